use crate::database::AdvertisementDatabase;
use crate::error::{DetectionError, ErrorKind};
use crate::exposure::{ExposureConfiguration, ExposureDetectionSummary, ExposureInfo};
use crate::primitives::TemporaryExposureKey;
use crate::session::QuerySession;
use crate::tekfile::{FileSignatureVerifier, TekFile};
use chrono::prelude::*;
use log::info;

/// File-driven detection coordinator. Verifies and parses diagnosis key
/// files, feeds their keys through a caching query session batch by batch
/// and aggregates everything into a summary. A file that fails verification
/// or parsing aborts that batch only; matches from prior files are kept.
pub struct DetectionSession<'a> {
    session: QuerySession<'a>,
    verifier: Option<FileSignatureVerifier>,
}

impl<'a> DetectionSession<'a> {
    pub fn new(
        database: &'a AdvertisementDatabase,
        configuration: ExposureConfiguration,
        attenuation_threshold: u8,
        attenuation_duration_thresholds: Vec<u8>,
    ) -> Self {
        let mut session = database.create_query_session(attenuation_threshold);
        session.set_configuration(configuration);
        session.set_attenuation_duration_thresholds(attenuation_duration_thresholds);
        session.set_cache_exposure_info(true);
        Self {
            session,
            verifier: None,
        }
    }
    pub fn with_verifier(mut self, verifier: FileSignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }
    /// Feed one diagnosis key file, returning the number of matched
    /// advertisements. With a verifier attached the signature sidecar is
    /// mandatory and checked before anything is parsed.
    pub fn add_file(
        &mut self,
        file_bytes: &[u8],
        signature_file_bytes: Option<&[u8]>,
    ) -> Result<u64, DetectionError> {
        if let Some(verifier) = &self.verifier {
            let signature_file_bytes = signature_file_bytes.ok_or_else(|| {
                DetectionError::new(
                    ErrorKind::NotAuthorized,
                    "diagnosis key file arrived without its signature file",
                )
            })?;
            verifier.verify(file_bytes, signature_file_bytes)?;
        }
        let file = TekFile::parse(file_bytes)?;
        info!(
            "matching {} diagnosis keys of region {}",
            file.keys().len(),
            file.region()
        );
        self.add_keys(file.keys())
    }
    pub fn add_keys(&mut self, daily_keys: &[TemporaryExposureKey]) -> Result<u64, DetectionError> {
        self.session.match_count(daily_keys)
    }
    pub fn exposure_info(&self) -> &[ExposureInfo] {
        self.session.cached_exposure_info()
    }
    pub fn generate_summary(&self) -> ExposureDetectionSummary {
        self.session.generate_summary(Utc::now())
    }
    pub fn session(&self) -> &QuerySession<'a> {
        &self.session
    }
}
