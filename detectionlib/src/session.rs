use crate::advertisement::Advertisement;
use crate::database::AdvertisementDatabase;
use crate::error::{DetectionError, ErrorKind};
use crate::exposure::{ExposureConfiguration, ExposureDetectionSummary, ExposureInfo};
use crate::primitives::{TekKeyring, TemporaryExposureKey};
use chrono::prelude::*;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SessionState {
    Open,
    Matching,
    Closed,
}

/// One detection session against the advertisement database. A session
/// borrows the database for its lifetime, owns its candidate buffers and
/// optionally caches the generated exposure info for later paged
/// enumeration. Matching is strictly sequential per session; starting a
/// match while one is in progress is API misuse.
pub struct QuerySession<'a> {
    database: &'a AdvertisementDatabase,
    attenuation_threshold: u8,
    attenuation_duration_thresholds: Vec<u8>,
    configuration: ExposureConfiguration,
    cache_exposure_info: bool,
    cached_exposure_info: Vec<ExposureInfo>,
    matched_keys: HashSet<[u8; 16]>,
    state: SessionState,
}

impl<'a> QuerySession<'a> {
    pub(crate) fn new(database: &'a AdvertisementDatabase, attenuation_threshold: u8) -> Self {
        Self {
            database,
            attenuation_threshold,
            attenuation_duration_thresholds: vec![50, 70],
            configuration: ExposureConfiguration::default(),
            cache_exposure_info: false,
            cached_exposure_info: Vec::new(),
            matched_keys: HashSet::new(),
            state: SessionState::Open,
        }
    }
    pub fn attenuation_threshold(&self) -> u8 {
        self.attenuation_threshold
    }
    /// Bucket limits for the attenuation durations; must be 2 or 3 values,
    /// strictly increasing. Validated when exposure info is generated.
    pub fn set_attenuation_duration_thresholds(&mut self, thresholds: Vec<u8>) {
        self.attenuation_duration_thresholds = thresholds;
    }
    pub fn set_configuration(&mut self, configuration: ExposureConfiguration) {
        self.configuration = configuration;
    }
    pub fn set_cache_exposure_info(&mut self, cache_exposure_info: bool) {
        self.cache_exposure_info = cache_exposure_info;
    }
    pub fn cached_exposure_info(&self) -> &[ExposureInfo] {
        &self.cached_exposure_info
    }
    pub fn cached_exposure_info_count(&self) -> usize {
        self.cached_exposure_info.len()
    }
    pub fn matched_key_count(&self) -> u64 {
        self.matched_keys.len() as u64
    }
    /// Count the advertisements matching the given daily keys. With exposure
    /// info caching enabled the generated infos are retained as well.
    pub fn match_count(
        &mut self,
        daily_keys: &[TemporaryExposureKey],
    ) -> Result<u64, DetectionError> {
        if self.cache_exposure_info {
            self.validate_exposure_info_inputs()?;
        }
        let matches = self.run_match(daily_keys)?;
        let count = matches.len() as u64;
        if self.cache_exposure_info {
            let infos = self.build_exposure_info(&matches, daily_keys)?;
            self.cached_exposure_info.extend(infos);
        }
        Ok(count)
    }
    /// Generate exposure info for the advertisements matching the given
    /// daily keys. On failure no partial list is returned and the cache is
    /// left unchanged.
    pub fn exposure_info(
        &mut self,
        daily_keys: &[TemporaryExposureKey],
    ) -> Result<Vec<ExposureInfo>, DetectionError> {
        self.validate_exposure_info_inputs()?;
        let matches = self.run_match(daily_keys)?;
        let infos = self.build_exposure_info(&matches, daily_keys)?;
        if self.cache_exposure_info {
            self.cached_exposure_info.extend(infos.iter().cloned());
        }
        Ok(infos)
    }
    /// Invoke the handler with ordered, disjoint, contiguous batches of
    /// cached exposure info covering the requested range. The handler sees
    /// either a batch or an error, never both.
    pub fn enumerate_cached_exposure_info<F>(
        &self,
        range: Range<usize>,
        batch_size: usize,
        handler: &mut F,
    ) where
        F: FnMut(Result<&[ExposureInfo], DetectionError>),
    {
        if batch_size == 0 {
            handler(Err(DetectionError::new(
                ErrorKind::ApiMisuse,
                "enumeration batch size must be positive",
            )));
            return;
        }
        if range.start > range.end || range.end > self.cached_exposure_info.len() {
            handler(Err(DetectionError::new(
                ErrorKind::BadParameter,
                "enumeration range exceeds the cached exposure info",
            )));
            return;
        }
        let mut start = range.start;
        while start < range.end {
            let end = (start + batch_size).min(range.end);
            handler(Ok(&self.cached_exposure_info[start..end]));
            start = end;
        }
    }
    pub fn generate_summary(&self, now: DateTime<Utc>) -> ExposureDetectionSummary {
        ExposureDetectionSummary::aggregate(
            &self.cached_exposure_info,
            self.matched_keys.len() as u64,
            self.attenuation_duration_thresholds.len() + 1,
            now,
        )
    }
    /// Closing ends the session; any further match is refused.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn run_match(
        &mut self,
        daily_keys: &[TemporaryExposureKey],
    ) -> Result<Vec<Advertisement>, DetectionError> {
        self.begin_match()?;
        let result = self.database.advertisements_matching_daily_keys(daily_keys);
        self.end_match();
        let matches = result?;
        debug!("{} matches for {} daily keys", matches.len(), daily_keys.len());
        for advertisement in &matches {
            if let Some(daily_key) = daily_keys.get(advertisement.daily_key_index as usize) {
                self.matched_keys.insert(daily_key.key_data());
            }
        }
        Ok(matches)
    }

    fn begin_match(&mut self) -> Result<(), DetectionError> {
        match self.state {
            SessionState::Open => {
                self.state = SessionState::Matching;
                Ok(())
            }
            SessionState::Matching => Err(DetectionError::new(
                ErrorKind::ApiMisuse,
                "a match is already in progress on this session",
            )),
            SessionState::Closed => Err(DetectionError::new(
                ErrorKind::Invalidated,
                "the session is closed",
            )),
        }
    }

    fn end_match(&mut self) {
        if self.state == SessionState::Matching {
            self.state = SessionState::Open;
        }
    }

    fn validate_exposure_info_inputs(&self) -> Result<(), DetectionError> {
        let thresholds = &self.attenuation_duration_thresholds;
        match thresholds.len() {
            2 | 3 => (),
            _ => {
                return Err(DetectionError::new(
                    ErrorKind::ApiMisuse,
                    "attenuation duration thresholds must be 2 or 3 values",
                ))
            }
        }
        if thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(DetectionError::new(
                ErrorKind::ApiMisuse,
                "attenuation duration thresholds must be strictly increasing",
            ));
        }
        self.configuration.validate()
    }

    fn build_exposure_info(
        &self,
        matches: &[Advertisement],
        daily_keys: &[TemporaryExposureKey],
    ) -> Result<Vec<ExposureInfo>, DetectionError> {
        let now = Utc::now();
        let mut keyrings: HashMap<u32, TekKeyring> = HashMap::new();
        let mut infos = Vec::with_capacity(matches.len());
        for advertisement in matches {
            let daily_key = daily_keys
                .get(advertisement.daily_key_index as usize)
                .ok_or_else(|| {
                    DetectionError::new(
                        ErrorKind::Internal,
                        "match references a daily key outside the batch",
                    )
                })?;
            let keyring = keyrings
                .entry(advertisement.daily_key_index)
                .or_insert_with(|| TekKeyring::from(*daily_key));
            infos.push(ExposureInfo::from_matched_advertisement(
                advertisement,
                keyring,
                &self.attenuation_duration_thresholds,
                &self.configuration,
                now,
            ));
        }
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AdvertisementStore;

    fn database() -> AdvertisementDatabase {
        AdvertisementDatabase::new(
            AdvertisementStore::open_in_memory().expect("Failed to open store"),
        )
    }

    #[test]
    fn test_match_on_closed_session_is_refused() {
        let database = database();
        let mut session = database.create_query_session(70);
        session.close();
        let error = session.match_count(&[]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Invalidated);
    }

    #[test]
    fn test_bad_threshold_count_is_api_misuse_and_leaves_cache_untouched() {
        let database = database();
        let mut session = database.create_query_session(70);
        session.set_cache_exposure_info(true);
        session.set_attenuation_duration_thresholds(vec![10, 20, 30, 40]);
        let error = session.exposure_info(&[]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ApiMisuse);
        assert_eq!(session.cached_exposure_info_count(), 0);
    }

    #[test]
    fn test_non_increasing_thresholds_are_api_misuse() {
        let database = database();
        let mut session = database.create_query_session(70);
        session.set_attenuation_duration_thresholds(vec![70, 50]);
        let error = session.exposure_info(&[]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ApiMisuse);
    }

    #[test]
    fn test_enumeration_delivers_disjoint_contiguous_batches() {
        let database = database();
        let session = database.create_query_session(70);
        // empty cache: an empty range enumerates nothing, without an error
        let mut calls = 0;
        session.enumerate_cached_exposure_info(0..0, 4, &mut |batch| {
            assert!(batch.is_ok());
            calls += 1;
        });
        assert_eq!(calls, 0);

        let mut errors = 0;
        session.enumerate_cached_exposure_info(0..1, 4, &mut |batch| {
            assert!(batch.is_err());
            errors += 1;
        });
        assert_eq!(errors, 1);

        let mut misuse = None;
        session.enumerate_cached_exposure_info(0..0, 0, &mut |batch| {
            misuse = Some(batch.unwrap_err().kind());
        });
        assert_eq!(misuse, Some(ErrorKind::ApiMisuse));
    }
}
