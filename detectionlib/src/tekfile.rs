use crate::error::{DetectionError, ErrorKind};
use crate::primitives::TemporaryExposureKey;
use crate::time::{ExposureTime, TEK_ROLLING_PERIOD};
use base64::Engine;
use prost::bytes::Buf;
use prost::Message;
use ring::digest;
use ring::signature;
use std::collections::HashMap;
use std::convert::TryInto;

/// Upper bound on a signature sidecar file.
pub const SIGNATURE_FILE_MAX_LEN: usize = 64 * 1024;
/// OID of ECDSA with SHA-256, the only accepted signature algorithm.
pub const SIGNATURE_ALGORITHM_ECDSA_P256_SHA256: &str = "1.2.840.10045.4.3.2";

const REQUIRED_METADATA_KEYS: [&str; 6] =
    ["batchNum", "batchSize", "pkVers", "region", "startTS", "endTS"];

/// First length-delimited record of a TEK file: the metadata dictionary.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TekFileHeader {
    #[prost(map = "string, string", tag = "1")]
    pub metadata: HashMap<String, String>,
}

/// One diagnosis key record; follows the header, length-delimited.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TekRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub key_data: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub rolling_start_number: u32,
    #[prost(uint32, tag = "3")]
    pub rolling_period: u32,
    #[prost(uint32, tag = "4")]
    pub transmission_risk_level: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignatureRecord {
    #[prost(string, tag = "1")]
    pub apple_bundle_id: String,
    #[prost(string, tag = "2")]
    pub android_bundle_id: String,
    #[prost(uint32, tag = "3")]
    pub batch_number: u32,
    #[prost(uint32, tag = "4")]
    pub batch_count: u32,
    #[prost(string, tag = "5")]
    pub key_id: String,
    #[prost(string, tag = "6")]
    pub key_version: String,
    #[prost(string, tag = "7")]
    pub signature_algorithm: String,
    /// X9.62 SEQUENCE of the two signature INTEGERs.
    #[prost(bytes = "vec", tag = "8")]
    pub signature_data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignatureFile {
    #[prost(message, repeated, tag = "1")]
    pub signatures: Vec<SignatureRecord>,
}

/// A parsed diagnosis key distribution file. Parsing validates the wire
/// shape only; authenticity is established separately by the
/// [`FileSignatureVerifier`] over the raw file bytes.
#[derive(Debug, Clone)]
pub struct TekFile {
    metadata: HashMap<String, String>,
    keys: Vec<TemporaryExposureKey>,
}

impl TekFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, DetectionError> {
        let mut buf = bytes;
        let header = TekFileHeader::decode_length_delimited(&mut buf).map_err(|error| {
            DetectionError::new(
                ErrorKind::BadFormat,
                format!("undecodable TEK file header: {}", error),
            )
        })?;
        for key in &REQUIRED_METADATA_KEYS {
            if !header.metadata.contains_key(*key) {
                return Err(DetectionError::new(
                    ErrorKind::BadFormat,
                    format!("TEK file metadata misses required key {}", key),
                ));
            }
        }
        let mut keys = Vec::new();
        while buf.has_remaining() {
            let record = TekRecord::decode_length_delimited(&mut buf).map_err(|error| {
                DetectionError::new(
                    ErrorKind::BadFormat,
                    format!("undecodable TEK record: {}", error),
                )
            })?;
            keys.push(Self::validate_record(record)?);
        }
        Ok(Self {
            metadata: header.metadata,
            keys,
        })
    }
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
    pub fn region(&self) -> &str {
        // presence is guaranteed by parse()
        &self.metadata["region"]
    }
    pub fn keys(&self) -> &[TemporaryExposureKey] {
        &self.keys
    }
    /// Assemble file bytes from metadata and keys. Used by the distribution
    /// tooling and the tests; `parse` is its inverse.
    pub fn encode(metadata: &HashMap<String, String>, keys: &[TemporaryExposureKey]) -> Vec<u8> {
        let header = TekFileHeader {
            metadata: metadata.clone(),
        };
        let mut bytes = header.encode_length_delimited_to_vec();
        for key in keys {
            let record = TekRecord {
                key_data: key.key_data().to_vec(),
                rolling_start_number: key.rolling_start().en_interval_number(),
                rolling_period: TEK_ROLLING_PERIOD,
                transmission_risk_level: u32::from(key.transmission_risk_level()),
            };
            bytes.extend_from_slice(&record.encode_length_delimited_to_vec());
        }
        bytes
    }

    fn validate_record(record: TekRecord) -> Result<TemporaryExposureKey, DetectionError> {
        let key: [u8; 16] = record.key_data.as_slice().try_into().map_err(|_| {
            DetectionError::new(ErrorKind::BadFormat, "diagnosis key must be 16 bytes")
        })?;
        if record.rolling_start_number % TEK_ROLLING_PERIOD != 0 {
            return Err(DetectionError::new(
                ErrorKind::BadFormat,
                "diagnosis key rolling start must align with the rolling period",
            ));
        }
        if record.transmission_risk_level > 8 {
            return Err(DetectionError::new(
                ErrorKind::BadFormat,
                "transmission risk level must be within 0..=8",
            ));
        }
        Ok(TemporaryExposureKey::from_parts(
            key,
            ExposureTime::from_en_interval_number(record.rolling_start_number),
            record.transmission_risk_level as u8,
        ))
    }
}

/// Verifies the detached ECDSA P-256/SHA-256 signature of a TEK file
/// against the public key of the file's region.
pub struct FileSignatureVerifier {
    app_bundle_id: String,
    public_key: Vec<u8>,
}

impl FileSignatureVerifier {
    /// The public key is expected base64 encoded, as distributed through
    /// server configuration, and must be an uncompressed P-256 point.
    pub fn new<T: Into<String>>(
        app_bundle_id: T,
        base64_public_key: &str,
    ) -> Result<Self, DetectionError> {
        let public_key = base64::engine::general_purpose::STANDARD
            .decode(base64_public_key)
            .map_err(|error| {
                DetectionError::new(
                    ErrorKind::BadParameter,
                    format!("public key is not valid base64: {}", error),
                )
            })?;
        Ok(Self::from_key_bytes(app_bundle_id, public_key))
    }
    pub fn from_key_bytes<T: Into<String>>(app_bundle_id: T, public_key: Vec<u8>) -> Self {
        Self {
            app_bundle_id: app_bundle_id.into(),
            public_key,
        }
    }
    /// Validate the main file against its signature sidecar. The signature
    /// covers the SHA-256 of the main file bytes.
    pub fn verify(
        &self,
        file_bytes: &[u8],
        signature_file_bytes: &[u8],
    ) -> Result<(), DetectionError> {
        if signature_file_bytes.len() > SIGNATURE_FILE_MAX_LEN {
            return Err(DetectionError::new(
                ErrorKind::BadFormat,
                "signature file exceeds 64 KiB",
            ));
        }
        let signature_file = SignatureFile::decode(signature_file_bytes).map_err(|error| {
            DetectionError::new(
                ErrorKind::BadFormat,
                format!("undecodable signature file: {}", error),
            )
        })?;
        let record = signature_file
            .signatures
            .iter()
            .find(|record| record.apple_bundle_id == self.app_bundle_id)
            .ok_or_else(|| {
                DetectionError::new(
                    ErrorKind::NotAuthorized,
                    "signature file carries no signature for this bundle id",
                )
            })?;
        if record.signature_algorithm != SIGNATURE_ALGORITHM_ECDSA_P256_SHA256 {
            return Err(DetectionError::new(
                ErrorKind::Unsupported,
                format!("unsupported signature algorithm {}", record.signature_algorithm),
            ));
        }
        let file_digest = digest::digest(&digest::SHA256, file_bytes);
        let public_key =
            signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, &self.public_key);
        public_key
            .verify(file_digest.as_ref(), &record.signature_data)
            .map_err(|_| {
                DetectionError::new(ErrorKind::NotAuthorized, "TEK file signature does not verify")
            })
    }
}
