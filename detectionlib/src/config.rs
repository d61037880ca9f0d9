use crate::exposure::ExposureConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// YAML configuration of the detector binary.
#[derive(Serialize, Deserialize, Debug)]
pub struct DetectorConfig {
    pub store_path: PathBuf,
    pub attenuation_threshold: u8,
    #[serde(default = "DetectorConfig::default_attenuation_duration_thresholds")]
    pub attenuation_duration_thresholds: Vec<u8>,
    #[serde(default)]
    pub query_filter: QueryFilterParams,
    #[serde(default)]
    pub scoring: ExposureConfiguration,
    pub verification: Option<VerificationParams>,
}

impl DetectorConfig {
    fn default_attenuation_duration_thresholds() -> Vec<u8> {
        vec![50, 70]
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct QueryFilterParams {
    pub buffer_size: usize,
    pub hash_count: u32,
}

impl std::default::Default for QueryFilterParams {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            hash_count: 4,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VerificationParams {
    pub app_bundle_id: String,
    pub region: String,
    /// Region to base64 encoded P-256 public key, as handed out by the
    /// health authority's server.
    pub public_keys: HashMap<String, String>,
}
