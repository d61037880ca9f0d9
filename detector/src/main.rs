mod args;

use anyhow::{Context, Result};
use args::{crate_authors, crate_description, crate_name, crate_version, Args};
use detectionlib::config::DetectorConfig;
use detectionlib::database::AdvertisementDatabase;
use detectionlib::detection::DetectionSession;
use detectionlib::logger;
use detectionlib::store::AdvertisementStore;
use detectionlib::tekfile::FileSignatureVerifier;
use std::fs;

fn main() -> Result<()> {
    let args = Args::new(
        crate_name!(),
        crate_version!(),
        crate_authors!(),
        crate_description!(),
    );

    let config = fs::read_to_string(&args.config_file_path).context("Error reading config file")?;
    let config: DetectorConfig = serde_yaml::from_str(&config).context("Error parsing config file")?;

    logger::setup_logger(&args.log_file_path, args.log_level, String::from("detector"));

    let store = AdvertisementStore::open(&config.store_path).with_context(|| {
        format!("Error opening advertisement store at {:?}", config.store_path)
    })?;
    let database = AdvertisementDatabase::new(store);
    match database.stored_advertisement_count() {
        Some(count) => logger::info!("Store holds {} advertisements", count),
        None => logger::warn!("Store count is currently unavailable"),
    }
    database
        .cache_inline_query_filter(
            config.query_filter.buffer_size,
            config.query_filter.hash_count,
            config.attenuation_threshold,
        )
        .context("Error building the inline query filter")?;

    let mut session = DetectionSession::new(
        &database,
        config.scoring.clone(),
        config.attenuation_threshold,
        config.attenuation_duration_thresholds.clone(),
    );
    if let Some(verification) = &config.verification {
        let public_key = verification
            .public_keys
            .get(&verification.region)
            .with_context(|| format!("No public key for region {}", verification.region))?;
        let verifier = FileSignatureVerifier::new(verification.app_bundle_id.as_str(), public_key)
            .context("Error decoding the configured public key")?;
        session = session.with_verifier(verifier);
    }

    let file_bytes = fs::read(&args.keys_file_path).context("Error reading diagnosis key file")?;
    let signature_file_bytes = match &args.signature_file_path {
        Some(path) => Some(fs::read(path).context("Error reading signature file")?),
        None => None,
    };
    let match_count = session
        .add_file(&file_bytes, signature_file_bytes.as_deref())
        .context("Error matching the diagnosis key file")?;
    logger::info!("{} advertisements matched", match_count);

    let summary = session.generate_summary();
    logger::info!("Matched key count: {}", summary.matched_key_count);
    logger::info!(
        "Days since last exposure: {}",
        summary.days_since_last_exposure
    );
    logger::info!("Maximum risk score: {}", summary.maximum_risk_score);
    logger::info!(
        "Risk score sum (full range): {}",
        summary.risk_score_sum_full_range
    );
    logger::info!(
        "Attenuation durations (s): {:?}",
        summary.attenuation_durations
    );

    Ok(())
}
