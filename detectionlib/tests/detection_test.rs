use chrono::prelude::*;
use detectionlib::advertisement::Advertisement;
use detectionlib::database::AdvertisementDatabase;
use detectionlib::error::ErrorKind;
use detectionlib::exposure::ExposureConfiguration;
use detectionlib::primitives::{Metadata, TekKeyring, TemporaryExposureKey};
use detectionlib::store::AdvertisementStore;
use detectionlib::tekfile::{
    FileSignatureVerifier, SignatureFile, SignatureRecord, TekFile,
    SIGNATURE_ALGORITHM_ECDSA_P256_SHA256,
};
use detectionlib::detection::DetectionSession;
use detectionlib::time::ExposureTime;
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use std::collections::HashMap;
use prost::Message;

const BUNDLE_ID: &str = "org.example.notify";

fn metadata() -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("batchNum".into(), "1".into());
    metadata.insert("batchSize".into(), "1".into());
    metadata.insert("pkVers".into(), "v1".into());
    metadata.insert("region".into(), "DE".into());
    metadata.insert("startTS".into(), "1588550400".into());
    metadata.insert("endTS".into(), "1588636800".into());
    metadata
}

fn sign(file_bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
        .expect("Failed to generate key pair");
    let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref())
        .expect("Failed to parse key pair");
    let file_digest = digest::digest(&digest::SHA256, file_bytes);
    let signature_data = key_pair
        .sign(&rng, file_digest.as_ref())
        .expect("Failed to sign")
        .as_ref()
        .to_vec();
    let signature_file = SignatureFile {
        signatures: vec![SignatureRecord {
            apple_bundle_id: BUNDLE_ID.into(),
            android_bundle_id: BUNDLE_ID.into(),
            batch_number: 1,
            batch_count: 1,
            key_id: "DE".into(),
            key_version: "v1".into(),
            signature_algorithm: SIGNATURE_ALGORITHM_ECDSA_P256_SHA256.into(),
            signature_data,
        }],
    };
    (
        signature_file.encode_to_vec(),
        key_pair.public_key().as_ref().to_vec(),
    )
}

#[test]
fn test_detection_session_end_to_end() {
    let database =
        AdvertisementDatabase::new(AdvertisementStore::open_in_memory().expect("Failed to open store"));

    let now = Utc::now();
    let key = TemporaryExposureKey::from_parts(
        [7; 16],
        ExposureTime::from(now).floor_tek_rolling_period(),
        3,
    );
    let keyring = TekKeyring::from(key);
    let at = key.rolling_start().advanced_by(12);
    let rpi = keyring.rpi(at);
    let encrypted_aem = keyring.encrypt_metadata(Metadata::new(-10), &rpi);
    let timestamp = f64::from(at.en_interval_number()) * 600.0;
    database
        .insert(&Advertisement::observed(
            rpi,
            encrypted_aem,
            timestamp,
            600,
            -50,
            false,
            826,
        ))
        .expect("Failed to insert beacon");

    let file_bytes = TekFile::encode(&metadata(), &[key]);
    let (signature_file_bytes, public_key) = sign(&file_bytes);

    let mut session = DetectionSession::new(
        &database,
        ExposureConfiguration::default(),
        70,
        vec![50, 70],
    )
    .with_verifier(FileSignatureVerifier::from_key_bytes(BUNDLE_ID, public_key));

    let match_count = session
        .add_file(&file_bytes, Some(&signature_file_bytes))
        .expect("Failed to add file");
    assert_eq!(match_count, 1);
    assert_eq!(session.exposure_info().len(), 1);
    assert_eq!(session.exposure_info()[0].attenuation_value(), 40);

    let summary = session.generate_summary();
    assert_eq!(summary.matched_key_count, 1);
    assert_eq!(summary.days_since_last_exposure, 0);
    assert_eq!(summary.attenuation_durations, vec![600, 0, 0]);
}

#[test]
fn test_bad_file_aborts_its_batch_only() {
    let database =
        AdvertisementDatabase::new(AdvertisementStore::open_in_memory().expect("Failed to open store"));

    let now = Utc::now();
    let key = TemporaryExposureKey::from_parts(
        [7; 16],
        ExposureTime::from(now).floor_tek_rolling_period(),
        0,
    );
    let keyring = TekKeyring::from(key);
    let rpi = keyring.rpi(key.rolling_start());
    let encrypted_aem = keyring.encrypt_metadata(Metadata::new(-10), &rpi);
    database
        .insert(&Advertisement::observed(
            rpi,
            encrypted_aem,
            f64::from(key.rolling_start().en_interval_number()) * 600.0,
            600,
            -50,
            false,
            826,
        ))
        .expect("Failed to insert beacon");

    let mut session = DetectionSession::new(
        &database,
        ExposureConfiguration::default(),
        70,
        vec![50, 70],
    );

    let good_file = TekFile::encode(&metadata(), &[key]);
    assert_eq!(session.add_file(&good_file, None).expect("Failed to add file"), 1);

    let error = session.add_file(b"not a TEK file", None).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::BadFormat);
    // the bad batch did not disturb the results of the good one
    assert_eq!(session.exposure_info().len(), 1);

    let summary = session.generate_summary();
    assert_eq!(summary.matched_key_count, 1);
}

#[test]
fn test_missing_signature_is_refused_when_verification_is_configured() {
    let database =
        AdvertisementDatabase::new(AdvertisementStore::open_in_memory().expect("Failed to open store"));
    let file_bytes = TekFile::encode(&metadata(), &[]);
    let (_, public_key) = sign(&file_bytes);

    let mut session = DetectionSession::new(
        &database,
        ExposureConfiguration::default(),
        70,
        vec![50, 70],
    )
    .with_verifier(FileSignatureVerifier::from_key_bytes(BUNDLE_ID, public_key));

    let error = session.add_file(&file_bytes, None).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotAuthorized);
}
