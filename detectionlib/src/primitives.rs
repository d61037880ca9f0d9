use crate::error::{DetectionError, ErrorKind};
use crate::time::{ExposureTime, TEK_ROLLING_PERIOD};
use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, BlockCipher, NewBlockCipher};
use aes_ctr::cipher::stream::{NewStreamCipher, SyncStreamCipher};
use aes_ctr::Aes128Ctr;
use ring::constant_time;
use ring::hkdf::Salt;
use ring::hkdf::HKDF_SHA256;
use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;

pub const RPI_LEN: usize = 16;
pub const AEM_LEN: usize = 4;

/// Attenuation sentinel: RSSI was clipped by the radio, the beacon was too
/// close to measure.
pub const ATTENUATION_SATURATED: u8 = 0;
/// Attenuation sentinel: the AEM could not be interpreted.
pub const ATTENUATION_UNKNOWN: u8 = 0xff;

pub trait Key {
    const KEY_LEN: usize;
    fn get(&self) -> &[u8];
}

/// A diagnosed user's per-day secret, together with the interval window it
/// covers and the transmission risk level attached by the health authority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemporaryExposureKey {
    key: [u8; Self::KEY_LEN],
    rolling_start: ExposureTime,
    transmission_risk_level: u8,
}

impl TemporaryExposureKey {
    pub fn new(
        secure_random: &dyn SecureRandom,
        rolling_start: ExposureTime,
        transmission_risk_level: u8,
    ) -> Result<Self, DetectionError> {
        let mut key = [0; Self::KEY_LEN];
        match secure_random.fill(&mut key) {
            Ok(()) => Ok(Self {
                key,
                rolling_start: rolling_start.floor_tek_rolling_period(),
                transmission_risk_level,
            }),
            Err(_) => Err(DetectionError::new(
                ErrorKind::Internal,
                "randomness error while generating TEK",
            )),
        }
    }
    pub fn from_parts(
        key: [u8; 16],
        rolling_start: ExposureTime,
        transmission_risk_level: u8,
    ) -> Self {
        Self {
            key,
            rolling_start,
            transmission_risk_level,
        }
    }
    pub fn key_data(&self) -> [u8; 16] {
        self.key
    }
    pub fn rolling_start(&self) -> ExposureTime {
        self.rolling_start
    }
    pub fn transmission_risk_level(&self) -> u8 {
        self.transmission_risk_level
    }
}

impl Key for TemporaryExposureKey {
    const KEY_LEN: usize = 16;

    fn get(&self) -> &[u8] {
        &self.key
    }
}

trait HKDFDerivedKey
where
    Self: Key,
{
    const INFO: &'static str;

    // NOTE: cannot return array here, due to const generic limitations in rustc
    fn derive<T: Key>(key_material: &T) -> Vec<u8> {
        let mut key = vec![0; Self::KEY_LEN];
        Salt::new(HKDF_SHA256, &[])
            .extract(key_material.get())
            .expand(&[Self::INFO.as_ref()], Wrapper(Self::KEY_LEN))
            .expect("HKDF error while expand().")
            .fill(&mut key)
            .expect("HKDF error while fill().");
        key
    }
}

struct Wrapper<T>(T);

impl ring::hkdf::KeyType for Wrapper<usize> {
    fn len(&self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RollingProximityIdentifierKey {
    key: [u8; Self::KEY_LEN],
}

impl RollingProximityIdentifierKey {
    pub fn new(tek: &TemporaryExposureKey) -> Self {
        Self {
            key: Self::derive(tek).try_into().unwrap(),
        }
    }
}

impl Key for RollingProximityIdentifierKey {
    const KEY_LEN: usize = 16;

    fn get(&self) -> &[u8] {
        &self.key
    }
}

impl HKDFDerivedKey for RollingProximityIdentifierKey {
    const INFO: &'static str = "EN-RPIK";
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AssociatedEncryptedMetadataKey {
    key: [u8; Self::KEY_LEN],
}

impl AssociatedEncryptedMetadataKey {
    pub fn new(tek: &TemporaryExposureKey) -> Self {
        Self {
            key: Self::derive(tek).try_into().unwrap(),
        }
    }
}

impl Key for AssociatedEncryptedMetadataKey {
    const KEY_LEN: usize = 16;

    fn get(&self) -> &[u8] {
        &self.key
    }
}

impl HKDFDerivedKey for AssociatedEncryptedMetadataKey {
    const INFO: &'static str = "EN-AEMK";
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RollingProximityIdentifier {
    data: [u8; Self::KEY_LEN],
}

impl RollingProximityIdentifier {
    const INFO: &'static str = "EN-RPI";

    pub fn new(rpik: &RollingProximityIdentifierKey, at: ExposureTime) -> Self {
        let key = GenericArray::from_slice(rpik.get());
        let cipher = Aes128::new(&key);
        let mut data = GenericArray::clone_from_slice(&Self::padded_data(at));
        cipher.encrypt_block(&mut data);
        Self { data: data.into() }
    }
    /// All RPIs of one TEK window, derived with a single AES key schedule.
    /// Byte-identical to 144 calls of `new` with consecutive interval numbers.
    pub fn derive_tek_rolling_period(
        rpik: &RollingProximityIdentifierKey,
        start: ExposureTime,
    ) -> Vec<RollingProximityIdentifier> {
        let key = GenericArray::from_slice(rpik.get());
        let cipher = Aes128::new(&key);
        (0..TEK_ROLLING_PERIOD)
            .map(|j| {
                let mut block =
                    GenericArray::clone_from_slice(&Self::padded_data(start.advanced_by(j)));
                cipher.encrypt_block(&mut block);
                Self { data: block.into() }
            })
            .collect()
    }
    pub fn from_bytes(data: [u8; 16]) -> Self {
        Self { data }
    }

    fn padded_data(at: ExposureTime) -> [u8; Self::KEY_LEN] {
        let mut padded_data = [0; Self::KEY_LEN];
        for (i, byte) in Self::INFO.as_bytes().iter().enumerate() {
            padded_data[i] = *byte;
        }
        for (i, byte) in at.as_bytes().iter().enumerate() {
            padded_data[i + 12] = *byte;
        }
        padded_data
    }
}

impl Key for RollingProximityIdentifier {
    const KEY_LEN: usize = 16;

    fn get(&self) -> &[u8] {
        &self.data
    }
}

// RPIs from the air are attacker-controlled; comparisons must not leak
// how far they match.
impl PartialEq for RollingProximityIdentifier {
    fn eq(&self, other: &Self) -> bool {
        constant_time::verify_slices_are_equal(&self.data, &other.data).is_ok()
    }
}

impl Eq for RollingProximityIdentifier {}

/// Decrypted advertisement metadata. Byte 0 carries the version bits,
/// byte 1 the transmit power in dBm, bytes 2 and 3 are reserved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    flags: u8,
    tx_power: i8,
}

impl Metadata {
    const VERSION_MASK: u8 = 0xc0;
    const VERSION_V1: u8 = 0x40;

    pub fn new(tx_power: i8) -> Self {
        Self {
            flags: Self::VERSION_V1,
            tx_power,
        }
    }
    pub fn tx_power(&self) -> i8 {
        self.tx_power
    }
    pub fn has_supported_version(&self) -> bool {
        self.flags & Self::VERSION_MASK == Self::VERSION_V1
    }

    fn to_bytes(&self) -> [u8; AEM_LEN] {
        [self.flags, self.tx_power as u8, 0, 0]
    }
    fn from_bytes(bytes: [u8; AEM_LEN]) -> Self {
        Self {
            flags: bytes[0],
            tx_power: bytes[1] as i8,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedEncryptedMetadata {
    data: [u8; AEM_LEN],
}

impl AssociatedEncryptedMetadata {
    pub fn encrypt(
        metadata: Metadata,
        aemk: &AssociatedEncryptedMetadataKey,
        rpi: &RollingProximityIdentifier,
    ) -> Self {
        let mut data = metadata.to_bytes();
        Self::apply_keystream(aemk, rpi, &mut data);
        Self { data }
    }
    pub fn decrypt(
        &self,
        aemk: &AssociatedEncryptedMetadataKey,
        rpi: &RollingProximityIdentifier,
    ) -> Metadata {
        let mut data = self.data;
        Self::apply_keystream(aemk, rpi, &mut data);
        Metadata::from_bytes(data)
    }
    pub fn from_bytes(data: [u8; AEM_LEN]) -> Self {
        Self { data }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    // AES-128-CTR with the RPI as the initial counter block; works for any
    // payload up to one block, which covers the 4 byte AEM.
    fn apply_keystream(
        aemk: &AssociatedEncryptedMetadataKey,
        rpi: &RollingProximityIdentifier,
        data: &mut [u8],
    ) {
        let mut cipher = Aes128Ctr::new(
            GenericArray::from_slice(aemk.get()),
            GenericArray::from_slice(rpi.get()),
        );
        cipher.apply_keystream(data);
    }
}

/// Normalized attenuation of an observed advertisement in dB.
pub fn attenuation_from_tx_power(tx_power: i8, rssi: i8, saturated: bool) -> u8 {
    if saturated {
        return ATTENUATION_SATURATED;
    }
    let attenuation = i16::from(tx_power) - i16::from(rssi);
    attenuation.max(0).min(254) as u8
}

/// The derived keys of one TEK, cached for the duration of a match batch.
#[derive(Copy, Clone, Debug)]
pub struct TekKeyring {
    tek: TemporaryExposureKey,
    rpik: RollingProximityIdentifierKey,
    aemk: AssociatedEncryptedMetadataKey,
}

impl TekKeyring {
    pub fn tek(&self) -> &TemporaryExposureKey {
        &self.tek
    }
    pub fn rpi(&self, at: ExposureTime) -> RollingProximityIdentifier {
        RollingProximityIdentifier::new(&self.rpik, at)
    }
    pub fn derive_tek_rolling_period(&self) -> Vec<RollingProximityIdentifier> {
        RollingProximityIdentifier::derive_tek_rolling_period(&self.rpik, self.tek.rolling_start())
    }
    pub fn encrypt_metadata(
        &self,
        metadata: Metadata,
        rpi: &RollingProximityIdentifier,
    ) -> AssociatedEncryptedMetadata {
        AssociatedEncryptedMetadata::encrypt(metadata, &self.aemk, rpi)
    }
    /// Decrypt the AEM of a matched advertisement and derive its attenuation.
    /// Yields the saturation sentinel for clipped RSSI readings and the
    /// unknown sentinel if the AEM does not carry a supported version.
    pub fn attenuation(
        &self,
        rpi: &RollingProximityIdentifier,
        encrypted_aem: &AssociatedEncryptedMetadata,
        rssi: i8,
        saturated: bool,
    ) -> u8 {
        let metadata = encrypted_aem.decrypt(&self.aemk, rpi);
        if !metadata.has_supported_version() {
            return ATTENUATION_UNKNOWN;
        }
        attenuation_from_tx_power(metadata.tx_power(), rssi, saturated)
    }
}

impl From<TemporaryExposureKey> for TekKeyring {
    fn from(tek: TemporaryExposureKey) -> Self {
        let rpik = RollingProximityIdentifierKey::new(&tek);
        let aemk = AssociatedEncryptedMetadataKey::new(&tek);
        Self { tek, rpik, aemk }
    }
}
