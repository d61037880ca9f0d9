use crate::error::{DetectionError, ErrorKind};
use crate::primitives::{AssociatedEncryptedMetadata, Key, RollingProximityIdentifier, AEM_LEN, RPI_LEN};
use std::convert::TryInto;

/// Daily key index of an advertisement no match has claimed yet.
pub const DAILY_KEY_INDEX_INVALID: u32 = 0xffff_ffff;

/// Packed record length, shared by the on-disk format and the scan buffer.
/// The country code is carried in the store but not in the packed record.
pub const ADVERTISEMENT_RECORD_LEN: usize = 39;

/// One observed exposure notification beacon. Sightings of the same RPI are
/// folded into a single record on insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub rpi: RollingProximityIdentifier,
    pub encrypted_aem: AssociatedEncryptedMetadata,
    pub timestamp: f64,
    pub daily_key_index: u32,
    pub rpi_index: u16,
    pub scan_interval: u16,
    pub rssi: i8,
    pub saturated: bool,
    pub country_code: u16,
    pub counter: u8,
}

impl Advertisement {
    pub fn observed(
        rpi: RollingProximityIdentifier,
        encrypted_aem: AssociatedEncryptedMetadata,
        timestamp: f64,
        scan_interval: u16,
        rssi: i8,
        saturated: bool,
        country_code: u16,
    ) -> Self {
        Self {
            rpi,
            encrypted_aem,
            timestamp,
            daily_key_index: DAILY_KEY_INDEX_INVALID,
            rpi_index: 0,
            scan_interval,
            rssi,
            saturated,
            country_code,
            counter: 1,
        }
    }
    pub fn is_matched(&self) -> bool {
        self.daily_key_index != DAILY_KEY_INDEX_INVALID
    }
    /// Fold another sighting of the same RPI into this record: the earlier
    /// timestamp wins, scan intervals add up (saturating), the RSSI is
    /// weighted by scan interval and the sighting counters add up.
    pub fn combine(&mut self, other: &Advertisement) {
        debug_assert!(self.rpi == other.rpi);
        let total_interval = u32::from(self.scan_interval) + u32::from(other.scan_interval);
        if total_interval > 0 {
            let weighted = (i32::from(self.rssi) * i32::from(self.scan_interval)
                + i32::from(other.rssi) * i32::from(other.scan_interval))
                / total_interval as i32;
            self.rssi = weighted as i8;
        }
        if other.timestamp < self.timestamp {
            self.timestamp = other.timestamp;
        }
        self.scan_interval = total_interval.min(u32::from(u16::MAX)) as u16;
        self.saturated = self.saturated || other.saturated;
        self.counter = self.counter.saturating_add(other.counter);
    }
    pub fn to_record_bytes(&self) -> [u8; ADVERTISEMENT_RECORD_LEN] {
        let mut record = [0u8; ADVERTISEMENT_RECORD_LEN];
        record[0..16].copy_from_slice(self.rpi.get());
        record[16..20].copy_from_slice(self.encrypted_aem.as_bytes());
        record[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        record[28..32].copy_from_slice(&self.daily_key_index.to_le_bytes());
        record[32..34].copy_from_slice(&self.rpi_index.to_le_bytes());
        record[34..36].copy_from_slice(&self.scan_interval.to_le_bytes());
        record[36] = self.rssi as u8;
        record[37] = self.saturated as u8;
        record[38] = self.counter;
        record
    }
    pub fn from_record_bytes(record: &[u8]) -> Result<Self, DetectionError> {
        if record.len() != ADVERTISEMENT_RECORD_LEN {
            return Err(DetectionError::new(
                ErrorKind::BadFormat,
                "advertisement record has the wrong length",
            ));
        }
        let rpi: [u8; RPI_LEN] = record[0..16].try_into().unwrap();
        let encrypted_aem: [u8; AEM_LEN] = record[16..20].try_into().unwrap();
        Ok(Self {
            rpi: RollingProximityIdentifier::from_bytes(rpi),
            encrypted_aem: AssociatedEncryptedMetadata::from_bytes(encrypted_aem),
            timestamp: f64::from_le_bytes(record[20..28].try_into().unwrap()),
            daily_key_index: u32::from_le_bytes(record[28..32].try_into().unwrap()),
            rpi_index: u16::from_le_bytes(record[32..34].try_into().unwrap()),
            scan_interval: u16::from_le_bytes(record[34..36].try_into().unwrap()),
            rssi: record[36] as i8,
            saturated: record[37] != 0,
            country_code: 0,
            counter: record[38],
        })
    }
}
