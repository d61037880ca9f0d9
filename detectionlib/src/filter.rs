use crate::error::{DetectionError, ErrorKind};
use crate::primitives::{Key, RollingProximityIdentifier, RPI_LEN};
use ring::digest;
use std::convert::TryInto;

/// Bloom-filter pre-screen over the RPIs held in the advertisement store.
/// Candidate RPIs failing the filter cannot be in the store and are dropped
/// before the backing store is queried. Once built the filter is immutable
/// and may be shared read-only across concurrent match sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    buffer: Vec<u8>,
    hash_count: u32,
}

impl QueryFilter {
    pub fn new(buffer_size: usize, hash_count: u32) -> Result<Self, DetectionError> {
        if buffer_size == 0 || hash_count == 0 {
            return Err(DetectionError::new(
                ErrorKind::BadParameter,
                "query filter needs a non-empty buffer and at least one hash",
            ));
        }
        Ok(Self {
            buffer: vec![0; buffer_size],
            hash_count,
        })
    }
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }
    pub fn add_possible_rpi(&mut self, rpi: &RollingProximityIdentifier) {
        for seed in 0..self.hash_count {
            let index = Self::bit_index(self.buffer.len() * 8, seed, rpi);
            self.buffer[index / 8] |= 1 << (index % 8);
        }
    }
    /// True iff the RPI cannot be in the store. The negative answer is
    /// authoritative; a positive one must still be verified against the store.
    pub fn should_ignore_rpi(&self, rpi: &RollingProximityIdentifier) -> bool {
        for seed in 0..self.hash_count {
            let index = Self::bit_index(self.buffer.len() * 8, seed, rpi);
            if self.buffer[index / 8] & (1 << (index % 8)) == 0 {
                return true;
            }
        }
        false
    }
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.buffer.len());
        bytes.extend_from_slice(&(self.buffer.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.hash_count.to_le_bytes());
        bytes.extend_from_slice(&self.buffer);
        bytes
    }
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DetectionError> {
        if bytes.len() < 8 {
            return Err(DetectionError::new(
                ErrorKind::BadFormat,
                "query filter is missing its header",
            ));
        }
        let buffer_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let hash_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if buffer_size == 0 || hash_count == 0 || bytes.len() != 8 + buffer_size {
            return Err(DetectionError::new(
                ErrorKind::BadFormat,
                "query filter header does not match its bitmap",
            ));
        }
        Ok(Self {
            buffer: bytes[8..].to_vec(),
            hash_count,
        })
    }

    // Fingerprint of (seed || rpi), mapped onto the bitmap. SHA-256 keeps the
    // hash family deterministic and portable across implementations.
    fn bit_index(bit_count: usize, seed: u32, rpi: &RollingProximityIdentifier) -> usize {
        let mut message = [0u8; 4 + RPI_LEN];
        message[0..4].copy_from_slice(&seed.to_le_bytes());
        message[4..].copy_from_slice(rpi.get());
        let fingerprint = digest::digest(&digest::SHA256, &message);
        let hash = u32::from_le_bytes(fingerprint.as_ref()[0..4].try_into().unwrap());
        hash as usize % bit_count
    }
}
