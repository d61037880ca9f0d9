use crate::advertisement::{Advertisement, ADVERTISEMENT_RECORD_LEN};
use crate::error::{DetectionError, StoreError};
use crate::filter::QueryFilter;
use crate::primitives::{Key, TekKeyring, TemporaryExposureKey, RPI_LEN};
use crate::session::QuerySession;
use crate::store::AdvertisementStore;
use crate::time::TEK_ROLLING_PERIOD;
use log::debug;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Callers should stay below this many daily keys per bulk match; the scan
/// of one batch is not interruptible.
pub const RECOMMENDED_MAX_KEYS_PER_MATCH: usize = 1024;

/// Matching front-end over the advertisement store. Expands daily key
/// batches into candidate RPI buffers, pre-screens them with the optional
/// inline Bloom filter and correlates the remainder against stored rows.
pub struct AdvertisementDatabase {
    store: AdvertisementStore,
    inline_query_filter: Mutex<Option<Arc<QueryFilter>>>,
}

impl AdvertisementDatabase {
    pub fn new(store: AdvertisementStore) -> Self {
        Self {
            store,
            inline_query_filter: Mutex::new(None),
        }
    }
    pub fn store(&self) -> &AdvertisementStore {
        &self.store
    }
    pub fn insert(&self, advertisement: &Advertisement) -> Result<(), StoreError> {
        self.store.insert(advertisement)
    }
    pub fn stored_advertisement_count(&self) -> Option<u64> {
        self.store.stored_advertisement_count()
    }
    /// Build a query filter from the store and keep it attached for the
    /// benefit of subsequent match calls. Worth it when many daily key
    /// batches are going to be matched in rapid succession.
    pub fn cache_inline_query_filter(
        &self,
        buffer_size: usize,
        hash_count: u32,
        attenuation_threshold: u8,
    ) -> Result<(), StoreError> {
        let filter = self
            .store
            .query_filter(buffer_size, hash_count, attenuation_threshold)?;
        *self.inline_query_filter.lock().unwrap() = Some(Arc::new(filter));
        Ok(())
    }
    pub fn clear_inline_query_filter(&self) {
        *self.inline_query_filter.lock().unwrap() = None;
    }
    pub fn create_query_session(&self, attenuation_threshold: u8) -> QuerySession {
        QuerySession::new(self, attenuation_threshold)
    }
    /// Correlate all RPIs derivable from the given daily keys against the
    /// store. Returned matches carry the daily key index and RPI index of
    /// the candidate slot they matched; their order is unspecified.
    pub fn advertisements_matching_daily_keys(
        &self,
        daily_keys: &[TemporaryExposureKey],
    ) -> Result<Vec<Advertisement>, DetectionError> {
        if daily_keys.is_empty() {
            return Ok(Vec::new());
        }
        let slots = daily_keys.len() * TEK_ROLLING_PERIOD as usize;
        let mut rpi_buffer = vec![0u8; slots * RPI_LEN];
        let mut validity_buffer = vec![false; slots];
        let filter = self.inline_query_filter();
        for (daily_key_index, daily_key) in daily_keys.iter().enumerate() {
            let keyring = TekKeyring::from(*daily_key);
            for (rpi_index, rpi) in keyring.derive_tek_rolling_period().iter().enumerate() {
                let slot = daily_key_index * TEK_ROLLING_PERIOD as usize + rpi_index;
                rpi_buffer[slot * RPI_LEN..(slot + 1) * RPI_LEN].copy_from_slice(rpi.get());
                validity_buffer[slot] = match &filter {
                    Some(filter) => !filter.should_ignore_rpi(rpi),
                    None => true,
                };
            }
        }
        let candidate_count = validity_buffer.iter().filter(|valid| **valid).count();
        debug!(
            "matching {} candidate RPIs from {} daily keys",
            candidate_count,
            daily_keys.len()
        );
        let matches = self
            .store
            .advertisements_matching_rpi_buffer(&rpi_buffer, &validity_buffer)
            .map_err(DetectionError::from)?;
        Ok(Self::combine_matches(matches))
    }

    /// The matches of `advertisements_matching_daily_keys` as one packed
    /// buffer in the 39 byte record layout, for callers consuming the raw
    /// row format.
    pub fn advertisements_buffer_matching_daily_keys(
        &self,
        daily_keys: &[TemporaryExposureKey],
    ) -> Result<Vec<u8>, DetectionError> {
        let matches = self.advertisements_matching_daily_keys(daily_keys)?;
        let mut buffer = Vec::with_capacity(matches.len() * ADVERTISEMENT_RECORD_LEN);
        for advertisement in &matches {
            buffer.extend_from_slice(&advertisement.to_record_bytes());
        }
        Ok(buffer)
    }

    fn inline_query_filter(&self) -> Option<Arc<QueryFilter>> {
        self.inline_query_filter.lock().unwrap().clone()
    }

    // Defensive: the store keeps one row per RPI, but scan rows sharing a
    // candidate slot are still folded under the combination invariant.
    fn combine_matches(matches: Vec<Advertisement>) -> Vec<Advertisement> {
        let mut combined: HashMap<(u32, u16), Advertisement> =
            HashMap::with_capacity(matches.len());
        for advertisement in matches {
            match combined.entry((advertisement.daily_key_index, advertisement.rpi_index)) {
                Entry::Occupied(mut entry) => entry.get_mut().combine(&advertisement),
                Entry::Vacant(entry) => {
                    entry.insert(advertisement);
                }
            }
        }
        combined
            .into_iter()
            .map(|(_, advertisement)| advertisement)
            .collect()
    }
}
