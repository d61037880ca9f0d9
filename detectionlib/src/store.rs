use crate::advertisement::{Advertisement, DAILY_KEY_INDEX_INVALID};
use crate::error::StoreError;
use crate::filter::QueryFilter;
use crate::primitives::{
    AssociatedEncryptedMetadata, Key, RollingProximityIdentifier, AEM_LEN, RPI_LEN,
};
use crate::time::TEK_ROLLING_PERIOD;
use rusqlite::{params, Connection};
use std::convert::TryInto;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS advertisement (
        rpi BLOB NOT NULL,
        encrypted_aem BLOB NOT NULL,
        timestamp REAL NOT NULL,
        scan_interval INTEGER NOT NULL,
        rssi INTEGER NOT NULL,
        saturated INTEGER NOT NULL,
        country_code INTEGER NOT NULL,
        counter INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_advertisement_rpi_prefix
        ON advertisement(substr(rpi, 1, 8));
";

/// Permanent on-device storage for observed exposure notification
/// advertisements. The store holds at most one physical row per RPI;
/// repeated sightings are combined on insertion. Writers are serialized
/// through the connection lock, readers see committed rows only.
pub struct AdvertisementStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    unreadable: AtomicBool,
}

impl AdvertisementStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(&path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.as_ref().to_path_buf()),
            unreadable: AtomicBool::new(false),
        })
    }
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            unreadable: AtomicBool::new(false),
        })
    }
    /// Insert an observed advertisement, combining it with an already stored
    /// sighting of the same RPI if one exists.
    pub fn insert(&self, advertisement: &Advertisement) -> Result<(), StoreError> {
        self.with_retry(|conn| Self::insert_locked(conn, advertisement))
    }
    /// Count of advertisements persisted on disk, or `None` while the
    /// backing store cannot be read.
    pub fn stored_advertisement_count(&self) -> Option<u64> {
        if self.unreadable.load(Ordering::SeqCst) {
            return None;
        }
        let count = self.with_retry(|conn| {
            conn.query_row("SELECT COUNT(*) FROM advertisement", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(StoreError::from)
        });
        match count {
            Ok(count) => Some(count as u64),
            Err(_) => None,
        }
    }
    /// Bulk-match a candidate RPI buffer against the stored advertisements.
    /// Slot i of the buffer holds the RPI of daily key i / 144 at interval
    /// i % 144; only slots with a set validity bit are considered. Returned
    /// rows carry `daily_key_index` and `rpi_index` taken from the candidate
    /// slot they matched, making the buffer the ground truth for both.
    pub fn advertisements_matching_rpi_buffer(
        &self,
        rpi_buffer: &[u8],
        validity_buffer: &[bool],
    ) -> Result<Vec<Advertisement>, StoreError> {
        assert_eq!(rpi_buffer.len(), validity_buffer.len() * RPI_LEN);
        self.with_retry(|conn| Self::scan_locked(conn, rpi_buffer, validity_buffer))
    }
    /// Build a Bloom pre-screen over the RPIs of all rows that would pass
    /// the attenuation threshold. Stored rows carry no transmit power, so
    /// the threshold check uses the RSSI proxy: a row passes if it is
    /// saturated or its RSSI is at least the negated threshold.
    pub fn query_filter(
        &self,
        buffer_size: usize,
        hash_count: u32,
        attenuation_threshold: u8,
    ) -> Result<QueryFilter, StoreError> {
        let mut filter = QueryFilter::new(buffer_size, hash_count)
            .map_err(|error| StoreError::Unknown(error.to_string()))?;
        let rpis = self.with_retry(|conn| {
            let mut stmt =
                conn.prepare("SELECT rpi FROM advertisement WHERE saturated != 0 OR rssi >= ?1")?;
            let threshold_rssi = -i32::from(attenuation_threshold);
            let mut rows = stmt.query(params![threshold_rssi])?;
            let mut rpis: Vec<[u8; RPI_LEN]> = Vec::new();
            while let Some(row) = rows.next()? {
                let rpi: Vec<u8> = row.get(0)?;
                let rpi: [u8; RPI_LEN] = rpi.try_into().map_err(|_| StoreError::Corrupt)?;
                rpis.push(rpi);
            }
            Ok(rpis)
        })?;
        for rpi in rpis {
            filter.add_possible_rpi(&RollingProximityIdentifier::from_bytes(rpi));
        }
        Ok(filter)
    }

    // Busy and transiently broken connections get one reconnect plus retry;
    // a corrupt store is marked unreadable and surfaced immediately.
    fn with_retry<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Fn(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().unwrap();
        let result = match operation(&mut conn) {
            Err(StoreError::Busy) | Err(StoreError::Reopen) => {
                self.reconnect(&mut conn);
                operation(&mut conn)
            }
            first => first,
        };
        if let Err(StoreError::Corrupt) = result {
            self.unreadable.store(true, Ordering::SeqCst);
        }
        result
    }

    fn reconnect(&self, conn: &mut Connection) {
        if let Some(path) = &self.path {
            if let Ok(reopened) = Connection::open(path) {
                if reopened.execute_batch(CREATE_TABLES).is_ok() {
                    *conn = reopened;
                }
            }
        }
    }

    fn insert_locked(conn: &mut Connection, advertisement: &Advertisement) -> Result<(), StoreError> {
        let tx = conn.transaction()?;
        let existing = {
            let mut stmt = tx.prepare_cached(
                "SELECT rowid, rpi, encrypted_aem, timestamp, scan_interval, rssi, saturated,
                        country_code, counter
                 FROM advertisement WHERE substr(rpi, 1, 8) = ?1",
            )?;
            let mut rows = stmt.query(params![&advertisement.rpi.get()[..8]])?;
            let mut found: Option<(i64, Advertisement)> = None;
            while let Some(row) = rows.next()? {
                let rowid: i64 = row.get(0)?;
                let stored = advertisement_from_row(row, 1)?;
                // the prefix index narrows, full equality decides
                if stored.rpi == advertisement.rpi {
                    found = Some((rowid, stored));
                    break;
                }
            }
            found
        };
        match existing {
            Some((rowid, mut stored)) => {
                stored.combine(advertisement);
                tx.execute(
                    "UPDATE advertisement
                     SET timestamp = ?1, scan_interval = ?2, rssi = ?3, saturated = ?4, counter = ?5
                     WHERE rowid = ?6",
                    params![
                        stored.timestamp,
                        stored.scan_interval,
                        stored.rssi,
                        stored.saturated,
                        stored.counter,
                        rowid
                    ],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO advertisement
                     (rpi, encrypted_aem, timestamp, scan_interval, rssi, saturated, country_code, counter)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        advertisement.rpi.get(),
                        advertisement.encrypted_aem.as_bytes(),
                        advertisement.timestamp,
                        advertisement.scan_interval,
                        advertisement.rssi,
                        advertisement.saturated,
                        advertisement.country_code,
                        advertisement.counter
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // The candidate buffer becomes a temporary relation so the whole scan is
    // a single join against the advertisement table, with the RPI prefix
    // index driving the lookup.
    fn scan_locked(
        conn: &mut Connection,
        rpi_buffer: &[u8],
        validity_buffer: &[bool],
    ) -> Result<Vec<Advertisement>, StoreError> {
        conn.execute_batch(
            "DROP TABLE IF EXISTS temp.rpi_buffer;
             CREATE TEMP TABLE rpi_buffer (
                 daily_key_index INTEGER NOT NULL,
                 rpi_index INTEGER NOT NULL,
                 rpi BLOB NOT NULL
             );",
        )?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO rpi_buffer (daily_key_index, rpi_index, rpi) VALUES (?1, ?2, ?3)",
            )?;
            for (slot, valid) in validity_buffer.iter().enumerate() {
                if !valid {
                    continue;
                }
                let daily_key_index = (slot / TEK_ROLLING_PERIOD as usize) as i64;
                let rpi_index = (slot % TEK_ROLLING_PERIOD as usize) as i64;
                let rpi = &rpi_buffer[slot * RPI_LEN..(slot + 1) * RPI_LEN];
                stmt.execute(params![daily_key_index, rpi_index, rpi])?;
            }
        }
        tx.commit()?;

        let mut matches = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT b.daily_key_index, b.rpi_index,
                        a.rpi, a.encrypted_aem, a.timestamp, a.scan_interval, a.rssi, a.saturated,
                        a.country_code, a.counter
                 FROM rpi_buffer AS b
                 JOIN advertisement AS a ON substr(a.rpi, 1, 8) = substr(b.rpi, 1, 8)
                 WHERE a.rpi = b.rpi",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut advertisement = advertisement_from_row(row, 2)?;
                advertisement.daily_key_index = row.get::<_, i64>(0)? as u32;
                advertisement.rpi_index = row.get::<_, i64>(1)? as u16;
                matches.push(advertisement);
            }
        }
        conn.execute_batch("DROP TABLE temp.rpi_buffer;")?;
        Ok(matches)
    }
}

fn advertisement_from_row(
    row: &rusqlite::Row,
    first_column: usize,
) -> Result<Advertisement, StoreError> {
    let rpi: Vec<u8> = row.get(first_column)?;
    let rpi: [u8; RPI_LEN] = rpi.try_into().map_err(|_| StoreError::Corrupt)?;
    let encrypted_aem: Vec<u8> = row.get(first_column + 1)?;
    let encrypted_aem: [u8; AEM_LEN] = encrypted_aem.try_into().map_err(|_| StoreError::Corrupt)?;
    Ok(Advertisement {
        rpi: RollingProximityIdentifier::from_bytes(rpi),
        encrypted_aem: AssociatedEncryptedMetadata::from_bytes(encrypted_aem),
        timestamp: row.get(first_column + 2)?,
        daily_key_index: DAILY_KEY_INDEX_INVALID,
        rpi_index: 0,
        scan_interval: row.get(first_column + 3)?,
        rssi: row.get(first_column + 4)?,
        saturated: row.get(first_column + 5)?,
        country_code: row.get(first_column + 6)?,
        counter: row.get(first_column + 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(rpi_byte: u8, timestamp: f64, scan_interval: u16, rssi: i8) -> Advertisement {
        Advertisement::observed(
            RollingProximityIdentifier::from_bytes([rpi_byte; RPI_LEN]),
            AssociatedEncryptedMetadata::from_bytes([1, 2, 3, 4]),
            timestamp,
            scan_interval,
            rssi,
            false,
            826,
        )
    }

    fn buffer_for(rpis: &[[u8; RPI_LEN]]) -> (Vec<u8>, Vec<bool>) {
        // one synthetic daily key per RPI, candidate placed at interval 0
        let slots = rpis.len() * TEK_ROLLING_PERIOD as usize;
        let mut rpi_buffer = vec![0u8; slots * RPI_LEN];
        let mut validity_buffer = vec![false; slots];
        for (daily_key_index, rpi) in rpis.iter().enumerate() {
            let slot = daily_key_index * TEK_ROLLING_PERIOD as usize;
            rpi_buffer[slot * RPI_LEN..(slot + 1) * RPI_LEN].copy_from_slice(rpi);
            validity_buffer[slot] = true;
        }
        (rpi_buffer, validity_buffer)
    }

    #[test]
    fn test_insert_and_count() {
        let store = AdvertisementStore::open_in_memory().expect("Failed to open store");
        assert_eq!(store.stored_advertisement_count(), Some(0));
        store.insert(&advertisement(1, 100.0, 120, -60)).unwrap();
        store.insert(&advertisement(2, 200.0, 120, -60)).unwrap();
        assert_eq!(store.stored_advertisement_count(), Some(2));
    }

    #[test]
    fn test_insert_combines_same_rpi() {
        let store = AdvertisementStore::open_in_memory().expect("Failed to open store");
        store.insert(&advertisement(1, 2000.0, 120, -60)).unwrap();
        store.insert(&advertisement(1, 1000.0, 240, -60)).unwrap();
        assert_eq!(store.stored_advertisement_count(), Some(1));

        let (rpi_buffer, validity_buffer) = buffer_for(&[[1; RPI_LEN]]);
        let matches = store
            .advertisements_matching_rpi_buffer(&rpi_buffer, &validity_buffer)
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].timestamp, 1000.0);
        assert_eq!(matches[0].scan_interval, 360);
        assert_eq!(matches[0].counter, 2);
    }

    #[test]
    fn test_scan_populates_indices_from_candidate_slots() {
        let store = AdvertisementStore::open_in_memory().expect("Failed to open store");
        store.insert(&advertisement(7, 100.0, 120, -60)).unwrap();
        store.insert(&advertisement(9, 100.0, 120, -60)).unwrap();
        store.insert(&advertisement(11, 100.0, 120, -60)).unwrap();

        let (rpi_buffer, validity_buffer) = buffer_for(&[[9; RPI_LEN], [7; RPI_LEN]]);
        let mut matches = store
            .advertisements_matching_rpi_buffer(&rpi_buffer, &validity_buffer)
            .unwrap();
        matches.sort_by_key(|advertisement| advertisement.daily_key_index);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].daily_key_index, 0);
        assert_eq!(matches[0].rpi, RollingProximityIdentifier::from_bytes([9; RPI_LEN]));
        assert_eq!(matches[1].daily_key_index, 1);
        assert_eq!(matches[1].rpi, RollingProximityIdentifier::from_bytes([7; RPI_LEN]));
        assert_eq!(matches[0].rpi_index, 0);
    }

    #[test]
    fn test_scan_ignores_cleared_validity_bits() {
        let store = AdvertisementStore::open_in_memory().expect("Failed to open store");
        store.insert(&advertisement(5, 100.0, 120, -60)).unwrap();

        let (rpi_buffer, mut validity_buffer) = buffer_for(&[[5; RPI_LEN]]);
        let matches = store
            .advertisements_matching_rpi_buffer(&rpi_buffer, &validity_buffer)
            .unwrap();
        assert_eq!(matches.len(), 1);

        validity_buffer[0] = false;
        let matches = store
            .advertisements_matching_rpi_buffer(&rpi_buffer, &validity_buffer)
            .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_query_filter_honours_attenuation_threshold() {
        let store = AdvertisementStore::open_in_memory().expect("Failed to open store");
        // proxy attenuation 60 passes a threshold of 70, 80 does not
        store.insert(&advertisement(1, 100.0, 120, -60)).unwrap();
        store.insert(&advertisement(2, 100.0, 120, -80)).unwrap();
        let mut saturated = advertisement(3, 100.0, 120, -90);
        saturated.saturated = true;
        store.insert(&saturated).unwrap();

        let filter = store.query_filter(1024, 4, 70).unwrap();
        assert!(!filter.should_ignore_rpi(&RollingProximityIdentifier::from_bytes([1; RPI_LEN])));
        assert!(filter.should_ignore_rpi(&RollingProximityIdentifier::from_bytes([2; RPI_LEN])));
        assert!(!filter.should_ignore_rpi(&RollingProximityIdentifier::from_bytes([3; RPI_LEN])));
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("advertisements.db");
        {
            let store = AdvertisementStore::open(&path).expect("Failed to open store");
            store.insert(&advertisement(1, 100.0, 120, -60)).unwrap();
        }
        let store = AdvertisementStore::open(&path).expect("Failed to reopen store");
        assert_eq!(store.stored_advertisement_count(), Some(1));
    }
}
