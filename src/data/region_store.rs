//! Append-only storage of recorded region content.
//!
//! Each region is keyed by `(x, y, p, region)` and holds one growing binary payload, a fetch
//! counter and the time of the last append.
//!
//! # Schema
//! ```text
//! core(core_id, x, y, processor, core_name)         UNIQUE(x, y, processor)
//! region(region_id, core_id, local_region_index,
//!        content, content_len, fetches,
//!        append_time, missing)                      UNIQUE(core_id, local_region_index)
//! region_view = core NATURAL JOIN region
//! ```
//!
//! `core_name` labels a core with the vertex placed on it, when one has been registered.
//!
//! A region is *missing* when it has never been appended to, or when the device reported that
//! some of its data was lost. A region written with zero bytes is empty, not missing.

use crate::data::{series, Database};
use crate::error::{FecError, FecResult};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use std::fmt;
use tracing::{debug, info};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS core(
    core_id INTEGER PRIMARY KEY AUTOINCREMENT,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    processor INTEGER NOT NULL,
    core_name TEXT,
    UNIQUE(x, y, processor));
CREATE TABLE IF NOT EXISTS region(
    region_id INTEGER PRIMARY KEY AUTOINCREMENT,
    core_id INTEGER NOT NULL REFERENCES core(core_id) ON DELETE RESTRICT,
    local_region_index INTEGER NOT NULL,
    content BLOB NOT NULL DEFAULT x'',
    content_len INTEGER NOT NULL DEFAULT 0,
    fetches INTEGER NOT NULL DEFAULT 0,
    append_time INTEGER,
    missing INTEGER NOT NULL DEFAULT 0,
    UNIQUE(core_id, local_region_index));
CREATE VIEW IF NOT EXISTS region_view AS
    SELECT core_id, region_id, x, y, processor, core_name, local_region_index,
           content, content_len, fetches, append_time, missing
    FROM core NATURAL JOIN region;
";

/// SQLite version that introduced `INSERT ... ON CONFLICT DO UPDATE`.
const UPSERT_MIN_VERSION: i32 = 3_024_000;

/// Location of one recording region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub x: u32,
    pub y: u32,
    pub p: u32,
    pub region: u32,
}

impl RegionKey {
    pub fn new(x: u32, y: u32, p: u32, region: u32) -> Self {
        Self { x, y, p, region }
    }

    fn error(&self, source: rusqlite::Error) -> FecError {
        FecError::region(self.x, self.y, self.p, self.region, source)
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}:{})", self.x, self.y, self.p, self.region)
    }
}

/// How appends create a row that may not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// One `INSERT ... ON CONFLICT DO UPDATE` statement.
    SingleStatement,
    /// Insert an empty row if absent, then update it by concatenation.
    TwoStep,
}

impl UpsertStrategy {
    /// Strongest strategy the linked SQLite supports.
    pub fn detect() -> Self {
        if rusqlite::version_number() >= UPSERT_MIN_VERSION {
            UpsertStrategy::SingleStatement
        } else {
            UpsertStrategy::TwoStep
        }
    }
}

/// Bookkeeping of a stored region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub fetches: u64,
    pub content_len: u64,
    pub append_time: Option<DateTime<Utc>>,
    pub missing: bool,
}

/// Persistent region content, sharing its connection with the series tables.
#[derive(Debug, Clone)]
pub struct RegionStore {
    db: Database,
    strategy: UpsertStrategy,
}

impl RegionStore {
    pub fn new(db: Database) -> Self {
        Self::with_strategy(db, UpsertStrategy::detect())
    }

    pub fn with_strategy(db: Database, strategy: UpsertStrategy) -> Self {
        debug!(?strategy, "Region store upsert strategy");
        Self { db, strategy }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn strategy(&self) -> UpsertStrategy {
        self.strategy
    }

    /// Appends `data` to the region, creating it on first use.
    pub fn store_data_in_region_buffer(&self, key: RegionKey, data: &[u8]) -> FecResult<()> {
        self.store_recording(key, data, false)
    }

    /// Appends `data`, also recording whether the device reported lost data for this fetch.
    pub fn store_recording(&self, key: RegionKey, data: &[u8], missing: bool) -> FecResult<()> {
        let now = Utc::now().timestamp_millis();
        let strategy = self.strategy;
        self.db.with_conn(|conn| {
            let tx = conn.transaction().map_err(|e| key.error(e))?;
            let core_id = core_id(&tx, key).map_err(|e| key.error(e))?;
            append(&tx, strategy, core_id, key.region, data, now, missing)
                .map_err(|e| key.error(e))?;
            tx.commit().map_err(|e| key.error(e))
        })?;
        debug!(region = %key, bytes = data.len(), missing, "Stored region data");
        Ok(())
    }

    /// Stored content and whether the region is missing.
    ///
    /// A region that was never written returns `(vec![], true)`.
    pub fn get_region_data(&self, key: RegionKey) -> FecResult<(Vec<u8>, bool)> {
        let found = self.db.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT CAST(content AS BLOB), fetches, missing FROM region_view
                 WHERE x = ?1 AND y = ?2 AND processor = ?3 AND local_region_index = ?4",
            )
            .and_then(|mut stmt| {
                stmt.query_row(params![key.x, key.y, key.p, key.region], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                })
                .optional()
            })
            .map_err(|e| key.error(e))
        })?;

        Ok(match found {
            Some((content, fetches, missing)) => (content, fetches == 0 || missing),
            None => (Vec::new(), true),
        })
    }

    pub fn region_info(&self, key: RegionKey) -> FecResult<Option<RegionInfo>> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT fetches, content_len, append_time, missing FROM region_view
                 WHERE x = ?1 AND y = ?2 AND processor = ?3 AND local_region_index = ?4",
                params![key.x, key.y, key.p, key.region],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| key.error(e))
        })?;

        Ok(row.map(|(fetches, content_len, append_time, missing)| RegionInfo {
            fetches: fetches.max(0) as u64,
            content_len: content_len.max(0) as u64,
            append_time: append_time.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            missing: fetches == 0 || missing,
        }))
    }

    /// Labels the core at `(x, y, p)`, typically with the vertex placed on it.
    pub fn set_core_name(&self, x: u32, y: u32, p: u32, name: &str) -> FecResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.prepare_cached("INSERT OR IGNORE INTO core(x, y, processor) VALUES (?1, ?2, ?3)")?
                .execute(params![x, y, p])?;
            tx.prepare_cached("UPDATE core SET core_name = ?4 WHERE x = ?1 AND y = ?2 AND processor = ?3")?
                .execute(params![x, y, p, name])?;
            tx.commit()?;
            Ok(())
        })?;
        debug!(x, y, p, name, "Labelled core");
        Ok(())
    }

    /// Label of the core at `(x, y, p)`, if it has one.
    pub fn core_name(&self, x: u32, y: u32, p: u32) -> FecResult<Option<String>> {
        self.db.with_conn(|conn| {
            let name = conn
                .query_row(
                    "SELECT core_name FROM core WHERE x = ?1 AND y = ?2 AND processor = ?3",
                    params![x, y, p],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(name.flatten())
        })
    }

    /// Empties one region so it reads as missing again. Returns whether it held any data.
    pub fn clear_region(&self, key: RegionKey) -> FecResult<bool> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE region SET content = CAST('' AS BLOB), content_len = 0, fetches = 0,
                         append_time = NULL, missing = 0
                     WHERE fetches > 0 AND local_region_index = ?4 AND core_id IN (
                         SELECT core_id FROM core WHERE x = ?1 AND y = ?2 AND processor = ?3)",
                    params![key.x, key.y, key.p, key.region],
                )
                .map_err(|e| key.error(e))?;
            Ok(changed > 0)
        })
    }

    /// Clears every region and drops all recorded series, keeping the catalog tables.
    pub fn clear(&self) -> FecResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE region SET content = CAST('' AS BLOB), content_len = 0, fetches = 0,
                     append_time = NULL, missing = 0",
                [],
            )?;
            series::drop_all(&tx)?;
            tx.commit()?;
            Ok(())
        })?;
        info!("Cleared all region content and recorded series");
        Ok(())
    }
}

fn core_id(tx: &Transaction<'_>, key: RegionKey) -> rusqlite::Result<i64> {
    tx.prepare_cached("INSERT OR IGNORE INTO core(x, y, processor) VALUES (?1, ?2, ?3)")?
        .execute(params![key.x, key.y, key.p])?;
    tx.prepare_cached("SELECT core_id FROM core WHERE x = ?1 AND y = ?2 AND processor = ?3")?
        .query_row(params![key.x, key.y, key.p], |row| row.get(0))
}

fn append(
    tx: &Transaction<'_>,
    strategy: UpsertStrategy,
    core_id: i64,
    region: u32,
    data: &[u8],
    now: i64,
    missing: bool,
) -> rusqlite::Result<()> {
    let len = data.len() as i64;
    match strategy {
        UpsertStrategy::SingleStatement => {
            tx.prepare_cached(
                "INSERT INTO region(
                     core_id, local_region_index, content, content_len, fetches, append_time, missing)
                 VALUES (?1, ?2, CAST(?3 AS BLOB), ?4, 1, ?5, ?6)
                 ON CONFLICT(core_id, local_region_index) DO UPDATE SET
                     content = CAST(region.content || excluded.content AS BLOB),
                     content_len = region.content_len + excluded.content_len,
                     fetches = region.fetches + 1,
                     append_time = excluded.append_time,
                     missing = MAX(region.missing, excluded.missing)",
            )?
            .execute(params![core_id, region, data, len, now, missing])?;
        }
        UpsertStrategy::TwoStep => {
            tx.prepare_cached(
                "INSERT OR IGNORE INTO region(core_id, local_region_index) VALUES (?1, ?2)",
            )?
            .execute(params![core_id, region])?;
            tx.prepare_cached(
                "UPDATE region SET
                     content = CAST(content || ?3 AS BLOB),
                     content_len = content_len + ?4,
                     fetches = fetches + 1,
                     append_time = ?5,
                     missing = MAX(missing, ?6)
                 WHERE core_id = ?1 AND local_region_index = ?2",
            )?
            .execute(params![core_id, region, data, len, now, missing])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<RegionStore> {
        [UpsertStrategy::SingleStatement, UpsertStrategy::TwoStep]
            .into_iter()
            .map(|s| RegionStore::with_strategy(Database::open_in_memory().unwrap(), s))
            .collect()
    }

    #[test]
    fn test_unwritten_region_is_missing() {
        for store in stores() {
            let (data, missing) = store.get_region_data(RegionKey::new(0, 0, 1, 2)).unwrap();
            assert!(data.is_empty());
            assert!(missing);
        }
    }

    #[test]
    fn test_appends_concatenate() {
        for store in stores() {
            let key = RegionKey::new(0, 0, 1, 2);
            store.store_data_in_region_buffer(key, b"abc").unwrap();
            store.store_data_in_region_buffer(key, b"def").unwrap();
            assert_eq!(store.get_region_data(key).unwrap(), (b"abcdef".to_vec(), false));

            let info = store.region_info(key).unwrap().unwrap();
            assert_eq!(info.fetches, 2);
            assert_eq!(info.content_len, 6);
            assert!(info.append_time.is_some());
        }
    }

    #[test]
    fn test_binary_content_survives_concatenation() {
        for store in stores() {
            let key = RegionKey::new(1, 1, 3, 0);
            store.store_data_in_region_buffer(key, &[0x00, 0xFF, 0x00]).unwrap();
            store.store_data_in_region_buffer(key, &[0x80, 0x00]).unwrap();
            let (data, _) = store.get_region_data(key).unwrap();
            assert_eq!(data, vec![0x00, 0xFF, 0x00, 0x80, 0x00]);
        }
    }

    #[test]
    fn test_empty_write_is_not_missing() {
        for store in stores() {
            let key = RegionKey::new(0, 0, 1, 2);
            store.store_data_in_region_buffer(key, b"").unwrap();
            assert_eq!(store.get_region_data(key).unwrap(), (Vec::new(), false));
        }
    }

    #[test]
    fn test_reported_loss_marks_region_missing() {
        let store = RegionStore::new(Database::open_in_memory().unwrap());
        let key = RegionKey::new(0, 1, 4, 0);
        store.store_recording(key, b"ab", true).unwrap();
        store.store_recording(key, b"cd", false).unwrap();
        assert_eq!(store.get_region_data(key).unwrap(), (b"abcd".to_vec(), true));
    }

    #[test]
    fn test_regions_are_independent() {
        let store = RegionStore::new(Database::open_in_memory().unwrap());
        store.store_data_in_region_buffer(RegionKey::new(0, 0, 1, 0), b"one").unwrap();
        store.store_data_in_region_buffer(RegionKey::new(0, 0, 1, 1), b"two").unwrap();
        store.store_data_in_region_buffer(RegionKey::new(0, 0, 2, 0), b"three").unwrap();
        assert_eq!(store.get_region_data(RegionKey::new(0, 0, 1, 1)).unwrap().0, b"two");
        assert_eq!(store.get_region_data(RegionKey::new(0, 0, 2, 0)).unwrap().0, b"three");
    }

    #[test]
    fn test_clear_region() {
        let store = RegionStore::new(Database::open_in_memory().unwrap());
        let key = RegionKey::new(2, 3, 5, 1);
        assert!(!store.clear_region(key).unwrap());

        store.store_data_in_region_buffer(key, b"xyz").unwrap();
        assert!(store.clear_region(key).unwrap());
        assert_eq!(store.get_region_data(key).unwrap(), (Vec::new(), true));
        assert!(!store.clear_region(key).unwrap());
    }

    #[test]
    fn test_core_names() {
        let store = RegionStore::new(Database::open_in_memory().unwrap());
        assert_eq!(store.core_name(0, 0, 3).unwrap(), None);

        store.store_data_in_region_buffer(RegionKey::new(0, 0, 3, 0), b"a").unwrap();
        assert_eq!(store.core_name(0, 0, 3).unwrap(), None);

        store.set_core_name(0, 0, 3, "pop_excitatory:0:99").unwrap();
        store.set_core_name(1, 0, 0, "monitor").unwrap();
        store.set_core_name(1, 0, 0, "SCAMP(OS)_1:0").unwrap();
        assert_eq!(store.core_name(0, 0, 3).unwrap().as_deref(), Some("pop_excitatory:0:99"));
        assert_eq!(store.core_name(1, 0, 0).unwrap().as_deref(), Some("SCAMP(OS)_1:0"));

        // labels survive clearing the recorded content
        store.clear().unwrap();
        assert_eq!(store.core_name(0, 0, 3).unwrap().as_deref(), Some("pop_excitatory:0:99"));
    }

    #[test]
    fn test_detected_strategy_is_single_statement_for_bundled_sqlite() {
        assert_eq!(UpsertStrategy::detect(), UpsertStrategy::SingleStatement);
    }
}
