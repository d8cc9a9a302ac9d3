//! Reassembles recorded signals from per-core tables into one queryable view.
//!
//! Every core recording a `(source, variable)` signal writes its own table: a `timestamp`
//! primary key plus one column per element id it owns. Element ids are disjoint across cores,
//! so the tables only share the `timestamp` column.
//!
//! Database objects are named after the signal's row in `global_metadata`, never after the
//! source and variable names, so `("a_b", "c")` and `("a", "b_c")` cannot share a table.
//! Per-core tables are found through `local_metadata` by `(source, variable, first id)`.
//!
//! Reconciling a signal picks its *best source*, the name of the table or view that holds
//! one row per timestamp with every element's column:
//!
//! ```text
//! one table             -> signal{id}_{first}_raw itself
//! many tables           -> signal{id}_ALL_keys   = UNION of all timestamps
//!                          signal{id}_ALL_simple = NATURAL JOIN of all tables
//!   count(simple) == count(keys)
//!                       -> simple
//!   otherwise           -> signal{id}_{first}_full = keys LEFT JOIN table   (short tables only)
//!                          signal{id}_ALL_full     = NATURAL JOIN of full views and complete tables
//! ```
//!
//! Timestamps are primary keys, so a natural join of the tables has exactly as many rows as
//! the intersection of their timestamp sets. Equal counts therefore mean every table holds the
//! same timestamps, and a table whose count equals the key count holds all of them.
//!
//! The best source is remembered in `global_metadata`. Callers reconcile once recording has
//! drained for the run; new inserts for a signal drop its views so the next query rebuilds them.
//! A signal nobody recorded is not an error: it reads back as [`SeriesData::unrecorded`].

use crate::data::Database;
use crate::error::{FecError, FecResult};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS source(
    source_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL UNIQUE,
    description TEXT);
CREATE TABLE IF NOT EXISTS local_metadata(
    source_name TEXT NOT NULL,
    variable_name TEXT NOT NULL,
    first_neuron_id INTEGER NOT NULL,
    table_name TEXT NOT NULL UNIQUE,
    data_type TEXT NOT NULL,
    UNIQUE(source_name, variable_name, first_neuron_id));
CREATE TABLE IF NOT EXISTS global_metadata(
    signal_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    variable_name TEXT NOT NULL,
    best_source TEXT,
    data_type TEXT NOT NULL,
    UNIQUE(source_name, variable_name));
CREATE TABLE IF NOT EXISTS series_view(
    view_name TEXT PRIMARY KEY,
    source_name TEXT NOT NULL,
    variable_name TEXT NOT NULL);
";

/// Fixed-point scale of recorded matrix values.
const FLOAT_DIVISOR: f64 = 65536.0;

/// Shape of the data recorded for a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// One row per timestamp, one column per element id.
    Matrix,
    /// One row per `(timestamp, atom_id)` event.
    Exists,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Matrix => "MATRIX",
            DataType::Exists => "EXISTS",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = FecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MATRIX" => Ok(DataType::Matrix),
            "EXISTS" => Ok(DataType::Exists),
            other => Err(FecError::Configuration(format!("Unknown data type '{other}'"))),
        }
    }
}

/// A `(source, variable)` pair recorded across many cores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal {
    pub source_name: String,
    pub variable: String,
}

impl Signal {
    pub fn new(source_name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            variable: variable.into(),
        }
    }

    fn error(&self, message: impl Into<String>) -> FecError {
        FecError::signal(&self.source_name, &self.variable, message)
    }
}

/// Name of a table or view belonging to the signal with catalog id `signal_id`.
fn object_name(signal_id: i64, part: &str, suffix: &str) -> String {
    format!("signal{signal_id}_{part}_{suffix}")
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_name, self.variable)
    }
}

/// Rows read back from a reconciled signal. The first column is the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData<T> {
    pub columns: Vec<String>,
    /// `None` where a core recorded nothing for that timestamp.
    pub rows: Vec<Vec<Option<T>>>,
    /// Nothing was ever recorded for the signal.
    pub missing: bool,
}

impl<T> SeriesData<T> {
    /// Result for a signal with no recorded data.
    pub fn unrecorded() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            missing: true,
        }
    }
}

/// Builds and memoizes reconciled views over per-core tables.
#[derive(Debug, Clone)]
pub struct SeriesReconciler {
    db: Database,
}

impl SeriesReconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Adds a source to the catalog, updating its description if already known.
    pub fn register_source(&self, source_name: &str, description: Option<&str>) -> FecResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO source(source_name, description) VALUES (?1, ?2)
                 ON CONFLICT(source_name) DO UPDATE SET
                     description = COALESCE(excluded.description, source.description)",
                params![source_name, description],
            )?;
            Ok(())
        })
    }

    pub fn source_description(&self, source_name: &str) -> FecResult<Option<String>> {
        self.db.with_conn(|conn| {
            let description = conn
                .query_row(
                    "SELECT description FROM source WHERE source_name = ?1",
                    [source_name],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(description.flatten())
        })
    }

    /// Stores one core's contribution to a matrix signal.
    ///
    /// `element_ids` are the columns this core owns; the first one keys its table. Each row is
    /// `[timestamp, value for each element id]`. Re-inserting a timestamp replaces that row.
    pub fn insert_matrix(
        &self,
        signal: &Signal,
        element_ids: &[u32],
        rows: &[Vec<i64>],
    ) -> FecResult<()> {
        let Some(&first_id) = element_ids.first() else {
            return Err(signal.error("a core must own at least one element id"));
        };
        if let Some(row) = rows.iter().find(|row| row.len() != element_ids.len() + 1) {
            return Err(FecError::RowWidth {
                expected: element_ids.len() + 1,
                actual: row.len(),
            });
        }

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let signal_id = claim_data_type(&tx, signal, DataType::Matrix)?;
            let table = match local_table(&tx, signal, first_id)? {
                Some(table) => table,
                None => {
                    let table = object_name(signal_id, &first_id.to_string(), "raw");
                    let columns: Vec<String> = element_ids
                        .iter()
                        .map(|id| format!("{} INTEGER", quote(&id.to_string())))
                        .collect();
                    tx.execute_batch(&format!(
                        "CREATE TABLE {} (timestamp INTEGER PRIMARY KEY NOT NULL, {})",
                        quote(&table),
                        columns.join(", ")
                    ))?;
                    register_table(&tx, signal, first_id, &table, DataType::Matrix)?;
                    debug!(%signal, table = %table, "Created per-core table");
                    table
                }
            };

            let placeholders = vec!["?"; element_ids.len() + 1].join(", ");
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT OR REPLACE INTO {} VALUES ({placeholders})",
                    quote(&table)
                ))?;
                for row in rows {
                    stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                }
            }
            invalidate(&tx, signal)?;
            tx.commit()?;
            Ok(())
        })
        .map_err(|e| with_signal(signal, e))
    }

    /// Stores `(timestamp, atom_id)` events of an exists signal. All cores share one table.
    pub fn insert_exists(&self, signal: &Signal, events: &[(i64, i64)]) -> FecResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let signal_id = claim_data_type(&tx, signal, DataType::Exists)?;
            let table = match local_table(&tx, signal, 0)? {
                Some(table) => table,
                None => {
                    let table = object_name(signal_id, "ALL", "raw");
                    tx.execute_batch(&format!(
                        "CREATE TABLE {} (
                             timestamp INTEGER NOT NULL,
                             atom_id INTEGER NOT NULL,
                             PRIMARY KEY(timestamp, atom_id))",
                        quote(&table)
                    ))?;
                    register_table(&tx, signal, 0, &table, DataType::Exists)?;
                    table
                }
            };
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT OR IGNORE INTO {} (timestamp, atom_id) VALUES (?1, ?2)",
                    quote(&table)
                ))?;
                for (timestamp, atom_id) in events {
                    stmt.execute(params![timestamp, atom_id])?;
                }
            }
            invalidate(&tx, signal)?;
            tx.commit()?;
            Ok(())
        })
        .map_err(|e| with_signal(signal, e))
    }

    pub fn data_type(&self, signal: &Signal) -> FecResult<Option<DataType>> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT data_type FROM global_metadata
                     WHERE source_name = ?1 AND variable_name = ?2",
                    params![signal.source_name, signal.variable],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            found.map(|s| s.parse()).transpose()
        })
    }

    /// Every source with the variables recorded for it.
    pub fn variable_map(&self) -> FecResult<BTreeMap<String, Vec<String>>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_name, variable_name FROM global_metadata
                 ORDER BY source_name, variable_name",
            )?;
            let pairs = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for pair in pairs {
                let (source, variable) = pair?;
                map.entry(source).or_default().push(variable);
            }
            Ok(map)
        })
    }

    /// Name of the table or view holding the whole signal, building views on first use.
    /// `None` when nothing has been recorded for the signal.
    pub fn reconcile(&self, signal: &Signal) -> FecResult<Option<String>> {
        Ok(self.best_source(signal)?.map(|(_, best)| best))
    }

    fn best_source(&self, signal: &Signal) -> FecResult<Option<(i64, String)>> {
        self.db
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                let best = best_source(&tx, signal)?;
                tx.commit()?;
                Ok(best)
            })
            .map_err(|e| with_signal(signal, e))
    }

    /// Reconciles every recorded signal. Safe to repeat.
    pub fn create_all_views(&self) -> FecResult<()> {
        let map = self.variable_map()?;
        for (source, variables) in map {
            for variable in variables {
                self.reconcile(&Signal::new(source.clone(), variable))?;
            }
        }
        info!("Created views for all recorded signals");
        Ok(())
    }

    /// All rows of a signal, ordered by timestamp.
    pub fn get_data(&self, signal: &Signal) -> FecResult<SeriesData<i64>> {
        let Some(best) = self.reconcile(signal)? else {
            debug!(%signal, "No data recorded");
            return Ok(SeriesData::unrecorded());
        };
        let order = match self.data_type(signal)? {
            Some(DataType::Exists) => "timestamp, atom_id",
            _ => "timestamp",
        };
        self.db
            .with_conn(|conn| select_all(conn, &best, order))
            .map_err(|e| with_signal(signal, e))
    }

    /// Matrix data rescaled from fixed point.
    pub fn get_data_as_float(&self, signal: &Signal) -> FecResult<SeriesData<f64>> {
        if self.data_type(signal)? == Some(DataType::Exists) {
            return Err(signal.error("event data has no floating point form"));
        }
        let Some((signal_id, best)) = self.best_source(signal)? else {
            debug!(%signal, "No data recorded");
            return Ok(SeriesData::unrecorded());
        };
        let view = object_name(signal_id, "ALL", "as_float");
        self.db
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                if !object_exists(&tx, &view)? {
                    let columns = column_names(&tx, &best)?;
                    let projection: Vec<String> = columns
                        .iter()
                        .map(|c| {
                            if c == "timestamp" {
                                "timestamp".to_string()
                            } else {
                                format!("{q} / {FLOAT_DIVISOR:.1} AS {q}", q = quote(c))
                            }
                        })
                        .collect();
                    create_view(
                        &tx,
                        signal,
                        &view,
                        &format!("SELECT {} FROM {}", projection.join(", "), quote(&best)),
                    )?;
                }
                tx.commit()?;
                select_all(conn, &view, "timestamp")
            })
            .map_err(|e| with_signal(signal, e))
    }

    /// Views currently defined for recorded signals.
    pub fn views(&self) -> FecResult<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT view_name FROM series_view ORDER BY view_name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
    }

    /// Per-core tables of a signal, ordered by first element id.
    pub fn tables(&self, signal: &Signal) -> FecResult<Vec<String>> {
        self.db.with_conn(|conn| {
            let tables = local_tables(conn, signal)?;
            Ok(tables.into_iter().map(|(table, _)| table).collect())
        })
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Adds the signal identity to raw database failures.
fn with_signal(signal: &Signal, err: FecError) -> FecError {
    match err {
        FecError::Database(e) => signal.error(e.to_string()),
        other => other,
    }
}

/// Records the data type of a new signal, or checks it against the stored one. Returns the
/// signal's catalog id.
fn claim_data_type(tx: &Transaction<'_>, signal: &Signal, requested: DataType) -> FecResult<i64> {
    let existing = tx
        .query_row(
            "SELECT signal_id, data_type FROM global_metadata
             WHERE source_name = ?1 AND variable_name = ?2",
            params![signal.source_name, signal.variable],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    match existing {
        Some((_, existing)) if existing != requested.as_str() => Err(FecError::DataTypeMismatch {
            source_name: signal.source_name.clone(),
            variable: signal.variable.clone(),
            existing,
            requested: requested.as_str().to_string(),
        }),
        Some((signal_id, _)) => Ok(signal_id),
        None => {
            tx.execute(
                "INSERT INTO global_metadata(source_name, variable_name, best_source, data_type)
                 VALUES (?1, ?2, NULL, ?3)",
                params![signal.source_name, signal.variable, requested.as_str()],
            )?;
            Ok(tx.last_insert_rowid())
        }
    }
}

fn local_table(conn: &Connection, signal: &Signal, first_id: u32) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT table_name FROM local_metadata
         WHERE source_name = ?1 AND variable_name = ?2 AND first_neuron_id = ?3",
        params![signal.source_name, signal.variable, first_id],
        |row| row.get(0),
    )
    .optional()
}

fn register_table(
    tx: &Transaction<'_>,
    signal: &Signal,
    first_id: u32,
    table: &str,
    data_type: DataType,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO local_metadata(
             source_name, variable_name, first_neuron_id, table_name, data_type)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![signal.source_name, signal.variable, first_id, table, data_type.as_str()],
    )?;
    Ok(())
}

fn object_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = ?1)",
        [name],
        |row| row.get(0),
    )
}

/// `(table, first element id)` of every per-core table of a signal.
fn local_tables(conn: &Connection, signal: &Signal) -> rusqlite::Result<Vec<(String, u32)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT table_name, first_neuron_id FROM local_metadata
         WHERE source_name = ?1 AND variable_name = ?2
         ORDER BY first_neuron_id",
    )?;
    let tables = stmt
        .query_map(params![signal.source_name, signal.variable], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect();
    tables
}

fn count_rows(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(name)), [], |row| row.get(0))
}

fn column_names(conn: &Connection, name: &str) -> rusqlite::Result<Vec<String>> {
    let stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 0", quote(name)))?;
    let names = stmt.column_names().into_iter().map(String::from).collect();
    Ok(names)
}

fn create_view(tx: &Transaction<'_>, signal: &Signal, view: &str, select: &str) -> rusqlite::Result<()> {
    tx.execute_batch(&format!("CREATE VIEW IF NOT EXISTS {} AS {select}", quote(view)))?;
    tx.execute(
        "INSERT OR IGNORE INTO series_view(view_name, source_name, variable_name) VALUES (?1, ?2, ?3)",
        params![view, signal.source_name, signal.variable],
    )?;
    Ok(())
}

fn natural_join(names: &[String]) -> String {
    let sources: Vec<String> = names.iter().map(|n| quote(n)).collect();
    format!("SELECT * FROM {}", sources.join(" NATURAL JOIN "))
}

fn best_source(tx: &Transaction<'_>, signal: &Signal) -> FecResult<Option<(i64, String)>> {
    let remembered = tx
        .query_row(
            "SELECT signal_id, best_source FROM global_metadata
             WHERE source_name = ?1 AND variable_name = ?2",
            params![signal.source_name, signal.variable],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    let Some((signal_id, remembered)) = remembered else {
        return Ok(None);
    };
    if let Some(best) = remembered {
        if object_exists(tx, &best)? {
            return Ok(Some((signal_id, best)));
        }
    }

    let tables = local_tables(tx, signal)?;
    let best = match tables.as_slice() {
        [] => return Ok(None),
        [(only, _)] => only.clone(),
        _ => reconcile_tables(tx, signal, signal_id, &tables)?,
    };

    tx.execute(
        "UPDATE global_metadata SET best_source = ?3 WHERE source_name = ?1 AND variable_name = ?2",
        params![signal.source_name, signal.variable, best],
    )?;
    info!(%signal, best_source = %best, tables = tables.len(), "Reconciled signal");
    Ok(Some((signal_id, best)))
}

fn reconcile_tables(
    tx: &Transaction<'_>,
    signal: &Signal,
    signal_id: i64,
    tables: &[(String, u32)],
) -> rusqlite::Result<String> {
    let names: Vec<String> = tables.iter().map(|(table, _)| table.clone()).collect();
    let keys = object_name(signal_id, "ALL", "keys");
    let union: Vec<String> = names
        .iter()
        .map(|t| format!("SELECT timestamp FROM {}", quote(t)))
        .collect();
    create_view(tx, signal, &keys, &union.join(" UNION "))?;

    let simple = object_name(signal_id, "ALL", "simple");
    create_view(tx, signal, &simple, &natural_join(&names))?;

    let key_count = count_rows(tx, &keys)?;
    let simple_count = count_rows(tx, &simple)?;
    if simple_count == key_count {
        debug!(%signal, rows = key_count, "All cores share the same timestamps");
        return Ok(simple);
    }

    debug!(%signal, keys = key_count, joined = simple_count, "Cores disagree on timestamps");
    let mut parts = Vec::with_capacity(tables.len());
    for (table, first_id) in tables {
        if count_rows(tx, table)? == key_count {
            parts.push(table.clone());
            continue;
        }
        let full = object_name(signal_id, &first_id.to_string(), "full");
        create_view(
            tx,
            signal,
            &full,
            &format!("SELECT * FROM {} LEFT JOIN {} USING (timestamp)", quote(&keys), quote(table)),
        )?;
        parts.push(full);
    }

    let all_full = object_name(signal_id, "ALL", "full");
    create_view(tx, signal, &all_full, &natural_join(&parts))?;
    Ok(all_full)
}

/// Drops the views of one signal so the next query rebuilds them from current data.
fn invalidate(tx: &Transaction<'_>, signal: &Signal) -> rusqlite::Result<()> {
    let views: Vec<String> = {
        let mut stmt = tx.prepare_cached(
            "SELECT view_name FROM series_view WHERE source_name = ?1 AND variable_name = ?2",
        )?;
        let names = stmt
            .query_map(params![signal.source_name, signal.variable], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        names
    };
    for view in &views {
        tx.execute_batch(&format!("DROP VIEW IF EXISTS {}", quote(view)))?;
    }
    tx.execute(
        "DELETE FROM series_view WHERE source_name = ?1 AND variable_name = ?2",
        params![signal.source_name, signal.variable],
    )?;
    tx.execute(
        "UPDATE global_metadata SET best_source = NULL WHERE source_name = ?1 AND variable_name = ?2",
        params![signal.source_name, signal.variable],
    )?;
    Ok(())
}

/// Drops every series table and view, keeping the catalog tables themselves.
pub(crate) fn drop_all(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    let collect = |sql: &str| -> rusqlite::Result<Vec<String>> {
        let mut stmt = tx.prepare(sql)?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    };
    for view in collect("SELECT view_name FROM series_view")? {
        tx.execute_batch(&format!("DROP VIEW IF EXISTS {}", quote(&view)))?;
    }
    for table in collect("SELECT table_name FROM local_metadata")? {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&table)))?;
    }
    tx.execute_batch(
        "DELETE FROM series_view;
         DELETE FROM local_metadata;
         DELETE FROM global_metadata;",
    )?;
    Ok(())
}

fn select_all<T: rusqlite::types::FromSql>(
    conn: &Connection,
    name: &str,
    order: &str,
) -> FecResult<SeriesData<T>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY {order}", quote(name)))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|i| row.get::<_, Option<T>>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(SeriesData {
        columns,
        rows,
        missing: false,
    })
}
