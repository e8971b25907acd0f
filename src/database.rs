//! SQLite storage for the timelog history engine.
//!
//! The schema is two tables: `timelog` (live entries, keyed by start) and
//! `removed` (tombstones, one per deleted uuid). Triggers keep the derived
//! `duration` column and the tombstone precedence rules consistent inside
//! the database, so every write path (single mutations, bulk import, sync
//! merges) observes the same invariants.
//!
//! UUIDs are stored as 16-byte BLOBs, `start` as integer seconds since
//! epoch, `mtime` as integer milliseconds since epoch.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::HistoryResult;
use crate::models::{Fields, SyncPayload, TimeLogEntry, TimeLogStats, TimeLogSyncRecord};

/// Entry projection shared by every history query: the stored columns plus
/// the derived preceding start (0 when there is no prior entry).
const SELECT_ENTRY: &str = "SELECT uuid, start, category, comment, duration, \
     ifnull((SELECT start FROM timelog WHERE start < result.start \
             ORDER BY start DESC LIMIT 1), 0) \
     FROM timelog AS result";

/// Result of a tombstone write.
#[derive(Debug, Clone, Copy)]
pub struct RemoveOutcome {
    /// The tombstone was written (not suppressed by a newer tombstone)
    pub tombstoned: bool,
    /// A live row existed and was deleted by the tombstone cascade
    pub live_removed: bool,
}

/// Database wrapper owning the SQLite connection.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (and if needed create) the database file at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> HistoryResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> HistoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Create tables and the invariant-maintaining triggers.
    fn init_schema(&self) -> HistoryResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS timelog
             (uuid BLOB UNIQUE, start INTEGER PRIMARY KEY, category TEXT,
              comment TEXT, duration INTEGER, mtime INTEGER);

            CREATE TABLE IF NOT EXISTS removed (uuid BLOB UNIQUE, mtime INTEGER);

            -- A tombstone newer than the incoming row suppresses the insert
            CREATE TRIGGER IF NOT EXISTS check_insert_timelog BEFORE INSERT ON timelog
            BEGIN
                SELECT mtime,
                    CASE WHEN NEW.mtime < mtime
                        THEN RAISE(IGNORE)
                    END
                FROM removed WHERE uuid=NEW.uuid;
            END;

            -- Repair neighbour durations and clear the tombstone after an insert
            CREATE TRIGGER IF NOT EXISTS insert_timelog AFTER INSERT ON timelog
            BEGIN
                UPDATE timelog SET duration=(NEW.start - start)
                WHERE start=(
                    SELECT start FROM timelog WHERE start < NEW.start
                    ORDER BY start DESC LIMIT 1
                );
                UPDATE timelog SET duration=IFNULL(
                    (SELECT start FROM timelog WHERE start > NEW.start
                     ORDER BY start ASC LIMIT 1) - NEW.start,
                    -1
                ) WHERE start=NEW.start;
                DELETE FROM removed WHERE uuid=NEW.uuid;
            END;

            CREATE TRIGGER IF NOT EXISTS delete_timelog AFTER DELETE ON timelog
            BEGIN
                UPDATE timelog SET duration=IFNULL(
                    (SELECT start FROM timelog WHERE start > OLD.start
                     ORDER BY start ASC LIMIT 1) - start,
                    -1
                ) WHERE start=(
                    SELECT start FROM timelog WHERE start < OLD.start
                    ORDER BY start DESC LIMIT 1
                );
            END;

            -- A staler update never overwrites a newer row
            CREATE TRIGGER IF NOT EXISTS check_update_timelog BEFORE UPDATE ON timelog
            BEGIN
                SELECT
                    CASE WHEN NEW.mtime < OLD.mtime
                        THEN RAISE(IGNORE)
                    END;
            END;

            CREATE TRIGGER IF NOT EXISTS update_timelog AFTER UPDATE OF start ON timelog
            BEGIN
                UPDATE timelog SET duration=(NEW.start - start)
                WHERE start=(
                    SELECT start FROM timelog WHERE start < NEW.start
                    ORDER BY start DESC LIMIT 1
                );
                -- If the predecessor did not change, do not update its duration twice
                UPDATE timelog SET duration=IFNULL(
                    (SELECT start FROM timelog WHERE start > OLD.start
                     ORDER BY start ASC LIMIT 1) - start,
                    -1
                ) WHERE start=NULLIF(
                    (SELECT start FROM timelog WHERE start < OLD.start
                     ORDER BY start DESC LIMIT 1),
                    (SELECT start FROM timelog WHERE start < NEW.start
                     ORDER BY start DESC LIMIT 1)
                );
                UPDATE timelog SET duration=IFNULL(
                    (SELECT start FROM timelog WHERE start > NEW.start
                     ORDER BY start ASC LIMIT 1) - NEW.start,
                    -1
                ) WHERE start=NEW.start;
            END;

            CREATE TRIGGER IF NOT EXISTS check_insert_removed BEFORE INSERT ON removed
            BEGIN
                SELECT mtime,
                    CASE WHEN NEW.mtime < mtime
                        THEN RAISE(IGNORE)
                    END
                FROM removed WHERE uuid=NEW.uuid;
            END;

            -- A committed tombstone deletes the live row for its uuid
            CREATE TRIGGER IF NOT EXISTS insert_removed AFTER INSERT ON removed
            BEGIN
                DELETE FROM timelog WHERE uuid=NEW.uuid;
            END;
            "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a live entry by uuid
    pub fn get_entry(&self, uuid: &Uuid) -> HistoryResult<Option<TimeLogEntry>> {
        let sql = format!("{SELECT_ENTRY} WHERE uuid = ?1");
        let mut entries = self.collect_entries(&sql, params![uuid.as_bytes().to_vec()])?;
        Ok(if entries.is_empty() {
            None
        } else {
            Some(entries.remove(0))
        })
    }

    /// Get all live entries in a category
    pub fn get_entries_by_category(&self, category: &str) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!("{SELECT_ENTRY} WHERE category = ?1 ORDER BY start ASC");
        self.collect_entries(&sql, params![category])
    }

    /// Get entries with `start` in `[begin, end]`, ascending, optionally
    /// restricted to one exact category.
    pub fn get_history_between(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        match category {
            Some(name) => {
                let sql = format!(
                    "{SELECT_ENTRY} WHERE (start BETWEEN ?1 AND ?2) AND category = ?3 \
                     ORDER BY start ASC"
                );
                self.collect_entries(&sql, params![begin.timestamp(), end.timestamp(), name])
            }
            None => {
                let sql =
                    format!("{SELECT_ENTRY} WHERE (start BETWEEN ?1 AND ?2) ORDER BY start ASC");
                self.collect_entries(&sql, params![begin.timestamp(), end.timestamp()])
            }
        }
    }

    /// Get up to `limit` entries with `start > from`, ascending
    pub fn get_history_after(
        &self,
        limit: i64,
        from: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!("{SELECT_ENTRY} WHERE start > ?1 ORDER BY start ASC LIMIT ?2");
        self.collect_entries(&sql, params![from.timestamp(), limit])
    }

    /// Get up to `limit` entries with `start < until`, descending
    /// (the caller reverses for ascending presentation).
    pub fn get_history_before(
        &self,
        limit: i64,
        until: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!("{SELECT_ENTRY} WHERE start < ?1 ORDER BY start DESC LIMIT ?2");
        self.collect_entries(&sql, params![until.timestamp(), limit])
    }

    /// Get the entries at exactly `start` (zero or one row)
    pub fn entries_at_start(&self, start: DateTime<Utc>) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!("{SELECT_ENTRY} WHERE start = ?1");
        self.collect_entries(&sql, params![start.timestamp()])
    }

    /// Window of entries observably changed by an insert at `start`:
    /// the new entry, its predecessor and its successor.
    pub fn insert_notify_window(&self, start: DateTime<Utc>) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!(
            "SELECT * FROM ({SELECT_ENTRY} WHERE start <= ?1 ORDER BY start DESC LIMIT 2) \
             UNION \
             SELECT * FROM ({SELECT_ENTRY} WHERE start > ?1 ORDER BY start ASC LIMIT 1) \
             ORDER BY start ASC"
        );
        self.collect_entries(&sql, params![start.timestamp()])
    }

    /// Window of entries observably changed by a removal at `old_start`:
    /// the two ex-neighbours.
    pub fn remove_notify_window(
        &self,
        old_start: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!(
            "SELECT * FROM ({SELECT_ENTRY} WHERE start < ?1 ORDER BY start DESC LIMIT 1) \
             UNION \
             SELECT * FROM ({SELECT_ENTRY} WHERE start > ?1 ORDER BY start ASC LIMIT 1) \
             ORDER BY start ASC"
        );
        self.collect_entries(&sql, params![old_start.timestamp()])
    }

    /// Window of entries observably changed by a start-time edit:
    /// neighbours of both the new and the old position.
    pub fn edit_notify_window(
        &self,
        new_start: DateTime<Utc>,
        old_start: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        let sql = format!(
            "SELECT * FROM ({SELECT_ENTRY} WHERE start <= ?1 ORDER BY start DESC LIMIT 2) \
             UNION \
             SELECT * FROM ({SELECT_ENTRY} WHERE start > ?1 ORDER BY start ASC LIMIT 1) \
             UNION \
             SELECT * FROM ({SELECT_ENTRY} WHERE start < ?2 ORDER BY start DESC LIMIT 1) \
             UNION \
             SELECT * FROM ({SELECT_ENTRY} WHERE start > ?2 ORDER BY start ASC LIMIT 1) \
             ORDER BY start ASC"
        );
        self.collect_entries(&sql, params![new_start.timestamp(), old_start.timestamp()])
    }

    /// Count of live rows
    pub fn count(&self) -> HistoryResult<i64> {
        let n = self
            .conn
            .query_row("SELECT count(*) FROM timelog", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Count of live rows in one category
    pub fn count_category(&self, category: &str) -> HistoryResult<i64> {
        let n = self.conn.query_row(
            "SELECT count(*) FROM timelog WHERE category = ?1",
            params![category],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// The set of distinct categories among live rows
    pub fn distinct_categories(&self) -> HistoryResult<std::collections::BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT category FROM timelog")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut categories = std::collections::BTreeSet::new();
        for row in rows {
            categories.insert(row?);
        }
        Ok(categories)
    }

    /// Per-bucket duration sums for entries in `[begin, end]`.
    ///
    /// With no filter, entries group by their first hierarchy segment. With a
    /// filter, only entries equal to the filter or under `filter + separator`
    /// count, and they group one level deeper than the filter. The open
    /// entry contributes its elapsed time (`now - start`).
    pub fn get_stats(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
        separator: &str,
    ) -> HistoryResult<Vec<TimeLogStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT category, duration FROM timelog WHERE start BETWEEN ?1 AND ?2",
        )?;
        let rows = stmt.query_map(params![begin.timestamp(), end.timestamp()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let max_start: Option<i64> = self
            .conn
            .query_row(
                "SELECT start FROM timelog ORDER BY start DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let now = Utc::now().timestamp();

        let filter = category.filter(|name| !name.is_empty());
        let filter_prefix = filter.map(|name| format!("{name}{separator}"));

        let mut buckets: BTreeMap<String, i64> = BTreeMap::new();
        for row in rows {
            let (name, duration) = row?;

            if let Some(filter) = filter {
                let under_filter = name == filter
                    || filter_prefix
                        .as_deref()
                        .is_some_and(|prefix| name.starts_with(prefix));
                if !under_filter {
                    continue;
                }
            }

            let effective = if duration != -1 {
                duration
            } else {
                max_start.map(|start| now - start).unwrap_or(0)
            };
            *buckets
                .entry(stats_bucket(&name, filter, separator))
                .or_insert(0) += effective;
        }

        Ok(buckets
            .into_iter()
            .map(|(category, duration)| TimeLogStats { category, duration })
            .collect())
    }

    /// All record changes with `mtime` in `(m_begin, m_end]`: live rows and
    /// tombstones interleaved, ascending by mtime.
    pub fn get_sync_data(
        &self,
        m_begin: DateTime<Utc>,
        m_end: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogSyncRecord>> {
        let sql = "WITH result AS ( \
                       SELECT uuid, start, category, comment, mtime FROM timelog \
                       WHERE (mtime > ?1 AND mtime <= ?2) \
                   UNION ALL \
                       SELECT uuid, NULL, NULL, NULL, mtime FROM removed \
                       WHERE (mtime > ?1 AND mtime <= ?2) \
                   ) \
                   SELECT uuid, start, category, comment, mtime FROM result \
                   ORDER BY mtime ASC";
        self.collect_sync_records(
            sql,
            params![m_begin.timestamp_millis(), m_end.timestamp_millis()],
        )
    }

    /// The locally-authoritative record for a uuid: whichever of the live row
    /// and the tombstone carries the greater mtime, or nothing.
    pub fn get_sync_affected(&self, uuid: &Uuid) -> HistoryResult<Option<TimeLogSyncRecord>> {
        let sql = "WITH result AS ( \
                       SELECT uuid, start, category, comment, mtime FROM timelog \
                       WHERE uuid = ?1 \
                   UNION ALL \
                       SELECT uuid, NULL, NULL, NULL, mtime FROM removed \
                       WHERE uuid = ?1 \
                   ) \
                   SELECT uuid, start, category, comment, mtime FROM result \
                   ORDER BY mtime DESC LIMIT 1";
        let mut records = self.collect_sync_records(sql, params![uuid.as_bytes().to_vec()])?;
        Ok(if records.is_empty() {
            None
        } else {
            Some(records.remove(0))
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert one live row. Returns false when a newer tombstone suppressed
    /// the insert; a duplicate `start` is a database error.
    pub fn insert_entry(
        &self,
        uuid: &Uuid,
        payload: &SyncPayload,
        mtime: DateTime<Utc>,
    ) -> HistoryResult<bool> {
        insert_row(&self.conn, uuid, payload, mtime)
    }

    /// Write a tombstone for a uuid; the trigger cascade deletes the live row.
    pub fn tombstone(&self, uuid: &Uuid, mtime: DateTime<Utc>) -> HistoryResult<RemoveOutcome> {
        tombstone_row(&self.conn, uuid, mtime)
    }

    /// Update the masked fields of one live row. Returns false when the uuid
    /// is unknown or a newer mtime suppressed the update.
    pub fn update_entry(
        &self,
        uuid: &Uuid,
        payload: &SyncPayload,
        fields: Fields,
        mtime: DateTime<Utc>,
    ) -> HistoryResult<bool> {
        update_row(&self.conn, uuid, payload, fields, mtime)
    }

    /// Move every live row in `old_name` to `new_name`, advancing mtimes.
    /// Returns the number of rows changed.
    pub fn rename_category(
        &self,
        old_name: &str,
        new_name: &str,
        mtime: DateTime<Utc>,
    ) -> HistoryResult<usize> {
        let changed = self.conn.execute(
            "UPDATE timelog SET category = ?1, mtime = ?2 WHERE category = ?3",
            params![new_name, mtime.timestamp_millis(), old_name],
        )?;
        Ok(changed)
    }

    /// Insert a batch of rows in one transaction; any failure rolls back all.
    pub fn insert_batch(
        &mut self,
        rows: &[(Uuid, SyncPayload, DateTime<Utc>)],
    ) -> HistoryResult<()> {
        let tx = self.conn.transaction()?;
        for (uuid, payload, mtime) in rows {
            insert_row(&tx, uuid, payload, *mtime)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Apply a classified sync batch in one transaction: tombstones first,
    /// then inserts, then whole-record updates.
    pub fn apply_sync(
        &mut self,
        removed: &[TimeLogSyncRecord],
        inserted: &[TimeLogSyncRecord],
        updated: &[TimeLogSyncRecord],
    ) -> HistoryResult<()> {
        let tx = self.conn.transaction()?;
        for record in removed {
            tombstone_row(&tx, &record.uuid, record.mtime)?;
        }
        for record in inserted {
            let payload = record
                .entry
                .as_ref()
                .ok_or_else(|| crate::error::HistoryError::sync("insert record without payload"))?;
            insert_row(&tx, &record.uuid, payload, record.mtime)?;
        }
        for record in updated {
            let payload = record
                .entry
                .as_ref()
                .ok_or_else(|| crate::error::HistoryError::sync("update record without payload"))?;
            update_row(&tx, &record.uuid, payload, Fields::ALL_FIELDS, record.mtime)?;
        }
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Row collection helpers
    // =========================================================================

    fn collect_entries<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map_entry_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn collect_sync_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> HistoryResult<Vec<TimeLogSyncRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map_sync_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn insert_row(
    conn: &Connection,
    uuid: &Uuid,
    payload: &SyncPayload,
    mtime: DateTime<Utc>,
) -> HistoryResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO timelog (uuid, start, category, comment, mtime) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            uuid.as_bytes().to_vec(),
            payload.start.timestamp(),
            payload.category,
            payload.comment,
            mtime.timestamp_millis(),
        ],
    )?;
    Ok(inserted > 0)
}

fn tombstone_row(
    conn: &Connection,
    uuid: &Uuid,
    mtime: DateTime<Utc>,
) -> HistoryResult<RemoveOutcome> {
    let live: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM timelog WHERE uuid = ?1)",
        params![uuid.as_bytes().to_vec()],
        |row| row.get(0),
    )?;
    let written = conn.execute(
        "INSERT OR REPLACE INTO removed (uuid, mtime) VALUES (?1, ?2)",
        params![uuid.as_bytes().to_vec(), mtime.timestamp_millis()],
    )?;
    Ok(RemoveOutcome {
        tombstoned: written > 0,
        live_removed: written > 0 && live,
    })
}

fn update_row(
    conn: &Connection,
    uuid: &Uuid,
    payload: &SyncPayload,
    fields: Fields,
    mtime: DateTime<Utc>,
) -> HistoryResult<bool> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if fields.contains(Fields::START_TIME) {
        sets.push("start=?");
        values.push(Value::Integer(payload.start.timestamp()));
    }
    if fields.contains(Fields::CATEGORY) {
        sets.push("category=?");
        values.push(Value::Text(payload.category.clone()));
    }
    if fields.contains(Fields::COMMENT) {
        sets.push("comment=?");
        values.push(Value::Text(payload.comment.clone()));
    }
    sets.push("mtime=?");
    values.push(Value::Integer(mtime.timestamp_millis()));
    values.push(Value::Blob(uuid.as_bytes().to_vec()));

    let sql = format!("UPDATE timelog SET {} WHERE uuid=?", sets.join(", "));
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed > 0)
}

fn map_entry_row(row: &Row) -> rusqlite::Result<TimeLogEntry> {
    let uuid_bytes: Vec<u8> = row.get(0)?;
    let uuid = Uuid::from_slice(&uuid_bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })?;

    Ok(TimeLogEntry {
        uuid,
        start: from_seconds(row.get(1)?),
        category: row.get(2)?,
        comment: row.get(3)?,
        duration: row.get(4)?,
        preceding_start: from_seconds(row.get(5)?),
    })
}

fn map_sync_row(row: &Row) -> rusqlite::Result<TimeLogSyncRecord> {
    let uuid_bytes: Vec<u8> = row.get(0)?;
    let uuid = Uuid::from_slice(&uuid_bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })?;

    let start: Option<i64> = row.get(1)?;
    let entry = match start {
        Some(seconds) => Some(SyncPayload {
            start: from_seconds(seconds),
            category: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            comment: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(TimeLogSyncRecord {
        uuid,
        entry,
        mtime: from_millis(row.get(4)?),
    })
}

fn from_seconds(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Compute the grouping bucket for a category under the stats rules:
/// the longest prefix ending at the first separator occurrence at or beyond
/// the filter boundary, right-trimmed.
fn stats_bucket(category: &str, filter: Option<&str>, separator: &str) -> String {
    let bucket = match filter {
        None => match category.find(separator) {
            Some(idx) => &category[..idx],
            None => category,
        },
        Some(filter) => match category[filter.len().min(category.len())..].find(separator) {
            None => category,
            Some(rel) => {
                let segment_start = filter.len() + rel + separator.len();
                match category[segment_start..].find(separator) {
                    None => category,
                    Some(rel2) => &category[..segment_start + rel2],
                }
            }
        },
    };
    bucket.trim_end().to_string()
}
