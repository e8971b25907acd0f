//! The timelog history engine.
//!
//! [`TimeLogHistory`] owns the database, the undo stack and the in-memory
//! scalar state (live-row count and category set). Commands mutate through
//! the storage layer, whose triggers keep the duration and tombstone
//! invariants; after every mutation the engine re-reads the affected
//! neighbour window and publishes the corresponding events.
//!
//! The engine is single-threaded by design: it expects to live on one
//! dedicated worker context, with observers receiving events through the
//! bus. It performs no internal locking.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::database::Database;
use crate::error::{HistoryError, HistoryResult};
use crate::events::{EventBus, HistoryEvent};
use crate::models::{Fields, SyncPayload, TimeLogEntry, TimeLogStats, TimeLogSyncRecord};
use crate::sync;
use crate::validation;

/// Maximum depth of the undo stack
pub const MAX_UNDO_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UndoKind {
    Insert,
    Remove,
    Edit,
    EditCategory,
}

/// One invertible user action: the minimum captured state to undo it.
struct UndoFrame {
    kind: UndoKind,
    data: Vec<TimeLogEntry>,
    fields: Vec<Fields>,
}

/// The history engine.
pub struct TimeLogHistory {
    db: Database,
    events: EventBus,
    undo_stack: Vec<UndoFrame>,
    size: i64,
    categories: BTreeSet<String>,
}

impl TimeLogHistory {
    /// Open the engine over `<data_path>/timelog/db.sqlite`, creating the
    /// directory and schema as needed.
    pub fn open<P: AsRef<Path>>(data_path: P) -> HistoryResult<Self> {
        let dir = data_path.as_ref().join("timelog");
        std::fs::create_dir_all(&dir)?;
        Self::with_database(Database::open(dir.join("db.sqlite"))?)
    }

    /// Open an engine over an in-memory database (for testing)
    pub fn open_in_memory() -> HistoryResult<Self> {
        Self::with_database(Database::open_in_memory()?)
    }

    fn with_database(db: Database) -> HistoryResult<Self> {
        let size = db.count()?;
        let categories = db.distinct_categories()?;
        Ok(Self {
            db,
            events: EventBus::new(),
            undo_stack: Vec::new(),
            size,
            categories,
        })
    }

    /// Register an event handler for the engine's lifetime
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: Fn(&HistoryEvent) + Send + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Number of live entries
    pub fn size(&self) -> i64 {
        self.size
    }

    /// The known category set
    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    /// Current undo stack depth
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Direct access to the storage layer (read-only use)
    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Insert a new entry. The entry's `mtime` defaults to now; a live entry
    /// with the same start is a storage error.
    pub fn insert(&mut self, entry: &TimeLogEntry) -> HistoryResult<()> {
        let valid = validation::validate_category(&entry.category, "category")
            .and_then(|_| validation::validate_comment(&entry.comment, "comment"));
        if let Err(e) = valid {
            self.report(&e);
            return Err(e);
        }

        self.push_undo(UndoFrame {
            kind: UndoKind::Insert,
            data: vec![entry.clone()],
            fields: Vec::new(),
        });
        self.insert_entry(entry, None)
    }

    /// Bulk-insert entries in one transaction. On failure everything rolls
    /// back and observers get `DataOutdated`; on success a single
    /// `DataImported` tells them to refresh wholesale.
    pub fn import(&mut self, entries: &[TimeLogEntry]) -> HistoryResult<()> {
        let now = Utc::now();
        let rows: Vec<_> = entries
            .iter()
            .map(|entry| (entry.uuid, SyncPayload::from(entry), now))
            .collect();

        match self.db.insert_batch(&rows) {
            Ok(()) => {
                self.emit(HistoryEvent::DataImported(entries.to_vec()));
                self.refresh_scalars()
            }
            Err(e) => {
                self.report(&e);
                self.process_fail();
                Err(e)
            }
        }
    }

    /// Remove an entry by uuid, leaving a tombstone
    pub fn remove(&mut self, entry: &TimeLogEntry) -> HistoryResult<()> {
        let old = match self.resolve_entry(&entry.uuid) {
            Ok(old) => old,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };

        self.push_undo(UndoFrame {
            kind: UndoKind::Remove,
            data: vec![old.clone()],
            fields: Vec::new(),
        });
        self.remove_entry(&old, None)
    }

    /// Apply the masked fields of `entry` to the stored row with its uuid
    pub fn edit(&mut self, entry: &TimeLogEntry, fields: Fields) -> HistoryResult<()> {
        let valid = validation::validate_edit_fields(fields)
            .and_then(|_| {
                if fields.contains(Fields::CATEGORY) {
                    validation::validate_category(&entry.category, "category")
                } else {
                    Ok(())
                }
            })
            .and_then(|_| {
                if fields.contains(Fields::COMMENT) {
                    validation::validate_comment(&entry.comment, "comment")
                } else {
                    Ok(())
                }
            });
        if let Err(e) = valid {
            self.report(&e);
            return Err(e);
        }

        // Resolve before pushing, so a bad uuid leaves the undo stack untouched
        let old = match self.resolve_entry(&entry.uuid) {
            Ok(old) => old,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };

        self.push_undo(UndoFrame {
            kind: UndoKind::Edit,
            data: vec![old],
            fields: vec![fields],
        });
        self.edit_entry(entry, fields, None)
    }

    /// Move every entry in `old_name` to `new_name`. Renaming a category
    /// with no entries succeeds as a no-op, dropping the stale name from the
    /// category set.
    pub fn edit_category(&mut self, old_name: &str, new_name: &str) -> HistoryResult<()> {
        if let Err(e) = validation::validate_category(new_name, "new_name") {
            self.report(&e);
            return Err(e);
        }
        if old_name == new_name {
            tracing::warn!("Same category name: {new_name}");
            return Ok(());
        }

        let entries = match self.db.get_entries_by_category(old_name) {
            Ok(entries) => entries,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };
        if entries.is_empty() {
            self.remove_from_categories(old_name);
            return Ok(());
        }

        let fields = vec![Fields::CATEGORY; entries.len()];
        self.push_undo(UndoFrame {
            kind: UndoKind::EditCategory,
            data: entries,
            fields,
        });

        match self.db.rename_category(old_name, new_name, Utc::now()) {
            Ok(_) => {
                if let Err(e) = self.refresh_categories() {
                    self.report(&e);
                    self.process_fail();
                    return Err(e);
                }
                self.emit(HistoryEvent::DataOutdated);
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                self.process_fail();
                Err(e)
            }
        }
    }

    /// Invert the most recent user action. Undoing does not push a new frame.
    pub fn undo(&mut self) -> HistoryResult<()> {
        let Some(frame) = self.undo_stack.pop() else {
            tracing::warn!("Empty undo stack");
            return Ok(());
        };

        let result = match frame.kind {
            UndoKind::Insert => self.remove_entry(&frame.data[0], None),
            UndoKind::Remove => self.insert_entry(&frame.data[0], None),
            UndoKind::Edit => self.edit_entry(&frame.data[0], frame.fields[0], None),
            UndoKind::EditCategory => {
                for (entry, fields) in frame.data.iter().zip(frame.fields.iter()) {
                    if self.edit_entry(entry, *fields, None).is_err() {
                        break;
                    }
                }
                Ok(())
            }
        };

        self.emit(HistoryEvent::UndoCountChanged(self.undo_stack.len()));
        result
    }

    /// Merge a peer's modification batch under last-writer-wins.
    ///
    /// Classification is announced through `SyncStatsAvailable` before the
    /// merge commits; the merge itself is one transaction.
    pub fn sync(
        &mut self,
        updated: &[TimeLogSyncRecord],
        removed: &[TimeLogSyncRecord],
    ) -> HistoryResult<()> {
        if let Err(e) = validation::validate_sync_updated(updated) {
            self.report(&e);
            return Err(e);
        }

        let plan = {
            let db = &self.db;
            match sync::classify(updated, removed, |uuid| db.get_sync_affected(uuid)) {
                Ok(plan) => plan,
                Err(e) => {
                    self.report(&e);
                    return Err(e);
                }
            }
        };

        self.emit(HistoryEvent::SyncStatsAvailable {
            removed_old: plan.removed_old.clone(),
            removed_new: plan.removed_new.clone(),
            inserted_old: plan.inserted_old.clone(),
            inserted_new: plan.inserted_new.clone(),
            updated_old: plan.updated_old.clone(),
            updated_new: plan.updated_new.clone(),
        });

        let merged = plan.removed_merged();
        if let Err(e) = self
            .db
            .apply_sync(&merged, &plan.inserted_new, &plan.updated_new)
        {
            self.report(&e);
            self.process_fail();
            return Err(e);
        }

        if let Err(e) = self.refresh_scalars() {
            self.report(&e);
            return Err(e);
        }

        for record in &merged {
            if let Some(entry) = record.to_entry() {
                self.emit(HistoryEvent::DataRemoved(entry));
            }
        }
        for record in &merged {
            if let Some(payload) = &record.entry {
                self.notify_remove_updates(payload.start);
            }
        }
        for record in &plan.inserted_new {
            if let Some(entry) = record.to_entry() {
                self.emit(HistoryEvent::DataInserted(entry));
            }
        }
        for record in &plan.inserted_new {
            if let Some(payload) = &record.entry {
                self.notify_insert_updates(payload.start);
            }
        }
        for (new, old) in plan.updated_new.iter().zip(plan.updated_old.iter()) {
            let (Some(new_payload), Some(old_payload)) = (&new.entry, &old.entry) else {
                continue;
            };
            let mut fields = Fields::NO_FIELDS;
            if new_payload.start.timestamp() != old_payload.start.timestamp() {
                fields |= Fields::START_TIME;
            }
            if new_payload.category != old_payload.category {
                fields |= Fields::CATEGORY;
            }
            if new_payload.comment != old_payload.comment {
                fields |= Fields::COMMENT;
            }
            self.notify_edit_updates(new_payload.start, fields, Some(old_payload.start));
        }

        self.emit(HistoryEvent::DataSynced {
            updated: updated.to_vec(),
            removed: removed.to_vec(),
        });
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Entries with start in `[begin, end]`, ascending, optionally filtered
    /// to one exact category. `id` is echoed in the completion event.
    pub fn get_history_between(
        &self,
        id: i64,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        self.complete_history_request(id, self.db.get_history_between(begin, end, category))
    }

    /// Up to `limit` entries after `from`, ascending
    pub fn get_history_after(
        &self,
        id: i64,
        limit: i64,
        from: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        self.complete_history_request(id, self.db.get_history_after(limit, from))
    }

    /// The `limit` entries with the largest start before `until`, ascending
    pub fn get_history_before(
        &self,
        id: i64,
        limit: i64,
        until: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        let result = self.db.get_history_before(limit, until).map(|mut entries| {
            entries.reverse();
            entries
        });
        self.complete_history_request(id, result)
    }

    /// Category-bucketed duration sums over `[begin, end]`
    pub fn get_stats(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        category: Option<&str>,
        separator: &str,
    ) -> HistoryResult<Vec<TimeLogStats>> {
        match self.db.get_stats(begin, end, category, separator) {
            Ok(rows) => {
                self.emit(HistoryEvent::StatsDataAvailable {
                    rows: rows.clone(),
                    until: end,
                });
                Ok(rows)
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// All record changes with mtime in `(m_begin, m_end]`, ascending by
    /// mtime, for shipping to a peer.
    pub fn get_sync_data(
        &self,
        m_begin: DateTime<Utc>,
        m_end: DateTime<Utc>,
    ) -> HistoryResult<Vec<TimeLogSyncRecord>> {
        match self.db.get_sync_data(m_begin, m_end) {
            Ok(records) => {
                self.emit(HistoryEvent::SyncDataAvailable {
                    records: records.clone(),
                    until: m_end,
                });
                Ok(records)
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resolve_entry(&self, uuid: &uuid::Uuid) -> HistoryResult<TimeLogEntry> {
        self.db
            .get_entry(uuid)?
            .ok_or_else(|| HistoryError::not_found(format!("no entry with uuid {uuid}")))
    }

    fn insert_entry(
        &mut self,
        entry: &TimeLogEntry,
        mtime: Option<DateTime<Utc>>,
    ) -> HistoryResult<()> {
        let mtime = mtime.unwrap_or_else(Utc::now);
        match self
            .db
            .insert_entry(&entry.uuid, &SyncPayload::from(entry), mtime)
        {
            Ok(inserted) => {
                self.emit(HistoryEvent::DataInserted(entry.clone()));
                if inserted {
                    self.set_size(self.size + 1);
                    self.add_to_categories(&entry.category);
                }
                self.notify_insert_updates(entry.start);
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                self.process_fail();
                Err(e)
            }
        }
    }

    fn remove_entry(
        &mut self,
        entry: &TimeLogEntry,
        mtime: Option<DateTime<Utc>>,
    ) -> HistoryResult<()> {
        match self.db.tombstone(&entry.uuid, mtime.unwrap_or_else(Utc::now)) {
            Ok(outcome) => {
                self.emit(HistoryEvent::DataRemoved(entry.clone()));
                if outcome.live_removed {
                    self.set_size(self.size - 1);
                }
                self.notify_remove_updates(entry.start);
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                self.process_fail();
                Err(e)
            }
        }
    }

    fn edit_entry(
        &mut self,
        entry: &TimeLogEntry,
        fields: Fields,
        mtime: Option<DateTime<Utc>>,
    ) -> HistoryResult<()> {
        // The old start locates the old neighbour window after the move
        let old_start = if fields.contains(Fields::START_TIME) {
            match self.resolve_entry(&entry.uuid) {
                Ok(old) => Some(old.start),
                Err(e) => {
                    self.report(&e);
                    self.process_fail();
                    return Err(e);
                }
            }
        } else {
            None
        };

        match self.db.update_entry(
            &entry.uuid,
            &SyncPayload::from(entry),
            fields,
            mtime.unwrap_or_else(Utc::now),
        ) {
            Ok(changed) => {
                if !changed {
                    tracing::debug!("Update of {} changed no rows", entry.uuid);
                }
                if fields.contains(Fields::CATEGORY) {
                    self.add_to_categories(&entry.category);
                }
                self.notify_edit_updates(entry.start, fields, old_start);
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                self.process_fail();
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Notification planner
    // -------------------------------------------------------------------------

    fn neighbour_fields() -> Fields {
        Fields::DURATION_TIME | Fields::PRECEDING_START
    }

    fn notify_insert_updates(&self, start: DateTime<Utc>) {
        match self.db.insert_notify_window(start) {
            Ok(entries) => self.emit_updates(entries, Self::neighbour_fields()),
            Err(e) => self.report(&e),
        }
    }

    fn notify_remove_updates(&self, old_start: DateTime<Utc>) {
        match self.db.remove_notify_window(old_start) {
            Ok(entries) => self.emit_updates(entries, Self::neighbour_fields()),
            Err(e) => self.report(&e),
        }
    }

    fn notify_edit_updates(
        &self,
        start: DateTime<Utc>,
        fields: Fields,
        old_start: Option<DateTime<Utc>>,
    ) {
        if fields.contains(Fields::START_TIME) {
            let Some(old_start) = old_start else {
                return;
            };
            match self.db.edit_notify_window(start, old_start) {
                Ok(entries) => self.emit_updates(entries, fields | Self::neighbour_fields()),
                Err(e) => self.report(&e),
            }
        } else {
            match self.db.entries_at_start(start) {
                Ok(entries) => self.emit_updates(entries, fields),
                Err(e) => self.report(&e),
            }
        }
    }

    fn emit_updates(&self, entries: Vec<TimeLogEntry>, fields: Fields) {
        if entries.is_empty() {
            return;
        }
        let masks = vec![fields; entries.len()];
        self.emit(HistoryEvent::DataUpdated(entries, masks));
    }

    // -------------------------------------------------------------------------
    // Scalar state and undo bookkeeping
    // -------------------------------------------------------------------------

    fn set_size(&mut self, size: i64) {
        if self.size == size {
            return;
        }
        self.size = size;
        self.emit(HistoryEvent::SizeChanged(size));
    }

    fn add_to_categories(&mut self, category: &str) {
        if self.categories.insert(category.to_string()) {
            self.emit(HistoryEvent::CategoriesChanged(self.categories.clone()));
        }
    }

    fn remove_from_categories(&mut self, category: &str) {
        if self.categories.remove(category) {
            self.emit(HistoryEvent::CategoriesChanged(self.categories.clone()));
        }
    }

    fn refresh_categories(&mut self) -> HistoryResult<()> {
        let categories = self.db.distinct_categories()?;
        if categories != self.categories {
            self.categories = categories;
            self.emit(HistoryEvent::CategoriesChanged(self.categories.clone()));
        }
        Ok(())
    }

    fn refresh_scalars(&mut self) -> HistoryResult<()> {
        let size = self.db.count()?;
        self.set_size(size);
        self.refresh_categories()
    }

    fn push_undo(&mut self, frame: UndoFrame) {
        self.undo_stack.push(frame);
        if self.undo_stack.len() > MAX_UNDO_SIZE {
            // The visible count stays at the cap, so no signal
            self.undo_stack.remove(0);
        } else {
            self.emit(HistoryEvent::UndoCountChanged(self.undo_stack.len()));
        }
    }

    fn process_fail(&mut self) {
        self.undo_stack.clear();
        self.emit(HistoryEvent::UndoCountChanged(0));
        self.emit(HistoryEvent::DataOutdated);
    }

    fn report(&self, error: &HistoryError) {
        tracing::error!("{error}");
        self.emit(HistoryEvent::Error(error.to_string()));
    }

    fn emit(&self, event: HistoryEvent) {
        self.events.emit(&event);
    }

    fn complete_history_request(
        &self,
        id: i64,
        result: HistoryResult<Vec<TimeLogEntry>>,
    ) -> HistoryResult<Vec<TimeLogEntry>> {
        match result {
            Ok(entries) => {
                self.emit(HistoryEvent::HistoryRequestCompleted {
                    entries: entries.clone(),
                    id,
                });
                Ok(entries)
            }
            Err(e) => {
                self.report(&e);
                self.emit(HistoryEvent::HistoryRequestCompleted {
                    entries: Vec::new(),
                    id,
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn ms(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn entry(start: i64, category: &str, comment: &str) -> TimeLogEntry {
        TimeLogEntry::new(ts(start), category.to_string(), comment.to_string())
    }

    fn live_record(uuid: Uuid, start: i64, category: &str, millis: i64) -> TimeLogSyncRecord {
        TimeLogSyncRecord {
            uuid,
            entry: Some(SyncPayload {
                start: ts(start),
                category: category.to_string(),
                comment: String::new(),
            }),
            mtime: ms(millis),
        }
    }

    fn recorder(history: &mut TimeLogHistory) -> Arc<Mutex<Vec<HistoryEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        history.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    fn starts_and_durations(history: &TimeLogHistory) -> Vec<(i64, i64)> {
        history
            .database()
            .get_history_between(ts(0), ts(1_000_000), None)
            .unwrap()
            .iter()
            .map(|e| (e.start.timestamp(), e.duration))
            .collect()
    }

    #[test]
    fn test_insert_and_duration_propagation() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        history.insert(&entry(200, "b", "")).unwrap();

        assert_eq!(starts_and_durations(&history), vec![(100, 100), (200, -1)]);
        assert_eq!(history.size(), 2);
        assert!(history.categories().contains("a"));
        assert!(history.categories().contains("b"));
    }

    #[test]
    fn test_insert_event_order() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let events = recorder(&mut history);
        history.insert(&entry(100, "a", "")).unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events[0], HistoryEvent::UndoCountChanged(1)));
        assert!(matches!(events[1], HistoryEvent::DataInserted(_)));
        assert!(matches!(events[2], HistoryEvent::SizeChanged(1)));
        assert!(matches!(events[3], HistoryEvent::CategoriesChanged(_)));
        assert!(matches!(events[4], HistoryEvent::DataUpdated(_, _)));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_insert_then_undo_restores_empty_state() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let e = entry(100, "a", "");
        history.insert(&e).unwrap();
        history.undo().unwrap();

        assert_eq!(history.size(), 0);
        assert_eq!(history.undo_count(), 0);
        assert!(starts_and_durations(&history).is_empty());
    }

    #[test]
    fn test_remove_closes_gap_and_undo_restores() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        let middle = entry(200, "b", "note");
        history.insert(&middle).unwrap();
        history.insert(&entry(300, "c", "")).unwrap();

        history.remove(&middle).unwrap();
        assert_eq!(starts_and_durations(&history), vec![(100, 200), (300, -1)]);
        assert!(history
            .database()
            .get_sync_affected(&middle.uuid)
            .unwrap()
            .unwrap()
            .is_tombstone());

        history.undo().unwrap();
        assert_eq!(
            starts_and_durations(&history),
            vec![(100, 100), (200, 100), (300, -1)]
        );
        let restored = history.database().get_entry(&middle.uuid).unwrap().unwrap();
        assert_eq!(restored.category, "b");
        assert_eq!(restored.comment, "note");
        // The tombstone is gone
        assert!(!history
            .database()
            .get_sync_affected(&middle.uuid)
            .unwrap()
            .unwrap()
            .is_tombstone());
    }

    #[test]
    fn test_remove_unknown_uuid_is_an_error() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let events = recorder(&mut history);

        let result = history.remove(&entry(100, "a", ""));
        assert!(matches!(result, Err(HistoryError::NotFound(_))));
        assert_eq!(history.undo_count(), 0);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], HistoryEvent::Error(_)));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_edit_then_undo_restores_masked_fields() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let original = entry(100, "a", "before");
        history.insert(&original).unwrap();

        let mut changed = original.clone();
        changed.category = "b".to_string();
        changed.comment = "after".to_string();
        history
            .edit(&changed, Fields::CATEGORY | Fields::COMMENT)
            .unwrap();

        let stored = history.database().get_entry(&original.uuid).unwrap().unwrap();
        assert_eq!(stored.category, "b");
        assert_eq!(stored.comment, "after");

        history.undo().unwrap();
        let stored = history.database().get_entry(&original.uuid).unwrap().unwrap();
        assert_eq!(stored.category, "a");
        assert_eq!(stored.comment, "before");
    }

    #[test]
    fn test_edit_start_reorders_and_notifies_window() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        let moved = entry(200, "b", "");
        history.insert(&moved).unwrap();
        history.insert(&entry(300, "c", "")).unwrap();

        let events = recorder(&mut history);
        let mut changed = moved.clone();
        changed.start = ts(50);
        history.edit(&changed, Fields::START_TIME).unwrap();

        assert_eq!(
            starts_and_durations(&history),
            vec![(50, 50), (100, 200), (300, -1)]
        );

        let events = events.lock().unwrap();
        let update = events
            .iter()
            .find_map(|event| match event {
                HistoryEvent::DataUpdated(entries, masks) => Some((entries.clone(), masks.clone())),
                _ => None,
            })
            .unwrap();
        let starts: Vec<i64> = update.0.iter().map(|e| e.start.timestamp()).collect();
        assert_eq!(starts, vec![50, 100, 300]);
        assert!(update.1[0].contains(Fields::START_TIME));
        assert!(update.1[0].contains(Fields::DURATION_TIME));
        assert!(update.1[0].contains(Fields::PRECEDING_START));
    }

    #[test]
    fn test_edit_unknown_uuid_pushes_no_frame() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        assert_eq!(history.undo_count(), 1);

        let result = history.edit(&entry(500, "b", ""), Fields::CATEGORY);
        assert!(matches!(result, Err(HistoryError::NotFound(_))));
        assert_eq!(history.undo_count(), 1);
    }

    #[test]
    fn test_edit_with_no_fields_is_rejected() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let e = entry(100, "a", "");
        history.insert(&e).unwrap();

        let result = history.edit(&e, Fields::NO_FIELDS);
        assert!(matches!(result, Err(HistoryError::Validation { .. })));
    }

    #[test]
    fn test_duplicate_start_fails_and_clears_undo() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        let events = recorder(&mut history);

        let result = history.insert(&entry(100, "b", ""));
        assert!(result.is_err());
        assert_eq!(history.undo_count(), 0);
        assert_eq!(history.size(), 1);

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event, HistoryEvent::Error(_))));
        assert!(events
            .iter()
            .any(|event| matches!(event, HistoryEvent::DataOutdated)));
    }

    #[test]
    fn test_edit_category_renames_and_undo_restores() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "x", "")).unwrap();
        history.insert(&entry(200, "x", "")).unwrap();
        history.insert(&entry(300, "y", "")).unwrap();

        history.edit_category("x", "z").unwrap();
        assert_eq!(history.database().count_category("x").unwrap(), 0);
        assert_eq!(history.database().count_category("z").unwrap(), 2);
        assert!(history.categories().contains("z"));
        assert!(!history.categories().contains("x"));

        history.undo().unwrap();
        assert_eq!(history.database().count_category("x").unwrap(), 2);
        assert_eq!(history.database().count_category("z").unwrap(), 0);
    }

    #[test]
    fn test_edit_category_same_name_is_a_noop() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "x", "")).unwrap();
        let events = recorder(&mut history);

        history.edit_category("x", "x").unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_edit_category_empty_name_is_rejected() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let result = history.edit_category("x", "");
        assert!(matches!(result, Err(HistoryError::Validation { .. })));
    }

    #[test]
    fn test_edit_category_without_entries_succeeds_as_noop() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        let events = recorder(&mut history);

        history.edit_category("ghost", "real").unwrap();
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(history.undo_count(), 1); // only the insert frame
    }

    #[test]
    fn test_undo_on_empty_stack_is_harmless() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let events = recorder(&mut history);
        history.undo().unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_undo_stack_caps_at_ten_frames() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let events = recorder(&mut history);
        for i in 0..12 {
            history.insert(&entry(100 * (i + 1), "a", "")).unwrap();
        }
        assert_eq!(history.undo_count(), MAX_UNDO_SIZE);

        // The count signal fired only while the stack was growing
        let undo_events: Vec<usize> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                HistoryEvent::UndoCountChanged(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(undo_events.len(), MAX_UNDO_SIZE);
        assert_eq!(*undo_events.last().unwrap(), MAX_UNDO_SIZE);
    }

    #[test]
    fn test_import_emits_single_wholesale_event() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let events = recorder(&mut history);
        let entries = vec![entry(100, "a", ""), entry(200, "b", "")];
        history.import(&entries).unwrap();

        assert_eq!(history.size(), 2);
        let events = events.lock().unwrap();
        assert!(matches!(events[0], HistoryEvent::DataImported(ref list) if list.len() == 2));
        assert!(!events
            .iter()
            .any(|event| matches!(event, HistoryEvent::DataInserted(_))));
    }

    #[test]
    fn test_import_failure_rolls_back_everything() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(50, "seed", "")).unwrap();

        let entries = vec![entry(100, "a", ""), entry(100, "b", "")];
        assert!(history.import(&entries).is_err());

        assert_eq!(history.size(), 1);
        assert_eq!(history.undo_count(), 0);
    }

    #[test]
    fn test_history_before_is_ascending() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        for start in [100, 200, 300, 400] {
            history.insert(&entry(start, "a", "")).unwrap();
        }

        let entries = history.get_history_before(7, 2, ts(400)).unwrap();
        let starts: Vec<i64> = entries.iter().map(|e| e.start.timestamp()).collect();
        assert_eq!(starts, vec![200, 300]);
    }

    #[test]
    fn test_history_queries_emit_completion_with_id() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "a", "")).unwrap();
        let events = recorder(&mut history);

        history.get_history_between(42, ts(0), ts(1000), None).unwrap();
        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            HistoryEvent::HistoryRequestCompleted { id: 42, ref entries } if entries.len() == 1
        ));
    }

    #[test]
    fn test_get_stats_emits_rows() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        history.insert(&entry(100, "work/email", "")).unwrap();
        history.insert(&entry(200, "home", "")).unwrap();
        let events = recorder(&mut history);

        let rows = history.get_stats(ts(0), ts(1000), None, "/").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(
            events.lock().unwrap()[0],
            HistoryEvent::StatsDataAvailable { ref rows, .. } if rows.len() == 2
        ));
    }

    #[test]
    fn test_sync_lww_loser_changes_nothing() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let uuid = Uuid::new_v4();
        history
            .sync(&[live_record(uuid, 100, "a", 1000)], &[])
            .unwrap();

        let events = recorder(&mut history);
        history
            .sync(&[live_record(uuid, 100, "b", 500)], &[])
            .unwrap();

        assert_eq!(
            history.database().get_entry(&uuid).unwrap().unwrap().category,
            "a"
        );
        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            HistoryEvent::SyncStatsAvailable { ref inserted_new, ref updated_new, .. }
                if inserted_new.is_empty() && updated_new.is_empty()
        ));
    }

    #[test]
    fn test_sync_tombstone_defeats_older_insert() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let uuid = Uuid::new_v4();
        history
            .sync(&[live_record(uuid, 100, "a", 1000)], &[])
            .unwrap();
        history
            .sync(&[], &[TimeLogSyncRecord::tombstone(uuid, ms(2000))])
            .unwrap();

        let events = recorder(&mut history);
        history
            .sync(&[live_record(uuid, 100, "a", 1000)], &[])
            .unwrap();

        assert!(history.database().get_entry(&uuid).unwrap().is_none());
        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            HistoryEvent::SyncStatsAvailable { ref inserted_new, ref updated_new, .. }
                if inserted_new.is_empty() && updated_new.is_empty()
        ));
    }

    #[test]
    fn test_sync_applies_batch_and_orders_events() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let victim = Uuid::new_v4();
        let edited = Uuid::new_v4();
        history
            .sync(
                &[
                    live_record(victim, 100, "a", 1000),
                    live_record(edited, 200, "b", 1000),
                ],
                &[],
            )
            .unwrap();

        let events = recorder(&mut history);
        let fresh = Uuid::new_v4();
        history
            .sync(
                &[
                    live_record(fresh, 300, "c", 3000),
                    live_record(edited, 200, "b2", 3000),
                ],
                &[TimeLogSyncRecord::tombstone(victim, ms(3000))],
            )
            .unwrap();

        assert!(history.database().get_entry(&victim).unwrap().is_none());
        assert_eq!(
            history.database().get_entry(&edited).unwrap().unwrap().category,
            "b2"
        );
        assert!(history.database().get_entry(&fresh).unwrap().is_some());

        let events = events.lock().unwrap();
        assert!(matches!(events[0], HistoryEvent::SyncStatsAvailable { .. }));
        assert!(matches!(events.last().unwrap(), HistoryEvent::DataSynced { .. }));
        let removed_at = events
            .iter()
            .position(|e| matches!(e, HistoryEvent::DataRemoved(_)))
            .unwrap();
        let inserted_at = events
            .iter()
            .position(|e| matches!(e, HistoryEvent::DataInserted(_)))
            .unwrap();
        assert!(removed_at < inserted_at);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut history = TimeLogHistory::open_in_memory().unwrap();
        let uuid = Uuid::new_v4();
        let updated = vec![live_record(uuid, 100, "a", 1000)];
        let removed = vec![TimeLogSyncRecord::tombstone(Uuid::new_v4(), ms(900))];

        history.sync(&updated, &removed).unwrap();
        let events = recorder(&mut history);
        history.sync(&updated, &removed).unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            HistoryEvent::SyncStatsAvailable {
                ref removed_new, ref inserted_new, ref updated_new, ..
            } if removed_new.is_empty() && inserted_new.is_empty() && updated_new.is_empty()
        ));
    }

    #[test]
    fn test_symmetric_sync_converges() {
        let mut a = TimeLogHistory::open_in_memory().unwrap();
        let mut b = TimeLogHistory::open_in_memory().unwrap();

        // Common ancestor: one shared entry, later recategorized on B
        let shared = Uuid::new_v4();
        a.sync(&[live_record(shared, 100, "a", 1000)], &[]).unwrap();
        b.sync(&[live_record(shared, 100, "a", 1000)], &[]).unwrap();
        b.sync(&[live_record(shared, 100, "b", 2000)], &[]).unwrap();

        // A gained a private entry; B removed an entry A still has
        let only_a = Uuid::new_v4();
        a.sync(&[live_record(only_a, 200, "x", 1500)], &[]).unwrap();
        let dead = Uuid::new_v4();
        a.sync(&[live_record(dead, 300, "y", 1600)], &[]).unwrap();
        b.sync(&[], &[TimeLogSyncRecord::tombstone(dead, ms(2500))])
            .unwrap();

        let begin = ms(0);
        let end = ms(1_000_000);
        let from_a = a.get_sync_data(begin, end).unwrap();
        let from_b = b.get_sync_data(begin, end).unwrap();

        let split = |records: Vec<TimeLogSyncRecord>| {
            let (tombstones, live): (Vec<_>, Vec<_>) =
                records.into_iter().partition(|r| r.is_tombstone());
            (live, tombstones)
        };
        let (a_updated, a_removed) = split(from_a);
        let (b_updated, b_removed) = split(from_b);

        b.sync(&a_updated, &a_removed).unwrap();
        a.sync(&b_updated, &b_removed).unwrap();

        assert_eq!(
            a.get_sync_data(begin, end).unwrap(),
            b.get_sync_data(begin, end).unwrap()
        );
        assert_eq!(
            a.database().get_history_between(ts(0), ts(1000), None).unwrap(),
            b.database().get_history_between(ts(0), ts(1000), None).unwrap()
        );
        // The shared entry converged to B's newer category everywhere
        assert_eq!(
            a.database().get_entry(&shared).unwrap().unwrap().category,
            "b"
        );
    }
}
