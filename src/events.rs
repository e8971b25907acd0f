//! Typed event surface emitted by the history engine.
//!
//! Observers register handlers on the engine's [`EventBus`]; every command
//! publishes the events describing its effects, in the order produced.
//! Events are plain values (all payloads are `Clone`) so a front-end can
//! forward them across thread boundaries.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::models::{Fields, TimeLogEntry, TimeLogStats, TimeLogSyncRecord};

/// Events published by the history engine.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    /// A command failed; the message is human-readable
    Error(String),
    /// A single entry was inserted
    DataInserted(TimeLogEntry),
    /// A bulk import committed; observers should refresh wholesale
    DataImported(Vec<TimeLogEntry>),
    /// A single entry was removed (tombstoned)
    DataRemoved(TimeLogEntry),
    /// Entries changed; the mask at index i describes which fields of
    /// entries[i] changed (a single emission always carries a uniform mask)
    DataUpdated(Vec<TimeLogEntry>, Vec<Fields>),
    /// Cached views are stale; observers must re-query
    DataOutdated,
    /// A sync batch committed
    DataSynced {
        updated: Vec<TimeLogSyncRecord>,
        removed: Vec<TimeLogSyncRecord>,
    },
    /// The live-row count changed
    SizeChanged(i64),
    /// The set of known categories changed
    CategoriesChanged(BTreeSet<String>),
    /// The visible undo depth changed
    UndoCountChanged(usize),
    /// A history query completed; `id` echoes the request id
    HistoryRequestCompleted {
        entries: Vec<TimeLogEntry>,
        id: i64,
    },
    /// A statistics query completed
    StatsDataAvailable {
        rows: Vec<TimeLogStats>,
        until: DateTime<Utc>,
    },
    /// A sync-data query completed
    SyncDataAvailable {
        records: Vec<TimeLogSyncRecord>,
        until: DateTime<Utc>,
    },
    /// Pre-merge classification of a sync batch, emitted before commit.
    /// The `*_old` vectors hold the locally-authoritative record for each
    /// classified element (`None` when the uuid was unknown locally).
    SyncStatsAvailable {
        removed_old: Vec<Option<TimeLogSyncRecord>>,
        removed_new: Vec<TimeLogSyncRecord>,
        inserted_old: Vec<Option<TimeLogSyncRecord>>,
        inserted_new: Vec<TimeLogSyncRecord>,
        updated_old: Vec<TimeLogSyncRecord>,
        updated_new: Vec<TimeLogSyncRecord>,
    },
}

type Handler = Box<dyn Fn(&HistoryEvent) + Send>;

/// Ordered registry of event handlers.
///
/// Handlers are invoked synchronously, in subscription order, on the
/// engine's worker context.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<Handler>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it stays subscribed for the engine's lifetime.
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: Fn(&HistoryEvent) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Deliver an event to every handler, in subscription order.
    pub fn emit(&self, event: &HistoryEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }
}
