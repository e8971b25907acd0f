//! TimeLog Core - history engine for the TimeLog time-tracking application.
//!
//! This library provides the durable, sync-capable timeline behind the UI:
//! - Data models (TimeLogEntry, TimeLogSyncRecord, TimeLogStats)
//! - SQLite storage with trigger-maintained duration and tombstone invariants
//! - The command surface (insert/import/remove/edit/rename/undo/queries)
//! - Multi-replica synchronization under last-writer-wins
//! - A typed event surface for incremental observers
//!
//! The engine is a single owned value designed to live on one dedicated
//! worker context; front-ends that need non-blocking behaviour wrap it in
//! their own task or thread boundary.

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod history;
pub mod models;
pub mod sync;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use database::Database;
pub use error::{HistoryError, HistoryResult};
pub use events::HistoryEvent;
pub use history::TimeLogHistory;
pub use models::{Fields, SyncPayload, TimeLogEntry, TimeLogStats, TimeLogSyncRecord};
pub use sync::SyncPlan;
