//! Data models for the timelog history engine.
//!
//! This module defines the core value types: TimeLogEntry, TimeLogSyncRecord,
//! TimeLogStats, and the Fields mask used by edit operations and update
//! notifications. Entry ids are UUIDs stored as 16 bytes in the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bit mask selecting entry fields for edits and update notifications.
///
/// Masks combine with `|`; `contains` checks that all bits of the argument
/// are set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct Fields(u32);

impl Fields {
    pub const NO_FIELDS: Fields = Fields(0);
    pub const START_TIME: Fields = Fields(1);
    pub const DURATION_TIME: Fields = Fields(2);
    pub const CATEGORY: Fields = Fields(4);
    pub const COMMENT: Fields = Fields(8);
    pub const PRECEDING_START: Fields = Fields(16);
    /// The fields a caller may edit directly
    pub const ALL_FIELDS: Fields = Fields(1 | 4 | 8);

    /// Check whether all bits of `other` are set in `self`
    pub fn contains(self, other: Fields) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any bit of `other` is set in `self`
    pub fn intersects(self, other: Fields) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Fields {
    type Output = Fields;

    fn bitor(self, rhs: Fields) -> Fields {
        Fields(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Fields {
    fn bitor_assign(&mut self, rhs: Fields) {
        self.0 |= rhs.0;
    }
}

/// A single start-of-activity record in the timeline.
///
/// `duration` and `preceding_start` are derived: the database maintains
/// `duration` (seconds to the next entry's start, `-1` for the open entry)
/// and queries project `preceding_start` (the prior entry's start, epoch 0
/// when there is none).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLogEntry {
    /// Unique identifier for the entry
    pub uuid: Uuid,
    /// When the activity started (second precision)
    pub start: DateTime<Utc>,
    /// Hierarchical category label, levels separated by a configurable string
    pub category: String,
    /// Free-form comment (possibly empty)
    pub comment: String,
    /// Seconds until the next entry's start; `-1` for the currently running entry
    pub duration: i64,
    /// Start of the immediately preceding entry; epoch 0 when none
    pub preceding_start: DateTime<Utc>,
}

impl TimeLogEntry {
    /// Create a new entry with a fresh uuid
    pub fn new(start: DateTime<Utc>, category: String, comment: String) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            start,
            category,
            comment,
            duration: -1,
            preceding_start: DateTime::UNIX_EPOCH,
        }
    }

    /// Check whether this is the open (currently running) entry
    pub fn is_running(&self) -> bool {
        self.duration == -1
    }
}

/// The payload of a live sync record: the entry fields that replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub start: DateTime<Utc>,
    pub category: String,
    pub comment: String,
}

impl From<&TimeLogEntry> for SyncPayload {
    fn from(entry: &TimeLogEntry) -> Self {
        Self {
            start: entry.start,
            category: entry.category.clone(),
            comment: entry.comment.clone(),
        }
    }
}

/// One element of a sync batch: a live entry state or a tombstone,
/// stamped with the record's modification time (millisecond precision).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLogSyncRecord {
    pub uuid: Uuid,
    /// `None` marks a tombstone (the uuid was removed at `mtime`)
    pub entry: Option<SyncPayload>,
    pub mtime: DateTime<Utc>,
}

impl TimeLogSyncRecord {
    /// Create a live record from an entry
    pub fn from_entry(entry: &TimeLogEntry, mtime: DateTime<Utc>) -> Self {
        Self {
            uuid: entry.uuid,
            entry: Some(SyncPayload::from(entry)),
            mtime,
        }
    }

    /// Create a tombstone record
    pub fn tombstone(uuid: Uuid, mtime: DateTime<Utc>) -> Self {
        Self {
            uuid,
            entry: None,
            mtime,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.entry.is_none()
    }

    /// Project this record onto an entry value, if it carries a payload.
    ///
    /// Derived fields are not part of sync records; the projection leaves
    /// them at their defaults.
    pub fn to_entry(&self) -> Option<TimeLogEntry> {
        self.entry.as_ref().map(|payload| TimeLogEntry {
            uuid: self.uuid,
            start: payload.start,
            category: payload.category.clone(),
            comment: payload.comment.clone(),
            duration: -1,
            preceding_start: DateTime::UNIX_EPOCH,
        })
    }
}

/// One row of a statistics query: total seconds per category bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLogStats {
    pub category: String,
    pub duration: i64,
}
