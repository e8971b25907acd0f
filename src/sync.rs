//! Sync batch classification.
//!
//! Two replicas exchange modification batches and converge under
//! last-writer-wins: for every record the greater `mtime` wins, ties go to
//! the local side. The classification pass here decides, per peer record,
//! whether it is a no-op, an insert, an update, or a removal against the
//! locally-authoritative state. The engine applies the resulting plan in a
//! single transaction.

use uuid::Uuid;

use crate::error::HistoryResult;
use crate::models::TimeLogSyncRecord;

/// The outcome of classifying a peer batch against local state.
///
/// `removed_old`/`inserted_old` hold the locally-authoritative record for
/// each accepted element (`None` when the uuid was unknown locally);
/// `updated_old` is always a live local row. The `*_new` vectors hold the
/// peer records that won, kept parallel to their `*_old` counterparts.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub removed_old: Vec<Option<TimeLogSyncRecord>>,
    pub removed_new: Vec<TimeLogSyncRecord>,
    pub inserted_old: Vec<Option<TimeLogSyncRecord>>,
    pub inserted_new: Vec<TimeLogSyncRecord>,
    pub updated_old: Vec<TimeLogSyncRecord>,
    pub updated_new: Vec<TimeLogSyncRecord>,
}

impl SyncPlan {
    /// True when no peer record won against local state
    pub fn is_empty(&self) -> bool {
        self.removed_new.is_empty() && self.inserted_new.is_empty() && self.updated_new.is_empty()
    }

    /// The tombstones to write: the peer's uuid and mtime, carrying the
    /// local row's payload (when one existed) so observers can see what
    /// disappeared.
    pub fn removed_merged(&self) -> Vec<TimeLogSyncRecord> {
        self.removed_new
            .iter()
            .zip(self.removed_old.iter())
            .map(|(new, old)| TimeLogSyncRecord {
                uuid: new.uuid,
                entry: old.as_ref().and_then(|record| record.entry.clone()),
                mtime: new.mtime,
            })
            .collect()
    }
}

/// Classify a peer batch against local state.
///
/// `local` resolves a uuid to the locally-authoritative record (the one with
/// the greater mtime among the live row and the tombstone, if any). A peer
/// record loses whenever the local mtime is greater or equal.
pub fn classify<F>(
    updated: &[TimeLogSyncRecord],
    removed: &[TimeLogSyncRecord],
    mut local: F,
) -> HistoryResult<SyncPlan>
where
    F: FnMut(&Uuid) -> HistoryResult<Option<TimeLogSyncRecord>>,
{
    let mut plan = SyncPlan::default();

    for record in removed {
        let affected = local(&record.uuid)?;
        if let Some(existing) = &affected {
            if existing.mtime >= record.mtime {
                continue;
            }
        }
        plan.removed_new.push(record.clone());
        plan.removed_old.push(affected);
    }

    for record in updated {
        let affected = local(&record.uuid)?;
        if let Some(existing) = &affected {
            if existing.mtime >= record.mtime {
                continue;
            }
        }
        match affected {
            Some(existing) if !existing.is_tombstone() => {
                plan.updated_new.push(record.clone());
                plan.updated_old.push(existing);
            }
            other => {
                plan.inserted_new.push(record.clone());
                plan.inserted_old.push(other);
            }
        }
    }

    Ok(plan)
}
