//! Input validation for the timelog history engine.
//!
//! All validators return HistoryError::Validation on failure, labelled with
//! the offending field.

use crate::error::{HistoryError, HistoryResult};
use crate::models::{Fields, TimeLogSyncRecord};

// Limits
pub const MAX_CATEGORY_LENGTH: usize = 500;
pub const MAX_COMMENT_LENGTH: usize = 100_000; // 100KB of text

/// Validate a category name: non-empty after trimming, bounded length.
pub fn validate_category(name: &str, field_name: &str) -> HistoryResult<()> {
    if name.trim().is_empty() {
        return Err(HistoryError::validation(
            field_name,
            "category name cannot be empty",
        ));
    }
    if name.len() > MAX_CATEGORY_LENGTH {
        return Err(HistoryError::validation(
            field_name,
            format!(
                "category name too long ({} > {} bytes)",
                name.len(),
                MAX_CATEGORY_LENGTH
            ),
        ));
    }
    Ok(())
}

/// Validate a comment length.
pub fn validate_comment(comment: &str, field_name: &str) -> HistoryResult<()> {
    if comment.len() > MAX_COMMENT_LENGTH {
        return Err(HistoryError::validation(
            field_name,
            format!(
                "comment too long ({} > {} bytes)",
                comment.len(),
                MAX_COMMENT_LENGTH
            ),
        ));
    }
    Ok(())
}

/// Validate an edit field mask: it must select at least one editable field.
pub fn validate_edit_fields(fields: Fields) -> HistoryResult<()> {
    if fields.is_empty() {
        return Err(HistoryError::validation("fields", "no fields specified"));
    }
    if !fields.intersects(Fields::ALL_FIELDS) {
        return Err(HistoryError::validation(
            "fields",
            "no editable fields specified",
        ));
    }
    Ok(())
}

/// Validate a sync `updated` batch: every record must carry a live payload.
pub fn validate_sync_updated(records: &[TimeLogSyncRecord]) -> HistoryResult<()> {
    for (i, record) in records.iter().enumerate() {
        if record.is_tombstone() {
            return Err(HistoryError::validation(
                "updated",
                format!("record {} ({}) has no entry payload", i, record.uuid),
            ));
        }
    }
    Ok(())
}
