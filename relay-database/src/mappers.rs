use chrono::{DateTime, Utc};
use relay_models::jobs::CompletionRecord;

use crate::StoreError;

/// `(identifier, deliver_at, created_at)` with both timestamps in epoch milliseconds.
pub type CompletionRow = (String, i64, i64);

pub fn row_to_completion(row: CompletionRow) -> Result<CompletionRecord, StoreError> {
    let (identifier, deliver_at, created_at) = row;
    Ok(CompletionRecord {
        deliver_at: from_millis(&identifier, deliver_at)?,
        created_at: from_millis(&identifier, created_at)?,
        identifier,
    })
}

fn from_millis(identifier: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        StoreError::Unavailable(format!(
            "stored timestamp {millis} for {identifier} is out of range"
        ))
    })
}
