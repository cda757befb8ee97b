use std::future::Future;

use chrono::{DateTime, Utc};
use relay_models::jobs::CompletionRecord;

use crate::StoreError;

// NOTE: implementors are shared across tasks behind an `Arc`; keep them free of borrowed state
pub trait CompletionStore: Send + Sync + 'static {
    fn create_table(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Persist the completion of `identifier`. Fails with `StoreError::Duplicate`
    /// when the identifier was already recorded; the existing row is left untouched.
    fn record_completion(
        &self,
        identifier: &str,
        deliver_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn find_completion(
        &self,
        identifier: &str,
    ) -> impl Future<Output = Result<Option<CompletionRecord>, StoreError>> + Send;

    /// Release pooled connections. Further calls fail with `StoreError::Unavailable`.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
