use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_models::jobs::CompletionRecord;

use crate::{StoreError, interfaces::CompletionStore};

/// Completion store kept in process memory. Clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<Mutex<HashMap<String, CompletionRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

impl CompletionStore for InMemoryStore {
    async fn create_table(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn record_completion(
        &self,
        identifier: &str,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut records = self.records.lock();
        if records.contains_key(identifier) {
            return Err(StoreError::Duplicate(identifier.to_string()));
        }
        records.insert(
            identifier.to_string(),
            CompletionRecord {
                identifier: identifier.to_string(),
                deliver_at,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn find_completion(&self, identifier: &str) -> Result<Option<CompletionRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.lock().get(identifier).cloned())
    }

    async fn close(&self) {
        self.set_unavailable(true);
    }
}
