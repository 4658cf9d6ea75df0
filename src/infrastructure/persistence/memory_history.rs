//! In-memory implementation of the call history repository

use crate::domain::call::history::{CallHistory, CallRecord};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Keeps the most recent `max_records` calls, oldest dropped first
pub struct InMemoryCallHistory {
    records: Arc<RwLock<VecDeque<CallRecord>>>,
    max_records: usize,
}

impl InMemoryCallHistory {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_records: max_records.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl CallHistory for InMemoryCallHistory {
    async fn record(&self, record: CallRecord) -> Result<()> {
        let mut records = self.records.write().await;
        debug!(call_id = %record.call_id, "Recording call outcome {:?}", record.outcome);

        records.push_back(record);
        while records.len() > self.max_records {
            records.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<CallRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn find_by_call_id(&self, call_id: &CallId) -> Result<Option<CallRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| &r.call_id == call_id).cloned())
    }
}
