//! Call history records and the repository port that stores them

use crate::domain::call::value_object::{CallDirection, CallKind, CallOutcome};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, ParticipantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One finished call, from the local participant's point of view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub kind: CallKind,
    pub remote_participants: Vec<ParticipantId>,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

impl CallRecord {
    /// Talk time in whole seconds, zero when the call was never answered
    pub fn duration_seconds(&self) -> i64 {
        self.answered_at
            .map(|answered| (self.ended_at - answered).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Repository interface for call history
///
/// Defined here as a port, implemented in the infrastructure layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallHistory: Send + Sync {
    /// Append a finished call
    async fn record(&self, record: CallRecord) -> Result<()>;

    /// Most recent calls first, at most `limit`
    async fn recent(&self, limit: usize) -> Result<Vec<CallRecord>>;

    /// Look up a single call
    async fn find_by_call_id(&self, call_id: &CallId) -> Result<Option<CallRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(answered: bool) -> CallRecord {
        let started_at = Utc::now();
        CallRecord {
            call_id: CallId::new(),
            direction: CallDirection::Outgoing,
            kind: CallKind::Voice,
            remote_participants: vec![ParticipantId::from("bob")],
            outcome: CallOutcome::Completed,
            started_at,
            answered_at: answered.then(|| started_at + Duration::seconds(5)),
            ended_at: started_at + Duration::seconds(65),
        }
    }

    #[test]
    fn test_duration_counts_talk_time_only() {
        assert_eq!(record(true).duration_seconds(), 60);
        assert_eq!(record(false).duration_seconds(), 0);
    }
}
