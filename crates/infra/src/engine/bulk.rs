//! Batch approve/reject.
//!
//! Each item goes through the single-item transition, so eligibility is
//! re-derived per item with the same guards. A failing item is recorded and
//! skipped; it never aborts the batch.

use serde::Serialize;

use campusres_core::UserId;
use campusres_requests::RequestId;

use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;

use super::Engine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum BulkItemResult {
    Applied,
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItem {
    pub request_id: RequestId,
    pub result: BulkItemResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub applied: usize,
    pub skipped: usize,
    /// In input order.
    pub items: Vec<BulkItem>,
}

impl BulkOutcome {
    fn record(&mut self, operation: &'static str, request_id: RequestId, result: EngineResult<()>) {
        let result = match result {
            Ok(()) => {
                self.applied += 1;
                BulkItemResult::Applied
            }
            Err(err) => {
                tracing::warn!(operation, request_id = %request_id, error = %err, "bulk item skipped");
                self.skipped += 1;
                BulkItemResult::Skipped(err.to_string())
            }
        };
        self.items.push(BulkItem { request_id, result });
    }
}

impl<S: EventStore> Engine<S> {
    pub fn bulk_approve(&self, request_ids: &[RequestId], approver: UserId) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &request_id in request_ids {
            let result = self.approve(request_id, approver).map(drop);
            outcome.record("bulk_approve", request_id, result);
        }
        outcome
    }

    /// A blank `reason` rejects the whole call.
    pub fn bulk_reject(
        &self,
        request_ids: &[RequestId],
        reason: &str,
        suggestion: Option<String>,
        actor: UserId,
    ) -> EngineResult<BulkOutcome> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation("rejection reason cannot be empty".to_string()));
        }

        let mut outcome = BulkOutcome::default();
        for &request_id in request_ids {
            let result = self
                .reject(request_id, reason, suggestion.clone(), actor)
                .map(drop);
            outcome.record("bulk_reject", request_id, result);
        }
        Ok(outcome)
    }
}
