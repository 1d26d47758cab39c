//! Read models fed by committed envelopes.
//!
//! Read models are disposable and rebuildable from the event store. Each
//! stream has a cursor so redelivered envelopes are ignored.

pub mod history;
pub mod request_index;
pub mod unit_index;

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use campusres_core::AggregateId;
use campusres_events::EventEnvelope;
use campusres_inventory::{AssignmentEvent, EquipmentEvent};
use campusres_requests::RequestEvent;

use crate::command_dispatcher::EventSink;
use crate::event_store::{EventStore, EventStoreError};

pub use history::{HistoryLedger, HistoryRecord, HistorySubject};
pub use request_index::{RequestIndex, RequestView};
pub use unit_index::UnitIndex;

/// Stream type of `Equipment` aggregates.
pub const EQUIPMENT_STREAM: &str = "inventory.equipment";
/// Stream type of `Assignment` aggregates.
pub const ASSIGNMENT_STREAM: &str = "inventory.assignment";
/// Stream type of `EquipmentRequest` aggregates.
pub const REQUEST_STREAM: &str = "requests.request";

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize {stream} event: {message}")]
    Deserialize { stream: String, message: String },

    #[error("unknown stream type '{0}'")]
    UnknownStream(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// All engine read models behind one sink.
#[derive(Debug, Default)]
pub struct Projections {
    requests: RequestIndex,
    units: UnitIndex,
    history: HistoryLedger,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl Projections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> &RequestIndex {
        &self.requests
    }

    pub fn units(&self) -> &UnitIndex {
        &self.units
    }

    pub fn history(&self) -> &HistoryLedger {
        &self.history
    }

    /// Apply one committed envelope.
    ///
    /// - Idempotent for redelivery (sequence <= cursor is ignored)
    /// - Rejects gaps after the first event of a stream
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = self
            .cursors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let last = cursors.get(&aggregate_id).copied().unwrap_or(0);

        if seq == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate or replay.
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let stream = envelope.aggregate_type();
        let decode_err = |e: serde_json::Error| ProjectionError::Deserialize {
            stream: stream.to_string(),
            message: e.to_string(),
        };
        match stream {
            EQUIPMENT_STREAM => {
                let event: EquipmentEvent =
                    serde_json::from_value(envelope.payload().clone()).map_err(decode_err)?;
                self.units.apply(&event);
                self.history.record_equipment(envelope.event_id(), &event);
            }
            ASSIGNMENT_STREAM => {
                let event: AssignmentEvent =
                    serde_json::from_value(envelope.payload().clone()).map_err(decode_err)?;
                self.history.record_assignment(envelope.event_id(), &event);
            }
            REQUEST_STREAM => {
                let event: RequestEvent =
                    serde_json::from_value(envelope.payload().clone()).map_err(decode_err)?;
                self.requests.apply(&event);
                self.history.record_request(envelope.event_id(), &event);
            }
            other => return Err(ProjectionError::UnknownStream(other.to_string())),
        }

        // Advance cursor after successful apply.
        cursors.insert(aggregate_id, seq);
        Ok(())
    }

    /// Rebuild every read model by replaying the store.
    pub fn rebuild_from<S: EventStore>(&self, store: &S) -> Result<(), ProjectionError> {
        self.cursors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.requests.clear();
        self.units.clear();
        self.history.clear();

        let mut events = Vec::new();
        for stream in [EQUIPMENT_STREAM, ASSIGNMENT_STREAM, REQUEST_STREAM] {
            events.extend(store.load_all(stream)?);
        }
        events.sort_by_key(|e| (e.aggregate_id, e.sequence_number));

        for stored in &events {
            self.apply_envelope(&stored.to_envelope())?;
        }
        Ok(())
    }
}

impl EventSink for Projections {
    fn publish(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), String> {
        self.apply_envelope(envelope).map_err(|e| e.to_string())
    }
}
