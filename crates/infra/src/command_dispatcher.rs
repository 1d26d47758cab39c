//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish committed envelopes to the sink (projections)
//! ```
//!
//! Publication only happens after a successful append, so read models never
//! see an event that was not committed. This module contains no IO itself; it
//! composes the `EventStore` and `EventSink` traits.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use campusres_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use campusres_events::EventEnvelope;

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Consumer of committed envelopes.
pub trait EventSink: Send + Sync {
    fn publish(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), String>;
}

impl<T> EventSink for Arc<T>
where
    T: EventSink + ?Sized,
{
    fn publish(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), String> {
        (**self).publish(envelope)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (e.g. stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),
    /// The command is not legal from the aggregate's current status.
    #[error("invalid state '{status}': {message}")]
    InvalidState { status: String, message: String },
    /// Not enough quantity or units.
    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: u32, available: i64 },
    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// Domain-level not found.
    #[error("not found")]
    NotFound,
    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error(transparent)]
    Store(EventStoreError),
    /// A projection rejected a committed event.
    #[error("publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidState { status, message } => {
                DispatchError::InvalidState { status, message }
            }
            DomainError::InsufficientInventory {
                requested,
                available,
            } => DispatchError::InsufficientInventory {
                requested,
                available,
            },
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - `S`: event store implementation
/// - `P`: sink that receives committed envelopes
///
/// Aggregates used here must be deterministic and side-effect free, and
/// must bump their version once per applied event.
#[derive(Debug)]
pub struct CommandDispatcher<S, P> {
    store: S,
    sink: P,
}

impl<S, P> CommandDispatcher<S, P> {
    pub fn new(store: S, sink: P) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, P> CommandDispatcher<S, P>
where
    S: EventStore,
    P: EventSink,
{
    /// Rehydrate an aggregate from its stream without changing anything.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// Returns the committed events (with assigned sequence numbers). A stale
    /// stream version surfaces as [`DispatchError::Concurrency`]; callers
    /// retry by reloading and re-executing the command.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: campusres_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load history
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 4) Persist (append-only, optimistic)
        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(aggregate_id, aggregate_type.clone(), Uuid::now_v7(), ev)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        // 5) Publish committed events (after append)
        for stored in &committed {
            self.sink
                .publish(&stored.to_envelope())
                .map_err(DispatchError::Publish)?;
        }

        Ok(committed)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

/// Replay stored events onto an aggregate, in sequence order.
pub(crate) fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    let mut sorted: Vec<&StoredEvent> = history.iter().collect();
    sorted.sort_by_key(|e| e.sequence_number);

    for stored in sorted {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
