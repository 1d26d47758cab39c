//! Engine services.
//!
//! [`Engine`] composes the command dispatcher, the read models, per-aggregate
//! locks and the injected clock. Operations are grouped by concern:
//!
//! - `availability`: capacity math over committed requests
//! - `inventory`: catalog entries, stock, units and bucket transfers
//! - `assignments`: staff/room assignments and request reservations
//! - `lifecycle`: the request state machine and the IN_USE sweep
//! - `bulk`: batch approve/reject with per-item outcomes
//!
//! Every mutating operation reads the clock once, takes the locks of every
//! aggregate it touches (request, then assignment, then equipment ids in
//! ascending order) and only then loads state.

mod assignments;
mod availability;
mod bulk;
mod inventory;
mod lifecycle;

use std::sync::Arc;

use campusres_core::{Clock, SystemClock};
use campusres_inventory::{
    Assignment, AssignmentCommand, AssignmentId, Equipment, EquipmentCommand, EquipmentId,
};
use campusres_requests::{EquipmentRequest, RequestCommand, RequestId};

use crate::command_dispatcher::CommandDispatcher;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_store::{EventStore, InMemoryEventStore, StoredEvent};
use crate::locks::KeyedLocks;
use crate::projections::{ASSIGNMENT_STREAM, EQUIPMENT_STREAM, Projections, REQUEST_STREAM};

pub use assignments::NewAssignment;
pub use availability::Availability;
pub use bulk::{BulkItem, BulkItemResult, BulkOutcome};
pub use inventory::NewEquipment;
pub use lifecycle::NewRequest;

/// Reservation and inventory lifecycle engine.
pub struct Engine<S = InMemoryEventStore> {
    dispatcher: CommandDispatcher<S, Arc<Projections>>,
    projections: Arc<Projections>,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine<InMemoryEventStore> {
    /// In-memory engine on the wall clock with default configuration.
    pub fn in_memory() -> Self {
        Self::new(InMemoryEventStore::new(), Arc::new(SystemClock), EngineConfig::default())
    }
}

impl<S: EventStore> Engine<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let projections = Arc::new(Projections::new());
        Self {
            dispatcher: CommandDispatcher::new(store, projections.clone()),
            projections,
            locks: KeyedLocks::new(),
            clock,
            config,
        }
    }

    /// Engine over an existing store; read models are rebuilt from it.
    pub fn from_store(store: S, clock: Arc<dyn Clock>, config: EngineConfig) -> EngineResult<Self> {
        let engine = Self::new(store, clock, config);
        engine
            .projections
            .rebuild_from(engine.dispatcher.store())
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    // Loading. Each returns NotFound for a stream that was never created.

    fn load_equipment(&self, equipment_id: EquipmentId) -> EngineResult<Equipment> {
        let equipment = self
            .dispatcher
            .load(equipment_id.aggregate_id(), |_| Equipment::empty(equipment_id))?;
        if !equipment.is_created() {
            return Err(EngineError::not_found(format!("equipment {equipment_id}")));
        }
        Ok(equipment)
    }

    fn load_request(&self, request_id: RequestId) -> EngineResult<EquipmentRequest> {
        let request = self
            .dispatcher
            .load(request_id.aggregate_id(), |_| EquipmentRequest::empty(request_id))?;
        if !request.is_created() {
            return Err(EngineError::not_found(format!("request {request_id}")));
        }
        Ok(request)
    }

    fn load_assignment(&self, assignment_id: AssignmentId) -> EngineResult<Assignment> {
        let assignment = self
            .dispatcher
            .load(assignment_id.aggregate_id(), |_| Assignment::empty(assignment_id))?;
        if !assignment.is_created() {
            return Err(EngineError::not_found(format!("assignment {assignment_id}")));
        }
        Ok(assignment)
    }

    // Dispatching. Callers hold the aggregate's lock.

    fn dispatch_equipment(
        &self,
        equipment_id: EquipmentId,
        command: EquipmentCommand,
    ) -> EngineResult<Vec<StoredEvent>> {
        self.dispatcher
            .dispatch(equipment_id.aggregate_id(), EQUIPMENT_STREAM, command, |_| {
                Equipment::empty(equipment_id)
            })
            .map_err(|e| named(e.into(), || format!("equipment {equipment_id}")))
    }

    fn dispatch_request(
        &self,
        request_id: RequestId,
        command: RequestCommand,
    ) -> EngineResult<Vec<StoredEvent>> {
        self.dispatcher
            .dispatch(request_id.aggregate_id(), REQUEST_STREAM, command, |_| {
                EquipmentRequest::empty(request_id)
            })
            .map_err(|e| named(e.into(), || format!("request {request_id}")))
    }

    fn dispatch_assignment(
        &self,
        assignment_id: AssignmentId,
        command: AssignmentCommand,
    ) -> EngineResult<Vec<StoredEvent>> {
        self.dispatcher
            .dispatch(assignment_id.aggregate_id(), ASSIGNMENT_STREAM, command, |_| {
                Assignment::empty(assignment_id)
            })
            .map_err(|e| named(e.into(), || format!("assignment {assignment_id}")))
    }

    /// Re-run `op` after a lost optimistic-concurrency race, up to
    /// `concurrency.conflict_retries` extra times.
    fn retrying<T>(&self, operation: &'static str, mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.config.concurrency.conflict_retries => {
                    attempt += 1;
                    tracing::warn!(operation, attempt, error = %err, "concurrency conflict, retrying");
                }
                other => return other,
            }
        }
    }
}

/// Give a generic NotFound the name of the missing aggregate.
fn named(err: EngineError, what: impl FnOnce() -> String) -> EngineError {
    match err {
        EngineError::NotFound(_) => EngineError::NotFound(what()),
        other => other,
    }
}
