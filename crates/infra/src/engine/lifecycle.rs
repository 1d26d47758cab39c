//! Request lifecycle: submission, approval chain, extensions, return.
//!
//! Each transition runs under the request's lock and evaluates the
//! aggregate's guard against a single `now`. Transitions that move inventory
//! also take the equipment lock, after the request lock.

use chrono::{DateTime, Duration, Utc};

use campusres_core::{Aggregate, TimeWindow, UserId};
use campusres_inventory::{
    BucketStatus, EquipmentCommand, EquipmentId, ReinstateUnits, ReleaseStock, ReserveStock,
    ReturnCondition, UnitId,
};
use campusres_requests::{
    ApproveRequest, CancelRequest, CompleteRequest, EquipmentRequest, EscalateRequest,
    HandleExtension, HodReview, MarkInUse, MarkReturned, RejectRequest, RequestCommand,
    RequestExtension, RequestId, RequestStatus, RequesterRole, RespondToSuggestion, SubmitRequest,
};

use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::projections::RequestView;

use super::Engine;

/// Input for [`Engine::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub requester: UserId,
    pub requester_role: RequesterRole,
    pub equipment_id: EquipmentId,
    pub quantity: u32,
    pub course_id: Option<String>,
    pub lab_class_id: Option<String>,
    pub reason: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl<S: EventStore> Engine<S> {
    /// Create a PENDING request after validating input, eligibility and
    /// capacity.
    pub fn submit(&self, new: NewRequest) -> EngineResult<EquipmentRequest> {
        let now = self.clock.now();
        let request_id = RequestId::generate();
        let equipment_id = new.equipment_id;
        let requester = new.requester;
        let cmd = RequestCommand::Submit(SubmitRequest {
            request_id,
            requester,
            requester_role: new.requester_role,
            equipment_id,
            quantity: new.quantity,
            course_id: new.course_id,
            lab_class_id: new.lab_class_id,
            reason: new.reason,
            start: new.start,
            end: new.end,
            occurred_at: now,
        });
        EquipmentRequest::empty(request_id).handle(&cmd)?;

        let equipment = self.load_equipment(equipment_id)?;
        if !equipment.is_available() {
            return Err(EngineError::Validation(format!(
                "equipment '{}' is not open for requests",
                equipment.name()
            )));
        }
        if new.requester_role == RequesterRole::Student && !equipment.allowed_to_students() {
            return Err(EngineError::Validation(format!(
                "equipment '{}' is not available to students",
                equipment.name()
            )));
        }
        let window = TimeWindow::new(new.start, new.end)?;
        self.availability_of(&equipment, new.quantity, &window, None)
            .ensure(new.quantity)?;

        self.locks.with(request_id.aggregate_id(), || {
            self.retrying("submit", || self.dispatch_request(request_id, cmd.clone()))
        })?;
        tracing::info!(
            request_id = %request_id,
            equipment_id = %equipment_id,
            to = %RequestStatus::Pending,
            actor = %requester,
            "request submitted"
        );
        self.load_request(request_id)
    }

    /// PENDING (or REJECTED with time left) -> APPROVED, reserving units or
    /// RESERVED stock.
    pub fn approve(&self, request_id: RequestId, approver: UserId) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "approve", approver, |request, now| {
            self.reserve_and_commit(request, approver, now, |reserved_units| {
                RequestCommand::Approve(ApproveRequest {
                    request_id,
                    approver,
                    reserved_units,
                    occurred_at: now,
                })
            })
        })
    }

    /// PENDING or not-yet-started APPROVED -> REJECTED. Held units go back
    /// to AVAILABLE.
    pub fn reject(
        &self,
        request_id: RequestId,
        reason: &str,
        suggestion: Option<String>,
        actor: UserId,
    ) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "reject", actor, |request, now| {
            let cmd = RequestCommand::Reject(RejectRequest {
                request_id,
                reason: reason.to_string(),
                suggestion: suggestion.clone(),
                actor,
                occurred_at: now,
            });
            self.release_and_commit(request, cmd, ReturnCondition::Good, None, actor, now)
        })
    }

    pub fn escalate(&self, request_id: RequestId, actor: UserId) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "escalate", actor, |_, now| {
            let cmd = RequestCommand::Escalate(EscalateRequest {
                request_id,
                actor,
                occurred_at: now,
            });
            self.dispatch_request(request_id, cmd).map(drop)
        })
    }

    /// ESCALATED -> HOD_APPROVED (reserving like an approval) or
    /// HOD_REJECTED (reason required).
    pub fn hod_review(
        &self,
        request_id: RequestId,
        approved: bool,
        reason: Option<String>,
        actor: UserId,
    ) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "hod_review", actor, |request, now| {
            let build = |reserved_units: Vec<UnitId>| {
                RequestCommand::HodReview(HodReview {
                    request_id,
                    approved,
                    reason: reason.clone(),
                    reserved_units,
                    actor,
                    occurred_at: now,
                })
            };
            if approved {
                self.reserve_and_commit(request, actor, now, build)
            } else {
                self.dispatch_request(request_id, build(Vec::new())).map(drop)
            }
        })
    }

    /// Record the requester's answer to an admin suggestion. Declining needs
    /// a reason.
    pub fn respond_to_suggestion(
        &self,
        request_id: RequestId,
        acknowledged: bool,
        reason: Option<String>,
        actor: UserId,
    ) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "respond_to_suggestion", actor, |_, now| {
            let cmd = RequestCommand::RespondToSuggestion(RespondToSuggestion {
                request_id,
                acknowledged,
                reason: reason.clone(),
                actor,
                occurred_at: now,
            });
            self.dispatch_request(request_id, cmd).map(drop)
        })
    }

    /// Ask for `hours` more at the end of the window, drawing on the daily
    /// budget.
    pub fn request_extension(
        &self,
        request_id: RequestId,
        hours: f64,
        reason: &str,
        actor: UserId,
    ) -> EngineResult<EquipmentRequest> {
        let policy = self.config.extension_policy();
        self.transition(request_id, "request_extension", actor, |_, now| {
            let cmd = RequestCommand::RequestExtension(RequestExtension {
                request_id,
                hours,
                reason: reason.to_string(),
                policy: policy.clone(),
                actor,
                occurred_at: now,
            });
            self.dispatch_request(request_id, cmd).map(drop)
        })
    }

    /// Decide the pending extension. Approval needs capacity over the added
    /// time, not counting this request.
    pub fn handle_extension(
        &self,
        request_id: RequestId,
        approved: bool,
        rejection_reason: Option<String>,
        actor: UserId,
    ) -> EngineResult<EquipmentRequest> {
        let policy = self.config.extension_policy();
        self.transition(request_id, "handle_extension", actor, |request, now| {
            let cmd = RequestCommand::HandleExtension(HandleExtension {
                request_id,
                approved,
                rejection_reason: rejection_reason.clone(),
                policy: policy.clone(),
                actor,
                occurred_at: now,
            });
            request.handle(&cmd)?;
            if !approved {
                return self.dispatch_request(request_id, cmd).map(drop);
            }

            let (equipment_id, window, minutes) = committed_parts(request)?;
            let minutes = minutes.unwrap_or_default();
            let added = TimeWindow::new(window.end(), window.end() + Duration::minutes(i64::from(minutes)))?;
            self.locks.with(equipment_id.aggregate_id(), || {
                let equipment = self.load_equipment(equipment_id)?;
                self.availability_of(&equipment, request.quantity(), &added, Some(request_id))
                    .ensure(request.quantity())?;
                self.dispatch_request(request_id, cmd).map(drop)
            })
        })
    }

    /// Record the hand-over explicitly. IN_USE is otherwise derived from the
    /// window start.
    pub fn mark_in_use(&self, request_id: RequestId, actor: UserId) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "mark_in_use", actor, |_, now| {
            let cmd = RequestCommand::MarkInUse(MarkInUse {
                request_id,
                actor,
                occurred_at: now,
            });
            self.dispatch_request(request_id, cmd).map(drop)
        })
    }

    /// Reconcile the return: units go back to AVAILABLE, or to DAMAGED/LOST
    /// with the reported condition.
    pub fn mark_returned(
        &self,
        request_id: RequestId,
        condition: ReturnCondition,
        notes: Option<String>,
        actor: UserId,
    ) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "mark_returned", actor, |request, now| {
            let cmd = RequestCommand::MarkReturned(MarkReturned {
                request_id,
                condition,
                notes: notes.clone(),
                actor,
                occurred_at: now,
            });
            self.release_and_commit(request, cmd, condition, notes.clone(), actor, now)
        })
    }

    pub fn complete(&self, request_id: RequestId, actor: UserId) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "complete", actor, |_, now| {
            let cmd = RequestCommand::Complete(CompleteRequest {
                request_id,
                actor,
                occurred_at: now,
            });
            self.dispatch_request(request_id, cmd).map(drop)
        })
    }

    /// Withdraw before the window starts. Held units go back to AVAILABLE.
    pub fn cancel(&self, request_id: RequestId, actor: UserId) -> EngineResult<EquipmentRequest> {
        self.transition(request_id, "cancel", actor, |request, now| {
            let cmd = RequestCommand::Cancel(CancelRequest {
                request_id,
                actor,
                occurred_at: now,
            });
            self.release_and_commit(request, cmd, ReturnCondition::Good, None, actor, now)
        })
    }

    /// Materialize IN_USE for every approved request whose window has
    /// started. Returns the requests that were marked.
    pub fn sweep_in_use(&self, actor: UserId) -> EngineResult<Vec<RequestId>> {
        let now = self.clock.now();
        let mut marked = Vec::new();

        for request_id in self.projections.requests().started_unmarked(now) {
            let changed = self.locks.with(request_id.aggregate_id(), || {
                self.retrying("sweep_in_use", || {
                    let request = self.load_request(request_id)?;
                    // Re-check under the lock; a concurrent return or
                    // mark_in_use may have won.
                    if !request.can_mark_in_use() || request.effective_status(now) != RequestStatus::InUse {
                        return Ok(None);
                    }
                    let cmd = RequestCommand::MarkInUse(MarkInUse {
                        request_id,
                        actor,
                        occurred_at: now,
                    });
                    self.dispatch_request(request_id, cmd)?;
                    Ok(Some(request.status()))
                })
            })?;

            if let Some(from) = changed {
                log_transition(request_id, "sweep_in_use", from, RequestStatus::InUse, actor);
                marked.push(request_id);
            }
        }

        Ok(marked)
    }

    pub fn request(&self, request_id: RequestId) -> EngineResult<EquipmentRequest> {
        self.load_request(request_id)
    }

    pub fn list_by_status(&self, status: RequestStatus) -> Vec<RequestView> {
        self.projections.requests().by_status(status)
    }

    pub fn list_for_requester(&self, requester: UserId) -> Vec<RequestView> {
        self.projections.requests().for_requester(requester)
    }

    pub fn list_for_equipment(&self, equipment_id: EquipmentId) -> Vec<RequestView> {
        self.projections.requests().for_equipment(equipment_id)
    }

    /// Load, run `body` against the pre-transition state, reload.
    ///
    /// `body` receives the request as loaded under the lock and the one
    /// `now` of this transition.
    fn transition(
        &self,
        request_id: RequestId,
        operation: &'static str,
        actor: UserId,
        body: impl Fn(&EquipmentRequest, DateTime<Utc>) -> EngineResult<()>,
    ) -> EngineResult<EquipmentRequest> {
        let now = self.clock.now();
        let (from, updated) = self.locks.with(request_id.aggregate_id(), || {
            self.retrying(operation, || {
                let request = self.load_request(request_id)?;
                body(&request, now)?;
                Ok((request.effective_status(now), self.load_request(request_id)?))
            })
        })?;

        log_transition(request_id, operation, from, updated.status(), actor);
        Ok(updated)
    }

    /// Check capacity, reserve units (serialized) or move stock to RESERVED
    /// (quantity-tracked), then commit the request command built from the
    /// reserved ids. A failed commit releases the reservation again.
    fn reserve_and_commit(
        &self,
        request: &EquipmentRequest,
        actor: UserId,
        now: DateTime<Utc>,
        build: impl Fn(Vec<UnitId>) -> RequestCommand,
    ) -> EngineResult<()> {
        let request_id = request.id_typed();
        // Guard before inventory is touched.
        request.handle(&build(Vec::new()))?;
        let (equipment_id, window, _) = committed_parts(request)?;
        let quantity = request.quantity();

        self.locks.with(equipment_id.aggregate_id(), || {
            let equipment = self.load_equipment(equipment_id)?;
            self.availability_of(&equipment, quantity, &window, Some(request_id))
                .ensure(quantity)?;

            let serialized = equipment.tracks_serialized_units();
            let reserved = if serialized {
                self.reserve_units(equipment_id, request_id, quantity, actor, now)?
            } else {
                self.reserve_stock(equipment_id, request_id, BucketStatus::Available, quantity, actor, now)?;
                Vec::new()
            };

            if let Err(err) = self.dispatch_request(request_id, build(reserved.clone())) {
                let notes = Some("approval rolled back".to_string());
                let undo = if serialized {
                    self.release_units(equipment_id, request_id, &reserved, ReturnCondition::Good, notes, actor, now)
                } else {
                    self.release_stock(equipment_id, request_id, ReturnCondition::Good, notes, actor, now)
                };
                if let Err(undo) = undo {
                    tracing::error!(
                        request_id = %request_id,
                        equipment_id = %equipment_id,
                        error = %undo,
                        "failed to release units after a failed approval"
                    );
                }
                return Err(err);
            }
            Ok(())
        })
    }

    /// Release what the request holds, then commit `cmd`. A failed commit
    /// puts the released inventory back on the request.
    fn release_and_commit(
        &self,
        request: &EquipmentRequest,
        cmd: RequestCommand,
        condition: ReturnCondition,
        notes: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let request_id = request.id_typed();
        // Guard before inventory is touched.
        request.handle(&cmd)?;
        let Some(equipment_id) = request.equipment_id() else {
            return self.dispatch_request(request_id, cmd).map(drop);
        };

        self.locks.with(equipment_id.aggregate_id(), || {
            let released = self.release_held(request, equipment_id, condition, notes.clone(), actor, now)?;
            if let Err(err) = self.dispatch_request(request_id, cmd.clone()) {
                if let Err(undo) = self.reinstate(equipment_id, request_id, &released, actor, now) {
                    tracing::error!(
                        request_id = %request_id,
                        equipment_id = %equipment_id,
                        error = %undo,
                        "failed to reinstate inventory after a failed transition"
                    );
                }
                return Err(err);
            }
            Ok(())
        })
    }

    /// Give back what a capacity-committing request holds: its units, or
    /// its RESERVED stock, into the bucket matching `condition`.
    fn release_held(
        &self,
        request: &EquipmentRequest,
        equipment_id: EquipmentId,
        condition: ReturnCondition,
        notes: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<Released> {
        if !request.status().commits_capacity() {
            return Ok(Released::Nothing);
        }
        let request_id = request.id_typed();
        let held = request.reserved_units();
        if !held.is_empty() {
            self.release_units(equipment_id, request_id, held, condition, notes, actor, now)?;
            return Ok(Released::Units(held.to_vec()));
        }

        let equipment = self.load_equipment(equipment_id)?;
        if equipment.tracks_serialized_units() {
            return Ok(Released::Nothing);
        }
        let quantity = equipment.stock_held_by(request_id.aggregate_id());
        self.release_stock(equipment_id, request_id, condition, notes, actor, now)?;
        Ok(Released::Stock {
            to: BucketStatus::from(condition.unit_status()),
            quantity,
        })
    }

    fn reinstate(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        released: &Released,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        match released {
            Released::Nothing => Ok(()),
            Released::Units(unit_ids) => {
                let cmd = EquipmentCommand::ReinstateUnits(ReinstateUnits {
                    equipment_id,
                    request_id: request_id.aggregate_id(),
                    unit_ids: unit_ids.clone(),
                    actor,
                    occurred_at: now,
                });
                self.dispatch_equipment(equipment_id, cmd).map(drop)
            }
            Released::Stock { to, quantity } => {
                self.reserve_stock(equipment_id, request_id, *to, *quantity, actor, now)
            }
        }
    }

    fn reserve_stock(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        from: BucketStatus,
        quantity: u32,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let cmd = EquipmentCommand::ReserveStock(ReserveStock {
            equipment_id,
            request_id: request_id.aggregate_id(),
            from,
            quantity,
            actor,
            occurred_at: now,
        });
        self.retrying("reserve_stock", || self.dispatch_equipment(equipment_id, cmd.clone()))
            .map(drop)
    }

    fn release_stock(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        condition: ReturnCondition,
        notes: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let cmd = EquipmentCommand::ReleaseStock(ReleaseStock {
            equipment_id,
            request_id: request_id.aggregate_id(),
            condition,
            notes,
            actor,
            occurred_at: now,
        });
        self.retrying("release_stock", || self.dispatch_equipment(equipment_id, cmd.clone()))
            .map(drop)
    }
}

/// Inventory moved off a request before its transition commits.
enum Released {
    Nothing,
    Units(Vec<UnitId>),
    Stock { to: BucketStatus, quantity: u32 },
}

fn committed_parts(request: &EquipmentRequest) -> EngineResult<(EquipmentId, TimeWindow, Option<u32>)> {
    match (request.equipment_id(), request.window()) {
        (Some(equipment_id), Some(window)) => {
            Ok((equipment_id, window, request.extension().map(|e| e.minutes)))
        }
        _ => Err(EngineError::Storage(format!(
            "request {} has no equipment or window",
            request.id_typed()
        ))),
    }
}

fn log_transition(
    request_id: RequestId,
    operation: &'static str,
    from: RequestStatus,
    to: RequestStatus,
    actor: UserId,
) {
    tracing::info!(
        request_id = %request_id,
        operation,
        from = %from,
        to = %to,
        actor = %actor,
        "request transition"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use chrono::TimeZone;

    use campusres_core::{AggregateId, ExpectedVersion, ManualClock};
    use campusres_inventory::UnitStatus;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::NewEquipment;
    use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
    use crate::projections::{HistorySubject, REQUEST_STREAM};

    /// Refuses request-stream appends while `offline` is set.
    #[derive(Default)]
    struct RequestStoreOutage {
        inner: InMemoryEventStore,
        offline: AtomicBool,
    }

    impl EventStore for RequestStoreOutage {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            if self.offline.load(Ordering::SeqCst)
                && events.iter().any(|e| e.aggregate_type == REQUEST_STREAM)
            {
                return Err(EventStoreError::InvalidAppend("request stream offline".into()));
            }
            self.inner.append(events, expected_version)
        }

        fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(aggregate_id)
        }

        fn load_all(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_all(aggregate_type)
        }
    }

    fn engine_with_outage() -> (Engine<Arc<RequestStoreOutage>>, Arc<RequestStoreOutage>, Arc<ManualClock>) {
        let store = Arc::new(RequestStoreOutage::default());
        let clock = Arc::new(ManualClock::new(at(7, 0)));
        let engine = Engine::new(store.clone(), clock.clone(), EngineConfig::default());
        (engine, store, clock)
    }

    fn request_in(equipment_id: EquipmentId, quantity: u32) -> NewRequest {
        NewRequest {
            requester: UserId::new(),
            requester_role: RequesterRole::Professor,
            equipment_id,
            quantity,
            course_id: None,
            lab_class_id: None,
            reason: "Field trip".into(),
            start: at(9, 0),
            end: at(11, 0),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 9, 2, h, m, 0).unwrap()
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        engine: Engine,
        admin: UserId,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(at(7, 0)));
        let engine = Engine::new(InMemoryEventStore::new(), clock.clone(), EngineConfig::default());
        Fixture {
            clock,
            engine,
            admin: UserId::new(),
        }
    }

    impl Fixture {
        fn cameras(&self, n: u32) -> EquipmentId {
            self.engine
                .register_equipment(NewEquipment::quantity_tracked("Camera", n), self.admin)
                .unwrap()
        }

        fn submit(&self, equipment_id: EquipmentId, quantity: u32, start: u32, end: u32) -> RequestId {
            self.engine
                .submit(NewRequest {
                    requester: UserId::new(),
                    requester_role: RequesterRole::Professor,
                    equipment_id,
                    quantity,
                    course_id: Some("PHY-101".into()),
                    lab_class_id: None,
                    reason: "Optics lab".into(),
                    start: at(start, 0),
                    end: at(end, 0),
                })
                .unwrap()
                .id_typed()
        }
    }

    #[test]
    fn submit_checks_student_eligibility_and_availability_flag() {
        let f = fixture();
        let staff_only = f
            .engine
            .register_equipment(NewEquipment::quantity_tracked("Oscilloscope", 3).staff_only(), f.admin)
            .unwrap();
        let request = NewRequest {
            requester: UserId::new(),
            requester_role: RequesterRole::Student,
            equipment_id: staff_only,
            quantity: 1,
            course_id: None,
            lab_class_id: None,
            reason: "Project".into(),
            start: at(10, 0),
            end: at(11, 0),
        };
        assert!(matches!(
            f.engine.submit(request.clone()).unwrap_err(),
            EngineError::Validation(_)
        ));

        f.engine
            .update_details(staff_only, "Oscilloscope", None, true, false, f.admin)
            .unwrap();
        let as_professor = NewRequest {
            requester_role: RequesterRole::Professor,
            ..request.clone()
        };
        assert!(matches!(
            f.engine.submit(as_professor).unwrap_err(),
            EngineError::Validation(_)
        ));

        let unknown = NewRequest {
            equipment_id: EquipmentId::generate(),
            ..request
        };
        assert!(matches!(f.engine.submit(unknown).unwrap_err(), EngineError::NotFound(_)));
    }

    #[test]
    fn submit_fails_without_capacity() {
        let f = fixture();
        let eq = f.cameras(2);
        let a = f.submit(eq, 2, 10, 12);
        f.engine.approve(a, f.admin).unwrap();

        let err = f
            .engine
            .submit(NewRequest {
                requester: UserId::new(),
                requester_role: RequesterRole::Professor,
                equipment_id: eq,
                quantity: 1,
                course_id: None,
                lab_class_id: None,
                reason: "Overlap".into(),
                start: at(11, 0),
                end: at(13, 0),
            })
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientInventory {
                requested: 1,
                available: 0
            }
        );
    }

    #[test]
    fn cancel_only_before_start() {
        let f = fixture();
        let eq = f.cameras(2);
        let early = f.submit(eq, 1, 10, 12);
        let late = f.submit(eq, 1, 10, 12);

        let cancelled = f.engine.cancel(early, f.admin).unwrap();
        assert_eq!(cancelled.status(), RequestStatus::Cancelled);

        f.clock.set(at(10, 0));
        let err = f.engine.cancel(late, f.admin).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[test]
    fn extension_approval_counts_the_next_booking() {
        let f = fixture();
        let eq = f.cameras(3);
        let first = f.submit(eq, 2, 9, 10);
        let next = f.submit(eq, 1, 10, 11);
        f.engine.approve(first, f.admin).unwrap();
        f.engine.approve(next, f.admin).unwrap();

        let free = f.engine.check_availability(eq, 2, at(10, 0), at(10, 30)).unwrap();
        assert_eq!(free.free_quantity, 2);
        assert!(f.engine.request(first).unwrap().can_request_extension(at(7, 0)));

        f.engine.request_extension(first, 0.5, "overrun", f.admin).unwrap();
        let extended = f.engine.handle_extension(first, true, None, f.admin).unwrap();
        assert_eq!(extended.window().unwrap().end(), at(10, 30));
    }

    #[test]
    fn sweep_materializes_in_use_once() {
        let f = fixture();
        let eq = f.cameras(3);
        let started = f.submit(eq, 1, 9, 11);
        let later = f.submit(eq, 1, 12, 13);
        f.engine.approve(started, f.admin).unwrap();
        f.engine.approve(later, f.admin).unwrap();

        f.clock.set(at(9, 30));
        assert_eq!(f.engine.request(started).unwrap().effective_status(at(9, 30)), RequestStatus::InUse);
        assert_eq!(f.engine.sweep_in_use(f.admin).unwrap(), vec![started]);
        assert!(f.engine.sweep_in_use(f.admin).unwrap().is_empty());
        assert_eq!(f.engine.request(started).unwrap().status(), RequestStatus::InUse);
        assert_eq!(f.engine.request(later).unwrap().status(), RequestStatus::Approved);
    }

    #[test]
    fn damaged_return_moves_serialized_units() {
        let f = fixture();
        let eq = f
            .engine
            .register_equipment(NewEquipment::serialized("Drone"), f.admin)
            .unwrap();
        let unit = f.engine.add_unit(eq, "DR-1", "new", f.admin).unwrap();
        let request = f.submit(eq, 1, 9, 11);
        let approved = f.engine.approve(request, f.admin).unwrap();
        assert_eq!(approved.reserved_units(), &[unit]);
        assert_eq!(f.engine.unit(unit).unwrap().status, UnitStatus::InRequest);

        f.clock.set(at(11, 30));
        let returned = f
            .engine
            .mark_returned(request, ReturnCondition::Damaged, Some("cracked rotor".into()), f.admin)
            .unwrap();
        assert_eq!(returned.status(), RequestStatus::Returned);
        assert_eq!(f.engine.unit(unit).unwrap().status, UnitStatus::Damaged);

        let completed = f.engine.complete(request, f.admin).unwrap();
        assert_eq!(completed.status(), RequestStatus::Completed);
    }

    #[test]
    fn failed_return_keeps_stock_reserved_for_the_request() {
        let (engine, store, clock) = engine_with_outage();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::quantity_tracked("Tripod", 4), admin)
            .unwrap();
        let request = engine.submit(request_in(eq, 3)).unwrap().id_typed();
        engine.approve(request, admin).unwrap();

        clock.set(at(11, 30));
        store.offline.store(true, Ordering::SeqCst);
        let err = engine
            .mark_returned(request, ReturnCondition::Damaged, None, admin)
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        let equipment = engine.equipment(eq).unwrap();
        assert_eq!(equipment.quantity(BucketStatus::Reserved), 3);
        assert_eq!(equipment.quantity(BucketStatus::Damaged), 0);
        assert_eq!(equipment.stock_held_by(request.aggregate_id()), 3);
        assert_eq!(engine.request(request).unwrap().status(), RequestStatus::Approved);
        let statuses: Vec<String> = engine
            .projections()
            .history()
            .for_subject(&HistorySubject::Request(request))
            .into_iter()
            .map(|r| r.to_status)
            .collect();
        assert_eq!(statuses, ["PENDING", "APPROVED"]);

        store.offline.store(false, Ordering::SeqCst);
        engine
            .mark_returned(request, ReturnCondition::Damaged, None, admin)
            .unwrap();
        let equipment = engine.equipment(eq).unwrap();
        assert_eq!(equipment.quantity(BucketStatus::Damaged), 3);
        assert_eq!(equipment.quantity(BucketStatus::Reserved), 0);
    }

    #[test]
    fn failed_cancel_keeps_units_with_the_request() {
        let (engine, store, _) = engine_with_outage();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::serialized("Drone"), admin)
            .unwrap();
        let unit = engine.add_unit(eq, "DR-1", "new", admin).unwrap();
        let request = engine.submit(request_in(eq, 1)).unwrap().id_typed();
        engine.approve(request, admin).unwrap();

        store.offline.store(true, Ordering::SeqCst);
        assert!(matches!(engine.cancel(request, admin).unwrap_err(), EngineError::Storage(_)));
        assert_eq!(engine.unit(unit).unwrap().status, UnitStatus::InRequest);
        assert_eq!(engine.request(request).unwrap().reserved_units(), &[unit]);

        store.offline.store(false, Ordering::SeqCst);
        engine.cancel(request, admin).unwrap();
        assert_eq!(engine.unit(unit).unwrap().status, UnitStatus::Available);
    }
}
