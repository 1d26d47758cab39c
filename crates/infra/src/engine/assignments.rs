//! Unit binding: staff/room assignments and request reservations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use campusres_core::{Aggregate, UserId};
use campusres_inventory::{
    AssignUnits, AssignedUnit, Assignment, AssignmentCommand, AssignmentId, AssignmentPeriod,
    AssignmentType, CreateAssignment, EquipmentCommand, EquipmentEvent, EquipmentId, ReleaseUnits,
    RemoveAssignment, ReserveUnits, ReturnCondition, UnassignUnits, UnitId,
};
use campusres_requests::RequestId;

use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;

use super::Engine;

/// Input for [`Engine::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub unit_ids: Vec<UnitId>,
    pub kind: AssignmentType,
    pub assigned_to: String,
    pub period: AssignmentPeriod,
    pub starts_at: DateTime<Utc>,
    /// Required for TEMPORARY, absent for PERMANENT.
    pub ends_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
}

type UnitsByEquipment = BTreeMap<EquipmentId, Vec<UnitId>>;

impl<S: EventStore> Engine<S> {
    /// Bind AVAILABLE units to a staff member or room.
    pub fn assign(&self, new: NewAssignment) -> EngineResult<Assignment> {
        let now = self.clock.now();
        let assignment_id = AssignmentId::generate();
        let actor = new.created_by;

        let mut units = Vec::with_capacity(new.unit_ids.len());
        for unit_id in &new.unit_ids {
            units.push(AssignedUnit {
                equipment_id: self.owner_of(*unit_id)?,
                unit_id: *unit_id,
            });
        }
        let create = AssignmentCommand::CreateAssignment(CreateAssignment {
            assignment_id,
            kind: new.kind,
            period: new.period,
            assigned_to: new.assigned_to,
            units: units.clone(),
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            created_by: actor,
            occurred_at: now,
        });
        // Shape checks before any unit moves.
        Assignment::empty(assignment_id).handle(&create)?;

        let by_equipment = group(&units);
        self.locks.with(assignment_id.aggregate_id(), || {
            self.locks
                .with_all(by_equipment.keys().map(EquipmentId::aggregate_id), || {
                    let mut done = UnitsByEquipment::new();
                    for (equipment_id, unit_ids) in &by_equipment {
                        let cmd = EquipmentCommand::AssignUnits(AssignUnits {
                            equipment_id: *equipment_id,
                            assignment_id,
                            unit_ids: unit_ids.clone(),
                            actor,
                            occurred_at: now,
                        });
                        if let Err(err) =
                            self.retrying("assign", || self.dispatch_equipment(*equipment_id, cmd.clone()))
                        {
                            self.unassign_units(assignment_id, &done, "assignment aborted", actor, now);
                            return Err(err);
                        }
                        done.insert(*equipment_id, unit_ids.clone());
                    }

                    if let Err(err) = self.retrying("assign", || {
                        self.dispatch_assignment(assignment_id, create.clone())
                    }) {
                        self.unassign_units(assignment_id, &done, "assignment aborted", actor, now);
                        return Err(err);
                    }
                    Ok(())
                })
        })?;

        tracing::info!(
            assignment_id = %assignment_id,
            units = units.len(),
            actor = %actor,
            "assignment created"
        );
        self.load_assignment(assignment_id)
    }

    /// End an assignment and return its units to AVAILABLE.
    pub fn remove(&self, assignment_id: AssignmentId, reason: &str, actor: UserId) -> EngineResult<Assignment> {
        let now = self.clock.now();

        self.locks.with(assignment_id.aggregate_id(), || {
            self.retrying("remove_assignment", || {
                let assignment = self.load_assignment(assignment_id)?;
                let remove = AssignmentCommand::RemoveAssignment(RemoveAssignment {
                    assignment_id,
                    reason: reason.to_string(),
                    removed_by: actor,
                    occurred_at: now,
                });
                assignment.handle(&remove)?;

                let by_equipment = group(assignment.units());
                self.locks
                    .with_all(by_equipment.keys().map(EquipmentId::aggregate_id), || {
                        let mut done = UnitsByEquipment::new();
                        for (equipment_id, unit_ids) in &by_equipment {
                            let cmd = EquipmentCommand::UnassignUnits(UnassignUnits {
                                equipment_id: *equipment_id,
                                assignment_id,
                                unit_ids: unit_ids.clone(),
                                reason: reason.trim().to_string(),
                                actor,
                                occurred_at: now,
                            });
                            if let Err(err) = self.dispatch_equipment(*equipment_id, cmd) {
                                self.reassign_units(assignment_id, &done, actor, now);
                                return Err(err);
                            }
                            done.insert(*equipment_id, unit_ids.clone());
                        }

                        if let Err(err) = self.dispatch_assignment(assignment_id, remove.clone()) {
                            self.reassign_units(assignment_id, &done, actor, now);
                            return Err(err);
                        }
                        Ok(())
                    })
            })
        })?;

        tracing::info!(assignment_id = %assignment_id, actor = %actor, "assignment removed");
        self.load_assignment(assignment_id)
    }

    /// Move `quantity` AVAILABLE units (lowest serials first) to IN_REQUEST
    /// for `request_id`.
    pub fn reserve_for_request(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        quantity: u32,
        actor: UserId,
    ) -> EngineResult<Vec<UnitId>> {
        let now = self.clock.now();
        self.locks.with(equipment_id.aggregate_id(), || {
            self.reserve_units(equipment_id, request_id, quantity, actor, now)
        })
    }

    /// Return units held by `request_id`: AVAILABLE when good, otherwise
    /// DAMAGED or LOST.
    pub fn release_from_request(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        unit_ids: &[UnitId],
        condition: ReturnCondition,
        actor: UserId,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        self.locks.with(equipment_id.aggregate_id(), || {
            self.release_units(equipment_id, request_id, unit_ids, condition, None, actor, now)
        })
    }

    pub fn assignment(&self, assignment_id: AssignmentId) -> EngineResult<Assignment> {
        self.load_assignment(assignment_id)
    }

    /// Assignment currently holding the unit, if any.
    pub fn active_for_unit(&self, unit_id: UnitId) -> EngineResult<Option<Assignment>> {
        self.owner_of(unit_id)?;
        match self.projections.units().active_assignment(&unit_id) {
            Some(assignment_id) => Ok(Some(self.load_assignment(assignment_id)?)),
            None => Ok(None),
        }
    }

    // Lock-held helpers.

    pub(crate) fn reserve_units(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        quantity: u32,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<UnitId>> {
        let cmd = EquipmentCommand::ReserveUnits(ReserveUnits {
            equipment_id,
            request_id: request_id.aggregate_id(),
            quantity,
            actor,
            occurred_at: now,
        });
        let committed =
            self.retrying("reserve_units", || self.dispatch_equipment(equipment_id, cmd.clone()))?;
        for stored in committed {
            let event: EquipmentEvent = serde_json::from_value(stored.payload)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            if let EquipmentEvent::UnitsReserved(reserved) = event {
                return Ok(reserved.unit_ids);
            }
        }
        Err(EngineError::Storage("reservation produced no units".to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn release_units(
        &self,
        equipment_id: EquipmentId,
        request_id: RequestId,
        unit_ids: &[UnitId],
        condition: ReturnCondition,
        notes: Option<String>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if unit_ids.is_empty() {
            return Ok(());
        }
        let cmd = EquipmentCommand::ReleaseUnits(ReleaseUnits {
            equipment_id,
            request_id: request_id.aggregate_id(),
            unit_ids: unit_ids.to_vec(),
            condition,
            notes,
            actor,
            occurred_at: now,
        });
        self.retrying("release_units", || self.dispatch_equipment(equipment_id, cmd.clone()))?;
        Ok(())
    }

    fn unassign_units(
        &self,
        assignment_id: AssignmentId,
        done: &UnitsByEquipment,
        reason: &str,
        actor: UserId,
        now: DateTime<Utc>,
    ) {
        for (equipment_id, unit_ids) in done {
            let cmd = EquipmentCommand::UnassignUnits(UnassignUnits {
                equipment_id: *equipment_id,
                assignment_id,
                unit_ids: unit_ids.clone(),
                reason: reason.to_string(),
                actor,
                occurred_at: now,
            });
            if let Err(err) = self.dispatch_equipment(*equipment_id, cmd) {
                tracing::error!(
                    assignment_id = %assignment_id,
                    equipment_id = %equipment_id,
                    error = %err,
                    "failed to roll back unit assignment"
                );
            }
        }
    }

    fn reassign_units(&self, assignment_id: AssignmentId, done: &UnitsByEquipment, actor: UserId, now: DateTime<Utc>) {
        for (equipment_id, unit_ids) in done {
            let cmd = EquipmentCommand::AssignUnits(AssignUnits {
                equipment_id: *equipment_id,
                assignment_id,
                unit_ids: unit_ids.clone(),
                actor,
                occurred_at: now,
            });
            if let Err(err) = self.dispatch_equipment(*equipment_id, cmd) {
                tracing::error!(
                    assignment_id = %assignment_id,
                    equipment_id = %equipment_id,
                    error = %err,
                    "failed to restore unit assignment"
                );
            }
        }
    }
}

fn group(units: &[AssignedUnit]) -> UnitsByEquipment {
    let mut by_equipment = UnitsByEquipment::new();
    for unit in units {
        by_equipment.entry(unit.equipment_id).or_default().push(unit.unit_id);
    }
    by_equipment
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use campusres_core::SystemClock;
    use campusres_inventory::{BucketStatus, UnitStatus};

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::NewEquipment;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::HistorySubject;

    fn engine() -> Engine {
        Engine::new(InMemoryEventStore::new(), Arc::new(SystemClock), EngineConfig::default())
    }

    fn laptops(engine: &Engine, n: usize) -> (EquipmentId, Vec<UnitId>) {
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::serialized("Laptop"), admin)
            .unwrap();
        let units = (0..n)
            .map(|i| engine.add_unit(eq, format!("SN-{i:03}"), "good", admin).unwrap())
            .collect();
        (eq, units)
    }

    fn staff(unit_ids: Vec<UnitId>) -> NewAssignment {
        NewAssignment {
            unit_ids,
            kind: AssignmentType::StaffAssignment,
            assigned_to: "Dr. Rivera".into(),
            period: AssignmentPeriod::Permanent,
            starts_at: Utc::now(),
            ends_at: None,
            created_by: UserId::new(),
        }
    }

    #[test]
    fn assign_then_remove_round_trips_unit_status() {
        let engine = engine();
        let (eq, units) = laptops(&engine, 3);

        let assignment = engine.assign(staff(units[..2].to_vec())).unwrap();
        assert!(assignment.is_active());
        assert_eq!(engine.unit(units[0]).unwrap().status, UnitStatus::Assigned);
        assert_eq!(engine.equipment(eq).unwrap().quantity(BucketStatus::Reserved), 2);
        assert_eq!(
            engine.active_for_unit(units[1]).unwrap().map(|a| a.id_typed()),
            Some(assignment.id_typed())
        );

        let removed = engine
            .remove(assignment.id_typed(), "office move", UserId::new())
            .unwrap();
        assert!(!removed.is_active());
        assert_eq!(engine.unit(units[0]).unwrap().status, UnitStatus::Available);
        assert!(engine.active_for_unit(units[0]).unwrap().is_none());

        let trail = engine
            .projections()
            .history()
            .for_subject(&HistorySubject::Unit(units[0]));
        let last = trail.last().unwrap();
        assert_eq!(last.to_status, "AVAILABLE");
        assert_eq!(last.notes.as_deref(), Some("office move"));
    }

    #[test]
    fn a_unit_cannot_be_assigned_twice() {
        let engine = engine();
        let (_, units) = laptops(&engine, 2);
        engine.assign(staff(vec![units[0]])).unwrap();

        let err = engine.assign(staff(vec![units[1], units[0]])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { ref status, .. } if status == "ASSIGNED"));
        // Nothing moved for the free unit either.
        assert_eq!(engine.unit(units[1]).unwrap().status, UnitStatus::Available);
    }

    #[test]
    fn assignment_shape_is_validated_before_units_move() {
        let engine = engine();
        let (_, units) = laptops(&engine, 1);

        let mut temporary = staff(vec![units[0]]);
        temporary.period = AssignmentPeriod::Temporary;
        temporary.ends_at = Some(temporary.starts_at - Duration::days(1));
        assert!(matches!(engine.assign(temporary).unwrap_err(), EngineError::Validation(_)));

        assert!(matches!(engine.assign(staff(vec![])).unwrap_err(), EngineError::Validation(_)));
        assert!(matches!(
            engine.assign(staff(vec![units[0], units[0]])).unwrap_err(),
            EngineError::Validation(_)
        ));
        assert_eq!(engine.unit(units[0]).unwrap().status, UnitStatus::Available);
    }

    #[test]
    fn remove_rules() {
        let engine = engine();
        let (_, units) = laptops(&engine, 1);
        let assignment = engine.assign(staff(units.clone())).unwrap();
        let id = assignment.id_typed();

        assert!(matches!(
            engine.remove(id, "  ", UserId::new()).unwrap_err(),
            EngineError::Validation(_)
        ));
        engine.remove(id, "retired", UserId::new()).unwrap();
        assert!(matches!(
            engine.remove(id, "again", UserId::new()).unwrap_err(),
            EngineError::InvalidState { .. }
        ));
        assert!(matches!(
            engine.remove(AssignmentId::generate(), "x", UserId::new()).unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn reserve_and_release_for_a_request() {
        let engine = engine();
        let (eq, units) = laptops(&engine, 3);
        let request_id = RequestId::generate();
        let admin = UserId::new();

        let reserved = engine.reserve_for_request(eq, request_id, 2, admin).unwrap();
        assert_eq!(reserved, vec![units[0], units[1]]);
        assert!(matches!(
            engine.reserve_for_request(eq, RequestId::generate(), 2, admin).unwrap_err(),
            EngineError::InsufficientInventory { requested: 2, available: 1 }
        ));

        engine
            .release_from_request(eq, request_id, &reserved, ReturnCondition::Damaged, admin)
            .unwrap();
        assert_eq!(engine.unit(units[0]).unwrap().status, UnitStatus::Damaged);
        assert_eq!(engine.equipment(eq).unwrap().quantity(BucketStatus::Damaged), 2);
    }
}
