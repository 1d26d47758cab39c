//! Capacity over a time window.
//!
//! `free = base - sum(quantity of committed requests overlapping the window)`,
//! where committed means APPROVED, HOD_APPROVED or IN_USE and overlap is
//! half-open. `base` is the AVAILABLE bucket for quantity-tracked equipment
//! and the serviceable units (AVAILABLE or IN_REQUEST) for serialized
//! equipment.

use chrono::{DateTime, Utc};
use serde::Serialize;

use campusres_core::TimeWindow;
use campusres_inventory::{Equipment, EquipmentId};
use campusres_requests::RequestId;

use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;

use super::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    /// May be negative after an admin moved stock out of AVAILABLE.
    pub free_quantity: i64,
}

impl Availability {
    pub(crate) fn ensure(self, requested: u32) -> EngineResult<()> {
        if self.available {
            return Ok(());
        }
        Err(EngineError::InsufficientInventory {
            requested,
            available: self.free_quantity,
        })
    }
}

impl<S: EventStore> Engine<S> {
    pub fn check_availability(
        &self,
        equipment_id: EquipmentId,
        quantity: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Availability> {
        let window = TimeWindow::new(start, end)?;
        let equipment = self.load_equipment(equipment_id)?;
        Ok(self.availability_of(&equipment, quantity, &window, None))
    }

    /// Same as [`Engine::check_availability`] but ignoring one request's own
    /// commitment.
    pub fn check_availability_excluding(
        &self,
        request_id: RequestId,
        equipment_id: EquipmentId,
        quantity: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Availability> {
        let window = TimeWindow::new(start, end)?;
        let equipment = self.load_equipment(equipment_id)?;
        Ok(self.availability_of(&equipment, quantity, &window, Some(request_id)))
    }

    pub(crate) fn availability_of(
        &self,
        equipment: &Equipment,
        quantity: u32,
        window: &TimeWindow,
        exclude: Option<RequestId>,
    ) -> Availability {
        let equipment_id = equipment.id_typed();
        let committed: i64 = self
            .projections
            .requests()
            .committed_overlapping(equipment_id, window, exclude)
            .iter()
            .map(|v| i64::from(v.quantity))
            .sum();
        let base = i64::from(equipment.reservable_base());
        let free_quantity = base - committed;

        tracing::debug!(
            equipment_id = %equipment_id,
            base,
            committed,
            free_quantity,
            requested = quantity,
            start = %window.start(),
            end = %window.end(),
            "availability computed"
        );

        Availability {
            available: free_quantity >= i64::from(quantity),
            free_quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use campusres_core::{ManualClock, UserId};
    use campusres_requests::RequesterRole;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{NewEquipment, NewRequest};
    use crate::event_store::InMemoryEventStore;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 3, 4, h, 0, 0).unwrap()
    }

    fn engine() -> Engine {
        let clock = Arc::new(ManualClock::new(at(6)));
        Engine::new(InMemoryEventStore::new(), clock, EngineConfig::default())
    }

    #[test]
    fn committed_overlapping_requests_reduce_free_quantity() {
        let engine = engine();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::quantity_tracked("Tripod", 4), admin)
            .unwrap();

        let request = engine
            .submit(NewRequest {
                requester: UserId::new(),
                requester_role: RequesterRole::Professor,
                equipment_id: eq,
                quantity: 3,
                course_id: None,
                lab_class_id: None,
                reason: "Field shoot".into(),
                start: at(10),
                end: at(12),
            })
            .unwrap();

        // Pending requests do not count.
        let before = engine.check_availability(eq, 2, at(11), at(13)).unwrap();
        assert_eq!(before.free_quantity, 4);

        engine.approve(request.id_typed(), admin).unwrap();

        let overlapping = engine.check_availability(eq, 2, at(11), at(13)).unwrap();
        assert_eq!(overlapping, Availability { available: false, free_quantity: 1 });

        // Touching windows do not overlap.
        let after = engine.check_availability(eq, 4, at(12), at(14)).unwrap();
        assert!(after.available);

        let own = engine
            .check_availability_excluding(request.id_typed(), eq, 4, at(11), at(13))
            .unwrap();
        assert_eq!(own.free_quantity, 4);
    }

    #[test]
    fn inverted_window_is_rejected() {
        let engine = engine();
        let eq = engine
            .register_equipment(NewEquipment::quantity_tracked("Tripod", 1), UserId::new())
            .unwrap();
        let err = engine
            .check_availability(eq, 1, at(12), at(12) - Duration::hours(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn unknown_equipment_is_not_found() {
        let err = engine()
            .check_availability(EquipmentId::generate(), 1, at(10), at(11))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
