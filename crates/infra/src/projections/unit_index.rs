use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use campusres_inventory::{AssignmentId, EquipmentEvent, EquipmentId, UnitId};

/// Which equipment owns each unit, and which assignment (if any) holds it.
#[derive(Debug, Default)]
pub struct UnitIndex {
    owners: RwLock<HashMap<UnitId, EquipmentId>>,
    active: RwLock<HashMap<UnitId, AssignmentId>>,
}

impl UnitIndex {
    pub(crate) fn apply(&self, event: &EquipmentEvent) {
        match event {
            EquipmentEvent::UnitAdded(e) => {
                self.owners
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(e.unit_id, e.equipment_id);
            }
            EquipmentEvent::UnitsAssigned(e) => {
                let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
                for id in &e.unit_ids {
                    active.insert(*id, e.assignment_id);
                }
            }
            EquipmentEvent::UnitsUnassigned(e) => {
                let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
                for id in &e.unit_ids {
                    if active.get(id) == Some(&e.assignment_id) {
                        active.remove(id);
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn clear(&self) {
        self.owners.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.active.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn owner_of(&self, unit_id: &UnitId) -> Option<EquipmentId> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit_id)
            .copied()
    }

    pub fn active_assignment(&self, unit_id: &UnitId) -> Option<AssignmentId> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campusres_core::UserId;
    use campusres_inventory::{UnitAdded, UnitsAssigned, UnitsUnassigned};
    use chrono::Utc;

    #[test]
    fn tracks_owner_and_active_assignment() {
        let index = UnitIndex::default();
        let equipment_id = EquipmentId::generate();
        let unit_id = UnitId::generate();
        let assignment_id = AssignmentId::generate();
        let actor = UserId::new();

        index.apply(&EquipmentEvent::UnitAdded(UnitAdded {
            equipment_id,
            unit_id,
            serial_number: "SN-1".into(),
            condition: "new".into(),
            actor,
            occurred_at: Utc::now(),
        }));
        assert_eq!(index.owner_of(&unit_id), Some(equipment_id));
        assert_eq!(index.active_assignment(&unit_id), None);

        index.apply(&EquipmentEvent::UnitsAssigned(UnitsAssigned {
            equipment_id,
            assignment_id,
            unit_ids: vec![unit_id],
            actor,
            occurred_at: Utc::now(),
        }));
        assert_eq!(index.active_assignment(&unit_id), Some(assignment_id));

        index.apply(&EquipmentEvent::UnitsUnassigned(UnitsUnassigned {
            equipment_id,
            assignment_id,
            unit_ids: vec![unit_id],
            reason: "moved".into(),
            actor,
            occurred_at: Utc::now(),
        }));
        assert_eq!(index.active_assignment(&unit_id), None);
    }
}
