//! Catalog entries, stock and unit maintenance.

use campusres_core::UserId;
use campusres_inventory::{
    AddUnit, BucketStatus, Equipment, EquipmentCommand, EquipmentId, EquipmentUnit, ReceiveStock,
    RegisterEquipment, SetUnitStatus, TransferStatus, UnitId, UnitStatus, UpdateEquipmentDetails,
};

use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;

use super::Engine;

/// Input for [`Engine::register_equipment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEquipment {
    pub name: String,
    pub location: Option<String>,
    pub allowed_to_students: bool,
    /// Fixed at registration.
    pub tracks_serialized_units: bool,
    /// Quantity-tracked only.
    pub initial_quantity: u32,
}

impl NewEquipment {
    pub fn quantity_tracked(name: impl Into<String>, quantity: u32) -> Self {
        Self {
            name: name.into(),
            location: None,
            allowed_to_students: true,
            tracks_serialized_units: false,
            initial_quantity: quantity,
        }
    }

    /// Starts with no units; add them with [`Engine::add_unit`].
    pub fn serialized(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
            allowed_to_students: true,
            tracks_serialized_units: true,
            initial_quantity: 0,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn staff_only(mut self) -> Self {
        self.allowed_to_students = false;
        self
    }
}

impl<S: EventStore> Engine<S> {
    pub fn register_equipment(&self, new: NewEquipment, actor: UserId) -> EngineResult<EquipmentId> {
        let now = self.clock.now();
        let equipment_id = EquipmentId::generate();
        let cmd = EquipmentCommand::RegisterEquipment(RegisterEquipment {
            equipment_id,
            name: new.name,
            location: new.location,
            allowed_to_students: new.allowed_to_students,
            tracks_serialized_units: new.tracks_serialized_units,
            initial_quantity: new.initial_quantity,
            actor,
            occurred_at: now,
        });

        self.locks.with(equipment_id.aggregate_id(), || {
            self.dispatch_equipment(equipment_id, cmd)
        })?;
        tracing::info!(equipment_id = %equipment_id, actor = %actor, "equipment registered");
        Ok(equipment_id)
    }

    pub fn update_details(
        &self,
        equipment_id: EquipmentId,
        name: impl Into<String>,
        location: Option<String>,
        allowed_to_students: bool,
        available: bool,
        actor: UserId,
    ) -> EngineResult<Equipment> {
        let now = self.clock.now();
        let cmd = EquipmentCommand::UpdateEquipmentDetails(UpdateEquipmentDetails {
            equipment_id,
            name: name.into(),
            location,
            allowed_to_students,
            available,
            actor,
            occurred_at: now,
        });
        self.mutate_equipment(equipment_id, "update_details", cmd)
    }

    pub fn receive_stock(&self, equipment_id: EquipmentId, quantity: u32, actor: UserId) -> EngineResult<Equipment> {
        let now = self.clock.now();
        let cmd = EquipmentCommand::ReceiveStock(ReceiveStock {
            equipment_id,
            quantity,
            actor,
            occurred_at: now,
        });
        self.mutate_equipment(equipment_id, "receive_stock", cmd)
    }

    pub fn add_unit(
        &self,
        equipment_id: EquipmentId,
        serial_number: impl Into<String>,
        condition: impl Into<String>,
        actor: UserId,
    ) -> EngineResult<UnitId> {
        let now = self.clock.now();
        let unit_id = UnitId::generate();
        let cmd = EquipmentCommand::AddUnit(AddUnit {
            equipment_id,
            unit_id,
            serial_number: serial_number.into(),
            condition: condition.into(),
            actor,
            occurred_at: now,
        });
        self.mutate_equipment(equipment_id, "add_unit", cmd)?;
        Ok(unit_id)
    }

    /// Admin move of an unbound unit between AVAILABLE, MAINTENANCE, DAMAGED
    /// and LOST. Retired units stay on record.
    pub fn set_unit_status(
        &self,
        unit_id: UnitId,
        status: UnitStatus,
        notes: Option<String>,
        actor: UserId,
    ) -> EngineResult<EquipmentUnit> {
        let now = self.clock.now();
        let equipment_id = self.owner_of(unit_id)?;
        let cmd = EquipmentCommand::SetUnitStatus(SetUnitStatus {
            equipment_id,
            unit_id,
            status,
            notes,
            actor,
            occurred_at: now,
        });
        let equipment = self.mutate_equipment(equipment_id, "set_unit_status", cmd)?;
        equipment
            .unit(&unit_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unit {unit_id}")))
    }

    /// Move `quantity` between two status buckets of quantity-tracked
    /// equipment.
    pub fn transfer_status(
        &self,
        equipment_id: EquipmentId,
        from: BucketStatus,
        to: BucketStatus,
        quantity: i64,
        notes: Option<String>,
        actor: UserId,
    ) -> EngineResult<Equipment> {
        let now = self.clock.now();
        let cmd = EquipmentCommand::TransferStatus(TransferStatus {
            equipment_id,
            from,
            to,
            quantity,
            notes,
            actor,
            occurred_at: now,
        });
        self.mutate_equipment(equipment_id, "transfer_status", cmd)
    }

    pub fn equipment(&self, equipment_id: EquipmentId) -> EngineResult<Equipment> {
        self.load_equipment(equipment_id)
    }

    pub fn unit(&self, unit_id: UnitId) -> EngineResult<EquipmentUnit> {
        let equipment = self.load_equipment(self.owner_of(unit_id)?)?;
        equipment
            .unit(&unit_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("unit {unit_id}")))
    }

    /// Units ordered by serial number.
    pub fn units_of(&self, equipment_id: EquipmentId) -> EngineResult<Vec<EquipmentUnit>> {
        let equipment = self.load_equipment(equipment_id)?;
        let mut units: Vec<EquipmentUnit> = equipment.units().cloned().collect();
        units.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        Ok(units)
    }

    pub(crate) fn owner_of(&self, unit_id: UnitId) -> EngineResult<EquipmentId> {
        self.projections
            .units()
            .owner_of(&unit_id)
            .ok_or_else(|| EngineError::not_found(format!("unit {unit_id}")))
    }

    fn mutate_equipment(
        &self,
        equipment_id: EquipmentId,
        operation: &'static str,
        cmd: EquipmentCommand,
    ) -> EngineResult<Equipment> {
        let equipment = self.locks.with(equipment_id.aggregate_id(), || {
            self.retrying(operation, || {
                self.dispatch_equipment(equipment_id, cmd.clone())?;
                self.load_equipment(equipment_id)
            })
        })?;
        tracing::info!(equipment_id = %equipment_id, operation, actor = %cmd_actor(&cmd), "equipment updated");
        Ok(equipment)
    }
}

fn cmd_actor(cmd: &EquipmentCommand) -> UserId {
    match cmd {
        EquipmentCommand::RegisterEquipment(c) => c.actor,
        EquipmentCommand::UpdateEquipmentDetails(c) => c.actor,
        EquipmentCommand::ReceiveStock(c) => c.actor,
        EquipmentCommand::AddUnit(c) => c.actor,
        EquipmentCommand::TransferStatus(c) => c.actor,
        EquipmentCommand::AssignUnits(c) => c.actor,
        EquipmentCommand::UnassignUnits(c) => c.actor,
        EquipmentCommand::ReserveUnits(c) => c.actor,
        EquipmentCommand::ReleaseUnits(c) => c.actor,
        EquipmentCommand::ReinstateUnits(c) => c.actor,
        EquipmentCommand::ReserveStock(c) => c.actor,
        EquipmentCommand::ReleaseStock(c) => c.actor,
        EquipmentCommand::SetUnitStatus(c) => c.actor,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use campusres_core::SystemClock;

    use super::*;
    use crate::config::EngineConfig;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::HistorySubject;

    fn engine() -> Engine {
        Engine::new(InMemoryEventStore::new(), Arc::new(SystemClock), EngineConfig::default())
    }

    #[test]
    fn transfer_moves_quantity_and_writes_one_record() {
        let engine = engine();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::quantity_tracked("Microscope", 10).at("Lab 2"), admin)
            .unwrap();

        let after = engine
            .transfer_status(eq, BucketStatus::Available, BucketStatus::Damaged, 3, None, admin)
            .unwrap();
        assert_eq!(after.quantity(BucketStatus::Available), 7);
        assert_eq!(after.quantity(BucketStatus::Damaged), 3);
        assert_eq!(after.total(), 10);

        let records = engine
            .projections()
            .history()
            .for_subject(&HistorySubject::Equipment(eq));
        // Registration plus the transfer.
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].to_status, "DAMAGED");
        assert_eq!(records[1].quantity, 3);
    }

    #[test]
    fn invalid_transfers_are_validation_errors() {
        let engine = engine();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::quantity_tracked("Microscope", 2), admin)
            .unwrap();

        for (from, to, qty) in [
            (BucketStatus::Available, BucketStatus::Available, 1),
            (BucketStatus::Available, BucketStatus::Lost, 0),
            (BucketStatus::Available, BucketStatus::Lost, 3),
        ] {
            let err = engine.transfer_status(eq, from, to, qty, None, admin).unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "{from}->{to} x{qty}: {err}");
        }
        assert_eq!(engine.projections().history().for_equipment(eq).len(), 1);
    }

    #[test]
    fn units_are_listed_by_serial_and_retired_units_stay() {
        let engine = engine();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::serialized("Laptop"), admin)
            .unwrap();
        let b = engine.add_unit(eq, "SN-B", "good", admin).unwrap();
        let a = engine.add_unit(eq, "SN-A", "good", admin).unwrap();

        let retired = engine
            .set_unit_status(b, UnitStatus::Lost, Some("stolen".into()), admin)
            .unwrap();
        assert_eq!(retired.status, UnitStatus::Lost);

        let units = engine.units_of(eq).unwrap();
        assert_eq!(units.iter().map(|u| u.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(engine.equipment(eq).unwrap().quantity(BucketStatus::Lost), 1);
        assert_eq!(engine.unit(a).unwrap().serial_number, "SN-A");
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let engine = engine();
        let admin = UserId::new();
        let eq = engine
            .register_equipment(NewEquipment::serialized("Laptop"), admin)
            .unwrap();
        engine.add_unit(eq, "SN-1", "good", admin).unwrap();
        let err = engine.add_unit(eq, "SN-1", "good", admin).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
