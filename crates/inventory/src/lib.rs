//! Inventory domain module (event-sourced).
//!
//! Equipment catalog entries, their serialized units, and staff/room
//! assignments, implemented purely as deterministic domain logic (no IO, no
//! HTTP, no storage).

pub mod assignment;
pub mod equipment;
pub mod unit;

pub use assignment::{
    AssignedUnit, Assignment, AssignmentCommand, AssignmentCreated, AssignmentEvent, AssignmentId,
    AssignmentPeriod, AssignmentRemoval, AssignmentRemoved, AssignmentType, CreateAssignment,
    RemoveAssignment,
};
pub use equipment::{
    AddUnit, AssignUnits, BucketStatus, Equipment, EquipmentCommand, EquipmentDetailsUpdated,
    EquipmentEvent, EquipmentId, EquipmentRegistered, ReceiveStock, RegisterEquipment,
    ReinstateUnits, ReleaseStock, ReleaseUnits, ReserveStock, ReserveUnits, SetUnitStatus,
    StatusBuckets, StatusTransferred, StockReceived, StockReleased, StockReserved,
    TransferStatus, UnassignUnits, UnitAdded, UnitRelease, UnitStatusChanged, UnitsAssigned,
    UnitsReleased, UnitsReserved, UnitsUnassigned, UpdateEquipmentDetails,
};
pub use unit::{EquipmentUnit, ReturnCondition, UnitId, UnitStatus};
