use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use campusres_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId, typed_id};
use campusres_events::Event;

use crate::assignment::AssignmentId;
use crate::unit::{EquipmentUnit, ReturnCondition, UnitId, UnitStatus};

typed_id!(
    /// Equipment catalog entry identifier.
    EquipmentId
);

/// Aggregate quantity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketStatus {
    Available,
    UnderMaintenance,
    Damaged,
    Lost,
    Reserved,
}

impl BucketStatus {
    pub const ALL: [BucketStatus; 5] = [
        BucketStatus::Available,
        BucketStatus::UnderMaintenance,
        BucketStatus::Damaged,
        BucketStatus::Lost,
        BucketStatus::Reserved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketStatus::Available => "AVAILABLE",
            BucketStatus::UnderMaintenance => "UNDER_MAINTENANCE",
            BucketStatus::Damaged => "DAMAGED",
            BucketStatus::Lost => "LOST",
            BucketStatus::Reserved => "RESERVED",
        }
    }
}

impl core::fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<UnitStatus> for BucketStatus {
    fn from(status: UnitStatus) -> Self {
        match status {
            UnitStatus::Available => BucketStatus::Available,
            UnitStatus::Assigned | UnitStatus::InRequest => BucketStatus::Reserved,
            UnitStatus::Maintenance => BucketStatus::UnderMaintenance,
            UnitStatus::Damaged => BucketStatus::Damaged,
            UnitStatus::Lost => BucketStatus::Lost,
        }
    }
}

/// Per-status quantity breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBuckets {
    pub available: u32,
    pub under_maintenance: u32,
    pub damaged: u32,
    pub lost: u32,
    pub reserved: u32,
}

impl StatusBuckets {
    pub fn get(&self, status: BucketStatus) -> u32 {
        match status {
            BucketStatus::Available => self.available,
            BucketStatus::UnderMaintenance => self.under_maintenance,
            BucketStatus::Damaged => self.damaged,
            BucketStatus::Lost => self.lost,
            BucketStatus::Reserved => self.reserved,
        }
    }

    fn slot_mut(&mut self, status: BucketStatus) -> &mut u32 {
        match status {
            BucketStatus::Available => &mut self.available,
            BucketStatus::UnderMaintenance => &mut self.under_maintenance,
            BucketStatus::Damaged => &mut self.damaged,
            BucketStatus::Lost => &mut self.lost,
            BucketStatus::Reserved => &mut self.reserved,
        }
    }

    fn shift(&mut self, from: BucketStatus, to: BucketStatus, quantity: u32) {
        let src = self.slot_mut(from);
        *src = src.saturating_sub(quantity);
        *self.slot_mut(to) += quantity;
    }

    pub fn total(&self) -> u32 {
        BucketStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Aggregate root: Equipment.
///
/// Either bucket-tracked (coarse per-status counts) or serialized (owns its
/// units), selected once at registration by `tracks_serialized_units`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equipment {
    id: EquipmentId,
    name: String,
    location: Option<String>,
    allowed_to_students: bool,
    available: bool,
    tracks_serialized_units: bool,
    buckets: StatusBuckets,
    /// RESERVED quantity held per request (bucket-tracked only).
    loans: BTreeMap<AggregateId, u32>,
    units: BTreeMap<UnitId, EquipmentUnit>,
    version: u64,
    created: bool,
}

impl Equipment {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: EquipmentId) -> Self {
        Self {
            id,
            name: String::new(),
            location: None,
            allowed_to_students: false,
            available: false,
            tracks_serialized_units: false,
            buckets: StatusBuckets::default(),
            loans: BTreeMap::new(),
            units: BTreeMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> EquipmentId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn allowed_to_students(&self) -> bool {
        self.allowed_to_students
    }

    /// Catalog-level "open for reservations" flag.
    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn tracks_serialized_units(&self) -> bool {
        self.tracks_serialized_units
    }

    /// Current per-status breakdown. Derived from units when serialized.
    pub fn breakdown(&self) -> StatusBuckets {
        if !self.tracks_serialized_units {
            return self.buckets;
        }
        let mut b = StatusBuckets::default();
        for unit in self.units.values() {
            *b.slot_mut(BucketStatus::from(unit.status)) += 1;
        }
        b
    }

    pub fn quantity(&self, status: BucketStatus) -> u32 {
        self.breakdown().get(status)
    }

    pub fn total(&self) -> u32 {
        if self.tracks_serialized_units {
            self.units.len() as u32
        } else {
            self.buckets.total()
        }
    }

    /// Quantity a reservation window can draw from before subtracting
    /// overlapping commitments. Stock out on loan counts: the requests
    /// holding it are subtracted through their own windows.
    pub fn reservable_base(&self) -> u32 {
        if self.tracks_serialized_units {
            self.units.values().filter(|u| u.status.is_serviceable()).count() as u32
        } else {
            self.buckets.available + self.stock_on_loan()
        }
    }

    /// RESERVED quantity held by one request.
    pub fn stock_held_by(&self, request_id: AggregateId) -> u32 {
        self.loans.get(&request_id).copied().unwrap_or(0)
    }

    /// RESERVED quantity held by requests, as opposed to manual holds.
    pub fn stock_on_loan(&self) -> u32 {
        self.loans.values().sum()
    }

    pub fn units(&self) -> impl Iterator<Item = &EquipmentUnit> {
        self.units.values()
    }

    pub fn unit(&self, unit_id: &UnitId) -> Option<&EquipmentUnit> {
        self.units.get(unit_id)
    }

    pub fn available_unit_count(&self) -> u32 {
        self.units.values().filter(|u| u.is_available()).count() as u32
    }

    /// Units currently held by a request.
    pub fn units_held_by(&self, request_id: AggregateId) -> Vec<UnitId> {
        self.units
            .values()
            .filter(|u| u.status == UnitStatus::InRequest && u.request == Some(request_id))
            .map(|u| u.id)
            .collect()
    }
}

impl AggregateRoot for Equipment {
    type Id = EquipmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterEquipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterEquipment {
    pub equipment_id: EquipmentId,
    pub name: String,
    pub location: Option<String>,
    pub allowed_to_students: bool,
    pub tracks_serialized_units: bool,
    /// Opening AVAILABLE quantity (bucket-tracked only).
    pub initial_quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateEquipmentDetails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEquipmentDetails {
    pub equipment_id: EquipmentId,
    pub name: String,
    pub location: Option<String>,
    pub allowed_to_students: bool,
    pub available: bool,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub equipment_id: EquipmentId,
    pub quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddUnit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUnit {
    pub equipment_id: EquipmentId,
    pub unit_id: UnitId,
    pub serial_number: String,
    pub condition: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransferStatus (admin inventory correction between buckets).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub equipment_id: EquipmentId,
    pub from: BucketStatus,
    pub to: BucketStatus,
    pub quantity: i64,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AssignUnits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignUnits {
    pub equipment_id: EquipmentId,
    pub assignment_id: AssignmentId,
    pub unit_ids: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UnassignUnits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignUnits {
    pub equipment_id: EquipmentId,
    pub assignment_id: AssignmentId,
    pub unit_ids: Vec<UnitId>,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveUnits (pick `quantity` AVAILABLE units for a request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveUnits {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseUnits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseUnits {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub unit_ids: Vec<UnitId>,
    pub condition: ReturnCondition,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReinstateUnits (put released units back on their request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReinstateUnits {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub unit_ids: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock (bucket-tracked counterpart of ReserveUnits).
///
/// `from` is AVAILABLE on approval; reinstating a released loan draws from
/// the bucket it was released into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub from: BucketStatus,
    pub quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseStock (bucket-tracked counterpart of ReleaseUnits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub condition: ReturnCondition,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetUnitStatus (maintenance, retirement, repair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUnitStatus {
    pub equipment_id: EquipmentId,
    pub unit_id: UnitId,
    pub status: UnitStatus,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquipmentCommand {
    RegisterEquipment(RegisterEquipment),
    UpdateEquipmentDetails(UpdateEquipmentDetails),
    ReceiveStock(ReceiveStock),
    AddUnit(AddUnit),
    TransferStatus(TransferStatus),
    AssignUnits(AssignUnits),
    UnassignUnits(UnassignUnits),
    ReserveUnits(ReserveUnits),
    ReleaseUnits(ReleaseUnits),
    ReinstateUnits(ReinstateUnits),
    ReserveStock(ReserveStock),
    ReleaseStock(ReleaseStock),
    SetUnitStatus(SetUnitStatus),
}

/// Event: EquipmentRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentRegistered {
    pub equipment_id: EquipmentId,
    pub name: String,
    pub location: Option<String>,
    pub allowed_to_students: bool,
    pub tracks_serialized_units: bool,
    pub initial_quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: EquipmentDetailsUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentDetailsUpdated {
    pub equipment_id: EquipmentId,
    pub name: String,
    pub location: Option<String>,
    pub allowed_to_students: bool,
    pub available: bool,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    pub equipment_id: EquipmentId,
    pub quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAdded {
    pub equipment_id: EquipmentId,
    pub unit_id: UnitId,
    pub serial_number: String,
    pub condition: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusTransferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransferred {
    pub equipment_id: EquipmentId,
    pub from: BucketStatus,
    pub to: BucketStatus,
    pub quantity: u32,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitsAssigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsAssigned {
    pub equipment_id: EquipmentId,
    pub assignment_id: AssignmentId,
    pub unit_ids: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitsUnassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsUnassigned {
    pub equipment_id: EquipmentId,
    pub assignment_id: AssignmentId,
    pub unit_ids: Vec<UnitId>,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitsReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsReserved {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub unit_ids: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Where one unit went on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRelease {
    pub unit_id: UnitId,
    pub to: UnitStatus,
}

/// Event: UnitsReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitsReleased {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub releases: Vec<UnitRelease>,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub from: BucketStatus,
    pub quantity: u32,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub equipment_id: EquipmentId,
    pub request_id: AggregateId,
    pub to: BucketStatus,
    pub quantity: u32,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatusChanged {
    pub equipment_id: EquipmentId,
    pub unit_id: UnitId,
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquipmentEvent {
    EquipmentRegistered(EquipmentRegistered),
    EquipmentDetailsUpdated(EquipmentDetailsUpdated),
    StockReceived(StockReceived),
    UnitAdded(UnitAdded),
    StatusTransferred(StatusTransferred),
    UnitsAssigned(UnitsAssigned),
    UnitsUnassigned(UnitsUnassigned),
    UnitsReserved(UnitsReserved),
    UnitsReleased(UnitsReleased),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    UnitStatusChanged(UnitStatusChanged),
}

impl EquipmentEvent {
    pub fn actor(&self) -> UserId {
        match self {
            EquipmentEvent::EquipmentRegistered(e) => e.actor,
            EquipmentEvent::EquipmentDetailsUpdated(e) => e.actor,
            EquipmentEvent::StockReceived(e) => e.actor,
            EquipmentEvent::UnitAdded(e) => e.actor,
            EquipmentEvent::StatusTransferred(e) => e.actor,
            EquipmentEvent::UnitsAssigned(e) => e.actor,
            EquipmentEvent::UnitsUnassigned(e) => e.actor,
            EquipmentEvent::UnitsReserved(e) => e.actor,
            EquipmentEvent::UnitsReleased(e) => e.actor,
            EquipmentEvent::StockReserved(e) => e.actor,
            EquipmentEvent::StockReleased(e) => e.actor,
            EquipmentEvent::UnitStatusChanged(e) => e.actor,
        }
    }

    pub fn equipment_id(&self) -> EquipmentId {
        match self {
            EquipmentEvent::EquipmentRegistered(e) => e.equipment_id,
            EquipmentEvent::EquipmentDetailsUpdated(e) => e.equipment_id,
            EquipmentEvent::StockReceived(e) => e.equipment_id,
            EquipmentEvent::UnitAdded(e) => e.equipment_id,
            EquipmentEvent::StatusTransferred(e) => e.equipment_id,
            EquipmentEvent::UnitsAssigned(e) => e.equipment_id,
            EquipmentEvent::UnitsUnassigned(e) => e.equipment_id,
            EquipmentEvent::UnitsReserved(e) => e.equipment_id,
            EquipmentEvent::UnitsReleased(e) => e.equipment_id,
            EquipmentEvent::StockReserved(e) => e.equipment_id,
            EquipmentEvent::StockReleased(e) => e.equipment_id,
            EquipmentEvent::UnitStatusChanged(e) => e.equipment_id,
        }
    }
}

impl Event for EquipmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            EquipmentEvent::EquipmentRegistered(_) => "inventory.equipment.registered",
            EquipmentEvent::EquipmentDetailsUpdated(_) => "inventory.equipment.details_updated",
            EquipmentEvent::StockReceived(_) => "inventory.equipment.stock_received",
            EquipmentEvent::UnitAdded(_) => "inventory.equipment.unit_added",
            EquipmentEvent::StatusTransferred(_) => "inventory.equipment.status_transferred",
            EquipmentEvent::UnitsAssigned(_) => "inventory.equipment.units_assigned",
            EquipmentEvent::UnitsUnassigned(_) => "inventory.equipment.units_unassigned",
            EquipmentEvent::UnitsReserved(_) => "inventory.equipment.units_reserved",
            EquipmentEvent::UnitsReleased(_) => "inventory.equipment.units_released",
            EquipmentEvent::StockReserved(_) => "inventory.equipment.stock_reserved",
            EquipmentEvent::StockReleased(_) => "inventory.equipment.stock_released",
            EquipmentEvent::UnitStatusChanged(_) => "inventory.equipment.unit_status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            EquipmentEvent::EquipmentRegistered(e) => e.occurred_at,
            EquipmentEvent::EquipmentDetailsUpdated(e) => e.occurred_at,
            EquipmentEvent::StockReceived(e) => e.occurred_at,
            EquipmentEvent::UnitAdded(e) => e.occurred_at,
            EquipmentEvent::StatusTransferred(e) => e.occurred_at,
            EquipmentEvent::UnitsAssigned(e) => e.occurred_at,
            EquipmentEvent::UnitsUnassigned(e) => e.occurred_at,
            EquipmentEvent::UnitsReserved(e) => e.occurred_at,
            EquipmentEvent::UnitsReleased(e) => e.occurred_at,
            EquipmentEvent::StockReserved(e) => e.occurred_at,
            EquipmentEvent::StockReleased(e) => e.occurred_at,
            EquipmentEvent::UnitStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Equipment {
    type Command = EquipmentCommand;
    type Event = EquipmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            EquipmentEvent::EquipmentRegistered(e) => {
                self.id = e.equipment_id;
                self.name = e.name.clone();
                self.location = e.location.clone();
                self.allowed_to_students = e.allowed_to_students;
                self.available = true;
                self.tracks_serialized_units = e.tracks_serialized_units;
                self.buckets = StatusBuckets {
                    available: e.initial_quantity,
                    ..StatusBuckets::default()
                };
                self.units.clear();
                self.loans.clear();
                self.created = true;
            }
            EquipmentEvent::EquipmentDetailsUpdated(e) => {
                self.name = e.name.clone();
                self.location = e.location.clone();
                self.allowed_to_students = e.allowed_to_students;
                self.available = e.available;
            }
            EquipmentEvent::StockReceived(e) => {
                self.buckets.available += e.quantity;
            }
            EquipmentEvent::UnitAdded(e) => {
                self.units.insert(
                    e.unit_id,
                    EquipmentUnit::new(e.unit_id, e.serial_number.clone(), e.condition.clone()),
                );
            }
            EquipmentEvent::StatusTransferred(e) => {
                self.buckets.shift(e.from, e.to, e.quantity);
            }
            EquipmentEvent::UnitsAssigned(e) => {
                for id in &e.unit_ids {
                    if let Some(unit) = self.units.get_mut(id) {
                        unit.status = UnitStatus::Assigned;
                        unit.assignment = Some(e.assignment_id);
                    }
                }
            }
            EquipmentEvent::UnitsUnassigned(e) => {
                for id in &e.unit_ids {
                    if let Some(unit) = self.units.get_mut(id) {
                        unit.status = UnitStatus::Available;
                        unit.assignment = None;
                    }
                }
            }
            EquipmentEvent::UnitsReserved(e) => {
                for id in &e.unit_ids {
                    if let Some(unit) = self.units.get_mut(id) {
                        unit.status = UnitStatus::InRequest;
                        unit.request = Some(e.request_id);
                    }
                }
            }
            EquipmentEvent::UnitsReleased(e) => {
                for release in &e.releases {
                    if let Some(unit) = self.units.get_mut(&release.unit_id) {
                        unit.status = release.to;
                        unit.request = None;
                    }
                }
            }
            EquipmentEvent::StockReserved(e) => {
                self.buckets.shift(e.from, BucketStatus::Reserved, e.quantity);
                self.loans.insert(e.request_id, e.quantity);
            }
            EquipmentEvent::StockReleased(e) => {
                self.buckets.shift(BucketStatus::Reserved, e.to, e.quantity);
                self.loans.remove(&e.request_id);
            }
            EquipmentEvent::UnitStatusChanged(e) => {
                if let Some(unit) = self.units.get_mut(&e.unit_id) {
                    unit.status = e.to;
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            EquipmentCommand::RegisterEquipment(cmd) => self.handle_register(cmd),
            EquipmentCommand::UpdateEquipmentDetails(cmd) => self.handle_update_details(cmd),
            EquipmentCommand::ReceiveStock(cmd) => self.handle_receive_stock(cmd),
            EquipmentCommand::AddUnit(cmd) => self.handle_add_unit(cmd),
            EquipmentCommand::TransferStatus(cmd) => self.handle_transfer(cmd),
            EquipmentCommand::AssignUnits(cmd) => self.handle_assign(cmd),
            EquipmentCommand::UnassignUnits(cmd) => self.handle_unassign(cmd),
            EquipmentCommand::ReserveUnits(cmd) => self.handle_reserve(cmd),
            EquipmentCommand::ReleaseUnits(cmd) => self.handle_release(cmd),
            EquipmentCommand::ReinstateUnits(cmd) => self.handle_reinstate(cmd),
            EquipmentCommand::ReserveStock(cmd) => self.handle_reserve_stock(cmd),
            EquipmentCommand::ReleaseStock(cmd) => self.handle_release_stock(cmd),
            EquipmentCommand::SetUnitStatus(cmd) => self.handle_set_unit_status(cmd),
        }
    }
}

impl Equipment {
    fn ensure_exists(&self, equipment_id: EquipmentId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != equipment_id {
            return Err(DomainError::invariant("equipment_id mismatch"));
        }
        Ok(())
    }

    fn ensure_buckets(&self) -> Result<(), DomainError> {
        if self.tracks_serialized_units {
            return Err(DomainError::validation(
                "equipment tracks serialized units; change unit status instead",
            ));
        }
        Ok(())
    }

    fn ensure_serialized(&self) -> Result<(), DomainError> {
        if !self.tracks_serialized_units {
            return Err(DomainError::validation(
                "equipment is tracked by quantity buckets, not serialized units",
            ));
        }
        Ok(())
    }

    fn existing_unit(&self, unit_id: &UnitId) -> Result<&EquipmentUnit, DomainError> {
        self.units.get(unit_id).ok_or_else(DomainError::not_found)
    }

    fn ensure_distinct(unit_ids: &[UnitId]) -> Result<(), DomainError> {
        if unit_ids.is_empty() {
            return Err(DomainError::validation("at least one unit is required"));
        }
        let mut seen = HashSet::with_capacity(unit_ids.len());
        if !unit_ids.iter().all(|id| seen.insert(*id)) {
            return Err(DomainError::validation("duplicate unit ids"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterEquipment) -> Result<Vec<EquipmentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("equipment already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.tracks_serialized_units && cmd.initial_quantity > 0 {
            return Err(DomainError::validation(
                "serialized equipment starts empty; add units individually",
            ));
        }

        Ok(vec![EquipmentEvent::EquipmentRegistered(EquipmentRegistered {
            equipment_id: cmd.equipment_id,
            name: cmd.name.trim().to_string(),
            location: cmd.location.clone(),
            allowed_to_students: cmd.allowed_to_students,
            tracks_serialized_units: cmd.tracks_serialized_units,
            initial_quantity: cmd.initial_quantity,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_details(
        &self,
        cmd: &UpdateEquipmentDetails,
    ) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }

        Ok(vec![EquipmentEvent::EquipmentDetailsUpdated(EquipmentDetailsUpdated {
            equipment_id: cmd.equipment_id,
            name: cmd.name.trim().to_string(),
            location: cmd.location.clone(),
            allowed_to_students: cmd.allowed_to_students,
            available: cmd.available,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive_stock(&self, cmd: &ReceiveStock) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_buckets()?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }

        Ok(vec![EquipmentEvent::StockReceived(StockReceived {
            equipment_id: cmd.equipment_id,
            quantity: cmd.quantity,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_unit(&self, cmd: &AddUnit) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;

        let serial = cmd.serial_number.trim();
        if serial.is_empty() {
            return Err(DomainError::validation("serial number cannot be empty"));
        }
        if self.units.contains_key(&cmd.unit_id) {
            return Err(DomainError::conflict("unit already exists"));
        }
        if self.units.values().any(|u| u.serial_number == serial) {
            return Err(DomainError::validation(format!(
                "serial number '{serial}' already exists for this equipment"
            )));
        }

        Ok(vec![EquipmentEvent::UnitAdded(UnitAdded {
            equipment_id: cmd.equipment_id,
            unit_id: cmd.unit_id,
            serial_number: serial.to_string(),
            condition: cmd.condition.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transfer(&self, cmd: &TransferStatus) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_buckets()?;

        if cmd.from == cmd.to {
            return Err(DomainError::validation("from and to status must differ"));
        }
        if cmd.quantity < 1 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        let current = self.buckets.get(cmd.from);
        if cmd.quantity > i64::from(current) {
            return Err(DomainError::validation(format!(
                "quantity {} exceeds {} count {current}",
                cmd.quantity, cmd.from
            )));
        }
        // Loaned stock leaves RESERVED only through its request's return.
        if cmd.from == BucketStatus::Reserved {
            let movable = current.saturating_sub(self.stock_on_loan());
            if cmd.quantity > i64::from(movable) {
                return Err(DomainError::validation(format!(
                    "only {movable} of {current} RESERVED are not on loan"
                )));
            }
        }

        Ok(vec![EquipmentEvent::StatusTransferred(StatusTransferred {
            equipment_id: cmd.equipment_id,
            from: cmd.from,
            to: cmd.to,
            quantity: cmd.quantity as u32,
            notes: cmd.notes.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign(&self, cmd: &AssignUnits) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;
        Self::ensure_distinct(&cmd.unit_ids)?;

        for id in &cmd.unit_ids {
            let unit = self.existing_unit(id)?;
            if !unit.is_available() {
                return Err(DomainError::invalid_state(
                    unit.status,
                    format!("unit {} is not AVAILABLE", unit.serial_number),
                ));
            }
        }

        Ok(vec![EquipmentEvent::UnitsAssigned(UnitsAssigned {
            equipment_id: cmd.equipment_id,
            assignment_id: cmd.assignment_id,
            unit_ids: cmd.unit_ids.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_unassign(&self, cmd: &UnassignUnits) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;
        Self::ensure_distinct(&cmd.unit_ids)?;
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("reason is required"));
        }

        for id in &cmd.unit_ids {
            let unit = self.existing_unit(id)?;
            if unit.status != UnitStatus::Assigned || unit.assignment != Some(cmd.assignment_id) {
                return Err(DomainError::invalid_state(
                    unit.status,
                    format!("unit {} is not bound to this assignment", unit.serial_number),
                ));
            }
        }

        Ok(vec![EquipmentEvent::UnitsUnassigned(UnitsUnassigned {
            equipment_id: cmd.equipment_id,
            assignment_id: cmd.assignment_id,
            unit_ids: cmd.unit_ids.clone(),
            reason: cmd.reason.trim().to_string(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveUnits) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        if !self.units_held_by(cmd.request_id).is_empty() {
            return Err(DomainError::conflict("request already holds units"));
        }

        // Lowest serial numbers first, so selection is stable across replays.
        let mut free: Vec<&EquipmentUnit> = self.units.values().filter(|u| u.is_available()).collect();
        if (free.len() as u32) < cmd.quantity {
            return Err(DomainError::insufficient(cmd.quantity, free.len() as i64));
        }
        free.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        let unit_ids = free
            .iter()
            .take(cmd.quantity as usize)
            .map(|u| u.id)
            .collect();

        Ok(vec![EquipmentEvent::UnitsReserved(UnitsReserved {
            equipment_id: cmd.equipment_id,
            request_id: cmd.request_id,
            unit_ids,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseUnits) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;
        if cmd.unit_ids.is_empty() {
            return Ok(vec![]);
        }
        Self::ensure_distinct(&cmd.unit_ids)?;

        let to = cmd.condition.unit_status();
        let mut releases = Vec::with_capacity(cmd.unit_ids.len());
        for id in &cmd.unit_ids {
            let unit = self.existing_unit(id)?;
            if unit.status != UnitStatus::InRequest || unit.request != Some(cmd.request_id) {
                return Err(DomainError::invalid_state(
                    unit.status,
                    format!("unit {} is not held by this request", unit.serial_number),
                ));
            }
            releases.push(UnitRelease { unit_id: *id, to });
        }

        Ok(vec![EquipmentEvent::UnitsReleased(UnitsReleased {
            equipment_id: cmd.equipment_id,
            request_id: cmd.request_id,
            releases,
            notes: cmd.notes.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reinstate(&self, cmd: &ReinstateUnits) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;
        Self::ensure_distinct(&cmd.unit_ids)?;

        for id in &cmd.unit_ids {
            let unit = self.existing_unit(id)?;
            if !unit.status.is_admin_settable() {
                return Err(DomainError::invalid_state(
                    unit.status,
                    format!("unit {} is bound elsewhere", unit.serial_number),
                ));
            }
        }

        Ok(vec![EquipmentEvent::UnitsReserved(UnitsReserved {
            equipment_id: cmd.equipment_id,
            request_id: cmd.request_id,
            unit_ids: cmd.unit_ids.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve_stock(&self, cmd: &ReserveStock) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_buckets()?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        if cmd.from == BucketStatus::Reserved {
            return Err(DomainError::validation("stock is reserved from another bucket"));
        }
        if self.loans.contains_key(&cmd.request_id) {
            return Err(DomainError::conflict("request already holds stock"));
        }
        let on_hand = self.buckets.get(cmd.from);
        if on_hand < cmd.quantity {
            return Err(DomainError::insufficient(cmd.quantity, i64::from(on_hand)));
        }

        Ok(vec![EquipmentEvent::StockReserved(StockReserved {
            equipment_id: cmd.equipment_id,
            request_id: cmd.request_id,
            from: cmd.from,
            quantity: cmd.quantity,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release_stock(&self, cmd: &ReleaseStock) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_buckets()?;

        let Some(&quantity) = self.loans.get(&cmd.request_id) else {
            return Err(DomainError::invariant(format!(
                "request {} holds no reserved stock",
                cmd.request_id
            )));
        };

        Ok(vec![EquipmentEvent::StockReleased(StockReleased {
            equipment_id: cmd.equipment_id,
            request_id: cmd.request_id,
            to: BucketStatus::from(cmd.condition.unit_status()),
            quantity,
            notes: cmd.notes.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_unit_status(
        &self,
        cmd: &SetUnitStatus,
    ) -> Result<Vec<EquipmentEvent>, DomainError> {
        self.ensure_exists(cmd.equipment_id)?;
        self.ensure_serialized()?;

        let unit = self.existing_unit(&cmd.unit_id)?;
        if !cmd.status.is_admin_settable() {
            return Err(DomainError::validation(format!(
                "{} is managed by assignments and requests",
                cmd.status
            )));
        }
        if !unit.status.is_admin_settable() {
            return Err(DomainError::invalid_state(
                unit.status,
                format!("unit {} is bound; release it first", unit.serial_number),
            ));
        }
        if unit.status == cmd.status {
            return Err(DomainError::validation("unit is already in that status"));
        }

        Ok(vec![EquipmentEvent::UnitStatusChanged(UnitStatusChanged {
            equipment_id: cmd.equipment_id,
            unit_id: cmd.unit_id,
            from: unit.status,
            to: cmd.status,
            notes: cmd.notes.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campusres_events::execute;
    use proptest::prelude::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn admin() -> UserId {
        UserId::new()
    }

    fn bucket_equipment(quantity: u32) -> Equipment {
        let id = EquipmentId::generate();
        let mut eq = Equipment::empty(id);
        execute(
            &mut eq,
            &EquipmentCommand::RegisterEquipment(RegisterEquipment {
                equipment_id: id,
                name: "Projector".to_string(),
                location: Some("Room 101".to_string()),
                allowed_to_students: true,
                tracks_serialized_units: false,
                initial_quantity: quantity,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        eq
    }

    fn serialized_equipment(serials: &[&str]) -> Equipment {
        let id = EquipmentId::generate();
        let mut eq = Equipment::empty(id);
        execute(
            &mut eq,
            &EquipmentCommand::RegisterEquipment(RegisterEquipment {
                equipment_id: id,
                name: "Oscilloscope".to_string(),
                location: None,
                allowed_to_students: false,
                tracks_serialized_units: true,
                initial_quantity: 0,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        for serial in serials {
            execute(
                &mut eq,
                &EquipmentCommand::AddUnit(AddUnit {
                    equipment_id: id,
                    unit_id: UnitId::generate(),
                    serial_number: serial.to_string(),
                    condition: "new".to_string(),
                    actor: admin(),
                    occurred_at: test_time(),
                }),
            )
            .unwrap();
        }
        eq
    }

    fn transfer(eq: &Equipment, from: BucketStatus, to: BucketStatus, quantity: i64) -> EquipmentCommand {
        EquipmentCommand::TransferStatus(TransferStatus {
            equipment_id: eq.id_typed(),
            from,
            to,
            quantity,
            notes: None,
            actor: admin(),
            occurred_at: test_time(),
        })
    }

    fn unit_by_serial(eq: &Equipment, serial: &str) -> UnitId {
        eq.units().find(|u| u.serial_number == serial).unwrap().id
    }

    #[test]
    fn register_opens_available_bucket() {
        let eq = bucket_equipment(5);
        assert_eq!(eq.total(), 5);
        assert_eq!(eq.quantity(BucketStatus::Available), 5);
        assert!(eq.is_available());
        assert_eq!(eq.version(), 1);
    }

    #[test]
    fn transfer_rejects_same_status_zero_and_excess() {
        let eq = bucket_equipment(3);
        for cmd in [
            transfer(&eq, BucketStatus::Available, BucketStatus::Available, 1),
            transfer(&eq, BucketStatus::Available, BucketStatus::Damaged, 0),
            transfer(&eq, BucketStatus::Available, BucketStatus::Damaged, -2),
            transfer(&eq, BucketStatus::Available, BucketStatus::Damaged, 4),
            transfer(&eq, BucketStatus::Lost, BucketStatus::Available, 1),
        ] {
            let err = eq.handle(&cmd).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{cmd:?} -> {err:?}");
        }
    }

    #[test]
    fn transfer_moves_quantity_between_buckets() {
        let mut eq = bucket_equipment(5);
        let cmd = transfer(&eq, BucketStatus::Available, BucketStatus::UnderMaintenance, 2);
        execute(&mut eq, &cmd).unwrap();
        assert_eq!(eq.quantity(BucketStatus::Available), 3);
        assert_eq!(eq.quantity(BucketStatus::UnderMaintenance), 2);
        assert_eq!(eq.total(), 5);
    }

    #[test]
    fn transfer_is_rejected_for_serialized_equipment() {
        let eq = serialized_equipment(&["A1"]);
        let err = eq
            .handle(&transfer(&eq, BucketStatus::Available, BucketStatus::Damaged, 1))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let eq = serialized_equipment(&["A1"]);
        let err = eq
            .handle(&EquipmentCommand::AddUnit(AddUnit {
                equipment_id: eq.id_typed(),
                unit_id: UnitId::generate(),
                serial_number: " A1 ".to_string(),
                condition: "used".to_string(),
                actor: admin(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("A1")));
    }

    #[test]
    fn reserve_picks_lowest_serials_and_fails_when_short() {
        let mut eq = serialized_equipment(&["C3", "A1", "B2"]);
        let equipment_id = eq.id_typed();
        let request_id = AggregateId::new();
        let events = execute(
            &mut eq,
            &EquipmentCommand::ReserveUnits(ReserveUnits {
                equipment_id,
                request_id,
                quantity: 2,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        match &events[0] {
            EquipmentEvent::UnitsReserved(e) => {
                assert_eq!(e.unit_ids, vec![unit_by_serial(&eq, "A1"), unit_by_serial(&eq, "B2")]);
            }
            other => panic!("Expected UnitsReserved, got {other:?}"),
        }
        assert_eq!(eq.available_unit_count(), 1);
        assert_eq!(eq.quantity(BucketStatus::Reserved), 2);
        assert_eq!(eq.reservable_base(), 3);

        let err = eq
            .handle(&EquipmentCommand::ReserveUnits(ReserveUnits {
                equipment_id,
                request_id: AggregateId::new(),
                quantity: 2,
                actor: admin(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::insufficient(2, 1));
    }

    #[test]
    fn release_with_damage_lands_in_damaged() {
        let mut eq = serialized_equipment(&["A1", "B2"]);
        let equipment_id = eq.id_typed();
        let request_id = AggregateId::new();
        execute(
            &mut eq,
            &EquipmentCommand::ReserveUnits(ReserveUnits {
                equipment_id,
                request_id,
                quantity: 2,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        let held = eq.units_held_by(request_id);
        assert_eq!(held.len(), 2);

        execute(
            &mut eq,
            &EquipmentCommand::ReleaseUnits(ReleaseUnits {
                equipment_id,
                request_id,
                unit_ids: held.clone(),
                condition: ReturnCondition::Damaged,
                notes: Some("cracked lens".to_string()),
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(held.iter().all(|id| eq.unit(id).unwrap().status == UnitStatus::Damaged));
        assert_eq!(eq.quantity(BucketStatus::Damaged), 2);
        assert!(eq.units_held_by(request_id).is_empty());
    }

    #[test]
    fn assigning_a_non_available_unit_is_invalid_state() {
        let mut eq = serialized_equipment(&["A1"]);
        let unit = unit_by_serial(&eq, "A1");
        let assign = |eq: &Equipment| {
            EquipmentCommand::AssignUnits(AssignUnits {
                equipment_id: eq.id_typed(),
                assignment_id: AssignmentId::generate(),
                unit_ids: vec![unit],
                actor: admin(),
                occurred_at: test_time(),
            })
        };
        let first = assign(&eq);
        execute(&mut eq, &first).unwrap();
        let err = eq.handle(&assign(&eq)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { status, .. } if status == "ASSIGNED"));
    }

    #[test]
    fn unassign_requires_matching_assignment_and_reason() {
        let mut eq = serialized_equipment(&["A1"]);
        let equipment_id = eq.id_typed();
        let unit = unit_by_serial(&eq, "A1");
        let assignment_id = AssignmentId::generate();
        execute(
            &mut eq,
            &EquipmentCommand::AssignUnits(AssignUnits {
                equipment_id,
                assignment_id,
                unit_ids: vec![unit],
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        let unassign = |assignment_id, reason: &str| {
            EquipmentCommand::UnassignUnits(UnassignUnits {
                equipment_id,
                assignment_id,
                unit_ids: vec![unit],
                reason: reason.to_string(),
                actor: admin(),
                occurred_at: test_time(),
            })
        };
        assert!(matches!(
            eq.handle(&unassign(assignment_id, "  ")).unwrap_err(),
            DomainError::Validation(_)
        ));
        assert!(matches!(
            eq.handle(&unassign(AssignmentId::generate(), "moved")).unwrap_err(),
            DomainError::InvalidState { .. }
        ));

        let cmd = unassign(assignment_id, "moved");
        execute(&mut eq, &cmd).unwrap();
        assert_eq!(eq.unit(&unit).unwrap().status, UnitStatus::Available);
        assert_eq!(eq.unit(&unit).unwrap().assignment, None);
    }

    #[test]
    fn bound_units_cannot_be_retired_directly() {
        let mut eq = serialized_equipment(&["A1"]);
        let equipment_id = eq.id_typed();
        let unit = unit_by_serial(&eq, "A1");
        execute(
            &mut eq,
            &EquipmentCommand::ReserveUnits(ReserveUnits {
                equipment_id,
                request_id: AggregateId::new(),
                quantity: 1,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        let err = eq
            .handle(&EquipmentCommand::SetUnitStatus(SetUnitStatus {
                equipment_id,
                unit_id: unit,
                status: UnitStatus::Lost,
                notes: None,
                actor: admin(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { status, .. } if status == "IN_REQUEST"));
    }

    fn reserve_stock(eq: &Equipment, request_id: AggregateId, quantity: u32) -> EquipmentCommand {
        EquipmentCommand::ReserveStock(ReserveStock {
            equipment_id: eq.id_typed(),
            request_id,
            from: BucketStatus::Available,
            quantity,
            actor: admin(),
            occurred_at: test_time(),
        })
    }

    fn release_stock(eq: &Equipment, request_id: AggregateId, condition: ReturnCondition) -> EquipmentCommand {
        EquipmentCommand::ReleaseStock(ReleaseStock {
            equipment_id: eq.id_typed(),
            request_id,
            condition,
            notes: Some("all cracked".to_string()),
            actor: admin(),
            occurred_at: test_time(),
        })
    }

    #[test]
    fn loaned_stock_comes_back_in_full_even_after_admin_moves() {
        let mut eq = bucket_equipment(5);
        let request_id = AggregateId::new();
        { let cmd = reserve_stock(&eq, request_id, 3); execute(&mut eq, &cmd) }.unwrap();
        assert_eq!(eq.quantity(BucketStatus::Available), 2);
        assert_eq!(eq.quantity(BucketStatus::Reserved), 3);
        assert_eq!(eq.stock_held_by(request_id), 3);
        assert_eq!(eq.reservable_base(), 5);

        let cmd = transfer(&eq, BucketStatus::Available, BucketStatus::UnderMaintenance, 2);
        execute(&mut eq, &cmd).unwrap();

        let events = { let cmd = release_stock(&eq, request_id, ReturnCondition::Damaged); execute(&mut eq, &cmd) }.unwrap();
        assert!(matches!(&events[0], EquipmentEvent::StockReleased(e) if e.quantity == 3));
        assert_eq!(eq.quantity(BucketStatus::Damaged), 3);
        assert_eq!(eq.quantity(BucketStatus::Reserved), 0);
        assert_eq!(eq.quantity(BucketStatus::UnderMaintenance), 2);
        assert_eq!(eq.stock_on_loan(), 0);
        assert_eq!(eq.total(), 5);
    }

    #[test]
    fn stock_on_loan_cannot_be_transferred_out_of_reserved() {
        let mut eq = bucket_equipment(4);
        { let cmd = transfer(&eq, BucketStatus::Available, BucketStatus::Reserved, 1); execute(&mut eq, &cmd) }.unwrap();
        { let cmd = reserve_stock(&eq, AggregateId::new(), 2); execute(&mut eq, &cmd) }.unwrap();

        let err = { let cmd = transfer(&eq, BucketStatus::Reserved, BucketStatus::Lost, 2); execute(&mut eq, &cmd) }.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        { let cmd = transfer(&eq, BucketStatus::Reserved, BucketStatus::Available, 1); execute(&mut eq, &cmd) }.unwrap();
        assert_eq!(eq.quantity(BucketStatus::Reserved), 2);
    }

    #[test]
    fn reserve_stock_needs_available_quantity_and_one_loan_per_request() {
        let mut eq = bucket_equipment(3);
        let request_id = AggregateId::new();

        let err = eq.handle(&reserve_stock(&eq, request_id, 4)).unwrap_err();
        assert_eq!(err, DomainError::insufficient(4, 3));

        { let cmd = reserve_stock(&eq, request_id, 1); execute(&mut eq, &cmd) }.unwrap();
        let err = eq.handle(&reserve_stock(&eq, request_id, 1)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn releasing_stock_never_held_is_an_error() {
        let eq = bucket_equipment(3);
        let err = eq
            .handle(&release_stock(&eq, AggregateId::new(), ReturnCondition::Lost))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn reinstate_puts_released_units_back_on_the_request() {
        let mut eq = serialized_equipment(&["A1", "A2"]);
        let equipment_id = eq.id_typed();
        let request_id = AggregateId::new();
        let a1 = unit_by_serial(&eq, "A1");
        execute(
            &mut eq,
            &EquipmentCommand::ReserveUnits(ReserveUnits {
                equipment_id,
                request_id,
                quantity: 1,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        execute(
            &mut eq,
            &EquipmentCommand::ReleaseUnits(ReleaseUnits {
                equipment_id,
                request_id,
                unit_ids: vec![a1],
                condition: ReturnCondition::Lost,
                notes: None,
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        execute(
            &mut eq,
            &EquipmentCommand::ReinstateUnits(ReinstateUnits {
                equipment_id,
                request_id,
                unit_ids: vec![a1],
                actor: admin(),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(eq.units_held_by(request_id), vec![a1]);
        assert_eq!(eq.unit(&a1).unwrap().status, UnitStatus::InRequest);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let eq = bucket_equipment(4);
        let before = eq.clone();
        let cmd = transfer(&eq, BucketStatus::Available, BucketStatus::Reserved, 2);
        let e1 = eq.handle(&cmd).unwrap();
        let e2 = eq.handle(&cmd).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(eq, before);
    }

    fn bucket_strategy() -> impl Strategy<Value = BucketStatus> {
        prop::sample::select(BucketStatus::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: total == Σ buckets after any sequence of transfers,
        /// accepted or rejected.
        #[test]
        fn bucket_sum_matches_total_after_transfers(
            initial in 0u32..50,
            moves in prop::collection::vec((bucket_strategy(), bucket_strategy(), -3i64..20), 0..40)
        ) {
            let mut eq = bucket_equipment(initial);
            for (from, to, quantity) in moves {
                let cmd = transfer(&eq, from, to, quantity);
                let _ = execute(&mut eq, &cmd);
                prop_assert_eq!(eq.breakdown().total(), initial);
                prop_assert_eq!(eq.total(), initial);
            }
        }

        /// Property: a unit is never bound to two assignments. Each step
        /// either assigns a subset of units to a fresh assignment or
        /// unassigns everything one assignment holds.
        #[test]
        fn no_unit_is_ever_assigned_twice(
            steps in prop::collection::vec((any::<bool>(), prop::collection::vec(0usize..6, 1..4)), 1..30)
        ) {
            let mut eq = serialized_equipment(&["U0", "U1", "U2", "U3", "U4", "U5"]);
            let units: Vec<UnitId> = eq.units().map(|u| u.id).collect();
            let mut live: Vec<(AssignmentId, Vec<UnitId>)> = Vec::new();

            for (assign, picks) in steps {
                if assign || live.is_empty() {
                    let mut unit_ids: Vec<UnitId> = picks.iter().map(|i| units[*i]).collect();
                    unit_ids.sort();
                    unit_ids.dedup();
                    let assignment_id = AssignmentId::generate();
                    let cmd = EquipmentCommand::AssignUnits(AssignUnits {
                        equipment_id: eq.id_typed(),
                        assignment_id,
                        unit_ids: unit_ids.clone(),
                        actor: admin(),
                        occurred_at: test_time(),
                    });
                    if execute(&mut eq, &cmd).is_ok() {
                        live.push((assignment_id, unit_ids));
                    }
                } else {
                    let (assignment_id, unit_ids) = live.remove(picks[0] % live.len());
                    let cmd = EquipmentCommand::UnassignUnits(UnassignUnits {
                        equipment_id: eq.id_typed(),
                        assignment_id,
                        unit_ids,
                        reason: "rotation".to_string(),
                        actor: admin(),
                        occurred_at: test_time(),
                    });
                    prop_assert!(execute(&mut eq, &cmd).is_ok());
                }

                for unit in eq.units() {
                    let holders = live.iter().filter(|(_, ids)| ids.contains(&unit.id)).count();
                    prop_assert!(holders <= 1);
                    prop_assert_eq!(holders == 1, unit.status == UnitStatus::Assigned);
                    prop_assert_eq!(
                        unit.assignment,
                        live.iter().find(|(_, ids)| ids.contains(&unit.id)).map(|(id, _)| *id)
                    );
                }
            }
        }
    }
}
