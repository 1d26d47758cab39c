use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use campusres_core::{Aggregate, AggregateRoot, DomainError, UserId, typed_id};
use campusres_events::Event;

use crate::equipment::EquipmentId;
use crate::unit::UnitId;

typed_id!(
    /// Staff/room assignment identifier.
    AssignmentId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentType {
    StaffAssignment,
    RoomAssignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentPeriod {
    Permanent,
    Temporary,
}

/// A unit bound by an assignment, with the equipment that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignedUnit {
    pub equipment_id: EquipmentId,
    pub unit_id: UnitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRemoval {
    pub reason: String,
    pub removed_by: UserId,
    pub removed_at: DateTime<Utc>,
}

/// Aggregate root: Assignment.
///
/// A non-time-boxed binding of units to a staff member or a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    id: AssignmentId,
    kind: AssignmentType,
    period: AssignmentPeriod,
    assigned_to: String,
    created_by: Option<UserId>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    units: Vec<AssignedUnit>,
    removal: Option<AssignmentRemoval>,
    version: u64,
    created: bool,
}

impl Assignment {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: AssignmentId) -> Self {
        Self {
            id,
            kind: AssignmentType::StaffAssignment,
            period: AssignmentPeriod::Permanent,
            assigned_to: String::new(),
            created_by: None,
            starts_at: None,
            ends_at: None,
            units: Vec::new(),
            removal: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AssignmentId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn kind(&self) -> AssignmentType {
        self.kind
    }

    pub fn period(&self) -> AssignmentPeriod {
        self.period
    }

    pub fn assigned_to(&self) -> &str {
        &self.assigned_to
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.starts_at
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at
    }

    pub fn units(&self) -> &[AssignedUnit] {
        &self.units
    }

    pub fn removal(&self) -> Option<&AssignmentRemoval> {
        self.removal.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.created && self.removal.is_none()
    }
}

impl AggregateRoot for Assignment {
    type Id = AssignmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateAssignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAssignment {
    pub assignment_id: AssignmentId,
    pub kind: AssignmentType,
    pub period: AssignmentPeriod,
    pub assigned_to: String,
    pub units: Vec<AssignedUnit>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveAssignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAssignment {
    pub assignment_id: AssignmentId,
    pub reason: String,
    pub removed_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentCommand {
    CreateAssignment(CreateAssignment),
    RemoveAssignment(RemoveAssignment),
}

/// Event: AssignmentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentCreated {
    pub assignment_id: AssignmentId,
    pub kind: AssignmentType,
    pub period: AssignmentPeriod,
    pub assigned_to: String,
    pub units: Vec<AssignedUnit>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AssignmentRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRemoved {
    pub assignment_id: AssignmentId,
    pub reason: String,
    pub removed_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentEvent {
    AssignmentCreated(AssignmentCreated),
    AssignmentRemoved(AssignmentRemoved),
}

impl Event for AssignmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AssignmentEvent::AssignmentCreated(_) => "inventory.assignment.created",
            AssignmentEvent::AssignmentRemoved(_) => "inventory.assignment.removed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AssignmentEvent::AssignmentCreated(e) => e.occurred_at,
            AssignmentEvent::AssignmentRemoved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Assignment {
    type Command = AssignmentCommand;
    type Event = AssignmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AssignmentEvent::AssignmentCreated(e) => {
                self.id = e.assignment_id;
                self.kind = e.kind;
                self.period = e.period;
                self.assigned_to = e.assigned_to.clone();
                self.created_by = Some(e.created_by);
                self.starts_at = Some(e.starts_at);
                self.ends_at = e.ends_at;
                self.units = e.units.clone();
                self.removal = None;
                self.created = true;
            }
            AssignmentEvent::AssignmentRemoved(e) => {
                self.removal = Some(AssignmentRemoval {
                    reason: e.reason.clone(),
                    removed_by: e.removed_by,
                    removed_at: e.occurred_at,
                });
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AssignmentCommand::CreateAssignment(cmd) => self.handle_create(cmd),
            AssignmentCommand::RemoveAssignment(cmd) => self.handle_remove(cmd),
        }
    }
}

impl Assignment {
    fn handle_create(&self, cmd: &CreateAssignment) -> Result<Vec<AssignmentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("assignment already exists"));
        }
        if cmd.units.is_empty() {
            return Err(DomainError::validation("at least one unit is required"));
        }
        let mut seen = HashSet::with_capacity(cmd.units.len());
        if !cmd.units.iter().all(|u| seen.insert(u.unit_id)) {
            return Err(DomainError::validation("duplicate unit ids"));
        }
        if cmd.assigned_to.trim().is_empty() {
            return Err(DomainError::validation("assigned_to cannot be empty"));
        }
        match (cmd.period, cmd.ends_at) {
            (AssignmentPeriod::Temporary, None) => {
                return Err(DomainError::validation("temporary assignments need an end date"));
            }
            (AssignmentPeriod::Temporary, Some(end)) if end <= cmd.starts_at => {
                return Err(DomainError::validation("end date must be after start date"));
            }
            (AssignmentPeriod::Permanent, Some(_)) => {
                return Err(DomainError::validation("permanent assignments have no end date"));
            }
            _ => {}
        }

        Ok(vec![AssignmentEvent::AssignmentCreated(AssignmentCreated {
            assignment_id: cmd.assignment_id,
            kind: cmd.kind,
            period: cmd.period,
            assigned_to: cmd.assigned_to.trim().to_string(),
            units: cmd.units.clone(),
            starts_at: cmd.starts_at,
            ends_at: cmd.ends_at,
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove(&self, cmd: &RemoveAssignment) -> Result<Vec<AssignmentEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != cmd.assignment_id {
            return Err(DomainError::invariant("assignment_id mismatch"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("reason is required"));
        }
        if self.removal.is_some() {
            return Err(DomainError::invalid_state("REMOVED", "assignment already removed"));
        }

        Ok(vec![AssignmentEvent::AssignmentRemoved(AssignmentRemoved {
            assignment_id: cmd.assignment_id,
            reason: cmd.reason.trim().to_string(),
            removed_by: cmd.removed_by,
            occurred_at: cmd.occurred_at,
        })])
    }
}
