use serde::{Deserialize, Serialize};

use campusres_core::{AggregateId, Entity, typed_id};

use crate::assignment::AssignmentId;

typed_id!(
    /// Serialized unit identifier (unique across the catalog).
    UnitId
);

/// Per-unit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Available,
    Assigned,
    InRequest,
    Maintenance,
    Damaged,
    Lost,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "AVAILABLE",
            UnitStatus::Assigned => "ASSIGNED",
            UnitStatus::InRequest => "IN_REQUEST",
            UnitStatus::Maintenance => "MAINTENANCE",
            UnitStatus::Damaged => "DAMAGED",
            UnitStatus::Lost => "LOST",
        }
    }

    /// Statuses an admin may set directly. `ASSIGNED` and `IN_REQUEST` are
    /// owned by assignments and requests.
    pub fn is_admin_settable(&self) -> bool {
        !matches!(self, UnitStatus::Assigned | UnitStatus::InRequest)
    }

    /// Units that can serve a reservation window (free now, or out on a
    /// request that will come back).
    pub fn is_serviceable(&self) -> bool {
        matches!(self, UnitStatus::Available | UnitStatus::InRequest)
    }
}

impl core::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition reported when equipment comes back from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCondition {
    Good,
    Damaged,
    Lost,
}

impl ReturnCondition {
    /// Unit status a returned unit lands in.
    pub fn unit_status(&self) -> UnitStatus {
        match self {
            ReturnCondition::Good => UnitStatus::Available,
            ReturnCondition::Damaged => UnitStatus::Damaged,
            ReturnCondition::Lost => UnitStatus::Lost,
        }
    }
}

/// One serialized, individually tracked physical item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentUnit {
    pub id: UnitId,
    pub serial_number: String,
    pub condition: String,
    pub status: UnitStatus,
    pub assignment: Option<AssignmentId>,
    /// Request currently holding the unit (`IN_REQUEST`).
    pub request: Option<AggregateId>,
}

impl EquipmentUnit {
    pub fn new(id: UnitId, serial_number: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            id,
            serial_number: serial_number.into(),
            condition: condition.into(),
            status: UnitStatus::Available,
            assignment: None,
            request: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == UnitStatus::Available
    }
}

impl Entity for EquipmentUnit {
    type Id = UnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_condition_maps_to_unit_status() {
        assert_eq!(ReturnCondition::Good.unit_status(), UnitStatus::Available);
        assert_eq!(ReturnCondition::Damaged.unit_status(), UnitStatus::Damaged);
        assert_eq!(ReturnCondition::Lost.unit_status(), UnitStatus::Lost);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&UnitStatus::InRequest).unwrap();
        assert_eq!(json, "\"IN_REQUEST\"");
    }
}
