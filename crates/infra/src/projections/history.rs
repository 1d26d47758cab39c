//! Append-only audit trail of status transitions.
//!
//! Records are derived from committed events only, so a transition that
//! failed never leaves a trace here.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use campusres_core::UserId;
use campusres_events::Event;
use campusres_inventory::{
    AssignmentEvent, AssignmentId, BucketStatus, EquipmentEvent, EquipmentId, UnitId, UnitStatus,
};
use campusres_requests::{RequestEvent, RequestId};

/// What a history record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistorySubject {
    Unit(UnitId),
    /// A bucket move on quantity-tracked equipment.
    Equipment(EquipmentId),
    Request(RequestId),
    Assignment(AssignmentId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    /// Event the record was derived from.
    pub event_id: Uuid,
    pub subject: HistorySubject,
    /// Owning equipment, when the subject belongs to one.
    pub equipment_id: Option<EquipmentId>,
    /// `None` for creation.
    pub from_status: Option<String>,
    pub to_status: String,
    pub quantity: u32,
    pub actor: UserId,
    pub at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Default)]
pub struct HistoryLedger {
    records: RwLock<Vec<HistoryRecord>>,
    /// Equipment and quantity of every submitted request.
    requests: RwLock<HashMap<RequestId, (EquipmentId, u32)>>,
}

struct Draft<'a> {
    subject: HistorySubject,
    equipment_id: Option<EquipmentId>,
    from: Option<&'a str>,
    to: &'a str,
    quantity: u32,
    notes: Option<&'a str>,
}

impl HistoryLedger {
    fn push_all<'a>(
        &self,
        event_id: Uuid,
        actor: UserId,
        at: DateTime<Utc>,
        drafts: impl IntoIterator<Item = Draft<'a>>,
    ) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        for d in drafts {
            records.push(HistoryRecord {
                event_id,
                subject: d.subject,
                equipment_id: d.equipment_id,
                from_status: d.from.map(str::to_string),
                to_status: d.to.to_string(),
                quantity: d.quantity,
                actor,
                at,
                notes: d.notes.map(str::to_string),
            });
        }
    }

    pub(crate) fn record_equipment(&self, event_id: Uuid, event: &EquipmentEvent) {
        let equipment_id = Some(event.equipment_id());
        let bucket = |from: Option<BucketStatus>, to: BucketStatus, quantity: u32, notes: Option<&'static str>| Draft {
            subject: HistorySubject::Equipment(event.equipment_id()),
            equipment_id,
            from: from.map(|s| s.as_str()),
            to: to.as_str(),
            quantity,
            notes,
        };
        let unit = |unit_id: UnitId, from: Option<UnitStatus>, to: UnitStatus| Draft {
            subject: HistorySubject::Unit(unit_id),
            equipment_id,
            from: from.map(|s| s.as_str()),
            to: to.as_str(),
            quantity: 1,
            notes: None,
        };

        let drafts: Vec<Draft<'_>> = match event {
            EquipmentEvent::EquipmentRegistered(e) if !e.tracks_serialized_units => {
                vec![bucket(None, BucketStatus::Available, e.initial_quantity, None)]
            }
            EquipmentEvent::EquipmentRegistered(_) | EquipmentEvent::EquipmentDetailsUpdated(_) => {
                vec![]
            }
            EquipmentEvent::StockReceived(e) => {
                vec![bucket(None, BucketStatus::Available, e.quantity, Some("stock received"))]
            }
            EquipmentEvent::UnitAdded(e) => vec![unit(e.unit_id, None, UnitStatus::Available)],
            EquipmentEvent::StatusTransferred(e) => vec![Draft {
                notes: e.notes.as_deref(),
                ..bucket(Some(e.from), e.to, e.quantity, None)
            }],
            EquipmentEvent::UnitsAssigned(e) => e
                .unit_ids
                .iter()
                .map(|id| unit(*id, Some(UnitStatus::Available), UnitStatus::Assigned))
                .collect(),
            EquipmentEvent::UnitsUnassigned(e) => e
                .unit_ids
                .iter()
                .map(|id| Draft {
                    notes: Some(e.reason.as_str()),
                    ..unit(*id, Some(UnitStatus::Assigned), UnitStatus::Available)
                })
                .collect(),
            EquipmentEvent::UnitsReserved(e) => e
                .unit_ids
                .iter()
                .map(|id| unit(*id, Some(UnitStatus::Available), UnitStatus::InRequest))
                .collect(),
            EquipmentEvent::UnitsReleased(e) => e
                .releases
                .iter()
                .map(|r| Draft {
                    notes: e.notes.as_deref(),
                    ..unit(r.unit_id, Some(UnitStatus::InRequest), r.to)
                })
                .collect(),
            EquipmentEvent::StockReserved(e) => {
                vec![bucket(Some(e.from), BucketStatus::Reserved, e.quantity, None)]
            }
            EquipmentEvent::StockReleased(e) => vec![Draft {
                notes: e.notes.as_deref(),
                ..bucket(Some(BucketStatus::Reserved), e.to, e.quantity, None)
            }],
            EquipmentEvent::UnitStatusChanged(e) => vec![Draft {
                notes: e.notes.as_deref(),
                ..unit(e.unit_id, Some(e.from), e.to)
            }],
        };

        self.push_all(event_id, event.actor(), event.occurred_at(), drafts);
    }

    pub(crate) fn record_assignment(&self, event_id: Uuid, event: &AssignmentEvent) {
        match event {
            AssignmentEvent::AssignmentCreated(e) => self.push_all(
                event_id,
                e.created_by,
                e.occurred_at,
                [Draft {
                    subject: HistorySubject::Assignment(e.assignment_id),
                    equipment_id: None,
                    from: None,
                    to: "ACTIVE",
                    quantity: e.units.len() as u32,
                    notes: Some(e.assigned_to.as_str()),
                }],
            ),
            AssignmentEvent::AssignmentRemoved(e) => self.push_all(
                event_id,
                e.removed_by,
                e.occurred_at,
                [Draft {
                    subject: HistorySubject::Assignment(e.assignment_id),
                    equipment_id: None,
                    from: Some("ACTIVE"),
                    to: "REMOVED",
                    quantity: 0,
                    notes: Some(e.reason.as_str()),
                }],
            ),
        }
    }

    pub(crate) fn record_request(&self, event_id: Uuid, event: &RequestEvent) {
        let Some((from, to)) = event.status_change() else {
            return;
        };
        if let RequestEvent::Submitted(e) = event {
            self.requests
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(e.request_id, (e.equipment_id, e.quantity));
        }
        let notes = match event {
            RequestEvent::Submitted(e) => Some(e.reason.as_str()),
            RequestEvent::Rejected(e) => Some(e.reason.as_str()),
            RequestEvent::HodApproved(e) => e.reason.as_deref(),
            RequestEvent::HodRejected(e) => Some(e.reason.as_str()),
            RequestEvent::Returned(e) => e.notes.as_deref(),
            _ => None,
        };
        let known = self
            .requests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.request_id())
            .copied();
        let (equipment_id, quantity) = match known {
            Some((equipment_id, quantity)) => (Some(equipment_id), quantity),
            None => (None, 0),
        };

        self.push_all(
            event_id,
            event.actor(),
            event.occurred_at(),
            [Draft {
                subject: HistorySubject::Request(event.request_id()),
                equipment_id,
                from: from.map(|s| s.as_str()),
                to: to.as_str(),
                quantity,
                notes,
            }],
        );
    }

    pub(crate) fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn select(&self, pred: impl Fn(&HistoryRecord) -> bool) -> Vec<HistoryRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<HistoryRecord> = records.iter().filter(|r| pred(r)).cloned().collect();
        // Stable: records of one event keep their order.
        out.sort_by_key(|r| r.at);
        out
    }

    pub fn all(&self) -> Vec<HistoryRecord> {
        self.select(|_| true)
    }

    pub fn for_subject(&self, subject: &HistorySubject) -> Vec<HistoryRecord> {
        self.select(|r| &r.subject == subject)
    }

    /// Records for an equipment entry and all of its units.
    pub fn for_equipment(&self, equipment_id: EquipmentId) -> Vec<HistoryRecord> {
        self.select(|r| r.equipment_id == Some(equipment_id))
    }

    /// Records with `from <= at < to`.
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<HistoryRecord> {
        self.select(|r| r.at >= from && r.at < to)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
