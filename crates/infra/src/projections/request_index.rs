use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use campusres_core::{TimeWindow, UserId};
use campusres_inventory::EquipmentId;
use campusres_requests::{RequestEvent, RequestId, RequestStatus, RequesterRole};

/// Queryable summary of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestView {
    pub request_id: RequestId,
    pub equipment_id: EquipmentId,
    pub requester: UserId,
    pub requester_role: RequesterRole,
    pub quantity: u32,
    /// Stored status (IN_USE only once materialized).
    pub status: RequestStatus,
    pub window: TimeWindow,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestView {
    pub fn commits_capacity_over(&self, window: &TimeWindow) -> bool {
        self.status.commits_capacity() && self.window.overlaps(window)
    }
}

/// Request read model used for capacity sums and listings.
#[derive(Debug, Default)]
pub struct RequestIndex {
    by_id: RwLock<HashMap<RequestId, RequestView>>,
}

impl RequestIndex {
    pub(crate) fn apply(&self, event: &RequestEvent) {
        let mut by_id = self.by_id.write().unwrap_or_else(PoisonError::into_inner);

        if let RequestEvent::Submitted(e) = event {
            by_id.insert(
                e.request_id,
                RequestView {
                    request_id: e.request_id,
                    equipment_id: e.equipment_id,
                    requester: e.requester,
                    requester_role: e.requester_role,
                    quantity: e.quantity,
                    status: RequestStatus::Pending,
                    window: e.window,
                    submitted_at: e.occurred_at,
                    updated_at: e.occurred_at,
                },
            );
            return;
        }

        let Some(view) = by_id.get_mut(&event.request_id()) else {
            return;
        };
        if let Some((_, to)) = event.status_change() {
            view.status = to;
        }
        if let RequestEvent::ExtensionApproved(e) = event {
            view.window = e.new_window;
        }
        view.updated_at = campusres_events::Event::occurred_at(event);
    }

    pub(crate) fn clear(&self) {
        self.by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn select(&self, pred: impl Fn(&RequestView) -> bool) -> Vec<RequestView> {
        let by_id = self.by_id.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<RequestView> = by_id.values().filter(|v| pred(v)).cloned().collect();
        out.sort_by_key(|v| (v.window.start(), v.request_id));
        out
    }

    pub fn get(&self, request_id: &RequestId) -> Option<RequestView> {
        self.by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_id)
            .cloned()
    }

    /// Requests on `equipment_id` holding capacity over a window overlapping
    /// `window`, optionally ignoring one request.
    pub fn committed_overlapping(
        &self,
        equipment_id: EquipmentId,
        window: &TimeWindow,
        exclude: Option<RequestId>,
    ) -> Vec<RequestView> {
        self.select(|v| {
            v.equipment_id == equipment_id
                && Some(v.request_id) != exclude
                && v.commits_capacity_over(window)
        })
    }

    pub fn by_status(&self, status: RequestStatus) -> Vec<RequestView> {
        self.select(|v| v.status == status)
    }

    pub fn for_requester(&self, requester: UserId) -> Vec<RequestView> {
        self.select(|v| v.requester == requester)
    }

    pub fn for_equipment(&self, equipment_id: EquipmentId) -> Vec<RequestView> {
        self.select(|v| v.equipment_id == equipment_id)
    }

    /// Approved requests whose window has started but that are not yet
    /// recorded as IN_USE.
    pub fn started_unmarked(&self, now: DateTime<Utc>) -> Vec<RequestId> {
        self.select(|v| {
            matches!(v.status, RequestStatus::Approved | RequestStatus::HodApproved)
                && v.window.has_started(now)
        })
        .into_iter()
        .map(|v| v.request_id)
        .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campusres_requests::{RequestApproved, RequestSubmitted};
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, h, 0, 0).unwrap()
    }

    fn submit(index: &RequestIndex, equipment_id: EquipmentId, start: u32, end: u32) -> RequestId {
        let request_id = RequestId::generate();
        index.apply(&RequestEvent::Submitted(RequestSubmitted {
            request_id,
            requester: UserId::new(),
            requester_role: RequesterRole::Professor,
            equipment_id,
            quantity: 2,
            course_id: None,
            lab_class_id: None,
            reason: "Lab".into(),
            window: TimeWindow::new(at(start), at(end)).unwrap(),
            occurred_at: at(6),
        }));
        request_id
    }

    fn approve(index: &RequestIndex, request_id: RequestId) {
        index.apply(&RequestEvent::Approved(RequestApproved {
            request_id,
            from: RequestStatus::Pending,
            approver: UserId::new(),
            reserved_units: vec![],
            occurred_at: at(7),
        }));
    }

    #[test]
    fn only_committed_overlapping_requests_count() {
        let index = RequestIndex::default();
        let eq = EquipmentId::generate();
        let a = submit(&index, eq, 10, 12);
        let b = submit(&index, eq, 12, 13);
        let _pending = submit(&index, eq, 10, 12);
        approve(&index, a);
        approve(&index, b);

        let query = TimeWindow::new(at(11), at(12)).unwrap();
        let hits = index.committed_overlapping(eq, &query, None);
        assert_eq!(hits.iter().map(|v| v.request_id).collect::<Vec<_>>(), vec![a]);
        assert!(index.committed_overlapping(eq, &query, Some(a)).is_empty());
        assert!(
            index
                .committed_overlapping(EquipmentId::generate(), &query, None)
                .is_empty()
        );
    }

    #[test]
    fn started_unmarked_lists_approved_past_start() {
        let index = RequestIndex::default();
        let eq = EquipmentId::generate();
        let a = submit(&index, eq, 10, 12);
        let _b = submit(&index, eq, 10, 12);
        approve(&index, a);
        assert!(index.started_unmarked(at(9)).is_empty());
        assert_eq!(index.started_unmarked(at(10)), vec![a]);
        assert_eq!(index.by_status(RequestStatus::Pending).len(), 1);
        assert_eq!(index.for_equipment(eq).len(), 2);
    }
}
