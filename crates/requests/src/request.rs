use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use campusres_core::{
    Aggregate, AggregateRoot, DomainError, DomainResult, TimeWindow, UserId, typed_id,
};
use campusres_events::Event;
use campusres_inventory::{EquipmentId, ReturnCondition, UnitId};

use crate::extension::{Extension, ExtensionBudget, ExtensionPolicy, ExtensionStatus};

typed_id!(
    /// Equipment request identifier.
    RequestId
);

/// Request status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    HodApproved,
    HodRejected,
    InUse,
    Returned,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Escalated => "ESCALATED",
            RequestStatus::HodApproved => "HOD_APPROVED",
            RequestStatus::HodRejected => "HOD_REJECTED",
            RequestStatus::InUse => "IN_USE",
            RequestStatus::Returned => "RETURNED",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    /// Statuses whose window counts against equipment capacity.
    pub fn commits_capacity(&self) -> bool {
        matches!(
            self,
            RequestStatus::Approved | RequestStatus::HodApproved | RequestStatus::InUse
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::HodRejected
        )
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequesterRole {
    Professor,
    Student,
    EquipmentAdmin,
    Hod,
}

/// Return sub-record, set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub condition: ReturnCondition,
    pub notes: Option<String>,
    pub received_by: UserId,
    pub returned_at: DateTime<Utc>,
}

/// Aggregate root: EquipmentRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentRequest {
    id: RequestId,
    requester: Option<UserId>,
    requester_role: RequesterRole,
    equipment_id: Option<EquipmentId>,
    quantity: u32,
    course_id: Option<String>,
    lab_class_id: Option<String>,
    reason: String,
    window: Option<TimeWindow>,
    status: RequestStatus,
    approved_by: Option<UserId>,
    rejection_reason: Option<String>,
    admin_suggestion: Option<String>,
    suggestion_acknowledged: Option<bool>,
    suggestion_response_reason: Option<String>,
    escalated_to_hod: bool,
    hod_reason: Option<String>,
    reserved_units: Vec<UnitId>,
    extension: Option<Extension>,
    extension_budget: Option<ExtensionBudget>,
    return_record: Option<ReturnRecord>,
    submitted_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl EquipmentRequest {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: RequestId) -> Self {
        Self {
            id,
            requester: None,
            requester_role: RequesterRole::Professor,
            equipment_id: None,
            quantity: 0,
            course_id: None,
            lab_class_id: None,
            reason: String::new(),
            window: None,
            status: RequestStatus::Pending,
            approved_by: None,
            rejection_reason: None,
            admin_suggestion: None,
            suggestion_acknowledged: None,
            suggestion_response_reason: None,
            escalated_to_hod: false,
            hod_reason: None,
            reserved_units: Vec::new(),
            extension: None,
            extension_budget: None,
            return_record: None,
            submitted_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RequestId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester
    }

    pub fn requester_role(&self) -> RequesterRole {
        self.requester_role
    }

    pub fn equipment_id(&self) -> Option<EquipmentId> {
        self.equipment_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn course_id(&self) -> Option<&str> {
        self.course_id.as_deref()
    }

    pub fn lab_class_id(&self) -> Option<&str> {
        self.lab_class_id.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn window(&self) -> Option<TimeWindow> {
        self.window
    }

    /// Stored status. See [`EquipmentRequest::effective_status`] for the
    /// status rules are evaluated against.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn admin_suggestion(&self) -> Option<&str> {
        self.admin_suggestion.as_deref()
    }

    /// `None` until the requester responds.
    pub fn suggestion_acknowledged(&self) -> Option<bool> {
        self.suggestion_acknowledged
    }

    pub fn suggestion_response_reason(&self) -> Option<&str> {
        self.suggestion_response_reason.as_deref()
    }

    pub fn escalated_to_hod(&self) -> bool {
        self.escalated_to_hod
    }

    pub fn hod_reason(&self) -> Option<&str> {
        self.hod_reason.as_deref()
    }

    pub fn reserved_units(&self) -> &[UnitId] {
        &self.reserved_units
    }

    pub fn extension(&self) -> Option<&Extension> {
        self.extension.as_ref()
    }

    pub fn return_record(&self) -> Option<&ReturnRecord> {
        self.return_record.as_ref()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Extension minutes still grantable on the UTC day of `now`.
    pub fn remaining_extension_minutes(&self, now: DateTime<Utc>, policy: &ExtensionPolicy) -> u32 {
        ExtensionBudget::remaining_on(self.extension_budget.as_ref(), now.date_naive(), policy)
    }

    /// Status with IN_USE derived: an approved request whose window has
    /// started is in use whether or not that was recorded explicitly.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RequestStatus {
        match (self.status, self.window) {
            (RequestStatus::Approved | RequestStatus::HodApproved, Some(w)) if w.has_started(now) => {
                RequestStatus::InUse
            }
            (status, _) => status,
        }
    }

    /// True when this request holds capacity over a window overlapping `window`.
    pub fn commits_capacity_over(&self, window: &TimeWindow) -> bool {
        self.status.commits_capacity() && self.window.is_some_and(|w| w.overlaps(window))
    }

    fn ends_after(&self, now: DateTime<Utc>) -> bool {
        self.window.is_some_and(|w| !w.has_ended(now))
    }

    fn starts_after(&self, now: DateTime<Utc>) -> bool {
        self.window.is_some_and(|w| !w.has_started(now))
    }

    // Transition guards. Single-item and bulk paths both go through these.

    /// PENDING, or REJECTED while the window has not ended (reprocess).
    pub fn can_approve(&self, now: DateTime<Utc>) -> bool {
        self.created
            && match self.status {
                RequestStatus::Pending => true,
                RequestStatus::Rejected => self.ends_after(now),
                _ => false,
            }
    }

    /// PENDING or APPROVED (not yet in use) while the window has not ended.
    pub fn can_reject(&self, now: DateTime<Utc>) -> bool {
        self.created
            && matches!(
                self.effective_status(now),
                RequestStatus::Pending | RequestStatus::Approved
            )
            && self.ends_after(now)
    }

    pub fn can_escalate(&self, now: DateTime<Utc>) -> bool {
        self.created && self.status == RequestStatus::Rejected && self.ends_after(now)
    }

    pub fn can_hod_review(&self) -> bool {
        self.created && self.status == RequestStatus::Escalated
    }

    /// Open while a suggestion awaits its first response and the request has
    /// not been returned or closed.
    pub fn can_respond_to_suggestion(&self) -> bool {
        self.created
            && self.admin_suggestion.is_some()
            && self.suggestion_acknowledged.is_none()
            && !matches!(
                self.status,
                RequestStatus::HodRejected
                    | RequestStatus::Returned
                    | RequestStatus::Completed
                    | RequestStatus::Cancelled
            )
    }

    pub fn can_request_extension(&self, now: DateTime<Utc>) -> bool {
        self.created
            && matches!(
                self.effective_status(now),
                RequestStatus::Approved | RequestStatus::InUse
            )
            && self
                .extension
                .as_ref()
                .is_none_or(|e| e.status == ExtensionStatus::Rejected)
    }

    pub fn can_handle_extension(&self, now: DateTime<Utc>) -> bool {
        self.created
            && self.extension.as_ref().is_some_and(Extension::is_pending)
            && matches!(
                self.effective_status(now),
                RequestStatus::Approved | RequestStatus::HodApproved | RequestStatus::InUse
            )
    }

    pub fn can_mark_in_use(&self) -> bool {
        self.created
            && matches!(
                self.status,
                RequestStatus::Approved | RequestStatus::HodApproved
            )
    }

    pub fn can_mark_returned(&self, now: DateTime<Utc>) -> bool {
        self.created
            && self.return_record.is_none()
            && matches!(
                self.effective_status(now),
                RequestStatus::Approved | RequestStatus::HodApproved | RequestStatus::InUse
            )
    }

    pub fn can_complete(&self) -> bool {
        self.created && self.status == RequestStatus::Returned
    }

    /// PENDING, APPROVED, REJECTED or ESCALATED before the window starts.
    pub fn can_cancel(&self, now: DateTime<Utc>) -> bool {
        self.created
            && matches!(
                self.status,
                RequestStatus::Pending
                    | RequestStatus::Approved
                    | RequestStatus::Rejected
                    | RequestStatus::Escalated
            )
            && self.starts_after(now)
    }
}

impl AggregateRoot for EquipmentRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: SubmitRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub request_id: RequestId,
    pub requester: UserId,
    pub requester_role: RequesterRole,
    pub equipment_id: EquipmentId,
    pub quantity: u32,
    pub course_id: Option<String>,
    pub lab_class_id: Option<String>,
    pub reason: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveRequest.
///
/// `reserved_units` are the units the approver's side already moved to
/// IN_REQUEST (empty for bucket-tracked equipment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub request_id: RequestId,
    pub approver: UserId,
    pub reserved_units: Vec<UnitId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    pub request_id: RequestId,
    pub reason: String,
    pub suggestion: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: EscalateRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalateRequest {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: HodReview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HodReview {
    pub request_id: RequestId,
    pub approved: bool,
    pub reason: Option<String>,
    pub reserved_units: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RespondToSuggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespondToSuggestion {
    pub request_id: RequestId,
    pub acknowledged: bool,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RequestExtension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestExtension {
    pub request_id: RequestId,
    pub hours: f64,
    pub reason: String,
    pub policy: ExtensionPolicy,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: HandleExtension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleExtension {
    pub request_id: RequestId,
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub policy: ExtensionPolicy,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInUse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInUse {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReturned {
    pub request_id: RequestId,
    pub condition: ReturnCondition,
    pub notes: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestCommand {
    Submit(SubmitRequest),
    Approve(ApproveRequest),
    Reject(RejectRequest),
    Escalate(EscalateRequest),
    HodReview(HodReview),
    RespondToSuggestion(RespondToSuggestion),
    RequestExtension(RequestExtension),
    HandleExtension(HandleExtension),
    MarkInUse(MarkInUse),
    MarkReturned(MarkReturned),
    Complete(CompleteRequest),
    Cancel(CancelRequest),
}

impl RequestCommand {
    pub fn request_id(&self) -> RequestId {
        match self {
            RequestCommand::Submit(c) => c.request_id,
            RequestCommand::Approve(c) => c.request_id,
            RequestCommand::Reject(c) => c.request_id,
            RequestCommand::Escalate(c) => c.request_id,
            RequestCommand::HodReview(c) => c.request_id,
            RequestCommand::RespondToSuggestion(c) => c.request_id,
            RequestCommand::RequestExtension(c) => c.request_id,
            RequestCommand::HandleExtension(c) => c.request_id,
            RequestCommand::MarkInUse(c) => c.request_id,
            RequestCommand::MarkReturned(c) => c.request_id,
            RequestCommand::Complete(c) => c.request_id,
            RequestCommand::Cancel(c) => c.request_id,
        }
    }
}

/// Event: RequestSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSubmitted {
    pub request_id: RequestId,
    pub requester: UserId,
    pub requester_role: RequesterRole,
    pub equipment_id: EquipmentId,
    pub quantity: u32,
    pub course_id: Option<String>,
    pub lab_class_id: Option<String>,
    pub reason: String,
    pub window: TimeWindow,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestApproved {
    pub request_id: RequestId,
    pub from: RequestStatus,
    pub approver: UserId,
    pub reserved_units: Vec<UnitId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub request_id: RequestId,
    pub from: RequestStatus,
    pub reason: String,
    pub suggestion: Option<String>,
    pub released_units: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestEscalated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEscalated {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: HodApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HodApproved {
    pub request_id: RequestId,
    pub reason: Option<String>,
    pub reserved_units: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: HodRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HodRejected {
    pub request_id: RequestId,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SuggestionResponded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionResponded {
    pub request_id: RequestId,
    pub acknowledged: bool,
    pub reason: Option<String>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ExtensionRequested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRequested {
    pub request_id: RequestId,
    pub minutes: u32,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ExtensionApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionApproved {
    pub request_id: RequestId,
    pub minutes: u32,
    pub new_window: TimeWindow,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ExtensionRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRejected {
    pub request_id: RequestId,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestMarkedInUse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMarkedInUse {
    pub request_id: RequestId,
    pub from: RequestStatus,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReturned {
    pub request_id: RequestId,
    pub from: RequestStatus,
    pub condition: ReturnCondition,
    pub notes: Option<String>,
    pub released_units: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCompleted {
    pub request_id: RequestId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub request_id: RequestId,
    pub from: RequestStatus,
    pub released_units: Vec<UnitId>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    Submitted(RequestSubmitted),
    Approved(RequestApproved),
    Rejected(RequestRejected),
    Escalated(RequestEscalated),
    HodApproved(HodApproved),
    HodRejected(HodRejected),
    SuggestionResponded(SuggestionResponded),
    ExtensionRequested(ExtensionRequested),
    ExtensionApproved(ExtensionApproved),
    ExtensionRejected(ExtensionRejected),
    MarkedInUse(RequestMarkedInUse),
    Returned(RequestReturned),
    Completed(RequestCompleted),
    Cancelled(RequestCancelled),
}

impl RequestEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            RequestEvent::Submitted(e) => e.request_id,
            RequestEvent::Approved(e) => e.request_id,
            RequestEvent::Rejected(e) => e.request_id,
            RequestEvent::Escalated(e) => e.request_id,
            RequestEvent::HodApproved(e) => e.request_id,
            RequestEvent::HodRejected(e) => e.request_id,
            RequestEvent::SuggestionResponded(e) => e.request_id,
            RequestEvent::ExtensionRequested(e) => e.request_id,
            RequestEvent::ExtensionApproved(e) => e.request_id,
            RequestEvent::ExtensionRejected(e) => e.request_id,
            RequestEvent::MarkedInUse(e) => e.request_id,
            RequestEvent::Returned(e) => e.request_id,
            RequestEvent::Completed(e) => e.request_id,
            RequestEvent::Cancelled(e) => e.request_id,
        }
    }

    pub fn actor(&self) -> UserId {
        match self {
            RequestEvent::Submitted(e) => e.requester,
            RequestEvent::Approved(e) => e.approver,
            RequestEvent::Rejected(e) => e.actor,
            RequestEvent::Escalated(e) => e.actor,
            RequestEvent::HodApproved(e) => e.actor,
            RequestEvent::HodRejected(e) => e.actor,
            RequestEvent::SuggestionResponded(e) => e.actor,
            RequestEvent::ExtensionRequested(e) => e.actor,
            RequestEvent::ExtensionApproved(e) => e.actor,
            RequestEvent::ExtensionRejected(e) => e.actor,
            RequestEvent::MarkedInUse(e) => e.actor,
            RequestEvent::Returned(e) => e.actor,
            RequestEvent::Completed(e) => e.actor,
            RequestEvent::Cancelled(e) => e.actor,
        }
    }

    /// `(from, to)` when the event moves the request between statuses.
    /// `from` is `None` on submission.
    pub fn status_change(&self) -> Option<(Option<RequestStatus>, RequestStatus)> {
        let change = match self {
            RequestEvent::Submitted(_) => (None, RequestStatus::Pending),
            RequestEvent::Approved(e) => (Some(e.from), RequestStatus::Approved),
            RequestEvent::Rejected(e) => (Some(e.from), RequestStatus::Rejected),
            RequestEvent::Escalated(_) => (Some(RequestStatus::Rejected), RequestStatus::Escalated),
            RequestEvent::HodApproved(_) => {
                (Some(RequestStatus::Escalated), RequestStatus::HodApproved)
            }
            RequestEvent::HodRejected(_) => {
                (Some(RequestStatus::Escalated), RequestStatus::HodRejected)
            }
            RequestEvent::MarkedInUse(e) => (Some(e.from), RequestStatus::InUse),
            RequestEvent::Returned(e) => (Some(e.from), RequestStatus::Returned),
            RequestEvent::Completed(_) => (Some(RequestStatus::Returned), RequestStatus::Completed),
            RequestEvent::Cancelled(e) => (Some(e.from), RequestStatus::Cancelled),
            RequestEvent::SuggestionResponded(_)
            | RequestEvent::ExtensionRequested(_)
            | RequestEvent::ExtensionApproved(_)
            | RequestEvent::ExtensionRejected(_) => return None,
        };
        Some(change)
    }
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::Submitted(_) => "requests.request.submitted",
            RequestEvent::Approved(_) => "requests.request.approved",
            RequestEvent::Rejected(_) => "requests.request.rejected",
            RequestEvent::Escalated(_) => "requests.request.escalated",
            RequestEvent::HodApproved(_) => "requests.request.hod_approved",
            RequestEvent::HodRejected(_) => "requests.request.hod_rejected",
            RequestEvent::SuggestionResponded(_) => "requests.request.suggestion_responded",
            RequestEvent::ExtensionRequested(_) => "requests.request.extension_requested",
            RequestEvent::ExtensionApproved(_) => "requests.request.extension_approved",
            RequestEvent::ExtensionRejected(_) => "requests.request.extension_rejected",
            RequestEvent::MarkedInUse(_) => "requests.request.marked_in_use",
            RequestEvent::Returned(_) => "requests.request.returned",
            RequestEvent::Completed(_) => "requests.request.completed",
            RequestEvent::Cancelled(_) => "requests.request.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RequestEvent::Submitted(e) => e.occurred_at,
            RequestEvent::Approved(e) => e.occurred_at,
            RequestEvent::Rejected(e) => e.occurred_at,
            RequestEvent::Escalated(e) => e.occurred_at,
            RequestEvent::HodApproved(e) => e.occurred_at,
            RequestEvent::HodRejected(e) => e.occurred_at,
            RequestEvent::SuggestionResponded(e) => e.occurred_at,
            RequestEvent::ExtensionRequested(e) => e.occurred_at,
            RequestEvent::ExtensionApproved(e) => e.occurred_at,
            RequestEvent::ExtensionRejected(e) => e.occurred_at,
            RequestEvent::MarkedInUse(e) => e.occurred_at,
            RequestEvent::Returned(e) => e.occurred_at,
            RequestEvent::Completed(e) => e.occurred_at,
            RequestEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for EquipmentRequest {
    type Command = RequestCommand;
    type Event = RequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RequestEvent::Submitted(e) => {
                self.id = e.request_id;
                self.requester = Some(e.requester);
                self.requester_role = e.requester_role;
                self.equipment_id = Some(e.equipment_id);
                self.quantity = e.quantity;
                self.course_id = e.course_id.clone();
                self.lab_class_id = e.lab_class_id.clone();
                self.reason = e.reason.clone();
                self.window = Some(e.window);
                self.status = RequestStatus::Pending;
                self.submitted_at = Some(e.occurred_at);
                self.created = true;
            }
            RequestEvent::Approved(e) => {
                self.status = RequestStatus::Approved;
                self.approved_by = Some(e.approver);
                self.rejection_reason = None;
                self.reserved_units = e.reserved_units.clone();
            }
            RequestEvent::Rejected(e) => {
                self.status = RequestStatus::Rejected;
                self.rejection_reason = Some(e.reason.clone());
                if e.suggestion.is_some() {
                    // A new suggestion reopens the response.
                    self.admin_suggestion = e.suggestion.clone();
                    self.suggestion_acknowledged = None;
                    self.suggestion_response_reason = None;
                }
                self.reserved_units.clear();
            }
            RequestEvent::Escalated(_) => {
                self.status = RequestStatus::Escalated;
                self.escalated_to_hod = true;
            }
            RequestEvent::HodApproved(e) => {
                self.status = RequestStatus::HodApproved;
                self.approved_by = Some(e.actor);
                self.hod_reason = e.reason.clone();
                self.reserved_units = e.reserved_units.clone();
            }
            RequestEvent::HodRejected(e) => {
                self.status = RequestStatus::HodRejected;
                self.hod_reason = Some(e.reason.clone());
            }
            RequestEvent::SuggestionResponded(e) => {
                self.suggestion_acknowledged = Some(e.acknowledged);
                self.suggestion_response_reason = e.reason.clone();
            }
            RequestEvent::ExtensionRequested(e) => {
                self.extension = Some(Extension {
                    minutes: e.minutes,
                    reason: e.reason.clone(),
                    status: ExtensionStatus::Pending,
                    budget_day: e.occurred_at.date_naive(),
                    requested_at: e.occurred_at,
                    decided_at: None,
                    rejection_reason: None,
                });
            }
            RequestEvent::ExtensionApproved(e) => {
                self.window = Some(e.new_window);
                if let Some(ext) = self.extension.as_mut() {
                    ext.status = ExtensionStatus::Approved;
                    ext.decided_at = Some(e.occurred_at);
                    let day = ext.budget_day;
                    let used = match self.extension_budget {
                        Some(b) if b.day == day => b.used_minutes,
                        _ => 0,
                    };
                    self.extension_budget = Some(ExtensionBudget {
                        day,
                        used_minutes: used + e.minutes,
                    });
                }
            }
            RequestEvent::ExtensionRejected(e) => {
                if let Some(ext) = self.extension.as_mut() {
                    ext.status = ExtensionStatus::Rejected;
                    ext.decided_at = Some(e.occurred_at);
                    ext.rejection_reason = Some(e.reason.clone());
                }
            }
            RequestEvent::MarkedInUse(_) => {
                self.status = RequestStatus::InUse;
            }
            RequestEvent::Returned(e) => {
                self.status = RequestStatus::Returned;
                self.return_record = Some(ReturnRecord {
                    condition: e.condition,
                    notes: e.notes.clone(),
                    received_by: e.actor,
                    returned_at: e.occurred_at,
                });
                self.reserved_units.clear();
            }
            RequestEvent::Completed(_) => {
                self.status = RequestStatus::Completed;
            }
            RequestEvent::Cancelled(_) => {
                self.status = RequestStatus::Cancelled;
                self.reserved_units.clear();
            }
        }

        self.updated_at = Some(event.occurred_at());
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if !matches!(command, RequestCommand::Submit(_)) {
            self.ensure_exists(command.request_id())?;
        }
        match command {
            RequestCommand::Submit(cmd) => self.handle_submit(cmd),
            RequestCommand::Approve(cmd) => self.handle_approve(cmd),
            RequestCommand::Reject(cmd) => self.handle_reject(cmd),
            RequestCommand::Escalate(cmd) => self.handle_escalate(cmd),
            RequestCommand::HodReview(cmd) => self.handle_hod_review(cmd),
            RequestCommand::RespondToSuggestion(cmd) => self.handle_respond(cmd),
            RequestCommand::RequestExtension(cmd) => self.handle_request_extension(cmd),
            RequestCommand::HandleExtension(cmd) => self.handle_extension_decision(cmd),
            RequestCommand::MarkInUse(cmd) => self.handle_mark_in_use(cmd),
            RequestCommand::MarkReturned(cmd) => self.handle_mark_returned(cmd),
            RequestCommand::Complete(cmd) => self.handle_complete(cmd),
            RequestCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

fn required(value: &str, what: &str) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{what} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl EquipmentRequest {
    fn ensure_exists(&self, request_id: RequestId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != request_id {
            return Err(DomainError::invariant("request_id mismatch"));
        }
        Ok(())
    }

    fn illegal(&self, now: DateTime<Utc>, action: &str) -> DomainError {
        let status = self.effective_status(now);
        DomainError::invalid_state(status, format!("cannot {action} a request in status {status}"))
    }

    fn handle_submit(&self, cmd: &SubmitRequest) -> DomainResult<Vec<RequestEvent>> {
        if self.created {
            return Err(DomainError::conflict("request already exists"));
        }
        let window = TimeWindow::new(cmd.start, cmd.end)?;
        if window.has_started(cmd.occurred_at) {
            return Err(DomainError::validation("start time must be in the future"));
        }
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be at least 1"));
        }
        let reason = required(&cmd.reason, "reason")?;

        Ok(vec![RequestEvent::Submitted(RequestSubmitted {
            request_id: cmd.request_id,
            requester: cmd.requester,
            requester_role: cmd.requester_role,
            equipment_id: cmd.equipment_id,
            quantity: cmd.quantity,
            course_id: optional(&cmd.course_id),
            lab_class_id: optional(&cmd.lab_class_id),
            reason,
            window,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveRequest) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_approve(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "approve"));
        }

        Ok(vec![RequestEvent::Approved(RequestApproved {
            request_id: cmd.request_id,
            from: self.status,
            approver: cmd.approver,
            reserved_units: cmd.reserved_units.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reject(&self, cmd: &RejectRequest) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_reject(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "reject"));
        }
        let reason = required(&cmd.reason, "rejection reason")?;

        Ok(vec![RequestEvent::Rejected(RequestRejected {
            request_id: cmd.request_id,
            from: self.effective_status(cmd.occurred_at),
            reason,
            suggestion: optional(&cmd.suggestion),
            released_units: self.reserved_units.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_escalate(&self, cmd: &EscalateRequest) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_escalate(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "escalate"));
        }

        Ok(vec![RequestEvent::Escalated(RequestEscalated {
            request_id: cmd.request_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_hod_review(&self, cmd: &HodReview) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_hod_review() {
            return Err(self.illegal(cmd.occurred_at, "review"));
        }

        if cmd.approved {
            return Ok(vec![RequestEvent::HodApproved(HodApproved {
                request_id: cmd.request_id,
                reason: optional(&cmd.reason),
                reserved_units: cmd.reserved_units.clone(),
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            })]);
        }

        let reason = required(cmd.reason.as_deref().unwrap_or_default(), "HOD rejection reason")?;
        Ok(vec![RequestEvent::HodRejected(HodRejected {
            request_id: cmd.request_id,
            reason,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_respond(&self, cmd: &RespondToSuggestion) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_respond_to_suggestion() {
            return Err(self.illegal(cmd.occurred_at, "respond to the suggestion on"));
        }
        let reason = if cmd.acknowledged {
            optional(&cmd.reason)
        } else {
            Some(required(
                cmd.reason.as_deref().unwrap_or_default(),
                "reason for declining the suggestion",
            )?)
        };

        Ok(vec![RequestEvent::SuggestionResponded(SuggestionResponded {
            request_id: cmd.request_id,
            acknowledged: cmd.acknowledged,
            reason,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Minutes of the daily budget already spoken for on the day of `now`:
    /// granted extensions plus one still awaiting a decision.
    fn pending_minutes_on(&self, now: DateTime<Utc>) -> u32 {
        self.extension
            .as_ref()
            .filter(|e| e.is_pending() && e.budget_day == now.date_naive())
            .map_or(0, |e| e.minutes)
    }

    fn handle_request_extension(&self, cmd: &RequestExtension) -> DomainResult<Vec<RequestEvent>> {
        let minutes = cmd.policy.minutes_for(cmd.hours)?;
        let remaining = self
            .remaining_extension_minutes(cmd.occurred_at, &cmd.policy)
            .saturating_sub(self.pending_minutes_on(cmd.occurred_at));
        if minutes > remaining {
            return Err(DomainError::validation(format!(
                "extension of {} h exceeds the remaining daily budget of {} h",
                cmd.hours,
                f64::from(remaining) / 60.0
            )));
        }
        if !self.can_request_extension(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "extend"));
        }
        let reason = required(&cmd.reason, "extension reason")?;

        Ok(vec![RequestEvent::ExtensionRequested(ExtensionRequested {
            request_id: cmd.request_id,
            minutes,
            reason,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_extension_decision(&self, cmd: &HandleExtension) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_handle_extension(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "decide an extension for"));
        }
        let (Some(ext), Some(window)) = (self.extension.as_ref(), self.window) else {
            return Err(DomainError::invariant("pending extension without a window"));
        };

        if !cmd.approved {
            let reason = required(
                cmd.rejection_reason.as_deref().unwrap_or_default(),
                "extension rejection reason",
            )?;
            return Ok(vec![RequestEvent::ExtensionRejected(ExtensionRejected {
                request_id: cmd.request_id,
                reason,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            })]);
        }

        let remaining =
            ExtensionBudget::remaining_on(self.extension_budget.as_ref(), ext.budget_day, &cmd.policy);
        if ext.minutes > remaining {
            return Err(DomainError::validation("extension exceeds the remaining daily budget"));
        }
        let new_window = window.extended_by(Duration::minutes(i64::from(ext.minutes)))?;

        Ok(vec![RequestEvent::ExtensionApproved(ExtensionApproved {
            request_id: cmd.request_id,
            minutes: ext.minutes,
            new_window,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_in_use(&self, cmd: &MarkInUse) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_mark_in_use() {
            return Err(self.illegal(cmd.occurred_at, "hand over"));
        }

        Ok(vec![RequestEvent::MarkedInUse(RequestMarkedInUse {
            request_id: cmd.request_id,
            from: self.status,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_returned(&self, cmd: &MarkReturned) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_mark_returned(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "mark returned"));
        }

        Ok(vec![RequestEvent::Returned(RequestReturned {
            request_id: cmd.request_id,
            from: self.effective_status(cmd.occurred_at),
            condition: cmd.condition,
            notes: optional(&cmd.notes),
            released_units: self.reserved_units.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteRequest) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_complete() {
            return Err(self.illegal(cmd.occurred_at, "complete"));
        }

        Ok(vec![RequestEvent::Completed(RequestCompleted {
            request_id: cmd.request_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelRequest) -> DomainResult<Vec<RequestEvent>> {
        if !self.can_cancel(cmd.occurred_at) {
            return Err(self.illegal(cmd.occurred_at, "cancel"));
        }

        Ok(vec![RequestEvent::Cancelled(RequestCancelled {
            request_id: cmd.request_id,
            from: self.status,
            released_units: self.reserved_units.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}
