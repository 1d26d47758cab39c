//! Equipment request domain module (event-sourced).
//!
//! The request approval state machine: one guard per transition, extension
//! budgeting and the return record. Time is always an input.

pub mod extension;
pub mod request;

pub use extension::{
    DAILY_EXTENSION_BUDGET_HOURS, Extension, ExtensionBudget, ExtensionPolicy, ExtensionStatus,
    MAX_EXTENSION_HOURS, MIN_EXTENSION_HOURS,
};
pub use request::{
    ApproveRequest, CancelRequest, CompleteRequest, EquipmentRequest, EscalateRequest,
    ExtensionApproved, ExtensionRejected, ExtensionRequested, HandleExtension, HodApproved,
    HodRejected, HodReview, MarkInUse, MarkReturned, RejectRequest, RequestApproved,
    RequestCancelled, RequestCommand, RequestCompleted, RequestEscalated, RequestEvent,
    RequestExtension, RequestId, RequestMarkedInUse, RequestRejected, RequestReturned,
    RequestStatus, RequestSubmitted, RequesterRole, RespondToSuggestion, ReturnRecord,
    SubmitRequest, SuggestionResponded,
};
