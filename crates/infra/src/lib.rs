//! Infrastructure layer: event store, dispatcher, read models, locks and the
//! engine services built on them.

pub mod command_dispatcher;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod locks;
pub mod projections;

pub use command_dispatcher::{CommandDispatcher, DispatchError, EventSink};
pub use config::EngineConfig;
pub use engine::{
    Availability, BulkItem, BulkItemResult, BulkOutcome, Engine, NewAssignment, NewEquipment,
    NewRequest,
};
pub use error::{EngineError, EngineResult};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent};
pub use projections::{HistoryLedger, HistoryRecord, HistorySubject, Projections, RequestView};
