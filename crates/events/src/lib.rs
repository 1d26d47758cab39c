//! Event primitives shared by domain crates and infrastructure.

pub mod envelope;
pub mod event;
pub mod handler;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
