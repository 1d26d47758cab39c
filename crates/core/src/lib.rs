//! `campusres-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).
//! Time is always an explicit input: business rules read "now" from a [`Clock`]
//! handed in by the caller, never from the system directly.

pub mod aggregate;
pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;
pub mod window;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, UserId};
pub use value_object::ValueObject;
pub use window::TimeWindow;
