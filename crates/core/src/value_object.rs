//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. To
/// "modify" one, build a new one (see [`crate::TimeWindow::extended_by`]).
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
