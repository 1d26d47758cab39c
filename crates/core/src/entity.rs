//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Entities live inside an aggregate (e.g. a serialized unit inside its
/// equipment) and are addressed by their own id.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
