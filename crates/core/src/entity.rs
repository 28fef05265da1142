//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Banks, card types, locations and movements are entities: two records with the
/// same id are the same thing, whatever their other attributes say.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
