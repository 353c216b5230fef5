//! Common definitions shared between the VM's components.

// Use sorted sets and maps for consistent, deterministic iteration order.
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Interned strings, used for function signatures and string-switch keys.
///
/// Two `Id`s compare equal (and share identity) iff their underlying strings
/// are equal, which is exactly what [`crate::types::TypeRegistry`] relies on
/// for structural interning of [`crate::types::Type`].
pub type Id = internment::Intern<String>;
