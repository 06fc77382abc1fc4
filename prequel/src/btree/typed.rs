//! Convenience re-exports for the common case of a tree keyed by a plain
//! function pointer or closure.
//!
//! [`super::BTree`] already is the typed tree -- there is no separate raw
//! layer in this crate (see the module doc on `btree::mod`) -- so this
//! module only exists to give callers a short, conventional import path.

pub use super::{BTree, BTreeAnchor, BTreeIter};
