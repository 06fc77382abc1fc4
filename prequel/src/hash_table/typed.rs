//! Convenience re-exports; see the note on `btree::typed` -- this crate
//! does not keep a separate raw/typed split, so this module is just a
//! short, conventional import path.

pub use super::{fnv1a, HashTable, HashTableAnchor};
