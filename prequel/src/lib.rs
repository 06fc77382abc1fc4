//! Primitives for building persistent on-disk data structures on top of a
//! single block-addressed file: a paging engine with an LRU block cache, a
//! compile-time binary serialization format, a best-fit block allocator, a
//! B+-tree, a linear-hashing hash table, a growable array, a LIFO stack,
//! and a small/large-object heap.
//!
//! Everything here assumes a single writer and no concurrent access -- see
//! each module's doc comment for the invariants it keeps instead.

// So `#[derive(Serializable)]`-generated code can refer to `::prequel::...`
// paths from within this crate's own modules and tests, exactly as an
// external downstream crate would.
extern crate self as prequel;

pub mod address;
pub mod allocator;
pub mod btree;
pub mod engine;
pub mod error;
pub mod extent;
pub mod freelist;
pub mod handle;
pub mod hash_table;
pub mod heap;
pub mod serialize;
pub mod stack;
pub mod vfs;

pub use address::{Addr, BlockIndex, RawAddress};
pub use engine::{BlockHandle, Engine};
pub use error::{Error, Result};
pub use handle::{AnchorHandle, Handle};
pub use serialize::Serializable;

// `Serializable` the trait and `Serializable` the derive macro live in
// separate namespaces, so both can be reached through one `use prequel::Serializable`.
pub use prequel_derive::Serializable;
