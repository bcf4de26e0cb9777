//! corral-state — embedded coordination service for Corral.
//!
//! Backed by [redb](https://docs.rs/redb), provides the hierarchical,
//! versioned key-value namespace the controller keeps all persistent
//! state in: compare-and-set writes, leases with ephemeral keys, and a
//! change feed for watches. Production clusters can point the
//! coordination client at an external service instead; this store is
//! what standalone controllers and every test run against.
//!
//! # Architecture
//!
//! Values are JSON documents wrapped in a [`StoredEntry`] envelope that
//! carries the key's version, its lease and the global revision of its
//! last modification. Keys are `/`-separated paths; `list` is a prefix
//! scan. Lease expiry is driven by [`CoordStore::expire_leases`], which
//! the daemon calls from a sweeper task.
//!
//! The `CoordStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::CoordStore;
pub use types::*;
