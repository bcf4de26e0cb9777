//! corral-coord — typed client for the coordination service.
//!
//! Every component talks to persistent state through
//! [`CoordinationClient`]: JSON documents at well-known [`paths`],
//! versioned writes with compare-and-set, leases that keep ephemeral
//! records alive, and prefix watches. The client is backend-agnostic;
//! [`CoordinationBackend`] is implemented for the embedded
//! [`corral_state::CoordStore`].
//!
//! Every call is bounded by the coordination timeout. A timeout and a
//! lost connection both surface as [`CoordError::Unavailable`]; callers
//! treat their cached state as stale until they have resynced.
//!
//! The [`LeaderLock`] elects exactly one controller through an
//! ephemeral `/leader` record and publishes the outcome as a
//! [`Leadership`] watch that gates every authoritative write.

pub mod backend;
pub mod client;
pub mod error;
pub mod leader;
pub mod paths;

pub use backend::CoordinationBackend;
pub use client::{CoordinationClient, Versioned, WatchStream};
pub use corral_state::{Entry, Lease, WatchEvent};
pub use error::{CoordError, CoordResult};
pub use leader::{LeaderLock, LeaderRecord, Leadership};
