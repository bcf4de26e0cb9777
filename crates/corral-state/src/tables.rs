//! redb table definitions for the coordination store.

use redb::TableDefinition;

/// Entries keyed by path (`/members/m1`, `/instances/broker/m1`, ...).
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Lease records keyed by lease id.
pub const LEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("leases");

/// Counters: global revision and lease id sequence.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const REVISION_KEY: &str = "revision";
pub const LEASE_SEQ_KEY: &str = "lease_seq";
