//! corral-core — shared vocabulary for the Corral cluster controller.
//!
//! Holds the domain types persisted in the coordination service, the
//! static role catalog (with its dependency graph), the `corral.toml`
//! configuration model, and the clock abstraction every time-dependent
//! rule is written against.

pub mod clock;
pub mod config;
pub mod duration;
pub mod roles;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ControllerConfig};
pub use roles::{CatalogError, ProbeSpec, RoleCatalog, RoleDefinition, RouteMode, RouteSpec};
pub use types::*;
