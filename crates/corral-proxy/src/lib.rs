//! corral-proxy — keeps the load-balancer config in line with Ready instances.
//!
//! ```text
//! RoutingTable::build  (Ready instances of routable roles)
//!        │
//!     render ──► ConfigDocument {text, digest}
//!        │
//!    validate ──► ConfigSink::apply (write + reload, bounded)
//!        │
//!   /routing  (digest of the config actually applied)
//! ```
//!
//! Degraded instances stay running but drop out of the table. A
//! document that fails validation is never applied, and the previous
//! config stays active when a reload fails.

pub mod error;
pub mod generator;
pub mod render;
pub mod sink;
pub mod table;

pub use error::{RoutingError, RoutingResult};
pub use generator::{ConfigGenerator, RoutingRecord};
pub use render::{ConfigDocument, render, validate};
pub use sink::{ConfigSink, FileSink, MemorySink};
pub use table::{Backend, Route, RoutingTable};
