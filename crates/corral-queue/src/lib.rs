//! corral-queue — the task queue bridge.
//!
//! A thin adapter between callers that submit work and the external
//! message broker. The [`Broker`] trait is the narrow interface to the
//! broker; [`MemoryBroker`] implements it in-process with at-least-once
//! delivery and visibility timeouts. [`TaskQueue`] adds typed payloads,
//! redelivery limits and dead-lettering on top.

pub mod broker;
pub mod error;
pub mod queue;

pub use broker::{Broker, MemoryBroker, QueueStats};
pub use error::{QueueError, QueueResult};
pub use queue::{Task, TaskEnvelope, TaskQueue, validate_queue_name};
