//! corrald — the Corral cluster controller daemon.
//!
//! Assembles every subsystem (embedded coordination store, leader
//! lock, node registry, role assigner, lifecycle manager, health
//! monitor, routing generator, scaling controller, task queue and REST
//! API) into one process. The binary in `main.rs` is a thin CLI over
//! [`controller`].

pub mod controller;

pub use controller::{Controller, Plugins, describe, run};
