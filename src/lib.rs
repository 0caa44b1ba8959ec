//! rasterd: renders pages of untrusted documents through a pool of isolated
//! worker processes.
//!
//! The [`pool`] module is the core: it supervises `rasterd-worker` child
//! processes, hands out exclusive [`pool::Lease`]s with deadlines, and replaces
//! workers that crash, hang, or outlive their lease. Everything else is the
//! thin service around it.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod pool;
pub mod util;
pub mod worker;
