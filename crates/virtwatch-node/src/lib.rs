//! Node heartbeat controller
//!
//! Each node runs an agent that stamps a heartbeat annotation on its Node
//! object. This crate watches those heartbeats and:
//! - marks nodes whose agent went silent as unschedulable (and schedulable
//!   again once the heartbeat returns)
//! - moves VirtualMachines that were placed on a silent or deleted node and
//!   have no live launcher pod to `Failed`, so they can be re-placed elsewhere
//!
//! # Modules
//!
//! - [`health`] - heartbeat age → node health
//! - [`selector`] - which VMs on an unhealthy node are stuck
//! - [`keys`] - mapping Node/VM/Pod notifications to node keys
//! - [`queue`] - deduplicating work queue with per-key backoff
//! - [`client`] - remote API seam (list and patch calls)
//! - [`cache`] - read-only local mirrors
//! - [`reconcile`] - one reconciliation cycle for one node
//! - [`controller`] - worker pool driving the queue
//! - [`watch`] - reflectors feeding the caches and the queue

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod health;
pub mod keys;
pub mod queue;
pub mod reconcile;
pub mod selector;
pub mod watch;

pub use config::NodeControllerConfig;
pub use controller::NodeController;
pub use health::NodeHealth;
pub use reconcile::{Context, CycleOutcome};

#[cfg(test)]
pub(crate) mod testing;
