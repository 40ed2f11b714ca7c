//! Narrow facade over the external coordination service.
//!
//! The region assigner never talks to etcd directly. Everything it needs
//! (versioned nodes, compare-and-swap writes, session-bound ephemeral nodes,
//! prefix watches) goes through [`client::CoordinationClient`], which has an
//! in-process implementation for tests and single-node deployments and an
//! etcd implementation for production.

pub mod client;
pub mod error;
pub mod etcd;
pub mod leader_election;
pub mod memory;
pub mod util;

pub use client::{
    CasOutcome, CoordinationClient, ExpectedVersion, NodeEvent, NodeEventKind, Versioned,
    WatchReceiver,
};
pub use error::{Error, Result};
