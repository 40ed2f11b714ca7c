//! Region assignment for a range-partitioned key-value store.
//!
//! The active master decides which region server hosts each region and
//! drives every region through the open/close/split transition protocol,
//! using transition nodes in the coordination service as the shared record
//! between master and region servers.

pub mod assignment;
pub mod balancer;
pub mod bulk_assigner;
pub mod catalog;
pub mod catalog_janitor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod locks;
pub mod master;
pub mod metrics_consts;
pub mod paths;
pub mod plans;
pub mod region_states;
pub mod rpc;
pub mod server_manager;
pub mod server_tracker;
pub mod table_state;
pub mod timeout_monitor;
pub mod transition;
pub mod types;
pub mod watcher;
