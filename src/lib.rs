//! wazgate - front Wazuh clusters with on-demand sandboxed unit orchestration
//!
//! The crate resolves per-cluster configuration, starts and supervises
//! sandboxed unit processes (manager, indexer, dashboard, certs), waits for
//! them to become network-ready, and proxies inbound requests to a healthy
//! unit while emitting lifecycle telemetry.

pub mod cli;
pub mod config;
pub mod server;
pub mod store;
pub mod substrate;
pub mod unit;
