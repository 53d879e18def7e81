//! beacond: real-time notification and workspace-chat gateway.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! in `tests/` drive the same router over a real listener.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod registry;
pub mod routes;
pub mod state;
pub mod types;
pub mod ws;
