//! Broker service library crate.
//!
//! # Purpose
//! Exposes broker subsystems (auth, config, status identity, TCP transport)
//! for use by the broker binary and integration tests.
pub mod auth;
pub mod config;
pub mod observability;
pub mod status;
pub mod transport;
