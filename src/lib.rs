//! Core library for the signal generator frontend.
//!
//! This library contains the SCPI driver for the supported signal generator
//! models, the equipment adapter that mirrors instrument state into a
//! hierarchical parameter store, and the supporting configuration, logging,
//! and transport layers. It is used by the `sgen_frontend` binary and by the
//! integration tests.

pub mod config;
pub mod control;
pub mod driver;
pub mod equipment;
pub mod error;
pub mod event;
pub mod logging;
pub mod registry;
pub mod schema;
pub mod store;
pub mod transport;
