//! keepgate — execution gateway library.
//!
//! Exposes the gateway's components for the binary entrypoint and for
//! integration tests, which are a separate compilation unit.
#![allow(dead_code)]

pub mod approval;
pub mod client;
pub mod config;
pub mod executor;
pub mod gateway;
pub mod policy;
pub mod signature;
pub mod store;
pub mod tls;
