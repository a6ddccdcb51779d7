//! API Module
//!
//! REST surface over the volume manager, plus health and Prometheus
//! endpoints.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
