//! Query interface exposed to clients: poll, subscription management and
//! version reporting.

pub mod query_service;

pub use query_service::{QueryService, STANDARD_VERSION};
