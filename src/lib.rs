//! Traceflow - traceability event repository
//!
//! Captures supply-chain events and master data into SQLite, answers
//! parameterized queries over them and delivers query results to standing
//! subscriptions on a schedule or whenever new data arrives.
//!
//! ## Modules
//!
//! - `capture` - request validation and atomic persistence
//! - `queries` - named queries and their parameter grammar
//! - `service` - poll, subscribe and unsubscribe
//! - `subscriptions` - scheduler, runner and HTTP delivery
//! - `storage` - schema, bulk writes and SQL compilation

pub mod capture;
pub mod config;
pub mod error;
pub mod model;
pub mod queries;
pub mod service;
pub mod sqlite_pragma;
pub mod storage;
pub mod subscriptions;

pub use capture::CaptureService;
pub use config::RepositoryConfig;
pub use error::{DeliveryError, EpcisError, Result, SubscriptionRunError};
pub use queries::QueryRegistry;
pub use service::QueryService;
pub use storage::Database;
