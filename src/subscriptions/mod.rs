//! Standing subscriptions: scheduling, evaluation and delivery
//!
//! ## Components
//!
//! - `scheduler` - owner task of the live registry and the tick loop
//! - `runner` - one evaluation: pending ids, query, delivery, acknowledgment
//! - `delivery` - outbound [`ResultSender`] and its HTTP implementation
//! - `backoff` - retry pacing for data-insert triggers
//!
//! Delivery is at-least-once. Pending request ids are only acknowledged after
//! the destination accepted the payload, so a failure is retried with the
//! same data plus anything captured since.

pub mod backoff;
pub mod delivery;
pub mod runner;
pub mod scheduler;

pub use backoff::RetryBackoff;
pub use delivery::{HttpResultSender, ResultSender};
pub use runner::{QuerySubscriptionRunner, RunOutcome, SubscriptionRunner};
pub use scheduler::{system_clock, Clock, SchedulerConfig, SchedulerHandle, SubscriptionScheduler};
