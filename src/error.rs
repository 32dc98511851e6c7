//! Error taxonomy surfaced to callers of capture, poll and subscription calls

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EpcisError>;

#[derive(Error, Debug)]
pub enum EpcisError {
    /// Malformed capture or subscription input, rejected before any mutation
    #[error("validation failure: {0}")]
    Validation(String),

    /// Unknown query name, or a bad or missing parameter
    #[error("query parameter failure: {0}")]
    QueryParameter(String),

    /// Result set exceeds the caller's maxEventCount / maxElementCount
    #[error("query too large: {0}")]
    QueryTooLarge(String),

    /// Unknown subscription id
    #[error("no such name: {0}")]
    NoSuchName(String),

    /// Duplicate subscription id, or the query does not allow subscriptions
    #[error("subscribe not permitted: {0}")]
    SubscribeNotPermitted(String),

    /// Transaction or commit failure; the transaction has been rolled back
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for EpcisError {
    fn from(err: tokio::task::JoinError) -> Self {
        EpcisError::Internal(format!("blocking task failed: {}", err))
    }
}

/// Outbound delivery failures; recorded by the scheduler and never propagated
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("destination answered with status {0}")]
    Status(u16),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why one subscription evaluation failed; pending data stays pending
#[derive(Error, Debug)]
pub enum SubscriptionRunError {
    #[error("query failed: {0}")]
    Query(#[from] EpcisError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}
