//! Poll, subscribe and unsubscribe orchestration
//!
//! Every failure leaves here as one of the [`EpcisError`] kinds. Storage
//! errors raised while a query runs are reported as query parameter
//! failures; only failing to open the store surfaces as a storage error.

use crate::error::{EpcisError, Result};
use crate::model::{normalize_parameters, Poll, PollResponse, Subscription, SubscriptionTrigger};
use crate::queries::QueryRegistry;
use crate::storage::{subscription_store, Database};
use crate::subscriptions::SchedulerHandle;
use reqwest::Url;
use std::sync::Arc;

pub const STANDARD_VERSION: &str = "1.2";

#[derive(Clone)]
pub struct QueryService {
    database: Database,
    registry: Arc<QueryRegistry>,
    scheduler: SchedulerHandle,
}

/// Failures inside query execution reach callers as parameter failures
fn execution_failure(err: EpcisError) -> EpcisError {
    match err {
        EpcisError::Storage(e) => EpcisError::QueryParameter(format!("query execution failed: {}", e)),
        EpcisError::Internal(e) => EpcisError::QueryParameter(format!("query execution failed: {}", e)),
        other => other,
    }
}

/// Absolute URI with a trailing `/`
fn normalize_destination(destination: &str) -> Result<String> {
    let url = Url::parse(destination.trim())
        .ok()
        .filter(|url| !url.cannot_be_a_base())
        .ok_or_else(|| {
            EpcisError::Validation(format!("destination '{}' is not an absolute URI", destination))
        })?;

    let mut normalized = url.to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}

impl QueryService {
    pub fn new(database: Database, registry: Arc<QueryRegistry>, scheduler: SchedulerHandle) -> Self {
        Self {
            database,
            registry,
            scheduler,
        }
    }

    pub async fn poll(&self, poll: Poll) -> Result<PollResponse> {
        let query = self.registry.get(&poll.query_name).ok_or_else(|| {
            EpcisError::QueryParameter(format!("unknown query {}", poll.query_name))
        })?;
        let parameters = normalize_parameters(poll.parameters);
        query.validate_parameters(&parameters)?;

        let database = self.database.clone();
        let results = tokio::task::spawn_blocking(move || {
            let conn = database.open()?;
            query
                .execute(&conn, &parameters, None)
                .map_err(execution_failure)
        })
        .await
        .map_err(|e| execution_failure(e.into()))??;

        log::debug!("🔍 Poll {} returned {} results", poll.query_name, results.len());

        Ok(PollResponse {
            query_name: poll.query_name,
            subscription_id: None,
            results,
        })
    }

    /// Persist the subscription, then register it with the scheduler
    pub async fn subscribe(&self, mut subscription: Subscription) -> Result<()> {
        if subscription.subscription_id.trim().is_empty() {
            return Err(EpcisError::Validation("subscription id is required".to_string()));
        }
        subscription.destination = normalize_destination(&subscription.destination)?;

        let query = self
            .registry
            .get(&subscription.query_name)
            .filter(|query| query.allow_subscription())
            .ok_or_else(|| {
                EpcisError::SubscribeNotPermitted(format!(
                    "query {} does not accept subscriptions",
                    subscription.query_name
                ))
            })?;

        subscription.parameters = normalize_parameters(subscription.parameters);
        query.validate_parameters(&subscription.parameters)?;

        subscription.trigger = match subscription.trigger {
            SubscriptionTrigger::Schedule(schedule) => SubscriptionTrigger::Schedule(
                schedule
                    .reparse()
                    .map_err(|e| EpcisError::Validation(e.to_string()))?,
            ),
            SubscriptionTrigger::DataInsert(uri) if uri.trim().is_empty() => {
                return Err(EpcisError::Validation("trigger URI is required".to_string()))
            }
            trigger => trigger,
        };

        let database = self.database.clone();
        let to_store = subscription.clone();
        let id = tokio::task::spawn_blocking(move || {
            let mut conn = database.open()?;
            if subscription_store::find_id(&conn, &to_store.subscription_id)?.is_some() {
                return Err(duplicate(&to_store.subscription_id));
            }
            subscription_store::insert(&mut conn, &to_store).map_err(|e| match e {
                rusqlite::Error::SqliteFailure(code, _)
                    if code.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    duplicate(&to_store.subscription_id)
                }
                other => EpcisError::Storage(other),
            })
        })
        .await??;

        subscription.id = Some(id);
        log::info!(
            "📝 Subscribed {} to {} -> {}",
            subscription.subscription_id,
            subscription.query_name,
            subscription.destination
        );
        self.scheduler.register(subscription).await
    }

    /// Delete the persisted subscription, then stop it firing
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let database = self.database.clone();
        let id = subscription_id.to_string();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = database.open()?;
            subscription_store::delete(&conn, &id)
        })
        .await??;

        if !deleted {
            return Err(EpcisError::NoSuchName(subscription_id.to_string()));
        }

        self.scheduler.remove(subscription_id).await?;
        log::info!("🗑️  Unsubscribed {}", subscription_id);
        Ok(())
    }

    pub fn query_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub async fn subscription_ids(&self, query_name: &str) -> Result<Vec<String>> {
        if self.registry.get(query_name).is_none() {
            return Err(EpcisError::NoSuchName(query_name.to_string()));
        }

        let database = self.database.clone();
        let query_name = query_name.to_string();
        let ids = tokio::task::spawn_blocking(move || {
            let conn = database.open()?;
            subscription_store::list_ids_for_query(&conn, &query_name)
        })
        .await??;
        Ok(ids)
    }

    pub fn standard_version(&self) -> &'static str {
        STANDARD_VERSION
    }

    pub fn vendor_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

fn duplicate(subscription_id: &str) -> EpcisError {
    EpcisError::SubscribeNotPermitted(format!("subscription {} already exists", subscription_id))
}
