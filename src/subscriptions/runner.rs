//! One evaluation of one subscription
//!
//! pending scope -> bound query restricted to it -> delivery -> acknowledge
//!
//! The scope is fixed at the start by the highest pending request id, so
//! requests captured while a delivery is in flight stay pending for the next
//! run. The backlog is never expanded into bound parameters.

use super::delivery::ResultSender;
use crate::error::{EpcisError, SubscriptionRunError};
use crate::model::{PollResponse, Subscription, SubscriptionTrigger};
use crate::queries::QueryRegistry;
use crate::storage::subscription_store::{self, PendingScope};
use crate::storage::Database;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Results were pushed to the destination
    Delivered { results: usize, acknowledged: usize },
    /// Empty result without reportIfEmpty; covered ids are acknowledged
    NothingToDeliver { acknowledged: usize },
}

#[async_trait]
pub trait SubscriptionRunner: Send + Sync {
    async fn run(&self, subscription: &Subscription) -> Result<RunOutcome, SubscriptionRunError>;
}

/// Runner backed by the query registry, the store and a result sender
pub struct QuerySubscriptionRunner {
    database: Database,
    registry: Arc<QueryRegistry>,
    sender: Arc<dyn ResultSender>,
}

impl QuerySubscriptionRunner {
    pub fn new(database: Database, registry: Arc<QueryRegistry>, sender: Arc<dyn ResultSender>) -> Self {
        Self {
            database,
            registry,
            sender,
        }
    }

    async fn acknowledge(&self, scope: PendingScope) -> Result<usize, EpcisError> {
        if scope.is_empty() {
            return Ok(0);
        }

        let database = self.database.clone();
        let acknowledged = tokio::task::spawn_blocking(move || {
            let conn = database.open()?;
            subscription_store::acknowledge(&conn, scope)
        })
        .await??;
        Ok(acknowledged)
    }
}

#[async_trait]
impl SubscriptionRunner for QuerySubscriptionRunner {
    async fn run(&self, subscription: &Subscription) -> Result<RunOutcome, SubscriptionRunError> {
        let id = subscription.id.ok_or_else(|| {
            EpcisError::Internal(format!(
                "subscription {} has no storage id",
                subscription.subscription_id
            ))
        })?;
        let query = self.registry.get(&subscription.query_name).ok_or_else(|| {
            EpcisError::QueryParameter(format!("unknown query {}", subscription.query_name))
        })?;

        let database = self.database.clone();
        let parameters = subscription.parameters.clone();
        let (scope, results) = tokio::task::spawn_blocking(move || {
            let conn = database.open()?;
            let scope = subscription_store::pending_scope(&conn, id)?;
            let results = query.execute(&conn, &parameters, Some(scope))?;
            Ok::<_, EpcisError>((scope, results))
        })
        .await
        .map_err(EpcisError::from)??;

        // Data-insert runs without new data, such as the first run after a
        // restart, report nothing even with reportIfEmpty
        let triggered = matches!(subscription.trigger, SubscriptionTrigger::DataInsert(_));
        if scope.is_empty() && triggered {
            return Ok(RunOutcome::NothingToDeliver { acknowledged: 0 });
        }

        if results.is_empty() && !subscription.report_if_empty {
            let acknowledged = self.acknowledge(scope).await?;
            return Ok(RunOutcome::NothingToDeliver { acknowledged });
        }

        let response = PollResponse {
            query_name: subscription.query_name.clone(),
            subscription_id: Some(subscription.subscription_id.clone()),
            results,
        };
        self.sender.send(&subscription.destination, &response).await?;

        let acknowledged = self.acknowledge(scope).await?;
        Ok(RunOutcome::Delivered {
            results: response.results.len(),
            acknowledged,
        })
    }
}
