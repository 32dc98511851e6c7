//! Named queries and their registry
//!
//! Poll and subscriptions both resolve a query by name and run it through
//! the same trait object, so a subscription delivers exactly what a poll
//! with the same parameters would return.

pub mod parameters;
pub mod simple_event_query;
pub mod simple_masterdata_query;

use crate::error::Result;
use crate::model::{QueryParameter, QueryResults};
use crate::storage::subscription_store::PendingScope;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;

pub use simple_event_query::SimpleEventQuery;
pub use simple_masterdata_query::SimpleMasterDataQuery;

/// A named, parameterized query
///
/// Parameters are always normalized before they reach an implementation.
/// `execute` runs on a blocking thread with its own connection.
pub trait EpcisQuery: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether subscriptions may bind this query
    fn allow_subscription(&self) -> bool;

    /// Reject unknown names, wrong arity and malformed values
    fn validate_parameters(&self, parameters: &[QueryParameter]) -> Result<()>;

    /// Run the query; `pending` restricts results to data a subscription
    /// has not received yet
    fn execute(
        &self,
        conn: &Connection,
        parameters: &[QueryParameter],
        pending: Option<PendingScope>,
    ) -> Result<QueryResults>;
}

/// Name -> query lookup shared by the query service and the scheduler
#[derive(Clone, Default)]
pub struct QueryRegistry {
    queries: HashMap<&'static str, Arc<dyn EpcisQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `SimpleEventQuery` and `SimpleMasterDataQuery`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SimpleEventQuery));
        registry.register(Arc::new(SimpleMasterDataQuery));
        registry
    }

    pub fn register(&mut self, query: Arc<dyn EpcisQuery>) {
        log::debug!("📋 Registered query {}", query.name());
        self.queries.insert(query.name(), query);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EpcisQuery>> {
        self.queries.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queries.keys().map(|n| n.to_string()).collect();
        names.sort();
        names
    }
}
