//! Capture entry point
//!
//! Validates a request, persists it in one transaction on the blocking pool
//! and, once committed, signals the scheduler so data-insert subscriptions
//! become due.

pub mod validation;

use crate::error::Result;
use crate::model::{CaptureRequest, RequestContext};
use crate::storage::{capture_store, Database};
use crate::subscriptions::SchedulerHandle;
use chrono::Utc;

pub use validation::validate_request;

#[derive(Clone)]
pub struct CaptureService {
    database: Database,
    scheduler: Option<SchedulerHandle>,
}

impl CaptureService {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Persist the request and return its id; nothing is stored on failure
    pub async fn capture(&self, request: CaptureRequest, context: RequestContext) -> Result<i64> {
        validate_request(&request)?;

        let database = self.database.clone();
        let events = request.events.len();
        let request_id = tokio::task::spawn_blocking(move || {
            let mut conn = database.open()?;
            capture_store::store_request(&mut conn, &request, &context, Utc::now())
        })
        .await?
        .map_err(|e| {
            log::error!("❌ Capture failed and was rolled back: {}", e);
            e
        })?;

        log::info!("📦 Captured request {} with {} events", request_id, events);

        if let Some(scheduler) = &self.scheduler {
            scheduler.notify_capture(request_id).await;
        }

        Ok(request_id)
    }
}
