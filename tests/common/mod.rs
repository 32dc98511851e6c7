//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use traceflow::model::{
    CaptureRequest, Event, EventAction, EventType, PollResponse, RequestContext, Subscription,
};
use traceflow::storage::{run_schema_migrations, subscription_store};
use traceflow::subscriptions::{
    Clock, QuerySubscriptionRunner, ResultSender, SchedulerConfig, SchedulerHandle, SubscriptionScheduler,
};
use traceflow::{CaptureService, Database, DeliveryError, QueryRegistry, QueryService};

pub fn create_database() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let database = Database::new(dir.path().join("traceflow.db"));
    let mut conn = database.open().unwrap();
    run_schema_migrations(&mut conn, "sql").unwrap();
    (dir, database)
}

/// Records deliveries; answers 503 while `failing` is set
#[derive(Default)]
pub struct RecordingSender {
    pub failing: AtomicBool,
    pub attempts: AtomicUsize,
    pub delivered: Mutex<Vec<(String, PollResponse)>>,
}

impl RecordingSender {
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn last(&self) -> (String, PollResponse) {
        self.delivered.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ResultSender for RecordingSender {
    async fn send(&self, destination: &str, response: &PollResponse) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Status(503));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((destination.to_string(), response.clone()));
        Ok(())
    }
}

/// Clock the test moves by hand
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn at(h: u32, m: u32, s: u32) -> Self {
        Self(Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap())))
    }

    pub fn set(&self, h: u32, m: u32, s: u32) {
        *self.0.lock().unwrap() = Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap();
    }

    pub fn clock(&self) -> Clock {
        let now = self.0.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

/// Everything wired together the way the runtime does it
pub struct Repository {
    pub _dir: TempDir,
    pub database: Database,
    pub capture: CaptureService,
    pub queries: QueryService,
    pub scheduler: SchedulerHandle,
    pub sender: Arc<RecordingSender>,
    pub clock: ManualClock,
}

pub fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(5),
        max_concurrency: 4,
        channel_buffer: 64,
        retry_initial: Duration::from_millis(0),
        retry_max: Duration::from_millis(0),
        retry_limit: None,
    }
}

/// Scheduler over `database` delivering through `sender`
pub fn spawn_scheduler(
    database: &Database,
    registry: Arc<QueryRegistry>,
    sender: Arc<RecordingSender>,
    clock: &ManualClock,
    subscriptions: Vec<Subscription>,
) -> SchedulerHandle {
    let runner = Arc::new(QuerySubscriptionRunner::new(database.clone(), registry, sender));
    let (scheduler, _task) =
        SubscriptionScheduler::with_clock(fast_scheduler_config(), runner, clock.clock())
            .spawn(subscriptions);
    scheduler
}

pub fn start_repository() -> Repository {
    let (dir, database) = create_database();
    let registry = Arc::new(QueryRegistry::with_defaults());
    let sender = Arc::new(RecordingSender::default());
    let clock = ManualClock::at(9, 0, 30);
    let scheduler = spawn_scheduler(&database, registry.clone(), sender.clone(), &clock, Vec::new());

    Repository {
        _dir: dir,
        capture: CaptureService::new(database.clone()).with_scheduler(scheduler.clone()),
        queries: QueryService::new(database.clone(), registry, scheduler.clone()),
        database,
        scheduler,
        sender,
        clock,
    }
}

/// Pending request ids of a persisted subscription
pub fn pending(database: &Database, subscription_id: &str) -> Vec<i64> {
    let conn = database.open().unwrap();
    let id = subscription_store::find_id(&conn, subscription_id).unwrap().unwrap();
    subscription_store::pending_request_ids(&conn, id).unwrap()
}

pub fn object_event(step: &str) -> Event {
    let mut event = Event::new(EventType::ObjectEvent, Utc::now(), Some(EventAction::Observe));
    event.business_step = Some(step.to_string());
    event
}

pub async fn capture(repository: &Repository, events: Vec<Event>) -> i64 {
    repository
        .capture
        .capture(CaptureRequest::new(events), RequestContext::default())
        .await
        .unwrap()
}

pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
