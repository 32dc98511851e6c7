//! End-to-end subscription delivery through the scheduler
//!
//! Covers schedule matching against an injected clock, acknowledgment of
//! delivered requests, and retry of undelivered data merged with newer
//! captures.

mod common;

use common::{
    capture, create_database, eventually, object_event, pending, spawn_scheduler, start_repository,
    ManualClock, RecordingSender,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use traceflow::model::{
    CaptureRequest, QueryParameter, QueryResults, QuerySchedule, RequestContext, Subscription,
};
use traceflow::storage::subscription_store;
use traceflow::{CaptureService, QueryRegistry};

fn event_count(results: &QueryResults) -> usize {
    match results {
        QueryResults::Events(events) => events.len(),
        QueryResults::MasterData(_) => panic!("expected events"),
    }
}

#[tokio::test]
async fn test_scheduled_subscription_fires_on_matching_second() {
    let repository = start_repository();
    let schedule = QuerySchedule::parse(Some("0"), None, None, None, None, None).unwrap();
    repository
        .queries
        .subscribe(Subscription::scheduled(
            "every-minute",
            "SimpleEventQuery",
            "http://consumer.example/inbox",
            schedule,
        ))
        .await
        .unwrap();

    let request_id = capture(&repository, vec![object_event("urn:step:shipping")]).await;

    // Clock sits at 09:00:30, nothing matches
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repository.sender.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(pending(&repository.database, "every-minute"), vec![request_id]);

    repository.clock.set(9, 1, 0);
    eventually(|| repository.sender.delivered_count() == 1).await;

    let (destination, response) = repository.sender.last();
    assert_eq!(destination, "http://consumer.example/inbox/");
    assert_eq!(response.subscription_id.as_deref(), Some("every-minute"));
    assert_eq!(event_count(&response.results), 1);

    eventually(|| pending(&repository.database, "every-minute").is_empty()).await;

    // Same second again: no second delivery
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repository.sender.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_delivery_keeps_data_pending_and_merges_newer_captures() {
    let repository = start_repository();
    let schedule = QuerySchedule::parse(Some("0"), None, None, None, None, None).unwrap();
    repository
        .queries
        .subscribe(Subscription::scheduled(
            "retrying",
            "SimpleEventQuery",
            "http://consumer.example/inbox/",
            schedule,
        ))
        .await
        .unwrap();

    repository.sender.failing.store(true, Ordering::SeqCst);
    let first = capture(&repository, vec![object_event("urn:step:shipping")]).await;

    repository.clock.set(9, 1, 0);
    eventually(|| repository.sender.attempts.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(repository.sender.delivered_count(), 0);
    assert_eq!(pending(&repository.database, "retrying"), vec![first]);

    let second = capture(&repository, vec![object_event("urn:step:receiving")]).await;
    repository.sender.failing.store(false, Ordering::SeqCst);
    repository.clock.set(9, 2, 0);

    eventually(|| repository.sender.delivered_count() == 1).await;
    let (_, response) = repository.sender.last();
    assert_eq!(event_count(&response.results), 2);

    eventually(|| pending(&repository.database, "retrying").is_empty()).await;
    assert!(second > first);
}

#[tokio::test]
async fn test_data_insert_subscription_retries_until_delivered() {
    let repository = start_repository();
    let mut subscription = Subscription::triggered(
        "on-insert",
        "SimpleEventQuery",
        "http://consumer.example/inbox",
        "urn:trigger:new-data",
    );
    subscription.parameters = vec![QueryParameter::new("EQ_bizStep", &["urn:step:shipping"])];
    repository.queries.subscribe(subscription).await.unwrap();

    repository.sender.failing.store(true, Ordering::SeqCst);
    capture(
        &repository,
        vec![object_event("urn:step:shipping"), object_event("urn:step:receiving")],
    )
    .await;

    eventually(|| repository.sender.attempts.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(repository.sender.delivered_count(), 0);

    repository.sender.failing.store(false, Ordering::SeqCst);
    eventually(|| repository.sender.delivered_count() == 1).await;

    let (_, response) = repository.sender.last();
    assert_eq!(event_count(&response.results), 1);
    eventually(|| pending(&repository.database, "on-insert").is_empty()).await;
}

#[tokio::test]
async fn test_empty_results_are_acknowledged_without_delivery() {
    let repository = start_repository();
    let mut subscription = Subscription::triggered(
        "quiet",
        "SimpleEventQuery",
        "http://consumer.example/inbox",
        "urn:trigger:new-data",
    );
    subscription.parameters = vec![QueryParameter::new("EQ_bizStep", &["urn:step:never"])];
    repository.queries.subscribe(subscription).await.unwrap();

    capture(&repository, vec![object_event("urn:step:shipping")]).await;

    eventually(|| pending(&repository.database, "quiet").is_empty()).await;
    assert_eq!(repository.sender.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unsubscribed_subscription_no_longer_fires() {
    let repository = start_repository();
    let schedule = QuerySchedule::parse(Some("0"), None, None, None, None, None).unwrap();
    repository
        .queries
        .subscribe(Subscription::scheduled(
            "short-lived",
            "SimpleEventQuery",
            "http://consumer.example/inbox",
            schedule,
        ))
        .await
        .unwrap();
    capture(&repository, vec![object_event("urn:step:shipping")]).await;

    repository.queries.unsubscribe("short-lived").await.unwrap();
    repository.clock.set(9, 1, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repository.sender.attempts.load(Ordering::SeqCst), 0);
    assert!(repository.scheduler.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_data_is_delivered_after_restart() {
    let (_dir, database) = create_database();
    let mut conn = database.open().unwrap();
    subscription_store::insert(
        &mut conn,
        &Subscription::triggered(
            "durable",
            "SimpleEventQuery",
            "http://consumer.example/inbox/",
            "urn:trigger:new-data",
        ),
    )
    .unwrap();

    // Captured while no scheduler was running
    let request_id = CaptureService::new(database.clone())
        .capture(
            CaptureRequest::new(vec![object_event("urn:step:shipping")]),
            RequestContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(pending(&database, "durable"), vec![request_id]);

    let restored = subscription_store::list(&conn).unwrap();
    let sender = Arc::new(RecordingSender::default());
    let _scheduler = spawn_scheduler(
        &database,
        Arc::new(QueryRegistry::with_defaults()),
        sender.clone(),
        &ManualClock::at(9, 0, 30),
        restored,
    );

    eventually(|| sender.delivered_count() == 1).await;
    let (_, response) = sender.last();
    assert_eq!(event_count(&response.results), 1);
    eventually(|| pending(&database, "durable").is_empty()).await;
}
