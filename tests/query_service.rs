//! Capture, poll and subscription management through the public services

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{capture, object_event, start_repository};
use traceflow::model::{
    CaptureRequest, Epc, EpcType, MasterData, Poll, QueryParameter, QueryResults, QuerySchedule,
    RequestContext, Subscription, READ_POINT_TYPE,
};
use traceflow::EpcisError;

fn poll(query_name: &str, parameters: Vec<QueryParameter>) -> Poll {
    Poll {
        query_name: query_name.to_string(),
        parameters,
    }
}

fn events(results: QueryResults) -> Vec<traceflow::model::Event> {
    match results {
        QueryResults::Events(events) => events,
        QueryResults::MasterData(_) => panic!("expected events"),
    }
}

#[tokio::test]
async fn test_captured_events_are_polled_back_with_children() {
    let repository = start_repository();
    let mut shipped = object_event("urn:step:shipping");
    shipped.epcs.push(Epc::new(EpcType::List, "urn:epc:id:sgtin:1.2.3"));
    shipped.epcs.push(Epc::with_quantity(EpcType::Quantity, "urn:epc:class:lgtin:4.5.6", 12.0));
    let received = object_event("urn:step:receiving");

    let request_id = capture(&repository, vec![shipped, received]).await;

    let response = repository
        .queries
        .poll(poll(
            "SimpleEventQuery",
            vec![QueryParameter::new("MATCH_epc", &["urn:epc:id:sgtin:1.2.3"])],
        ))
        .await
        .unwrap();

    assert_eq!(response.query_name, "SimpleEventQuery");
    assert!(response.subscription_id.is_none());
    let found = events(response.results);
    assert_eq!(found.len(), 1);
    let event = &found[0];
    assert_eq!(event.id.as_ref().unwrap().request_id, request_id);
    assert_eq!(event.id.as_ref().unwrap().event_index, 0);
    assert_eq!(event.business_step.as_deref(), Some("urn:step:shipping"));
    assert_eq!(event.epcs.len(), 2);
    assert!(event.record_time.is_some());
}

#[tokio::test]
async fn test_poll_orders_and_limits() {
    let repository = start_repository();
    let base = Utc::now();
    let mut batch = Vec::new();
    for offset in 0..3 {
        let mut event = object_event("urn:step:shipping");
        event.event_time = base + ChronoDuration::minutes(offset);
        batch.push(event);
    }
    capture(&repository, batch).await;

    let newest_first = events(
        repository
            .queries
            .poll(poll(
                "SimpleEventQuery",
                vec![
                    QueryParameter::new("orderBy", &["eventTime"]),
                    QueryParameter::new("eventCountLimit", &["2"]),
                ],
            ))
            .await
            .unwrap()
            .results,
    );
    assert_eq!(newest_first.len(), 2);
    assert!(newest_first[0].event_time > newest_first[1].event_time);

    let too_large = repository
        .queries
        .poll(poll(
            "SimpleEventQuery",
            vec![QueryParameter::new("maxEventCount", &["2"])],
        ))
        .await;
    assert!(matches!(too_large, Err(EpcisError::QueryTooLarge(_))));
}

#[tokio::test]
async fn test_poll_rejects_unknown_query_and_bad_parameters() {
    let repository = start_repository();

    let unknown = repository.queries.poll(poll("NoSuchQuery", Vec::new())).await;
    assert!(matches!(unknown, Err(EpcisError::QueryParameter(_))));

    let bad_time = repository
        .queries
        .poll(poll(
            "SimpleEventQuery",
            vec![QueryParameter::new("GE_eventTime", &["yesterday"])],
        ))
        .await;
    assert!(matches!(bad_time, Err(EpcisError::QueryParameter(_))));

    let both_limits = repository
        .queries
        .poll(poll(
            "SimpleEventQuery",
            vec![
                QueryParameter::new("eventCountLimit", &["1"]),
                QueryParameter::new("maxEventCount", &["1"]),
            ],
        ))
        .await;
    assert!(matches!(both_limits, Err(EpcisError::QueryParameter(_))));
}

#[tokio::test]
async fn test_master_data_poll_and_hierarchy_filter() {
    let repository = start_repository();
    let mut request = CaptureRequest::new(Vec::new());
    request.master_data.push(
        MasterData::new(READ_POINT_TYPE, "urn:site:plant")
            .with_attribute("urn:attr:name", "Plant")
            .with_child("urn:site:dock"),
    );
    request
        .master_data
        .push(MasterData::new(READ_POINT_TYPE, "urn:site:dock"));
    let mut docked = object_event("urn:step:loading");
    docked.read_point = Some("urn:site:dock".to_string());
    request.events.push(docked);
    request.events.push(object_event("urn:step:loading"));

    repository
        .capture
        .capture(request, RequestContext::default())
        .await
        .unwrap();

    let within = events(
        repository
            .queries
            .poll(poll(
                "SimpleEventQuery",
                vec![QueryParameter::new("WD_readPoint", &["urn:site:plant"])],
            ))
            .await
            .unwrap()
            .results,
    );
    assert_eq!(within.len(), 1);
    assert_eq!(within[0].read_point.as_deref(), Some("urn:site:dock"));

    let response = repository
        .queries
        .poll(poll(
            "SimpleMasterDataQuery",
            vec![
                QueryParameter::new("includeAttributes", &["true"]),
                QueryParameter::new("includeChildren", &["true"]),
                QueryParameter::new("EQ_name", &["urn:site:plant"]),
            ],
        ))
        .await
        .unwrap();
    match response.results {
        QueryResults::MasterData(elements) => {
            assert_eq!(elements.len(), 1);
            assert_eq!(elements[0].children, vec!["urn:site:dock".to_string()]);
            assert_eq!(elements[0].attributes.len(), 1);
        }
        QueryResults::Events(_) => panic!("expected master data"),
    }
}

#[tokio::test]
async fn test_subscribe_error_taxonomy() {
    let repository = start_repository();
    let every_minute = || QuerySchedule::parse(Some("0"), None, None, None, None, None).unwrap();

    let relative = repository
        .queries
        .subscribe(Subscription::scheduled("a", "SimpleEventQuery", "/inbox", every_minute()))
        .await;
    assert!(matches!(relative, Err(EpcisError::Validation(_))));

    let not_subscribable = repository
        .queries
        .subscribe(Subscription::scheduled(
            "b",
            "SimpleMasterDataQuery",
            "http://consumer.example/inbox",
            every_minute(),
        ))
        .await;
    assert!(matches!(not_subscribable, Err(EpcisError::SubscribeNotPermitted(_))));

    // Schedules arriving over the wire skip field parsing until subscribe
    let out_of_range: QuerySchedule = serde_json::from_value(serde_json::json!({
        "second": { "source": "99" },
        "minute": { "source": null },
        "hour": { "source": null },
        "day_of_month": { "source": null },
        "month": { "source": null },
        "day_of_week": { "source": null },
    }))
    .unwrap();
    let bad_schedule = repository
        .queries
        .subscribe(Subscription::scheduled(
            "e",
            "SimpleEventQuery",
            "http://consumer.example/inbox",
            out_of_range,
        ))
        .await;
    assert!(matches!(bad_schedule, Err(EpcisError::Validation(_))));

    let mut bad_parameters = Subscription::scheduled(
        "c",
        "SimpleEventQuery",
        "http://consumer.example/inbox",
        every_minute(),
    );
    bad_parameters.parameters = vec![QueryParameter::new("eventCountLimit", &["-3"])];
    let bad_parameters = repository.queries.subscribe(bad_parameters).await;
    assert!(matches!(bad_parameters, Err(EpcisError::QueryParameter(_))));

    let subscription = Subscription::scheduled(
        "d",
        "SimpleEventQuery",
        "http://consumer.example/inbox",
        every_minute(),
    );
    repository.queries.subscribe(subscription.clone()).await.unwrap();
    let duplicate = repository.queries.subscribe(subscription).await;
    assert!(matches!(duplicate, Err(EpcisError::SubscribeNotPermitted(_))));

    assert_eq!(
        repository.queries.subscription_ids("SimpleEventQuery").await.unwrap(),
        vec!["d".to_string()]
    );
    assert_eq!(repository.scheduler.list().await.unwrap(), vec!["d".to_string()]);
}

#[tokio::test]
async fn test_unsubscribe_and_lookup_errors() {
    let repository = start_repository();

    let missing = repository.queries.unsubscribe("never-registered").await;
    assert!(matches!(missing, Err(EpcisError::NoSuchName(_))));

    let unknown_query = repository.queries.subscription_ids("NoSuchQuery").await;
    assert!(matches!(unknown_query, Err(EpcisError::NoSuchName(_))));

    repository
        .queries
        .subscribe(Subscription::triggered(
            "gone",
            "SimpleEventQuery",
            "http://consumer.example/inbox",
            "urn:trigger:new-data",
        ))
        .await
        .unwrap();
    repository.queries.unsubscribe("gone").await.unwrap();

    assert!(repository
        .queries
        .subscription_ids("SimpleEventQuery")
        .await
        .unwrap()
        .is_empty());
    let again = repository.queries.unsubscribe("gone").await;
    assert!(matches!(again, Err(EpcisError::NoSuchName(_))));
}

#[tokio::test]
async fn test_initial_record_time_backfills_existing_requests() {
    let repository = start_repository();
    let before = Utc::now() - ChronoDuration::minutes(1);
    let earlier = capture(&repository, vec![object_event("urn:step:shipping")]).await;

    let mut subscription = Subscription::triggered(
        "backfill",
        "SimpleEventQuery",
        "http://consumer.example/inbox",
        "urn:trigger:new-data",
    );
    subscription.initial_record_time = Some(before);
    subscription.active = false;
    repository.queries.subscribe(subscription).await.unwrap();

    let conn = repository.database.open().unwrap();
    let id = traceflow::storage::subscription_store::find_id(&conn, "backfill")
        .unwrap()
        .unwrap();
    assert_eq!(
        traceflow::storage::subscription_store::pending_request_ids(&conn, id).unwrap(),
        vec![earlier]
    );
}

#[tokio::test]
async fn test_query_names_are_listed() {
    let repository = start_repository();
    assert_eq!(
        repository.queries.query_names(),
        vec!["SimpleEventQuery".to_string(), "SimpleMasterDataQuery".to_string()]
    );
    assert_eq!(repository.queries.standard_version(), "1.2");
    assert_eq!(repository.queries.vendor_version(), env!("CARGO_PKG_VERSION"));
}
