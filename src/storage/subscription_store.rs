//! Persisted subscriptions and their pending requests
//!
//! A pending row `(subscription, request)` means the request has not yet been
//! delivered to that subscription. Capture inserts the rows, a successful
//! delivery deletes exactly the ones it covered.

use super::{from_millis, to_millis};
use crate::model::{QueryParameter, QuerySchedule, Subscription, SubscriptionTrigger};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

const SUBSCRIPTION_COLUMNS: &str = "id, subscription_id, query_name, destination, active, \
     report_if_empty, initial_record_time, trigger_uri, schedule_seconds, schedule_minutes, \
     schedule_hours, schedule_day_of_month, schedule_month, schedule_day_of_week";

/// Persist a subscription with its parameters and return the storage id
///
/// With an initial record time, requests already recorded at or after it
/// start out pending.
pub fn insert(conn: &mut Connection, subscription: &Subscription) -> rusqlite::Result<i64> {
    let tx = conn.transaction()?;

    let (trigger_uri, schedule) = match &subscription.trigger {
        SubscriptionTrigger::DataInsert(uri) => (Some(uri.as_str()), None),
        SubscriptionTrigger::Schedule(schedule) => (None, Some(schedule)),
    };
    let fields: [Option<&str>; 6] = match schedule {
        Some(s) => [
            s.second.source(),
            s.minute.source(),
            s.hour.source(),
            s.day_of_month.source(),
            s.month.source(),
            s.day_of_week.source(),
        ],
        None => [None; 6],
    };

    tx.execute(
        "INSERT INTO subscription
         (subscription_id, query_name, destination, active, report_if_empty, initial_record_time,
          trigger_uri, schedule_seconds, schedule_minutes, schedule_hours, schedule_day_of_month,
          schedule_month, schedule_day_of_week)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            subscription.subscription_id,
            subscription.query_name,
            subscription.destination,
            subscription.active,
            subscription.report_if_empty,
            subscription.initial_record_time.map(to_millis),
            trigger_uri,
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            fields[4],
            fields[5],
        ],
    )?;
    let id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO subscription_parameter (subscription_id, parameter_index, value_index, name, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (parameter_index, parameter) in subscription.parameters.iter().enumerate() {
            for (value_index, value) in parameter.values.iter().enumerate() {
                stmt.execute(params![
                    id,
                    parameter_index as i64,
                    value_index as i64,
                    parameter.name,
                    value
                ])?;
            }
        }
    }

    if let Some(initial) = subscription.initial_record_time {
        let marked = tx.execute(
            "INSERT INTO pending_request (subscription_id, request_id)
             SELECT ?1, id FROM request WHERE record_time >= ?2",
            params![id, to_millis(initial)],
        )?;
        log::debug!(
            "   ├─ Subscription {} starts with {} pending requests",
            subscription.subscription_id,
            marked
        );
    }

    tx.commit()?;
    Ok(id)
}

pub fn find_id(conn: &Connection, subscription_id: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM subscription WHERE subscription_id = ?1",
        [subscription_id],
        |row| row.get(0),
    )
    .optional()
}

/// All persisted subscriptions with their parameters, in creation order
pub fn list(conn: &Connection) -> rusqlite::Result<Vec<Subscription>> {
    let mut parameters = load_parameters(conn)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM subscription ORDER BY id",
        SUBSCRIPTION_COLUMNS
    ))?;
    let mut subscriptions = stmt
        .query_map([], read_subscription)?
        .collect::<rusqlite::Result<Vec<Subscription>>>()?;

    for subscription in &mut subscriptions {
        if let Some(id) = subscription.id {
            subscription.parameters = parameters.remove(&id).unwrap_or_default();
        }
    }
    Ok(subscriptions)
}

pub fn list_ids_for_query(conn: &Connection, query_name: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT subscription_id FROM subscription WHERE query_name = ?1 ORDER BY id",
    )?;
    let ids = stmt
        .query_map([query_name], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Delete a subscription; parameters and pending rows cascade
pub fn delete(conn: &Connection, subscription_id: &str) -> rusqlite::Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM subscription WHERE subscription_id = ?1",
        [subscription_id],
    )?;
    Ok(deleted > 0)
}

pub fn pending_request_ids(conn: &Connection, id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT request_id FROM pending_request WHERE subscription_id = ?1 ORDER BY request_id",
    )?;
    let ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Pending requests of one subscription, bounded by the highest request id
/// seen when the scope was read
///
/// Queries and acknowledgments go through the same bound, so requests
/// captured after the read stay pending whatever the backlog size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingScope {
    pub subscription: i64,
    pub through_request: i64,
    pub count: usize,
}

impl PendingScope {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub fn pending_scope(conn: &Connection, id: i64) -> rusqlite::Result<PendingScope> {
    conn.query_row(
        "SELECT COALESCE(MAX(request_id), 0), COUNT(*) FROM pending_request WHERE subscription_id = ?1",
        [id],
        |row| {
            Ok(PendingScope {
                subscription: id,
                through_request: row.get(0)?,
                count: row.get::<_, i64>(1)? as usize,
            })
        },
    )
}

/// Remove the pending rows covered by `scope`; rows added since stay pending
pub fn acknowledge(conn: &Connection, scope: PendingScope) -> rusqlite::Result<usize> {
    if scope.is_empty() {
        return Ok(0);
    }

    conn.execute(
        "DELETE FROM pending_request WHERE subscription_id = ?1 AND request_id <= ?2",
        params![scope.subscription, scope.through_request],
    )
}

fn load_parameters(conn: &Connection) -> rusqlite::Result<HashMap<i64, Vec<QueryParameter>>> {
    let mut stmt = conn.prepare(
        "SELECT subscription_id, parameter_index, name, value FROM subscription_parameter
         ORDER BY subscription_id, parameter_index, value_index",
    )?;
    let mut rows = stmt.query([])?;

    let mut parameters: HashMap<i64, Vec<QueryParameter>> = HashMap::new();
    let mut last: Option<(i64, i64)> = None;
    while let Some(row) = rows.next()? {
        let subscription: i64 = row.get(0)?;
        let index: i64 = row.get(1)?;
        let name: String = row.get(2)?;
        let value: String = row.get(3)?;

        let list = parameters.entry(subscription).or_default();
        if last == Some((subscription, index)) {
            if let Some(parameter) = list.last_mut() {
                parameter.values.push(value);
            }
        } else {
            list.push(QueryParameter {
                name,
                values: vec![value],
            });
        }
        last = Some((subscription, index));
    }
    Ok(parameters)
}

fn read_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    let trigger_uri: Option<String> = row.get(7)?;
    let trigger = match trigger_uri {
        Some(uri) => SubscriptionTrigger::DataInsert(uri),
        None => {
            let field = |index: usize| row.get::<_, Option<String>>(index);
            let schedule = QuerySchedule::parse(
                field(8)?.as_deref(),
                field(9)?.as_deref(),
                field(10)?.as_deref(),
                field(11)?.as_deref(),
                field(12)?.as_deref(),
                field(13)?.as_deref(),
            )
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
            SubscriptionTrigger::Schedule(schedule)
        }
    };

    Ok(Subscription {
        id: Some(row.get(0)?),
        subscription_id: row.get(1)?,
        query_name: row.get(2)?,
        parameters: Vec::new(),
        destination: row.get(3)?,
        active: row.get(4)?,
        report_if_empty: row.get(5)?,
        initial_record_time: row.get::<_, Option<i64>>(6)?.map(from_millis),
        trigger,
    })
}
