//! Event filter accumulator and two-phase fetch
//!
//! Callers add typed predicates, one ordering and one limit. Nothing touches
//! SQL until [`EventQuery::compile`], which is pure and returns the statement
//! text plus its bound parameters. [`EventQuery::fetch`] then:
//!
//! 1. selects the matching event rows (predicates, ordering, limit)
//! 2. reads every child collection for exactly those events, one batched
//!    read per collection, and attaches children in memory
//!
//! Every existential predicate is its own `EXISTS` sub-select, so two
//! predicates over the same child table may be satisfied by different rows.

use super::masterdata_query::latest_masterdata;
use super::{decode, from_millis, key_pairs, text, MAX_BOUND_PARAMETERS};
use crate::model::{
    BusinessTransaction, CustomField, Epc, EpcType, ErrorDeclaration, Event, EventAction, EventId,
    EventType, FieldType, SourceDestination, SourceDestinationDirection, BUSINESS_LOCATION_TYPE,
    READ_POINT_TYPE,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::collections::HashMap;

/// Scalar event columns predicates and ordering can refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    EventType,
    Action,
    EventTime,
    RecordTime,
    BusinessStep,
    Disposition,
    ReadPoint,
    BusinessLocation,
    EventId,
    TransformationId,
    RequestId,
}

impl EventField {
    pub fn column(&self) -> &'static str {
        match self {
            EventField::EventType => "e.event_type",
            EventField::Action => "e.action",
            EventField::EventTime => "e.event_time",
            EventField::RecordTime => "e.record_time",
            EventField::BusinessStep => "e.business_step",
            EventField::Disposition => "e.disposition",
            EventField::ReadPoint => "e.read_point",
            EventField::BusinessLocation => "e.business_location",
            EventField::EventId => "e.event_id",
            EventField::TransformationId => "e.transformation_id",
            EventField::RequestId => "e.request_id",
        }
    }

    /// Vocabulary type of the master data the field refers to, if fixed
    pub fn masterdata_type(&self) -> Option<&'static str> {
        match self {
            EventField::ReadPoint => Some(READ_POINT_TYPE),
            EventField::BusinessLocation => Some(BUSINESS_LOCATION_TYPE),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparator {
    pub fn sql(&self) -> &'static str {
        match self {
            Comparator::Equal => "=",
            Comparator::Less => "<",
            Comparator::LessOrEqual => "<=",
            Comparator::Greater => ">",
            Comparator::GreaterOrEqual => ">=",
        }
    }
}

/// Typed predicate operand; times are compared as stored epoch millis
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
    Integer(i64),
}

impl FilterValue {
    fn to_sql(&self) -> Value {
        match self {
            FilterValue::Text(value) => text(value),
            FilterValue::Number(value) => Value::Real(*value),
            FilterValue::Time(value) => Value::Integer(value.timestamp_millis()),
            FilterValue::Integer(value) => Value::Integer(*value),
        }
    }

    /// Custom field column holding values of this kind
    fn custom_field_column(&self) -> &'static str {
        match self {
            FilterValue::Text(_) => "cf.text_value",
            FilterValue::Number(_) | FilterValue::Integer(_) => "cf.numeric_value",
            FilterValue::Time(_) => "cf.date_value",
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    fn sql(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASC",
            OrderDirection::Descending => "DESC",
        }
    }
}

/// Names one custom field: where it was declared, its qualified name and
/// whether it is a top-level field or an inner one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomFieldSelector {
    pub field_type: FieldType,
    pub namespace: String,
    pub name: String,
    pub inner: bool,
}

impl CustomFieldSelector {
    pub fn new(
        field_type: FieldType,
        namespace: impl Into<String>,
        name: impl Into<String>,
        inner: bool,
    ) -> Self {
        Self {
            field_type,
            namespace: namespace.into(),
            name: name.into(),
            inner,
        }
    }

    fn sql(&self, params: &mut Vec<Value>) -> String {
        params.push(text(self.field_type.as_str()));
        params.push(text(&self.namespace));
        params.push(text(&self.name));
        let nesting = if self.inner {
            "cf.parent_index IS NOT NULL"
        } else {
            "cf.parent_index IS NULL"
        };
        format!(
            "cf.field_type = ? AND cf.namespace = ? AND cf.name = ? AND {}",
            nesting
        )
    }
}

/// One conjunct of an event query
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    FieldIn {
        field: EventField,
        values: Vec<FilterValue>,
    },
    FieldCompare {
        field: EventField,
        comparator: Comparator,
        value: FilterValue,
    },
    BusinessTransactionIn {
        transaction_type: String,
        ids: Vec<String>,
    },
    SourceDestinationIn {
        direction: SourceDestinationDirection,
        sd_type: String,
        ids: Vec<String>,
    },
    /// Type and value are checked on the same EPC row
    EpcMatches {
        epc_types: Vec<EpcType>,
        values: Vec<String>,
    },
    ErrorDeclarationExists,
    ErrorReasonIn(Vec<String>),
    CorrectiveEventIdIn(Vec<String>),
    /// Field equals one of the ids or one of their descendants
    MasterDataHierarchyContains {
        field: EventField,
        ids: Vec<String>,
    },
    CustomFieldIn {
        selector: CustomFieldSelector,
        values: Vec<String>,
    },
    CustomFieldCompare {
        selector: CustomFieldSelector,
        comparator: Comparator,
        value: FilterValue,
    },
    CustomFieldExists(CustomFieldSelector),
    EpcQuantityCompare {
        comparator: Comparator,
        quantity: f64,
    },
    MasterDataAttributeIn {
        field: EventField,
        attribute: String,
        values: Vec<String>,
    },
    MasterDataHasAttribute {
        field: EventField,
        attributes: Vec<String>,
    },
    RequestIdIn(Vec<i64>),
    /// Still pending for a subscription, up to and including a request id
    PendingFor {
        subscription: i64,
        through_request: i64,
    },
}

/// `?, ?, ?` for `count` values
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn push_texts(params: &mut Vec<Value>, values: &[String]) -> String {
    params.extend(values.iter().map(|v| text(v)));
    placeholders(values.len())
}

/// `WITH RECURSIVE` sub-select yielding the ids and all their descendants
pub(crate) fn descendants_sql(md_type: Option<&str>, ids: &[String], params: &mut Vec<Value>) -> String {
    let seeds = ids
        .iter()
        .map(|id| {
            params.push(text(id));
            "(?)"
        })
        .collect::<Vec<_>>()
        .join(", ");

    let type_filter = match md_type {
        Some(md_type) => {
            params.push(text(md_type));
            "AND h.md_type = ?"
        }
        None => "",
    };

    format!(
        "WITH RECURSIVE descendants(id) AS (VALUES {seeds} \
         UNION SELECT h.child_id FROM masterdata_hierarchy h JOIN descendants d ON h.parent_id = d.id \
         WHERE {latest} {type_filter}) \
         SELECT id FROM descendants",
        latest = latest_hierarchy_link("h"),
    )
}

/// Only links recorded by the latest capture of the parent element
fn latest_hierarchy_link(alias: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM masterdata newer WHERE newer.md_type = {a}.md_type \
         AND newer.md_id = {a}.parent_id \
         AND (newer.request_id > {a}.request_id \
         OR (newer.request_id = {a}.request_id AND newer.md_index > {a}.md_index)))",
        a = alias
    )
}

impl Predicate {
    fn sql(&self, params: &mut Vec<Value>) -> String {
        const SAME_EVENT: &str = "request_id = e.request_id AND {t}.event_index = e.event_index";
        let child = |table: &str, alias: &str| {
            format!(
                "SELECT 1 FROM {table} {alias} WHERE {alias}.{}",
                SAME_EVENT.replace("{t}", alias)
            )
        };

        match self {
            Predicate::FieldIn { field, values } => {
                params.extend(values.iter().map(FilterValue::to_sql));
                format!("{} IN ({})", field.column(), placeholders(values.len()))
            }
            Predicate::FieldCompare {
                field,
                comparator,
                value,
            } => {
                params.push(value.to_sql());
                format!("{} {} ?", field.column(), comparator.sql())
            }
            Predicate::BusinessTransactionIn {
                transaction_type,
                ids,
            } => {
                params.push(text(transaction_type));
                format!(
                    "EXISTS ({} AND bt.transaction_type = ? AND bt.transaction_id IN ({}))",
                    child("business_transaction", "bt"),
                    push_texts(params, ids)
                )
            }
            Predicate::SourceDestinationIn {
                direction,
                sd_type,
                ids,
            } => {
                params.push(text(direction.as_str()));
                params.push(text(sd_type));
                format!(
                    "EXISTS ({} AND sd.direction = ? AND sd.sd_type = ? AND sd.sd_id IN ({}))",
                    child("source_destination", "sd"),
                    push_texts(params, ids)
                )
            }
            Predicate::EpcMatches { epc_types, values } => {
                params.extend(epc_types.iter().map(|t| text(t.as_str())));
                let types = placeholders(epc_types.len());
                format!(
                    "EXISTS ({} AND ep.epc_type IN ({}) AND ep.value IN ({}))",
                    child("epc", "ep"),
                    types,
                    push_texts(params, values)
                )
            }
            Predicate::ErrorDeclarationExists => {
                format!("EXISTS ({})", child("error_declaration", "ed"))
            }
            Predicate::ErrorReasonIn(reasons) => format!(
                "EXISTS ({} AND ed.reason IN ({}))",
                child("error_declaration", "ed"),
                push_texts(params, reasons)
            ),
            Predicate::CorrectiveEventIdIn(ids) => format!(
                "EXISTS ({} AND ce.corrective_event_id IN ({}))",
                child("corrective_event_id", "ce"),
                push_texts(params, ids)
            ),
            Predicate::MasterDataHierarchyContains { field, ids } => format!(
                "{} IN ({})",
                field.column(),
                descendants_sql(field.masterdata_type(), ids, params)
            ),
            Predicate::CustomFieldIn { selector, values } => {
                let selector = selector.sql(params);
                format!(
                    "EXISTS ({} AND {} AND cf.text_value IN ({}))",
                    child("custom_field", "cf"),
                    selector,
                    push_texts(params, values)
                )
            }
            Predicate::CustomFieldCompare {
                selector,
                comparator,
                value,
            } => {
                let selector = selector.sql(params);
                params.push(value.to_sql());
                format!(
                    "EXISTS ({} AND {} AND {} {} ?)",
                    child("custom_field", "cf"),
                    selector,
                    value.custom_field_column(),
                    comparator.sql()
                )
            }
            Predicate::CustomFieldExists(selector) => {
                let selector = selector.sql(params);
                format!("EXISTS ({} AND {})", child("custom_field", "cf"), selector)
            }
            Predicate::EpcQuantityCompare {
                comparator,
                quantity,
            } => {
                params.push(Value::Real(*quantity));
                format!(
                    "EXISTS ({} AND q.is_quantity = 1 AND q.quantity {} ?)",
                    child("epc", "q"),
                    comparator.sql()
                )
            }
            Predicate::MasterDataAttributeIn {
                field,
                attribute,
                values,
            } => {
                let element = masterdata_element(*field, params);
                params.push(text(attribute));
                format!(
                    "EXISTS ({} AND a.attribute_id = ? AND a.value IN ({}))",
                    element,
                    push_texts(params, values)
                )
            }
            Predicate::MasterDataHasAttribute { field, attributes } => {
                let element = masterdata_element(*field, params);
                format!(
                    "EXISTS ({} AND a.attribute_id IN ({}))",
                    element,
                    push_texts(params, attributes)
                )
            }
            Predicate::RequestIdIn(ids) => {
                params.extend(ids.iter().map(|id| Value::Integer(*id)));
                format!("e.request_id IN ({})", placeholders(ids.len()))
            }
            Predicate::PendingFor {
                subscription,
                through_request,
            } => {
                params.push(Value::Integer(*subscription));
                params.push(Value::Integer(*through_request));
                "e.request_id IN (SELECT p.request_id FROM pending_request p \
                 WHERE p.subscription_id = ? AND p.request_id <= ?)"
                    .to_string()
            }
        }
    }
}

/// Attribute rows of the latest master data element the field refers to
fn masterdata_element(field: EventField, params: &mut Vec<Value>) -> String {
    let type_filter = match field.masterdata_type() {
        Some(md_type) => {
            params.push(text(md_type));
            "m.md_type = ? AND "
        }
        None => "",
    };
    format!(
        "SELECT 1 FROM masterdata m \
         JOIN masterdata_attribute a ON a.request_id = m.request_id AND a.md_index = m.md_index \
         WHERE {}m.md_id = {} AND {}",
        type_filter,
        field.column(),
        latest_masterdata("m")
    )
}

/// Statement text with its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

const EVENT_COLUMNS: &str = "e.request_id, e.event_index, e.event_type, e.event_time, e.record_time, \
     e.event_timezone_offset, e.action, e.business_step, e.disposition, e.read_point, \
     e.business_location, e.event_id, e.transformation_id";

/// Conjunctive event query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    predicates: Vec<Predicate>,
    order_by: Option<(EventField, OrderDirection)>,
    limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn push(&mut self, predicate: Predicate) -> &mut Self {
        self.predicates.push(predicate);
        self
    }

    pub fn where_field_in(&mut self, field: EventField, values: Vec<FilterValue>) -> &mut Self {
        self.push(Predicate::FieldIn { field, values })
    }

    pub fn where_field(
        &mut self,
        field: EventField,
        comparator: Comparator,
        value: FilterValue,
    ) -> &mut Self {
        self.push(Predicate::FieldCompare {
            field,
            comparator,
            value,
        })
    }

    pub fn where_business_transaction(
        &mut self,
        transaction_type: impl Into<String>,
        ids: Vec<String>,
    ) -> &mut Self {
        self.push(Predicate::BusinessTransactionIn {
            transaction_type: transaction_type.into(),
            ids,
        })
    }

    pub fn where_source_destination(
        &mut self,
        direction: SourceDestinationDirection,
        sd_type: impl Into<String>,
        ids: Vec<String>,
    ) -> &mut Self {
        self.push(Predicate::SourceDestinationIn {
            direction,
            sd_type: sd_type.into(),
            ids,
        })
    }

    pub fn where_epc(&mut self, epc_types: &[EpcType], values: Vec<String>) -> &mut Self {
        self.push(Predicate::EpcMatches {
            epc_types: epc_types.to_vec(),
            values,
        })
    }

    pub fn where_error_declaration_exists(&mut self) -> &mut Self {
        self.push(Predicate::ErrorDeclarationExists)
    }

    pub fn where_error_reason_in(&mut self, reasons: Vec<String>) -> &mut Self {
        self.push(Predicate::ErrorReasonIn(reasons))
    }

    pub fn where_corrective_event_id_in(&mut self, ids: Vec<String>) -> &mut Self {
        self.push(Predicate::CorrectiveEventIdIn(ids))
    }

    pub fn where_within_hierarchy(&mut self, field: EventField, ids: Vec<String>) -> &mut Self {
        self.push(Predicate::MasterDataHierarchyContains { field, ids })
    }

    pub fn where_custom_field_in(
        &mut self,
        selector: CustomFieldSelector,
        values: Vec<String>,
    ) -> &mut Self {
        self.push(Predicate::CustomFieldIn { selector, values })
    }

    pub fn where_custom_field(
        &mut self,
        selector: CustomFieldSelector,
        comparator: Comparator,
        value: FilterValue,
    ) -> &mut Self {
        self.push(Predicate::CustomFieldCompare {
            selector,
            comparator,
            value,
        })
    }

    pub fn where_custom_field_exists(&mut self, selector: CustomFieldSelector) -> &mut Self {
        self.push(Predicate::CustomFieldExists(selector))
    }

    pub fn where_quantity(&mut self, comparator: Comparator, quantity: f64) -> &mut Self {
        self.push(Predicate::EpcQuantityCompare {
            comparator,
            quantity,
        })
    }

    pub fn where_masterdata_attribute_in(
        &mut self,
        field: EventField,
        attribute: impl Into<String>,
        values: Vec<String>,
    ) -> &mut Self {
        self.push(Predicate::MasterDataAttributeIn {
            field,
            attribute: attribute.into(),
            values,
        })
    }

    pub fn where_masterdata_has_attribute(
        &mut self,
        field: EventField,
        attributes: Vec<String>,
    ) -> &mut Self {
        self.push(Predicate::MasterDataHasAttribute { field, attributes })
    }

    pub fn where_request_id_in(&mut self, ids: Vec<i64>) -> &mut Self {
        self.push(Predicate::RequestIdIn(ids))
    }

    pub fn where_pending_for(&mut self, subscription: i64, through_request: i64) -> &mut Self {
        self.push(Predicate::PendingFor {
            subscription,
            through_request,
        })
    }

    pub fn order_by(&mut self, field: EventField, direction: OrderDirection) -> &mut Self {
        self.order_by = Some((field, direction));
        self
    }

    /// `0` means unbounded
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Phase 1 statement: matching event rows, ordered and limited
    pub fn compile(&self) -> CompiledQuery {
        let mut params = Vec::new();

        let conditions: Vec<String> = self.predicates.iter().map(|p| p.sql(&mut params)).collect();
        let where_clause = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };

        let order = match self.order_by {
            Some((field, direction)) => format!(
                "{} {}, e.request_id, e.event_index",
                field.column(),
                direction.sql()
            ),
            None => "e.request_id, e.event_index".to_string(),
        };

        params.push(Value::Integer(
            self.limit
                .and_then(|l| i64::try_from(l).ok())
                .unwrap_or(i64::MAX),
        ));

        CompiledQuery {
            sql: format!(
                "SELECT {} FROM event e WHERE {} ORDER BY {} LIMIT ?",
                EVENT_COLUMNS, where_clause, order
            ),
            params,
        }
    }

    /// Run both phases and return fully populated events in phase 1 order
    pub fn fetch(&self, conn: &Connection) -> rusqlite::Result<Vec<Event>> {
        let compiled = self.compile();
        log::debug!(
            "🔍 Event query: {} predicates, limit {:?}",
            self.predicates.len(),
            self.limit
        );

        let mut stmt = conn.prepare(&compiled.sql)?;
        let mut events = stmt
            .query_map(params_from_iter(compiled.params.iter()), read_event)?
            .collect::<rusqlite::Result<Vec<Event>>>()?;

        if events.is_empty() {
            return Ok(events);
        }

        attach_children(conn, &mut events)?;
        Ok(events)
    }
}

fn read_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type = decode(2, row.get(2)?, EventType::parse)?;
    let action = match row.get::<_, Option<String>>(6)? {
        Some(code) => Some(decode(6, code, EventAction::parse)?),
        None => None,
    };

    let mut event = Event::new(event_type, from_millis(row.get(3)?), action);
    event.id = Some(EventId {
        request_id: row.get(0)?,
        event_index: row.get(1)?,
    });
    event.record_time = Some(from_millis(row.get(4)?));
    event.event_timezone_offset = row.get(5)?;
    event.business_step = row.get(7)?;
    event.disposition = row.get(8)?;
    event.read_point = row.get(9)?;
    event.business_location = row.get(10)?;
    event.event_id = row.get(11)?;
    event.transformation_id = row.get(12)?;
    Ok(event)
}

/// Phase 2: one batched read per child table, chunked by key count
fn attach_children(conn: &Connection, events: &mut [Event]) -> rusqlite::Result<()> {
    let positions: HashMap<EventId, usize> = events
        .iter()
        .enumerate()
        .filter_map(|(position, event)| event.id.map(|id| (id, position)))
        .collect();
    let keys: Vec<(i64, i64)> = events
        .iter()
        .filter_map(|e| e.id.map(|id| (id.request_id, id.event_index)))
        .collect();

    for chunk in keys.chunks(MAX_BOUND_PARAMETERS / 2) {
        read_children(
            conn,
            "SELECT request_id, event_index, epc_type, value, quantity, unit_of_measure \
             FROM epc WHERE (request_id, event_index) IN (VALUES {keys}) \
             ORDER BY request_id, event_index, epc_index",
            chunk,
            |row| {
                Ok(Epc {
                    epc_type: decode(2, row.get(2)?, EpcType::parse)?,
                    value: row.get(3)?,
                    quantity: row.get(4)?,
                    unit_of_measure: row.get(5)?,
                })
            },
            |id, epc| {
                if let Some(&position) = positions.get(&id) {
                    events[position].epcs.push(epc);
                }
            },
        )?;

        let mut fields: Vec<(EventId, i64, Option<i64>, CustomField)> = Vec::new();
        read_children(
            conn,
            "SELECT request_id, event_index, field_index, parent_index, field_type, namespace, name, \
             text_value, numeric_value, date_value \
             FROM custom_field WHERE (request_id, event_index) IN (VALUES {keys}) \
             ORDER BY request_id, event_index, field_index",
            chunk,
            |row| {
                let field = CustomField {
                    field_type: decode(4, row.get(4)?, FieldType::parse)?,
                    namespace: row.get(5)?,
                    name: row.get(6)?,
                    text_value: row.get(7)?,
                    numeric_value: row.get(8)?,
                    date_value: row.get::<_, Option<i64>>(9)?.map(from_millis),
                    children: Vec::new(),
                };
                Ok((row.get::<_, i64>(2)?, row.get::<_, Option<i64>>(3)?, field))
            },
            |id, (field_index, parent_index, field)| {
                fields.push((id, field_index, parent_index, field))
            },
        )?;
        attach_custom_fields(events, &positions, fields);

        read_children(
            conn,
            "SELECT request_id, event_index, transaction_type, transaction_id \
             FROM business_transaction WHERE (request_id, event_index) IN (VALUES {keys}) \
             ORDER BY request_id, event_index, transaction_index",
            chunk,
            |row| {
                Ok(BusinessTransaction {
                    transaction_type: row.get(2)?,
                    id: row.get(3)?,
                })
            },
            |id, transaction| {
                if let Some(&position) = positions.get(&id) {
                    events[position].business_transactions.push(transaction);
                }
            },
        )?;

        read_children(
            conn,
            "SELECT request_id, event_index, direction, sd_type, sd_id \
             FROM source_destination WHERE (request_id, event_index) IN (VALUES {keys}) \
             ORDER BY request_id, event_index, sd_index",
            chunk,
            |row| {
                Ok(SourceDestination {
                    direction: decode(2, row.get(2)?, SourceDestinationDirection::parse)?,
                    sd_type: row.get(3)?,
                    id: row.get(4)?,
                })
            },
            |id, sd| {
                if let Some(&position) = positions.get(&id) {
                    events[position].source_destinations.push(sd);
                }
            },
        )?;

        read_children(
            conn,
            "SELECT request_id, event_index, declaration_time, reason \
             FROM error_declaration WHERE (request_id, event_index) IN (VALUES {keys})",
            chunk,
            |row| {
                Ok(ErrorDeclaration {
                    declaration_time: from_millis(row.get(2)?),
                    reason: row.get(3)?,
                    corrective_event_ids: Vec::new(),
                })
            },
            |id, declaration| {
                if let Some(&position) = positions.get(&id) {
                    events[position].error_declaration = Some(declaration);
                }
            },
        )?;

        read_children(
            conn,
            "SELECT request_id, event_index, corrective_event_id \
             FROM corrective_event_id WHERE (request_id, event_index) IN (VALUES {keys}) \
             ORDER BY request_id, event_index, corrective_index",
            chunk,
            |row| row.get::<_, String>(2),
            |id, corrective| {
                let declaration = positions
                    .get(&id)
                    .and_then(|&position| events[position].error_declaration.as_mut());
                if let Some(declaration) = declaration {
                    declaration.corrective_event_ids.push(corrective);
                }
            },
        )?;
    }

    Ok(())
}

/// Run one child read for a chunk of event keys, handing each row to `attach`
fn read_children<T>(
    conn: &Connection,
    sql_template: &str,
    keys: &[(i64, i64)],
    read: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
    mut attach: impl FnMut(EventId, T),
) -> rusqlite::Result<()> {
    let mut params = Vec::with_capacity(keys.len() * 2);
    let sql = sql_template.replace("{keys}", &key_pairs(keys, &mut params));

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let id = EventId {
            request_id: row.get(0)?,
            event_index: row.get(1)?,
        };
        attach(id, read(row)?);
    }
    Ok(())
}

/// Rebuild the one-level custom field tree; parents precede their children
fn attach_custom_fields(
    events: &mut [Event],
    positions: &HashMap<EventId, usize>,
    fields: Vec<(EventId, i64, Option<i64>, CustomField)>,
) {
    let mut parents: HashMap<(EventId, i64), usize> = HashMap::new();

    for (id, field_index, parent_index, field) in fields {
        let Some(&position) = positions.get(&id) else {
            continue;
        };
        let custom_fields = &mut events[position].custom_fields;

        match parent_index.and_then(|parent| parents.get(&(id, parent)).copied()) {
            Some(parent) => custom_fields[parent].children.push(field),
            None => {
                parents.insert((id, field_index), custom_fields.len());
                custom_fields.push(field);
            }
        }
    }
}
