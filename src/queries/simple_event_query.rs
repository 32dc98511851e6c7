//! `SimpleEventQuery`: the standard event query
//!
//! Each parameter maps onto one predicate of [`EventQuery`]. Building the
//! query is also how parameters are validated, so validation and execution
//! can never disagree.

use super::parameters::{count, each, invalid, number, single, time};
use super::EpcisQuery;
use crate::error::{EpcisError, Result};
use crate::model::{
    EpcType, EventAction, EventType, FieldType, QueryParameter, QueryResults,
    SourceDestinationDirection,
};
use crate::storage::subscription_store::PendingScope;
use crate::storage::{Comparator, CustomFieldSelector, EventField, EventQuery, FilterValue, OrderDirection};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub struct SimpleEventQuery;

/// Parsed form of a parameter list
#[derive(Debug)]
struct EventQueryPlan {
    query: EventQuery,
    max_event_count: Option<usize>,
}

const QUANTITY_TYPES: [EpcType; 4] = [
    EpcType::Quantity,
    EpcType::ChildQuantity,
    EpcType::InputQuantity,
    EpcType::OutputQuantity,
];

fn epc_types(name: &str) -> Option<&'static [EpcType]> {
    let types: &'static [EpcType] = match name {
        "MATCH_epc" => &[EpcType::List, EpcType::ChildEpc],
        "MATCH_parentID" => &[EpcType::ParentId],
        "MATCH_inputEPC" => &[EpcType::InputEpc],
        "MATCH_outputEPC" => &[EpcType::OutputEpc],
        "MATCH_anyEPC" => &[
            EpcType::List,
            EpcType::ChildEpc,
            EpcType::ParentId,
            EpcType::InputEpc,
            EpcType::OutputEpc,
        ],
        "MATCH_epcClass" => &[EpcType::Quantity, EpcType::ChildQuantity],
        "MATCH_inputEPCClass" => &[EpcType::InputQuantity],
        "MATCH_outputEPCClass" => &[EpcType::OutputQuantity],
        "MATCH_anyEPCClass" => &QUANTITY_TYPES,
        _ => return None,
    };
    Some(types)
}

fn comparator(prefix: &str) -> Option<Comparator> {
    match prefix {
        "EQ" => Some(Comparator::Equal),
        "GT" => Some(Comparator::Greater),
        "GE" => Some(Comparator::GreaterOrEqual),
        "LT" => Some(Comparator::Less),
        "LE" => Some(Comparator::LessOrEqual),
        _ => None,
    }
}

/// Event field named in `EQATTR_` / `HASATTR_` parameters
fn attribute_field(name: &str) -> Option<EventField> {
    match name {
        "bizStep" => Some(EventField::BusinessStep),
        "disposition" => Some(EventField::Disposition),
        "readPoint" => Some(EventField::ReadPoint),
        "bizLocation" => Some(EventField::BusinessLocation),
        _ => None,
    }
}

/// `[INNER_][ILMD_]<namespace>#<name>`
fn custom_field_selector(rest: &str) -> Option<CustomFieldSelector> {
    let (inner, rest) = match rest.strip_prefix("INNER_") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (field_type, rest) = match rest.strip_prefix("ILMD_") {
        Some(rest) => (FieldType::Ilmd, rest),
        None => (FieldType::Extension, rest),
    };
    let (namespace, name) = rest.rsplit_once('#')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(CustomFieldSelector::new(field_type, namespace, name, inner))
}

/// Number first, then timestamp; anything else is rejected
fn comparable(parameter: &QueryParameter) -> Result<FilterValue> {
    let value = single(parameter)?;
    if let Ok(number) = value.parse::<f64>() {
        return Ok(FilterValue::Number(number));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| FilterValue::Time(t.with_timezone(&Utc)))
        .map_err(|_| invalid(parameter, "expects a number or an RFC 3339 timestamp"))
}

fn texts(parameter: &QueryParameter) -> Vec<String> {
    parameter.values.clone()
}

fn text_values(parameter: &QueryParameter) -> Vec<FilterValue> {
    parameter.values.iter().map(|v| FilterValue::from(v.as_str())).collect()
}

impl EventQueryPlan {
    fn build(parameters: &[QueryParameter]) -> Result<Self> {
        let mut query = EventQuery::new();
        let mut order_field = None;
        let mut order_direction = None;
        let mut event_count_limit = None;
        let mut max_event_count = None;

        for parameter in parameters {
            let name = parameter.name.as_str();

            match name {
                "eventType" => {
                    let types = each(parameter, EventType::parse, "an event type")?;
                    query.where_field_in(
                        EventField::EventType,
                        types.iter().map(|t| FilterValue::from(t.as_str())).collect(),
                    );
                }
                "GE_eventTime" => {
                    query.where_field(EventField::EventTime, Comparator::GreaterOrEqual, FilterValue::Time(time(parameter)?));
                }
                "LT_eventTime" => {
                    query.where_field(EventField::EventTime, Comparator::Less, FilterValue::Time(time(parameter)?));
                }
                "GE_recordTime" => {
                    query.where_field(EventField::RecordTime, Comparator::GreaterOrEqual, FilterValue::Time(time(parameter)?));
                }
                "LT_recordTime" => {
                    query.where_field(EventField::RecordTime, Comparator::Less, FilterValue::Time(time(parameter)?));
                }
                "EQ_action" => {
                    let actions = each(parameter, EventAction::parse, "ADD, OBSERVE or DELETE")?;
                    query.where_field_in(
                        EventField::Action,
                        actions.iter().map(|a| FilterValue::from(a.as_str())).collect(),
                    );
                }
                "EQ_bizStep" => {
                    query.where_field_in(EventField::BusinessStep, text_values(parameter));
                }
                "EQ_disposition" => {
                    query.where_field_in(EventField::Disposition, text_values(parameter));
                }
                "EQ_readPoint" => {
                    query.where_field_in(EventField::ReadPoint, text_values(parameter));
                }
                "EQ_bizLocation" => {
                    query.where_field_in(EventField::BusinessLocation, text_values(parameter));
                }
                "EQ_transformationID" => {
                    query.where_field_in(EventField::TransformationId, text_values(parameter));
                }
                "EQ_eventID" => {
                    query.where_field_in(EventField::EventId, text_values(parameter));
                }
                "WD_readPoint" => {
                    query.where_within_hierarchy(EventField::ReadPoint, texts(parameter));
                }
                "WD_bizLocation" => {
                    query.where_within_hierarchy(EventField::BusinessLocation, texts(parameter));
                }
                "EXISTS_errorDeclaration" => {
                    query.where_error_declaration_exists();
                }
                "EQ_errorReason" => {
                    query.where_error_reason_in(texts(parameter));
                }
                "EQ_correctiveEventID" => {
                    query.where_corrective_event_id_in(texts(parameter));
                }
                "EQ_quantity" | "GT_quantity" | "GE_quantity" | "LT_quantity" | "LE_quantity" => {
                    let prefix = &name[..2];
                    let comparator = comparator(prefix).ok_or_else(|| invalid(parameter, "unknown comparator"))?;
                    query.where_quantity(comparator, number(parameter)?);
                }
                "orderBy" => {
                    order_field = Some(match single(parameter)? {
                        "eventTime" => EventField::EventTime,
                        "recordTime" => EventField::RecordTime,
                        _ => return Err(invalid(parameter, "expects eventTime or recordTime")),
                    });
                }
                "orderDirection" => {
                    order_direction = Some(match single(parameter)? {
                        "ASC" => OrderDirection::Ascending,
                        "DESC" => OrderDirection::Descending,
                        _ => return Err(invalid(parameter, "expects ASC or DESC")),
                    });
                }
                "eventCountLimit" => event_count_limit = Some(count(parameter)?),
                "maxEventCount" => max_event_count = Some(count(parameter)?),
                _ => Self::prefixed(&mut query, parameter)?,
            }
        }

        if event_count_limit.is_some() && max_event_count.is_some() {
            return Err(EpcisError::QueryParameter(
                "eventCountLimit and maxEventCount cannot be combined".to_string(),
            ));
        }

        // orderDirection alone has no effect
        if let Some(field) = order_field {
            query.order_by(field, order_direction.unwrap_or(OrderDirection::Descending));
        }

        if let Some(limit) = event_count_limit {
            query.set_limit(limit);
        }
        if let Some(max) = max_event_count {
            // One extra row tells "exactly max" apart from "more than max"
            let limit = max.checked_add(1).ok_or_else(|| {
                EpcisError::QueryParameter("maxEventCount is out of range".to_string())
            })?;
            query.set_limit(limit);
        }

        Ok(Self {
            query,
            max_event_count,
        })
    }

    /// Parameters whose name embeds a type, field or attribute
    fn prefixed(query: &mut EventQuery, parameter: &QueryParameter) -> Result<()> {
        let name = parameter.name.as_str();

        if let Some(types) = epc_types(name) {
            query.where_epc(types, texts(parameter));
            return Ok(());
        }
        if let Some(transaction_type) = name.strip_prefix("EQ_bizTransaction_") {
            query.where_business_transaction(transaction_type, texts(parameter));
            return Ok(());
        }
        if let Some(sd_type) = name.strip_prefix("EQ_source_") {
            query.where_source_destination(SourceDestinationDirection::Source, sd_type, texts(parameter));
            return Ok(());
        }
        if let Some(sd_type) = name.strip_prefix("EQ_destination_") {
            query.where_source_destination(
                SourceDestinationDirection::Destination,
                sd_type,
                texts(parameter),
            );
            return Ok(());
        }
        if let Some(rest) = name.strip_prefix("EQATTR_") {
            let (field, attribute) = rest
                .split_once('_')
                .and_then(|(field, attribute)| Some((attribute_field(field)?, attribute)))
                .filter(|(_, attribute)| !attribute.is_empty())
                .ok_or_else(|| invalid(parameter, "expects EQATTR_<field>_<attribute>"))?;
            query.where_masterdata_attribute_in(field, attribute, texts(parameter));
            return Ok(());
        }
        if let Some(field) = name.strip_prefix("HASATTR_") {
            let field = attribute_field(field)
                .ok_or_else(|| invalid(parameter, "expects HASATTR_<field>"))?;
            query.where_masterdata_has_attribute(field, texts(parameter));
            return Ok(());
        }
        if let Some(rest) = name.strip_prefix("EXISTS_") {
            let selector = custom_field_selector(rest)
                .ok_or_else(|| invalid(parameter, "unknown parameter"))?;
            query.where_custom_field_exists(selector);
            return Ok(());
        }

        let (prefix, rest) = name
            .split_once('_')
            .ok_or_else(|| invalid(parameter, "unknown parameter"))?;
        let comparator = comparator(prefix).ok_or_else(|| invalid(parameter, "unknown parameter"))?;
        let selector =
            custom_field_selector(rest).ok_or_else(|| invalid(parameter, "unknown parameter"))?;

        match comparator {
            Comparator::Equal => query.where_custom_field_in(selector, texts(parameter)),
            comparator => query.where_custom_field(selector, comparator, comparable(parameter)?),
        };
        Ok(())
    }
}

impl EpcisQuery for SimpleEventQuery {
    fn name(&self) -> &'static str {
        "SimpleEventQuery"
    }

    fn allow_subscription(&self) -> bool {
        true
    }

    fn validate_parameters(&self, parameters: &[QueryParameter]) -> Result<()> {
        EventQueryPlan::build(parameters).map(|_| ())
    }

    fn execute(
        &self,
        conn: &Connection,
        parameters: &[QueryParameter],
        pending: Option<PendingScope>,
    ) -> Result<QueryResults> {
        let mut plan = EventQueryPlan::build(parameters)?;

        if let Some(scope) = pending {
            if scope.is_empty() {
                return Ok(QueryResults::Events(Vec::new()));
            }
            plan.query
                .where_pending_for(scope.subscription, scope.through_request);
        }

        let events = plan.query.fetch(conn)?;

        if let Some(max) = plan.max_event_count {
            if events.len() > max {
                return Err(EpcisError::QueryTooLarge(format!(
                    "more than {} events match the query",
                    max
                )));
            }
        }

        Ok(QueryResults::Events(events))
    }
}
