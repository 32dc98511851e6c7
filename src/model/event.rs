//! Event model
//!
//! An event is identified by `(request_id, event_index)` once captured.
//! Children (EPCs, custom fields, business transactions, source/destinations)
//! are owned by the event and stored in their own tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage identity of a captured event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub request_id: i64,
    pub event_index: i64,
}

/// The fixed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ObjectEvent,
    AggregationEvent,
    TransactionEvent,
    TransformationEvent,
    QuantityEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ObjectEvent => "ObjectEvent",
            EventType::AggregationEvent => "AggregationEvent",
            EventType::TransactionEvent => "TransactionEvent",
            EventType::TransformationEvent => "TransformationEvent",
            EventType::QuantityEvent => "QuantityEvent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ObjectEvent" => Some(EventType::ObjectEvent),
            "AggregationEvent" => Some(EventType::AggregationEvent),
            "TransactionEvent" => Some(EventType::TransactionEvent),
            "TransformationEvent" => Some(EventType::TransformationEvent),
            "QuantityEvent" => Some(EventType::QuantityEvent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    Add,
    Observe,
    Delete,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Add => "ADD",
            EventAction::Observe => "OBSERVE",
            EventAction::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADD" => Some(EventAction::Add),
            "OBSERVE" => Some(EventAction::Observe),
            "DELETE" => Some(EventAction::Delete),
            _ => None,
        }
    }
}

/// Role of an EPC row within its event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpcType {
    List,
    ParentId,
    ChildEpc,
    InputEpc,
    OutputEpc,
    Quantity,
    ChildQuantity,
    InputQuantity,
    OutputQuantity,
}

impl EpcType {
    pub const ALL: [EpcType; 9] = [
        EpcType::List,
        EpcType::ParentId,
        EpcType::ChildEpc,
        EpcType::InputEpc,
        EpcType::OutputEpc,
        EpcType::Quantity,
        EpcType::ChildQuantity,
        EpcType::InputQuantity,
        EpcType::OutputQuantity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EpcType::List => "list",
            EpcType::ParentId => "parent_id",
            EpcType::ChildEpc => "child_epc",
            EpcType::InputEpc => "input_epc",
            EpcType::OutputEpc => "output_epc",
            EpcType::Quantity => "quantity",
            EpcType::ChildQuantity => "child_quantity",
            EpcType::InputQuantity => "input_quantity",
            EpcType::OutputQuantity => "output_quantity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }

    /// Quantity-typed rows carry an EPC class and an optional quantity
    pub fn is_quantity(&self) -> bool {
        matches!(
            self,
            EpcType::Quantity | EpcType::ChildQuantity | EpcType::InputQuantity | EpcType::OutputQuantity
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epc {
    pub epc_type: EpcType,
    pub value: String,
    pub quantity: Option<f64>,
    pub unit_of_measure: Option<String>,
}

impl Epc {
    pub fn new(epc_type: EpcType, value: impl Into<String>) -> Self {
        Self {
            epc_type,
            value: value.into(),
            quantity: None,
            unit_of_measure: None,
        }
    }

    pub fn with_quantity(epc_type: EpcType, value: impl Into<String>, quantity: f64) -> Self {
        Self {
            epc_type,
            value: value.into(),
            quantity: Some(quantity),
            unit_of_measure: None,
        }
    }
}

/// Where a custom field was declared on the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Extension,
    Ilmd,
    CustomField,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Extension => "extension",
            FieldType::Ilmd => "ilmd",
            FieldType::CustomField => "custom_field",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "extension" => Some(FieldType::Extension),
            "ilmd" => Some(FieldType::Ilmd),
            "custom_field" => Some(FieldType::CustomField),
            _ => None,
        }
    }
}

/// User extension field. Top-level fields may own one level of inner fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub field_type: FieldType,
    pub namespace: String,
    pub name: String,
    pub text_value: Option<String>,
    pub numeric_value: Option<f64>,
    pub date_value: Option<DateTime<Utc>>,
    #[serde(default)]
    pub children: Vec<CustomField>,
}

impl CustomField {
    pub fn text(
        field_type: FieldType,
        namespace: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let value = value.into();
        // Numeric and date projections let comparators work on text captured from XML
        let numeric_value = value.trim().parse::<f64>().ok();
        let date_value = DateTime::parse_from_rfc3339(value.trim())
            .ok()
            .map(|d| d.with_timezone(&Utc));
        Self {
            field_type,
            namespace: namespace.into(),
            name: name.into(),
            text_value: Some(value),
            numeric_value,
            date_value,
            children: Vec::new(),
        }
    }

    pub fn parent(
        field_type: FieldType,
        namespace: impl Into<String>,
        name: impl Into<String>,
        children: Vec<CustomField>,
    ) -> Self {
        Self {
            field_type,
            namespace: namespace.into(),
            name: name.into(),
            text_value: None,
            numeric_value: None,
            date_value: None,
            children,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessTransaction {
    pub transaction_type: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceDestinationDirection {
    Source,
    Destination,
}

impl SourceDestinationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDestinationDirection::Source => "source",
            SourceDestinationDirection::Destination => "destination",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "source" => Some(SourceDestinationDirection::Source),
            "destination" => Some(SourceDestinationDirection::Destination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDestination {
    pub direction: SourceDestinationDirection,
    pub sd_type: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDeclaration {
    pub declaration_time: DateTime<Utc>,
    pub reason: Option<String>,
    #[serde(default)]
    pub corrective_event_ids: Vec<String>,
}

/// A traceability event
///
/// `id` is `None` before capture and set by the store when read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<EventId>,
    pub event_type: EventType,
    pub event_time: DateTime<Utc>,
    /// Set by the capture pipeline; ignored on input
    pub record_time: Option<DateTime<Utc>>,
    pub event_timezone_offset: String,
    pub action: Option<EventAction>,
    pub business_step: Option<String>,
    pub disposition: Option<String>,
    pub read_point: Option<String>,
    pub business_location: Option<String>,
    pub event_id: Option<String>,
    pub transformation_id: Option<String>,
    pub error_declaration: Option<ErrorDeclaration>,
    #[serde(default)]
    pub epcs: Vec<Epc>,
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
    #[serde(default)]
    pub business_transactions: Vec<BusinessTransaction>,
    #[serde(default)]
    pub source_destinations: Vec<SourceDestination>,
}

impl Event {
    /// Minimal event with every optional attribute unset
    pub fn new(event_type: EventType, event_time: DateTime<Utc>, action: Option<EventAction>) -> Self {
        Self {
            id: None,
            event_type,
            event_time,
            record_time: None,
            event_timezone_offset: "+00:00".to_string(),
            action,
            business_step: None,
            disposition: None,
            read_point: None,
            business_location: None,
            event_id: None,
            transformation_id: None,
            error_declaration: None,
            epcs: Vec::new(),
            custom_fields: Vec::new(),
            business_transactions: Vec::new(),
            source_destinations: Vec::new(),
        }
    }
}
