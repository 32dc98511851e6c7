//! Capture request envelope
//!
//! A request owns everything captured in one call. The store assigns the
//! request id; events and master data get dense indices from their position.

use super::event::Event;
use super::masterdata::MasterData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactRole {
    Sender,
    Receiver,
}

impl ContactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactRole::Sender => "sender",
            ContactRole::Receiver => "receiver",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInformation {
    pub role: ContactRole,
    pub identifier: String,
    pub contact: Option<String>,
    pub email_address: Option<String>,
    pub fax_number: Option<String>,
    pub telephone_number: Option<String>,
    pub contact_type_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardBusinessHeader {
    pub version: String,
    pub standard: String,
    pub type_version: String,
    pub instance_identifier: String,
    pub header_type: String,
    pub creation_date_time: Option<DateTime<Utc>>,
    /// Stored in list order; the index is the position
    #[serde(default)]
    pub contact_informations: Vec<ContactInformation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackType {
    Success,
    QueryTooLarge,
    ImplementationException,
}

impl CallbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackType::Success => "success",
            CallbackType::QueryTooLarge => "query_too_large",
            CallbackType::ImplementationException => "implementation_exception",
        }
    }
}

/// Out-of-band acknowledgment carried by a capture request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCallback {
    pub callback_type: CallbackType,
    pub subscription_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub document_time: DateTime<Utc>,
    pub schema_version: String,
    pub header: Option<StandardBusinessHeader>,
    pub callback: Option<SubscriptionCallback>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub master_data: Vec<MasterData>,
}

impl CaptureRequest {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            document_time: Utc::now(),
            schema_version: "1.2".to_string(),
            header: None,
            callback: None,
            events,
            master_data: Vec::new(),
        }
    }
}

/// Who captured the request; supplied by the transport layer after authentication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
}
