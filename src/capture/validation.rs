//! Capture request checks, run before anything is written

use crate::error::{EpcisError, Result};
use crate::model::{CaptureRequest, CustomField, Event, EventType};

fn reject(position: usize, reason: &str) -> EpcisError {
    EpcisError::Validation(format!("event {}: {}", position, reason))
}

pub fn validate_request(request: &CaptureRequest) -> Result<()> {
    if request.events.is_empty() && request.master_data.is_empty() {
        return Err(EpcisError::Validation(
            "request carries no events and no master data".to_string(),
        ));
    }

    for (position, event) in request.events.iter().enumerate() {
        validate_event(position, event)?;
    }

    for (position, element) in request.master_data.iter().enumerate() {
        if element.md_type.trim().is_empty() || element.id.trim().is_empty() {
            return Err(EpcisError::Validation(format!(
                "master data {}: type and id are required",
                position
            )));
        }
        if element.children.iter().any(|c| c.trim().is_empty()) {
            return Err(EpcisError::Validation(format!(
                "master data {}: blank child id",
                position
            )));
        }
    }

    Ok(())
}

fn validate_event(position: usize, event: &Event) -> Result<()> {
    match (event.event_type, event.action) {
        (EventType::TransformationEvent, Some(_)) => {
            return Err(reject(position, "transformation events carry no action"))
        }
        (EventType::TransformationEvent, None) => {}
        (_, None) => return Err(reject(position, "action is required")),
        (_, Some(_)) => {}
    }

    for epc in &event.epcs {
        if epc.value.trim().is_empty() {
            return Err(reject(position, "blank EPC value"));
        }
        if let Some(quantity) = epc.quantity {
            if !quantity.is_finite() || quantity < 0.0 {
                return Err(reject(position, "quantity must be finite and non-negative"));
            }
        }
    }

    for field in &event.custom_fields {
        validate_field(position, field)?;
        for child in &field.children {
            validate_field(position, child)?;
            if !child.children.is_empty() {
                return Err(reject(position, "custom fields nest at most one level"));
            }
        }
    }

    Ok(())
}

fn validate_field(position: usize, field: &CustomField) -> Result<()> {
    if field.namespace.trim().is_empty() || field.name.trim().is_empty() {
        return Err(reject(position, "custom field needs a namespace and a name"));
    }
    Ok(())
}
