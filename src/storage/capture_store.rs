//! Atomic persistence of one capture request
//!
//! Everything a request owns is written inside one transaction. Events and
//! master data are grouped by row kind across the whole batch: one bulk
//! insert for all event rows, one for all EPC rows, and so on, instead of
//! one round trip per event.

use super::{optional_text, text, to_millis, BulkInsert};
use crate::model::{
    CaptureRequest, CustomField, Event, MasterData, RequestContext, StandardBusinessHeader,
    SubscriptionCallback,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, Transaction};

/// Persist a capture request and return the generated request id
///
/// Steps (one transaction):
/// 1. request header
/// 2. standard business header + contacts
/// 3. subscription callback
/// 4. events and children, bulk inserted per row kind
/// 5. master data, attributes and hierarchy links
/// 6. pending rows so every subscription sees the new request
///
/// Any error drops the transaction, which rolls everything back.
pub fn store_request(
    conn: &mut Connection,
    request: &CaptureRequest,
    context: &RequestContext,
    record_time: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    let tx = conn.transaction()?;

    let request_id = store_header(&tx, request, context, record_time)?;

    store_standard_business_header(&tx, request.header.as_ref(), request_id)?;
    store_callback(&tx, request.callback.as_ref(), request_id)?;
    store_events(&tx, &request.events, request_id, record_time)?;
    store_master_data(&tx, &request.master_data, request_id)?;
    mark_pending_for_subscriptions(&tx, request_id)?;

    tx.commit()?;

    log::debug!(
        "✅ Captured request {} ({} events, {} master data)",
        request_id,
        request.events.len(),
        request.master_data.len()
    );

    Ok(request_id)
}

fn store_header(
    tx: &Transaction<'_>,
    request: &CaptureRequest,
    context: &RequestContext,
    record_time: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO request (document_time, record_time, schema_version, user_id)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            to_millis(request.document_time),
            to_millis(record_time),
            request.schema_version,
            context.user_id,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn store_standard_business_header(
    tx: &Transaction<'_>,
    header: Option<&StandardBusinessHeader>,
    request_id: i64,
) -> rusqlite::Result<()> {
    let Some(header) = header else {
        return Ok(());
    };

    tx.execute(
        "INSERT INTO standard_business_header
         (request_id, version, standard, type_version, instance_identifier, header_type, creation_date_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            request_id,
            header.version,
            header.standard,
            header.type_version,
            header.instance_identifier,
            header.header_type,
            header.creation_date_time.map(to_millis),
        ],
    )?;

    let mut contacts = BulkInsert::new(
        "contact_information",
        &[
            "request_id",
            "contact_index",
            "role",
            "identifier",
            "contact",
            "email_address",
            "fax_number",
            "telephone_number",
            "contact_type_identifier",
        ],
    );
    for (index, contact) in header.contact_informations.iter().enumerate() {
        contacts.push(vec![
            Value::Integer(request_id),
            Value::Integer(index as i64),
            text(contact.role.as_str()),
            text(&contact.identifier),
            optional_text(contact.contact.as_deref()),
            optional_text(contact.email_address.as_deref()),
            optional_text(contact.fax_number.as_deref()),
            optional_text(contact.telephone_number.as_deref()),
            optional_text(contact.contact_type_identifier.as_deref()),
        ]);
    }
    contacts.execute(tx)?;

    Ok(())
}

fn store_callback(
    tx: &Transaction<'_>,
    callback: Option<&SubscriptionCallback>,
    request_id: i64,
) -> rusqlite::Result<()> {
    let Some(callback) = callback else {
        return Ok(());
    };

    tx.execute(
        "INSERT INTO subscription_callback (request_id, callback_type, subscription_id, reason)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            request_id,
            callback.callback_type.as_str(),
            callback.subscription_id,
            callback.reason,
        ],
    )?;
    Ok(())
}

fn store_events(
    tx: &Transaction<'_>,
    events: &[Event],
    request_id: i64,
    record_time: DateTime<Utc>,
) -> rusqlite::Result<()> {
    if events.is_empty() {
        return Ok(());
    }

    let mut rows = EventRows::new();
    for (event_index, event) in events.iter().enumerate() {
        rows.add_event(request_id, event_index as i64, event, record_time);
    }

    rows.persist(tx)
}

fn store_master_data(
    tx: &Transaction<'_>,
    master_data: &[MasterData],
    request_id: i64,
) -> rusqlite::Result<()> {
    if master_data.is_empty() {
        return Ok(());
    }

    let mut rows = MasterDataRows::new();
    for (md_index, element) in master_data.iter().enumerate() {
        rows.add_master_data(request_id, md_index as i64, element);
    }

    rows.persist(tx)
}

fn mark_pending_for_subscriptions(tx: &Transaction<'_>, request_id: i64) -> rusqlite::Result<()> {
    let marked = tx.execute(
        "INSERT INTO pending_request (subscription_id, request_id) SELECT id, ?1 FROM subscription",
        params![request_id],
    )?;
    if marked > 0 {
        log::debug!("   ├─ Request {} pending for {} subscriptions", request_id, marked);
    }
    Ok(())
}

/// Row buffers for every event table, filled across the whole batch
struct EventRows {
    events: BulkInsert,
    epcs: BulkInsert,
    custom_fields: BulkInsert,
    business_transactions: BulkInsert,
    source_destinations: BulkInsert,
    error_declarations: BulkInsert,
    corrective_event_ids: BulkInsert,
}

impl EventRows {
    fn new() -> Self {
        Self {
            events: BulkInsert::new(
                "event",
                &[
                    "request_id",
                    "event_index",
                    "event_type",
                    "event_time",
                    "record_time",
                    "event_timezone_offset",
                    "action",
                    "business_step",
                    "disposition",
                    "read_point",
                    "business_location",
                    "event_id",
                    "transformation_id",
                ],
            ),
            epcs: BulkInsert::new(
                "epc",
                &[
                    "request_id",
                    "event_index",
                    "epc_index",
                    "epc_type",
                    "value",
                    "is_quantity",
                    "quantity",
                    "unit_of_measure",
                ],
            ),
            custom_fields: BulkInsert::new(
                "custom_field",
                &[
                    "request_id",
                    "event_index",
                    "field_index",
                    "parent_index",
                    "field_type",
                    "namespace",
                    "name",
                    "text_value",
                    "numeric_value",
                    "date_value",
                ],
            ),
            business_transactions: BulkInsert::new(
                "business_transaction",
                &[
                    "request_id",
                    "event_index",
                    "transaction_index",
                    "transaction_type",
                    "transaction_id",
                ],
            ),
            source_destinations: BulkInsert::new(
                "source_destination",
                &["request_id", "event_index", "sd_index", "direction", "sd_type", "sd_id"],
            ),
            error_declarations: BulkInsert::new(
                "error_declaration",
                &["request_id", "event_index", "declaration_time", "reason"],
            ),
            corrective_event_ids: BulkInsert::new(
                "corrective_event_id",
                &["request_id", "event_index", "corrective_index", "corrective_event_id"],
            ),
        }
    }

    fn add_event(&mut self, request_id: i64, event_index: i64, event: &Event, record_time: DateTime<Utc>) {
        let key = || vec![Value::Integer(request_id), Value::Integer(event_index)];

        let mut row = key();
        row.extend([
            text(event.event_type.as_str()),
            Value::Integer(to_millis(event.event_time)),
            Value::Integer(to_millis(record_time)),
            text(&event.event_timezone_offset),
            optional_text(event.action.map(|a| a.as_str())),
            optional_text(event.business_step.as_deref()),
            optional_text(event.disposition.as_deref()),
            optional_text(event.read_point.as_deref()),
            optional_text(event.business_location.as_deref()),
            optional_text(event.event_id.as_deref()),
            optional_text(event.transformation_id.as_deref()),
        ]);
        self.events.push(row);

        for (index, epc) in event.epcs.iter().enumerate() {
            let mut row = key();
            row.extend([
                Value::Integer(index as i64),
                text(epc.epc_type.as_str()),
                text(&epc.value),
                Value::Integer(epc.epc_type.is_quantity() as i64),
                epc.quantity.map(Value::Real).unwrap_or(Value::Null),
                optional_text(epc.unit_of_measure.as_deref()),
            ]);
            self.epcs.push(row);
        }

        let mut field_index = 0i64;
        for field in &event.custom_fields {
            let parent_index = field_index;
            self.add_custom_field(key(), field_index, None, field);
            field_index += 1;

            for child in &field.children {
                self.add_custom_field(key(), field_index, Some(parent_index), child);
                field_index += 1;
            }
        }

        for (index, transaction) in event.business_transactions.iter().enumerate() {
            let mut row = key();
            row.extend([
                Value::Integer(index as i64),
                text(&transaction.transaction_type),
                text(&transaction.id),
            ]);
            self.business_transactions.push(row);
        }

        for (index, sd) in event.source_destinations.iter().enumerate() {
            let mut row = key();
            row.extend([
                Value::Integer(index as i64),
                text(sd.direction.as_str()),
                text(&sd.sd_type),
                text(&sd.id),
            ]);
            self.source_destinations.push(row);
        }

        if let Some(declaration) = &event.error_declaration {
            let mut row = key();
            row.extend([
                Value::Integer(to_millis(declaration.declaration_time)),
                optional_text(declaration.reason.as_deref()),
            ]);
            self.error_declarations.push(row);

            for (index, corrective) in declaration.corrective_event_ids.iter().enumerate() {
                let mut row = key();
                row.extend([Value::Integer(index as i64), text(corrective)]);
                self.corrective_event_ids.push(row);
            }
        }
    }

    fn add_custom_field(
        &mut self,
        mut row: Vec<Value>,
        field_index: i64,
        parent_index: Option<i64>,
        field: &CustomField,
    ) {
        row.extend([
            Value::Integer(field_index),
            parent_index.map(Value::Integer).unwrap_or(Value::Null),
            text(field.field_type.as_str()),
            text(&field.namespace),
            text(&field.name),
            optional_text(field.text_value.as_deref()),
            field.numeric_value.map(Value::Real).unwrap_or(Value::Null),
            field
                .date_value
                .map(|d| Value::Integer(to_millis(d)))
                .unwrap_or(Value::Null),
        ]);
        self.custom_fields.push(row);
    }

    /// Parent tables first so child foreign keys resolve
    fn persist(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        self.events.execute(tx)?;
        self.epcs.execute(tx)?;
        self.custom_fields.execute(tx)?;
        self.business_transactions.execute(tx)?;
        self.source_destinations.execute(tx)?;
        self.error_declarations.execute(tx)?;
        self.corrective_event_ids.execute(tx)?;
        Ok(())
    }
}

struct MasterDataRows {
    elements: BulkInsert,
    attributes: BulkInsert,
    hierarchy: BulkInsert,
}

impl MasterDataRows {
    fn new() -> Self {
        Self {
            elements: BulkInsert::new("masterdata", &["request_id", "md_index", "md_type", "md_id"]),
            attributes: BulkInsert::new(
                "masterdata_attribute",
                &["request_id", "md_index", "attribute_index", "attribute_id", "value"],
            ),
            hierarchy: BulkInsert::new(
                "masterdata_hierarchy",
                &["request_id", "md_index", "child_index", "md_type", "parent_id", "child_id"],
            ),
        }
    }

    fn add_master_data(&mut self, request_id: i64, md_index: i64, element: &MasterData) {
        self.elements.push(vec![
            Value::Integer(request_id),
            Value::Integer(md_index),
            text(&element.md_type),
            text(&element.id),
        ]);

        for (index, attribute) in element.attributes.iter().enumerate() {
            self.attributes.push(vec![
                Value::Integer(request_id),
                Value::Integer(md_index),
                Value::Integer(index as i64),
                text(&attribute.id),
                text(&attribute.value),
            ]);
        }

        for (index, child) in element.children.iter().enumerate() {
            self.hierarchy.push(vec![
                Value::Integer(request_id),
                Value::Integer(md_index),
                Value::Integer(index as i64),
                text(&element.md_type),
                text(&element.id),
                text(child),
            ]);
        }
    }

    fn persist(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        self.elements.execute(tx)?;
        self.attributes.execute(tx)?;
        self.hierarchy.execute(tx)?;
        Ok(())
    }
}
