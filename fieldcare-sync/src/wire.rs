//! JSON wire format conversion
//!
//! The server sends flat JSON objects. The identifier, code, name and
//! `lastUpdated` fields are lifted into [`Record`]; everything else stays in
//! the payload.

use crate::error::{ApiError, ApiResult};
use crate::model::{is_temporary_uid, ExistenceEntry, PushReceipt, Record};
use crate::resource::ResourceType;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const ZONELESS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Parse a server timestamp. Zone-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, ZONELESS_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Format a timestamp the way the server's query filters expect it
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Identifier held by a reference field: a bare string or `{"id": ...}`
pub fn reference_uid(value: &Value) -> Option<&str> {
    match value {
        Value::String(uid) => Some(uid.as_str()),
        Value::Object(object) => object.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn take_string(object: &mut Map<String, Value>, field: &str) -> Option<String> {
    match object.remove(field) {
        Some(Value::String(s)) => Some(s),
        Some(other) if !other.is_null() => {
            // Keep non-string values where they were
            object.insert(field.to_string(), other);
            None
        }
        _ => None,
    }
}

/// Items of a collection response: a bare array or `{"<endpoint>": [...]}`
pub fn collection_items(resource: ResourceType, body: Value) -> ApiResult<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => match object.remove(resource.endpoint()) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ApiError::MalformedResponse(format!(
                "expected a \"{}\" array",
                resource.endpoint()
            ))),
        },
        _ => Err(ApiError::MalformedResponse(format!(
            "unexpected {} listing shape",
            resource
        ))),
    }
}

pub fn record_from_wire(resource: ResourceType, value: Value) -> ApiResult<Record> {
    let Value::Object(mut object) = value else {
        return Err(ApiError::MalformedResponse(format!("{} entry is not an object", resource)));
    };
    let uid = take_string(&mut object, resource.id_field()).ok_or_else(|| {
        ApiError::MalformedResponse(format!("{} entry without \"{}\"", resource, resource.id_field()))
    })?;

    let mut record = Record::remote(resource, uid);
    record.code = take_string(&mut object, "code");
    record.display_name = take_string(&mut object, "displayName").or_else(|| take_string(&mut object, "name"));
    record.last_updated = match take_string(&mut object, "lastUpdated") {
        Some(raw) => Some(parse_timestamp(&raw).ok_or_else(|| {
            ApiError::MalformedResponse(format!("bad lastUpdated \"{}\" on {} {}", raw, resource, record.uid))
        })?),
        None => None,
    };
    record.payload = Value::Object(object);
    Ok(record)
}

pub fn existence_from_wire(resource: ResourceType, value: Value) -> ApiResult<ExistenceEntry> {
    let Value::Object(mut object) = value else {
        return Err(ApiError::MalformedResponse(format!("{} listing entry is not an object", resource)));
    };
    let id = take_string(&mut object, resource.id_field())
        .ok_or_else(|| ApiError::MalformedResponse(format!("{} listing entry without identifier", resource)))?;
    Ok(ExistenceEntry {
        id,
        name: take_string(&mut object, "displayName").or_else(|| take_string(&mut object, "name")),
    })
}

/// Outbound JSON for a record.
///
/// `references` maps reference fields to the global identifiers of their
/// targets, resolved from the record's surrogate-key relations. A temporary
/// identifier is left out so the server assigns the real one.
pub fn record_to_wire(record: &Record, references: &BTreeMap<String, String>) -> Value {
    let mut object = match &record.payload {
        Value::Object(object) => object.clone(),
        _ => Map::new(),
    };
    let id_field = record.resource.id_field();
    if is_temporary_uid(&record.uid) {
        object.remove(id_field);
    } else {
        object.insert(id_field.to_string(), Value::String(record.uid.clone()));
    }
    if let Some(code) = &record.code {
        object.insert("code".to_string(), Value::String(code.clone()));
    }
    if let Some(name) = &record.display_name {
        object.insert("name".to_string(), Value::String(name.clone()));
    }
    if let Some(at) = record.last_updated {
        object.insert("lastUpdated".to_string(), Value::String(format_timestamp(at)));
    }
    for (field, uid) in references {
        object.insert(field.clone(), Value::String(uid.clone()));
    }
    Value::Object(object)
}

/// Identifier the server assigned in a push response.
///
/// Accepts an import summary (`response.importSummaries[].reference`), a
/// single object report (`response.uid`) or the record echoed back.
pub fn push_receipt_from_wire(resource: ResourceType, body: &Value) -> ApiResult<PushReceipt> {
    let candidates = [
        body.pointer("/response/importSummaries/0/reference"),
        body.pointer("/response/uid"),
        body.pointer("/reference"),
        body.get(resource.id_field()),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(|id| PushReceipt {
            assigned_id: id.to_string(),
        })
        .ok_or_else(|| ApiError::MalformedResponse(format!("no assigned identifier in {} push response", resource)))
}
