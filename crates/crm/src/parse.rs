//! Decoding of Mautic response bodies.
//!
//! Mautic is loose with shapes: collections come back as objects keyed by id
//! or as arrays (empty results are usually `[]`), ids may be strings, and
//! tags are objects with a `tag` member. Anything unrecognised decodes as
//! empty rather than as an error.

use serde_json::{Map, Value};

use freem_core::crm::{ContactRecord, FieldDescriptor};
use freem_core::types::scalar_string;

fn members(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(items)) => items.iter().collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn id_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        other => scalar_string(other)?.parse().ok(),
    }
}

fn tags(value: Option<&Value>) -> Vec<String> {
    members(value)
        .into_iter()
        .filter_map(|tag| match tag {
            Value::String(name) => Some(name.clone()),
            Value::Object(obj) => obj.get("tag").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Field values from `fields.all`, or from the grouped form
/// `fields.<group>.<alias>.value` when `all` is absent.
fn fields(value: Option<&Value>) -> Map<String, Value> {
    let Some(Value::Object(groups)) = value else {
        return Map::new();
    };
    if let Some(Value::Object(all)) = groups.get("all") {
        return all.clone();
    }
    let mut flat = Map::new();
    for group in groups.values() {
        let Value::Object(group) = group else {
            continue;
        };
        for (alias, field) in group {
            if let Some(value) = field.get("value") {
                flat.insert(alias.clone(), value.clone());
            }
        }
    }
    flat
}

pub(crate) fn contact(value: &Value) -> Option<ContactRecord> {
    let id = id_of(value.get("id")?)?;
    Some(ContactRecord {
        id,
        tags: tags(value.get("tags")),
        fields: fields(value.get("fields")),
    })
}

/// Contacts from a list response, in response order.
pub(crate) fn contact_list(body: &Value) -> Vec<ContactRecord> {
    members(body.get("contacts"))
        .into_iter()
        .filter_map(contact)
        .collect()
}

/// Id of the `contact` object in a create or edit response.
pub(crate) fn contact_id(body: &Value) -> Option<u64> {
    body.get("contact").and_then(|c| c.get("id")).and_then(id_of)
}

pub(crate) fn field_list(body: &Value) -> Vec<FieldDescriptor> {
    members(body.get("fields"))
        .into_iter()
        .filter_map(|field| {
            let alias = field.get("alias")?.as_str()?.to_string();
            let label = field
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(FieldDescriptor { alias, label })
        })
        .collect()
}
