use super::key::JsonMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Option<Map<String, Value>>,
    #[serde(default)]
    pub removed_fields: Option<Vec<String>>,
}

/// A database change as reported by the watch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub full_document: Option<Value>,
    #[serde(default)]
    pub document_key: Option<Value>,
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,
}

impl ChangeEvent {
    pub fn insert(document: Value) -> Self {
        let document_key = document.get("_id").map(|id| json!({ "_id": id }));
        Self {
            operation_type: Some("insert".to_string()),
            full_document: Some(document),
            document_key,
            update_description: None,
        }
    }

    pub fn update(id: Value, updated_fields: Map<String, Value>, removed_fields: Vec<String>) -> Self {
        Self {
            operation_type: Some("update".to_string()),
            full_document: None,
            document_key: Some(json!({ "_id": id })),
            update_description: Some(UpdateDescription {
                updated_fields: Some(updated_fields),
                removed_fields: Some(removed_fields),
            }),
        }
    }

    pub fn delete(id: Value) -> Self {
        Self {
            operation_type: Some("delete".to_string()),
            full_document: None,
            document_key: Some(json!({ "_id": id })),
            update_description: None,
        }
    }

    /// The document sent to clients. A full document that is not an
    /// object is sent as `null`; a missing update description field is
    /// sent as `null` (updated) or `[]` (removed).
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();

        if let Some(full) = &self.full_document {
            let full = if full.is_object() { full.clone() } else { Value::Null };
            doc.insert("fullDocument".to_string(), full);
        }

        if let Some(key) = &self.document_key {
            doc.insert("documentKey".to_string(), key.clone());
        }

        if let Some(update) = &self.update_description {
            let updated = update
                .updated_fields
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null);
            let removed = update
                .removed_fields
                .as_ref()
                .map(|fields| Value::Array(fields.iter().cloned().map(Value::String).collect()))
                .unwrap_or_else(|| Value::Array(Vec::new()));
            doc.insert(
                "updateDescription".to_string(),
                json!({ "updatedFields": updated, "removedFields": removed }),
            );
        }

        if let Some(op) = &self.operation_type {
            doc.insert("operationType".to_string(), Value::String(op.clone()));
        }

        Value::Object(doc)
    }

    pub fn render(&self, mode: JsonMode) -> String {
        let doc = self.to_document();
        match mode {
            JsonMode::Relaxed => doc.to_string(),
            JsonMode::Extended => to_extended(doc).to_string(),
        }
    }
}

/// Wrap numbers in their canonical extended JSON form.
fn to_extended(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    json!({ "$numberInt": i.to_string() })
                } else {
                    json!({ "$numberLong": i.to_string() })
                }
            } else if let Some(u) = n.as_u64() {
                json!({ "$numberLong": u.to_string() })
            } else {
                let f = n.as_f64().unwrap_or_default();
                json!({ "$numberDouble": format_double(f) })
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(to_extended).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, to_extended(v))).collect()),
        other => other,
    }
}

fn format_double(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_event_document() {
        let mut updated = Map::new();
        updated.insert("qty".to_string(), json!(5));
        let event = ChangeEvent::update(json!("a1"), updated, vec!["note".to_string()]);

        assert_eq!(
            event.to_document(),
            json!({
                "documentKey": {"_id": "a1"},
                "updateDescription": {"updatedFields": {"qty": 5}, "removedFields": ["note"]},
                "operationType": "update",
            })
        );
    }

    #[test]
    fn test_missing_update_fields_defaults() {
        let event = ChangeEvent {
            operation_type: Some("update".to_string()),
            update_description: Some(UpdateDescription::default()),
            ..Default::default()
        };
        let doc = event.to_document();
        assert_eq!(doc["updateDescription"]["updatedFields"], Value::Null);
        assert_eq!(doc["updateDescription"]["removedFields"], json!([]));
    }

    #[test]
    fn test_non_object_full_document_is_null() {
        let event = ChangeEvent {
            full_document: Some(json!("not a document")),
            ..Default::default()
        };
        assert_eq!(event.to_document()["fullDocument"], Value::Null);
    }

    #[test]
    fn test_extended_rendering_wraps_numbers() {
        let event = ChangeEvent::insert(json!({"_id": 1, "big": 5_000_000_000i64, "ratio": 0.5, "n": 2.0}));
        let rendered: Value = serde_json::from_str(&event.render(JsonMode::Extended)).unwrap();

        assert_eq!(rendered["fullDocument"]["_id"], json!({"$numberInt": "1"}));
        assert_eq!(rendered["fullDocument"]["big"], json!({"$numberLong": "5000000000"}));
        assert_eq!(rendered["fullDocument"]["ratio"], json!({"$numberDouble": "0.5"}));
        assert_eq!(rendered["fullDocument"]["n"], json!({"$numberDouble": "2.0"}));

        let relaxed: Value = serde_json::from_str(&event.render(JsonMode::Relaxed)).unwrap();
        assert_eq!(relaxed["fullDocument"]["_id"], 1);
    }
}
