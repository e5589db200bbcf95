//! Context scrubbing and the websocket-safe projection.
//!
//! The execution context is an opaque JSON tree. Two rewrites are applied
//! at the persistence and broadcast boundaries:
//!
//! - `scrub_base64` replaces every value stored under a key literally named
//!   `base64`, at any depth, with a short descriptor recording the original
//!   length. Step payload snapshots and API reads of the context must never
//!   carry the bulk payload itself.
//! - `safe_projection` restricts a context to a fixed allow-list of small
//!   scalar fields for broadcast over the progress channel.

use serde_json::{Map, Value, json};

/// Context keys the progress channel is allowed to carry, both at the root
/// and inside `dynamic_properties`.
const SAFE_FIELDS: &[&str] = &[
    "execution_id",
    "fetched_at",
    "next_step_name",
    "manual",
    "documento_procesado",
    "mime_type",
    "nombre_documento",
    "uuid_proceso",
    "estructura_carpetas",
    "pdf_reordenado_disponible",
    "pdf_reordenado_archivo",
    "pdf_reordenado_subido_gcs",
    "pdf_reordenado_tamaño_kb",
    "secciones_individuales_disponibles",
    "secciones_individuales_subidas",
    "pdf_anotado_disponible",
    "pdf_anotado_tiempo_procesamiento",
    "pdf_anotado_valores_encontrados",
];

/// Extra keys allowed only inside `dynamic_properties`.
const SAFE_DYNAMIC_FIELDS: &[&str] = &["validation_final", "decision_result", "step_summary"];

/// Depth-first rewrite replacing every `base64` value with a descriptor.
pub fn scrub_base64(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut clean = Map::with_capacity(map.len());
            for (key, val) in map {
                if key == "base64" {
                    let descriptor = match val {
                        Value::String(s) => {
                            format!("[BASE64_CONTENT_REMOVED - Length: {} chars]", s.chars().count())
                        }
                        _ => "[BASE64_CONTENT_REMOVED - Not string]".to_string(),
                    };
                    clean.insert(key.clone(), Value::String(descriptor));
                } else {
                    clean.insert(key.clone(), scrub_base64(val));
                }
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub_base64).collect()),
        other => other.clone(),
    }
}

/// Build the websocket-safe projection of a context: allow-listed root
/// fields, a filtered `dynamic_properties`, and the last-step info block.
pub fn safe_projection(context: &Value) -> Value {
    let Some(map) = context.as_object() else {
        return json!({});
    };

    let mut safe = Map::new();
    for field in SAFE_FIELDS {
        if let Some(val) = map.get(*field) {
            safe.insert((*field).to_string(), val.clone());
        }
    }

    if let Some(Value::Object(dynamic)) = map.get("dynamic_properties") {
        let mut safe_dynamic = Map::new();
        for field in SAFE_FIELDS.iter().chain(SAFE_DYNAMIC_FIELDS) {
            if let Some(val) = dynamic.get(*field) {
                safe_dynamic.insert((*field).to_string(), val.clone());
            }
        }
        if !safe_dynamic.is_empty() {
            safe.insert("dynamic_properties".to_string(), Value::Object(safe_dynamic));
        }
    }

    if let Some(last) = map.get("last_step_info") {
        safe.insert("last_step_info".to_string(), scrub_base64(last));
    }

    Value::Object(safe)
}

/// Document name recorded in the context, for event summaries.
pub fn document_name(safe_context: &Value) -> String {
    safe_context
        .pointer("/dynamic_properties/nombre_documento")
        .or_else(|| safe_context.get("nombre_documento"))
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_replaces_top_level_base64() {
        let ctx = json!({"base64": "a".repeat(2048), "other": "kept"});
        let clean = scrub_base64(&ctx);
        assert_eq!(
            clean["base64"],
            "[BASE64_CONTENT_REMOVED - Length: 2048 chars]"
        );
        assert_eq!(clean["other"], "kept");
    }

    #[test]
    fn test_scrub_reaches_nested_objects_and_arrays() {
        let ctx = json!({
            "dynamic_properties": {
                "document": {"base64": "xyz"},
            },
            "pages": [{"base64": "abcd"}, {"text": "plain"}],
        });
        let clean = scrub_base64(&ctx);
        assert_eq!(
            clean["dynamic_properties"]["document"]["base64"],
            "[BASE64_CONTENT_REMOVED - Length: 3 chars]"
        );
        assert_eq!(
            clean["pages"][0]["base64"],
            "[BASE64_CONTENT_REMOVED - Length: 4 chars]"
        );
        assert_eq!(clean["pages"][1]["text"], "plain");
    }

    #[test]
    fn test_scrub_non_string_base64() {
        let ctx = json!({"base64": 42});
        let clean = scrub_base64(&ctx);
        assert_eq!(clean["base64"], "[BASE64_CONTENT_REMOVED - Not string]");
    }

    #[test]
    fn test_scrub_leaves_scalars_untouched() {
        assert_eq!(scrub_base64(&json!("plain")), json!("plain"));
        assert_eq!(scrub_base64(&json!(7)), json!(7));
    }

    #[test]
    fn test_safe_projection_filters_unknown_keys() {
        let ctx = json!({
            "execution_id": "abc",
            "uuid_proceso": "p-1",
            "base64": "huge",
            "huge_blob": {"a": 1},
            "dynamic_properties": {
                "nombre_documento": "ine.pdf",
                "decision_result": "approved",
                "raw_pages": [1, 2, 3],
            },
        });
        let safe = safe_projection(&ctx);
        assert_eq!(safe["execution_id"], "abc");
        assert_eq!(safe["uuid_proceso"], "p-1");
        assert!(safe.get("base64").is_none());
        assert!(safe.get("huge_blob").is_none());
        assert_eq!(safe["dynamic_properties"]["nombre_documento"], "ine.pdf");
        assert_eq!(safe["dynamic_properties"]["decision_result"], "approved");
        assert!(safe["dynamic_properties"].get("raw_pages").is_none());
    }

    #[test]
    fn test_safe_projection_of_non_object_is_empty() {
        assert_eq!(safe_projection(&json!(null)), json!({}));
        assert_eq!(safe_projection(&json!([1, 2])), json!({}));
    }

    #[test]
    fn test_document_name_fallback() {
        assert_eq!(document_name(&json!({})), "Unknown");
        let ctx = json!({"dynamic_properties": {"nombre_documento": "acta.pdf"}});
        assert_eq!(document_name(&ctx), "acta.pdf");
    }
}
