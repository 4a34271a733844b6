use super::ContentLoader;
use crate::error::{KbError, Result};
use serde_json::Value as JsonValue;

/// JSON loader: flattens a document into `path: value` lines
pub struct JsonLoader;

fn flatten(prefix: &str, value: &JsonValue, out: &mut Vec<String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        JsonValue::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten(&format!("{}[{}]", prefix, idx), child, out);
            }
        }
        JsonValue::String(s) => out.push(format!("{}: {}", prefix, s)),
        JsonValue::Null => {}
        other => out.push(format!("{}: {}", prefix, other)),
    }
}

impl ContentLoader for JsonLoader {
    fn can_load(&self, extension: &str) -> bool {
        extension == "json"
    }

    fn extract(&self, raw: &str, path: &str) -> Result<String> {
        let value: JsonValue = serde_json::from_str(raw)
            .map_err(|e| KbError::Ingestion(format!("JSON parse error in {}: {}", path, e)))?;

        let mut lines = Vec::new();
        flatten("", &value, &mut lines);
        Ok(lines.join("\n"))
    }
}
