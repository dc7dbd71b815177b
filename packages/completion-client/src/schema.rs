//! Strict-mode JSON schemas derived from Rust types.
//!
//! `schemars` produces draft-07 schemas with `$ref`/`definitions`. OpenAI's
//! strict structured outputs need a narrower dialect:
//!
//! 1. every object has `additionalProperties: false`
//! 2. every property is listed in `required` (nullable ones included)
//! 3. no `$ref`, everything inlined
//! 4. no `format` on non-string types and no `uniqueItems`

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A type the model can be asked to produce.
///
/// Blanket-implemented for anything that is `JsonSchema + DeserializeOwned`.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    /// Strict-mode schema for this type.
    fn strict_schema() -> Value {
        let mut root = serde_json::to_value(schema_for!(Self)).unwrap_or_default();

        let definitions = match &mut root {
            Value::Object(map) => {
                map.remove("$schema");
                map.remove("definitions")
            }
            _ => None,
        }
        .unwrap_or(Value::Object(Map::new()));

        strictify(&mut root, &definitions);
        root
    }

    /// Name sent as `json_schema.name`.
    fn output_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

fn strictify(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(target) = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/definitions/"))
                .and_then(|name| definitions.get(name))
            {
                *value = target.clone();
                strictify(value, definitions);
                return;
            }

            map.remove("uniqueItems");
            let is_string = map.get("type").and_then(Value::as_str) == Some("string");
            if !is_string {
                map.remove("format");
            }

            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".into(), Value::Bool(false));
                let required: Vec<Value> = map
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| props.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                map.insert("required".into(), Value::Array(required));
            }

            for child in map.values_mut() {
                strictify(child, definitions);
            }
        }
        Value::Array(items) => {
            for item in items {
                strictify(item, definitions);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::collections::BTreeSet;

    #[derive(Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
    enum Level {
        Low,
        High,
    }

    #[derive(Deserialize, JsonSchema)]
    struct Source {
        title: String,
        url: Option<String>,
    }

    #[derive(Deserialize, JsonSchema)]
    struct Metadata {
        years: BTreeSet<i32>,
        level: Level,
        source: Source,
        note: Option<String>,
    }

    #[test]
    fn optional_fields_are_still_required() {
        let schema = Metadata::strict_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();

        assert!(required.contains(&"note"));
        assert!(required.contains(&"years"));
        assert_eq!(schema["additionalProperties"], Value::Bool(false));
    }

    #[test]
    fn nested_types_are_inlined() {
        let schema = Metadata::strict_schema();
        let text = serde_json::to_string(&schema).unwrap();

        assert!(!text.contains("$ref"));
        assert!(schema.get("definitions").is_none());
        assert!(schema.get("$schema").is_none());

        let source = &schema["properties"]["source"];
        assert_eq!(source["type"], "object");
        assert_eq!(source["additionalProperties"], Value::Bool(false));
        assert!(source["required"]
            .as_array()
            .unwrap()
            .contains(&Value::String("url".into())));
    }

    #[test]
    fn unsupported_keywords_are_stripped() {
        let schema = Metadata::strict_schema();
        let years = &schema["properties"]["years"];

        assert_eq!(years["type"], "array");
        assert!(years.get("uniqueItems").is_none());
        assert!(years["items"].get("format").is_none());
        assert_eq!(years["items"]["type"], "integer");
    }

    #[test]
    fn schema_name_follows_type_name() {
        assert_eq!(Metadata::output_name(), "Metadata");
    }
}
