/// Edge transformers
///
/// Project and rename fields of a source node's output before it becomes part
/// of the target node's input. `from` is either a JSONPath (`$.items[0].id`)
/// or a plain dotted path (`user.name`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key used when a non-object output has to be placed into an object input
pub const OUTPUT_KEY: &str = "output";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub from: String,
    pub to: String,
}

impl FieldMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Projection/rename applied to one edge's payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transformer {
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    /// Carry over source fields that no mapping mentions
    #[serde(default)]
    pub keep_unmapped: bool,
}

impl Transformer {
    pub fn new(mappings: Vec<FieldMapping>) -> Self {
        Self {
            mappings,
            keep_unmapped: false,
        }
    }

    pub fn keep_unmapped(mut self) -> Self {
        self.keep_unmapped = true;
        self
    }

    /// Apply the mappings to `output`, always producing an object
    ///
    /// A path that matches nothing leaves its target field absent.
    pub fn apply(&self, output: &Value) -> Value {
        let mut projected = if self.keep_unmapped {
            as_object(output.clone())
        } else {
            Map::new()
        };

        for mapping in &self.mappings {
            match resolve(output, &mapping.from) {
                Some(value) => {
                    projected.insert(mapping.to.clone(), value);
                }
                None => {
                    tracing::debug!("🔍 Transformer path '{}' matched nothing", mapping.from);
                }
            }
        }

        Value::Object(projected)
    }
}

/// Merge one fired edge's payload into a node input (last writer wins per field)
pub fn merge_into(input: &mut Map<String, Value>, payload: Value) {
    input.extend(as_object(payload));
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert(OUTPUT_KEY.to_string(), other);
            map
        }
    }
}

fn resolve(output: &Value, path: &str) -> Option<Value> {
    if path.starts_with('$') {
        let mut matches = match jsonpath_lib::select(output, path) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("⚠️ Invalid JSONPath '{}': {:?}", path, e);
                return None;
            }
        };
        return match matches.len() {
            0 => None,
            1 => matches.pop().cloned(),
            _ => Some(Value::Array(matches.into_iter().cloned().collect())),
        };
    }

    // Dotted path
    let mut current = output;
    for part in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renames_and_projects_fields() {
        let transformer = Transformer::new(vec![
            FieldMapping::new("user.name", "owner"),
            FieldMapping::new("$.items[*].id", "ids"),
            FieldMapping::new("missing.path", "never"),
        ]);
        let output = json!({
            "user": { "name": "ada" },
            "items": [{ "id": 1 }, { "id": 2 }],
            "noise": true
        });

        let projected = transformer.apply(&output);
        assert_eq!(projected, json!({ "owner": "ada", "ids": [1, 2] }));
    }

    #[test]
    fn keeps_unmapped_fields_when_asked() {
        let transformer =
            Transformer::new(vec![FieldMapping::new("$.status", "httpStatus")]).keep_unmapped();
        let projected = transformer.apply(&json!({ "status": 200, "body": "ok" }));
        assert_eq!(
            projected,
            json!({ "status": 200, "body": "ok", "httpStatus": 200 })
        );
    }

    #[test]
    fn merge_wraps_scalars_and_overwrites_fields() {
        let mut input = Map::new();
        merge_into(&mut input, json!({ "a": 1, "shared": "first" }));
        merge_into(&mut input, json!({ "shared": "second" }));
        merge_into(&mut input, json!(42));

        assert_eq!(
            Value::Object(input),
            json!({ "a": 1, "shared": "second", "output": 42 })
        );
    }
}
