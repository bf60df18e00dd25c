//! Minimal JSON-Schema validation.
//!
//! Skills declare optional `input_schema` / `output_schema` documents and the
//! invoker contract depends on enforcing them. Only the subset the skill
//! library actually uses is supported: `type`, `required`, `enum`, `pattern`,
//! `properties`, `items` and `additionalProperties`.

use serde_json::Value;

/// A single schema violation, with a JSON-pointer-like path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `value` against `schema`, collecting every violation instead of
/// stopping at the first.
pub fn validate(value: &Value, schema: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    check(value, schema, "$", &mut violations);
    violations
}

/// Convenience wrapper: `Ok(())` when the value conforms.
pub fn conforms(value: &Value, schema: &Value) -> std::result::Result<(), String> {
    let violations = validate(value, schema);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations
            .iter()
            .map(Violation::to_string)
            .collect::<Vec<_>>()
            .join("; "))
    }
}

fn check(value: &Value, schema: &Value, path: &str, out: &mut Vec<Violation>) {
    let schema = match schema.as_object() {
        Some(s) => s,
        // A non-object schema (e.g. `true`) accepts everything.
        None => return,
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(value, expected) {
            out.push(Violation {
                path: path.to_string(),
                message: format!("expected type '{}', got '{}'", expected, type_name(value)),
            });
            // Remaining keywords assume the declared type.
            return;
        }
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            out.push(Violation {
                path: path.to_string(),
                message: format!("value not in enum {:?}", options),
            });
        }
    }

    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        if let Some(s) = value.as_str() {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("string does not match pattern '{}'", pattern),
                        });
                    }
                }
                Err(e) => out.push(Violation {
                    path: path.to_string(),
                    message: format!("invalid pattern '{}': {}", pattern, e),
                }),
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    out.push(Violation {
                        path: format!("{}.{}", path, name),
                        message: "required property missing".to_string(),
                    });
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(props) = properties {
            for (name, sub) in props {
                if let Some(v) = obj.get(name) {
                    check(v, sub, &format!("{}.{}", path, name), out);
                }
            }
        }

        match schema.get("additionalProperties") {
            Some(Value::Bool(false)) => {
                for name in obj.keys() {
                    let declared = properties.map(|p| p.contains_key(name)).unwrap_or(false);
                    if !declared {
                        out.push(Violation {
                            path: format!("{}.{}", path, name),
                            message: "additional property not allowed".to_string(),
                        });
                    }
                }
            }
            Some(extra_schema @ Value::Object(_)) => {
                for (name, v) in obj {
                    let declared = properties.map(|p| p.contains_key(name)).unwrap_or(false);
                    if !declared {
                        check(v, extra_schema, &format!("{}.{}", path, name), out);
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema.get("items") {
            for (i, v) in items.iter().enumerate() {
                check(v, item_schema, &format!("{}[{}]", path, i), out);
            }
        }
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
