//! Placeholder invoker.
//!
//! Echoes a structured stub honoring the skill's output schema. Used in
//! tests and whenever no real backend is wired in; its output is a pure
//! function of the schema, so placeholder-backed skills behave
//! deterministically.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::registry::{InvokerKind, Skill};

use super::SkillInvoker;

#[derive(Debug, Clone, Default)]
pub struct PlaceholderInvoker;

impl PlaceholderInvoker {
    pub fn new() -> Self {
        Self
    }

    fn stub_for(name: &str, property_schema: &Value) -> Value {
        match property_schema.get("type").and_then(Value::as_str) {
            Some("number") => json!(1.0),
            Some("integer") => json!(1),
            Some("boolean") => json!(true),
            Some("array") => json!([]),
            Some("object") => json!({}),
            _ => {
                // Respect an enum if declared, otherwise a visibly fake string.
                if let Some(first) = property_schema
                    .get("enum")
                    .and_then(Value::as_array)
                    .and_then(|options| options.first())
                {
                    first.clone()
                } else {
                    Value::String(format!("stub:{name}"))
                }
            }
        }
    }
}

#[async_trait]
impl SkillInvoker for PlaceholderInvoker {
    fn kind(&self) -> Option<InvokerKind> {
        Some(InvokerKind::Placeholder)
    }

    fn supports(&self, _skill: &Skill) -> bool {
        true
    }

    async fn invoke(&self, skill: &Skill, _input: &Value, _context: &Value) -> Result<Value> {
        let output = match skill
            .output_schema
            .as_ref()
            .and_then(|s| s.get("properties"))
            .and_then(Value::as_object)
        {
            Some(properties) => {
                let mut output = Map::new();
                for (name, property_schema) in properties {
                    output.insert(name.clone(), Self::stub_for(name, property_schema));
                }
                Value::Object(output)
            }
            None => json!({ "result": format!("skill '{}' executed", skill.id) }),
        };
        Ok(output)
    }
}
