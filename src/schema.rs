//! Opaque validation boundary shared by structured output and tool
//! arguments: a schema takes a JSON value and either returns the validated
//! value or fails.

use serde_json::Value;

use crate::error::SchemaError;

pub trait Schema: Send + Sync {
    fn parse(&self, input: &Value) -> Result<Value, SchemaError>;
}

/// Any plain function over a value is a usable schema.
impl<F> Schema for F
where
    F: Fn(&Value) -> Result<Value, SchemaError> + Send + Sync,
{
    fn parse(&self, input: &Value) -> Result<Value, SchemaError> {
        self(input)
    }
}

/// Declarative validator over a JSON-schema-shaped description: object root,
/// `required` membership, primitive `type` checks per property, and
/// `additionalProperties: false` enforcement.
#[derive(Clone, Debug)]
pub struct JsonSchema {
    schema: Value,
}

impl JsonSchema {
    /// Accepts the schema after checking it is well formed; malformed
    /// schemas are a construction-time error, not a parse-time surprise.
    pub fn new(schema: Value) -> Result<Self, SchemaError> {
        let root = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

        if root.get("type").and_then(Value::as_str) != Some("object") {
            return Err(SchemaError::RootTypeMustBeObject);
        }

        if let Some(required) = root.get("required") {
            let names = required.as_array().ok_or(SchemaError::InvalidRequired)?;
            if names.iter().any(|name| !name.is_string()) {
                return Err(SchemaError::InvalidRequired);
            }
        }

        Ok(Self { schema })
    }

    pub fn describe(&self) -> &Value {
        &self.schema
    }
}

impl Schema for JsonSchema {
    fn parse(&self, input: &Value) -> Result<Value, SchemaError> {
        let object = input
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("value must be a JSON object".to_string()))?;
        let root = self
            .schema
            .as_object()
            .ok_or(SchemaError::SchemaNotObject)?;

        if let Some(required) = root.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(SchemaError::Invalid(format!(
                        "missing required field: {name}"
                    )));
                }
            }
        }

        let properties = root.get("properties").and_then(Value::as_object);

        if root.get("additionalProperties").and_then(Value::as_bool) == Some(false) {
            for key in object.keys() {
                let known = properties.is_some_and(|props| props.contains_key(key));
                if !known {
                    return Err(SchemaError::Invalid(format!("unknown field: {key}")));
                }
            }
        }

        if let Some(properties) = properties {
            for (key, value) in object {
                let declared = properties
                    .get(key)
                    .and_then(|property| property.get("type"))
                    .and_then(Value::as_str);
                if let Some(type_name) = declared {
                    if !matches_type(value, type_name) {
                        return Err(SchemaError::Invalid(format!(
                            "field '{key}' must be of type {type_name}"
                        )));
                    }
                }
            }
        }

        Ok(input.clone())
    }
}

fn matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
