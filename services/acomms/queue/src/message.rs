//! Structured messages and dotted field-path access.

use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Generic accessor for nested fields addressed by dotted paths
/// such as `"header.dest"`.
pub trait FieldAccess {
    /// Look up a field
    fn get_field(&self, path: &str) -> Option<&Value>;

    /// Set a field, creating intermediate objects as needed
    fn set_field(&mut self, path: &str, value: Value) -> Result<(), QueueError>;
}

impl FieldAccess for Value {
    fn get_field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self, |current, name| current.as_object()?.get(name))
    }

    fn set_field(&mut self, path: &str, value: Value) -> Result<(), QueueError> {
        let mut names = path.split('.').peekable();
        let mut current = self;

        while let Some(name) = names.next() {
            if name.is_empty() {
                return Err(QueueError::Configuration(format!("empty segment in field path `{}`", path)));
            }

            if current.is_null() {
                *current = Value::Object(Map::new());
            }

            let object = match current {
                Value::Object(map) => map,
                _ => {
                    return Err(QueueError::Configuration(format!(
                        "cannot access child `{}` of a non-object field in `{}`",
                        name, path
                    )))
                }
            };

            if names.peek().is_none() {
                object.insert(name.to_string(), value);
                return Ok(());
            }
            current = object.entry(name.to_string()).or_insert(Value::Null);
        }

        Err(QueueError::Configuration("empty field path".to_string()))
    }
}

/// A message of a known type with a structured body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicMessage {
    /// Message type identifier
    pub type_id: u32,
    /// Message content
    pub body: Value,
}

impl DynamicMessage {
    /// Create a message
    pub fn new(type_id: u32, body: Value) -> Self {
        Self { type_id, body }
    }
}

impl FieldAccess for DynamicMessage {
    fn get_field(&self, path: &str) -> Option<&Value> {
        self.body.get_field(path)
    }

    fn set_field(&mut self, path: &str, value: Value) -> Result<(), QueueError> {
        self.body.set_field(path, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested_field() {
        let msg = DynamicMessage::new(4, json!({"header": {"dest": 3, "time": 1.5}, "telegram": "hi"}));
        assert_eq!(msg.get_field("header.dest"), Some(&json!(3)));
        assert_eq!(msg.get_field("telegram"), Some(&json!("hi")));
        assert_eq!(msg.get_field("header.src"), None);
        assert_eq!(msg.get_field("telegram.length"), None);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut msg = DynamicMessage::new(4, Value::Null);
        msg.set_field("header.dest", json!(7)).unwrap();
        msg.set_field("header.src", json!(1)).unwrap();
        assert_eq!(msg.body, json!({"header": {"dest": 7, "src": 1}}));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut value = json!({"telegram": "hi"});
        assert!(value.set_field("telegram.length", json!(2)).is_err());
        assert!(value.set_field("a..b", json!(2)).is_err());
    }
}
