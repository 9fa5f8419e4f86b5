use log::info;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::Transformer;
use crate::config::TransformerConfig;
use crate::connectors::Message;
use crate::error::TransformError;
use crate::util;

/// Value injected by `JsonAppend`.
#[derive(Clone)]
pub enum Field {
    Static(Value),

    /// Evaluated once per message.
    Computed(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl Field {
    fn value(&self) -> Value {
        match self {
            Field::Static(v) => v.clone(),
            Field::Computed(f) => f(),
        }
    }
}

/// Injects fields into JSON object messages.
///
/// Existing keys are overwritten. Input that is not a JSON object is
/// rejected with `TransformError`.
#[derive(Clone, Default)]
pub struct JsonAppend {
    fields: Vec<(String, Field)>,
}

impl JsonAppend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), Field::Static(value.into())));
        self
    }

    pub fn with_computed(
        mut self,
        key: impl Into<String>,
        f: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.fields.push((key.into(), Field::Computed(Arc::new(f))));
        self
    }

    pub fn from_config(cfg: &TransformerConfig) -> Self {
        let mut transformer = cfg
            .append
            .iter()
            .fold(Self::new(), |t, (k, v)| t.with_field(k.clone(), v.clone()));

        if let Some(field) = &cfg.timestamp_field {
            transformer = transformer.with_computed(field.clone(), || Value::from(util::now_ms()));
        }

        transformer
    }
}

impl Transformer for JsonAppend {
    fn name(&self) -> &'static str {
        "json"
    }

    fn transform(&self, message: &str) -> Result<Message, TransformError> {
        let mut obj: Map<String, Value> = match serde_json::from_str(message)? {
            Value::Object(obj) => obj,
            other => return Err(TransformError::NotAnObject(kind_of(&other))),
        };

        for (key, field) in &self.fields {
            obj.insert(key.clone(), field.value());
        }

        Ok(serde_json::to_string(&Value::Object(obj))?)
    }

    fn info(&self) {
        info!("Using JSON transformer.");
        let keys: Vec<&str> = self.fields.iter().map(|(k, _)| k.as_str()).collect();
        info!("appending fields: {:?}", keys);
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn appends_field() {
        let t = JsonAppend::new().with_field("k", "v");
        let out = t.transform(r#"{"x":1}"#).unwrap();
        assert_eq!(parse(&out), json!({"x": 1, "k": "v"}));
    }

    #[test]
    fn keeps_existing_fields_of_every_type() {
        let t = JsonAppend::new().with_field("key", 1.5);
        let out = t
            .transform(r#"{"a":1, "b":"2", "c":true, "d":null}"#)
            .unwrap();
        assert_eq!(
            parse(&out),
            json!({"a": 1, "b": "2", "c": true, "d": null, "key": 1.5})
        );
    }

    #[test]
    fn overwrites_existing_key() {
        let t = JsonAppend::new().with_field("x", 2);
        assert_eq!(parse(&t.transform(r#"{"x":1}"#).unwrap()), json!({"x": 2}));
    }

    #[test]
    fn computed_fields_run_per_message() {
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let c = counter.clone();
        let t = JsonAppend::new().with_computed("seq", move || {
            Value::from(c.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
        });

        assert_eq!(parse(&t.transform("{}").unwrap()), json!({"seq": 0}));
        assert_eq!(parse(&t.transform("{}").unwrap()), json!({"seq": 1}));
    }

    #[test]
    fn rejects_non_objects() {
        let t = JsonAppend::new().with_field("k", "v");
        assert!(matches!(t.transform("not json"), Err(TransformError::Json(_))));
        assert!(matches!(
            t.transform("[1,2]"),
            Err(TransformError::NotAnObject("array"))
        ));
    }

    #[test]
    fn from_config_includes_timestamp() {
        let cfg = TransformerConfig {
            kind: "json".to_string(),
            append: json!({"k": "v"}).as_object().unwrap().clone(),
            timestamp_field: Some("received_at".to_string()),
        };
        let out = parse(&JsonAppend::from_config(&cfg).transform(r#"{"x":1}"#).unwrap());

        assert_eq!(out["k"], "v");
        assert_eq!(out["x"], 1);
        assert!(out["received_at"].as_i64().unwrap() > 0);
    }
}
