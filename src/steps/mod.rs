//! Pipeline steps — the unit-of-work contract and its implementations.
//!
//! A step only implements [`Step::run`]. Starting, finishing, statistics
//! and critical-error logging are applied uniformly by [`execute`].

pub mod context;
pub mod integration;
pub mod lifecycle;
pub mod records;
pub mod setup;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StepError;
use crate::pipeline::registry::StepKind;

pub use context::{RunEnv, StepContext};
pub use lifecycle::execute;

/// JSON result map returned by a step.
pub type StepOutput = serde_json::Map<String, serde_json::Value>;

/// A unit of work in the import pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    fn kind(&self) -> StepKind;

    /// Text used in the "Starting: ..." log line.
    fn description(&self) -> String {
        self.kind().label().to_string()
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutput, StepError>;
}

/// Values produced by one step for later steps of the same run.
#[derive(Debug, Clone, Default)]
pub struct RunArtifacts {
    values: BTreeMap<String, serde_json::Value>,
}

impl RunArtifacts {
    pub const DEFAULT_UNIT_ID: &'static str = "default_unit_id";

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Build a [`StepOutput`] from a `json!` object literal.
pub fn output(value: serde_json::Value) -> StepOutput {
    match value {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = StepOutput::new();
            map.insert("value".into(), other);
            map
        }
    }
}

/// Registry id of a record payload, whichever field the resource uses.
pub fn record_id(payload: &serde_json::Value) -> Option<String> {
    ["id", "objectId", "mongoId", "uid", "code"]
        .iter()
        .filter_map(|field| payload.get(*field))
        .find_map(|value| match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_prefers_id_then_fallbacks() {
        assert_eq!(
            record_id(&serde_json::json!({"id": "A1", "objectId": "B"})),
            Some("A1".into())
        );
        assert_eq!(
            record_id(&serde_json::json!({"objectId": "B2"})),
            Some("B2".into())
        );
        assert_eq!(record_id(&serde_json::json!({"code": 44})), Some("44".into()));
        assert_eq!(record_id(&serde_json::json!({"id": "  "})), None);
        assert_eq!(record_id(&serde_json::json!({"name": "x"})), None);
    }

    #[test]
    fn artifacts_store_typed_values() {
        let mut artifacts = RunArtifacts::default();
        assert!(artifacts.is_empty());
        artifacts.insert(RunArtifacts::DEFAULT_UNIT_ID, serde_json::json!("u-1"));
        assert_eq!(artifacts.get_str(RunArtifacts::DEFAULT_UNIT_ID), Some("u-1"));
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn output_wraps_non_objects() {
        let map = output(serde_json::json!({"a": 1}));
        assert_eq!(map["a"], 1);
        let map = output(serde_json::json!(5));
        assert_eq!(map["value"], 5);
    }
}
