//! The `_control` envelope: a cross-cutting concern isolated in a single
//! parser that yields a list of `control_*` operations to enqueue, and
//! strips `_control` from the persisted result.
//!
//! A tool's raw JSON result may carry a `_control` object alongside its
//! normal payload. This module is the single place that understands that
//! object's shape; everything downstream (the bus, the persisted message)
//! only ever sees the stripped result plus a list of typed directives.

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlEnvelope {
    #[serde(default)]
    pub artifacts: Vec<ArtifactDirective>,
    #[serde(default)]
    pub context: Option<ContextDirective>,
    #[serde(default)]
    pub memory: Option<MemoryDirective>,
    #[serde(default)]
    pub config: Option<ConfigDirective>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactDirective {
    pub title: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Present ⇒ update an existing artifact; absent ⇒ create one.
    #[serde(default)]
    pub artifact_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextDirective {
    #[serde(default)]
    pub public_meta_set: Map<String, Value>,
    #[serde(default)]
    pub public_meta_delete: Vec<String>,
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub delete: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryDirective {
    #[serde(default)]
    pub add: Vec<MemoryAdd>,
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub clear_by_type: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryAdd {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDirective {
    pub agent: Option<String>,
    pub model: Option<String>,
}

/// One directive bundle, ready to become a `control_*` bus operation.
#[derive(Debug, Clone)]
pub enum ControlOp {
    Artifacts(Vec<ArtifactDirective>),
    Context(ContextDirective),
    Memory(MemoryDirective),
    Config(ConfigDirective),
}

impl ControlEnvelope {
    pub fn into_ops(self) -> Vec<ControlOp> {
        let mut ops = Vec::new();
        if !self.artifacts.is_empty() {
            ops.push(ControlOp::Artifacts(self.artifacts));
        }
        if let Some(context) = self.context {
            ops.push(ControlOp::Context(context));
        }
        if let Some(memory) = self.memory {
            ops.push(ControlOp::Memory(memory));
        }
        if let Some(config) = self.config {
            ops.push(ControlOp::Config(config));
        }
        ops
    }
}

/// Removes and parses `_control` from a tool result, returning the
/// directives (if any). `result` is mutated in place to strip the key so
/// the persisted function-result metadata never carries it.
pub fn extract(result: &mut Value) -> Option<ControlEnvelope> {
    let obj = result.as_object_mut()?;
    let raw = obj.remove("_control")?;
    serde_json::from_value(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_control_and_yields_artifact_op() {
        let mut result = json!({
            "result": "ok",
            "_control": {
                "artifacts": [{"title": "Notes", "content": "# N", "type": "inline"}]
            }
        });
        let envelope = extract(&mut result).unwrap();
        assert_eq!(result, json!({"result": "ok"}));
        let ops = envelope.into_ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], ControlOp::Artifacts(a) if a.len() == 1 && a[0].title == "Notes"));
    }

    #[test]
    fn missing_control_yields_none() {
        let mut result = json!({"result": "ok"});
        assert!(extract(&mut result).is_none());
    }
}
