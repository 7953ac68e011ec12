//! `AgentContext`: the agent/model binding for one session.
//!
//! Wraps the injected agent registry and caches the active agent/model
//! per actor. Delegate calls returned by a step are re-routed through the
//! normal tool path under the configured delegation function id, so
//! `ToolCaller` never needs to know delegation exists.

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::AgentError;
use crate::prompt_builder::Prompt;
use crate::registry::{AgentRuntime, ArgumentPayload, RawToolCall, StepOptions, StepOutcome};
use std::sync::Arc;

pub struct AgentContext {
    runtime: Arc<dyn AgentRuntime>,
    delegation_func_id: String,
    current_agent: RwLock<Option<String>>,
    current_model: RwLock<Option<String>>,
}

impl AgentContext {
    pub fn new(runtime: Arc<dyn AgentRuntime>, delegation_func_id: impl Into<String>) -> Self {
        Self {
            runtime,
            delegation_func_id: delegation_func_id.into(),
            current_agent: RwLock::new(None),
            current_model: RwLock::new(None),
        }
    }

    /// Loads `agent_id`, resolving its default model when `model` is
    /// omitted.
    pub async fn load_agent(&self, agent_id: &str, model: Option<String>) -> Result<(), AgentError> {
        if !self.runtime.agent_exists(agent_id).await {
            return Err(AgentError::UnknownAgent {
                id: agent_id.to_string(),
            });
        }
        let model = match model {
            Some(m) => {
                if !self.runtime.model_exists(agent_id, &m).await {
                    return Err(AgentError::UnknownModel { id: m });
                }
                m
            }
            None => self.runtime.default_model(agent_id).await?,
        };
        *self.current_agent.write().await = Some(agent_id.to_string());
        *self.current_model.write().await = Some(model);
        Ok(())
    }

    /// Same contract as `load_agent`; named separately to mirror the two
    /// call sites (`agent_change` at open time vs. the `agent{name}`
    /// command mid-session).
    pub async fn switch_to_agent(&self, agent_id: &str, model: Option<String>) -> Result<(), AgentError> {
        self.load_agent(agent_id, model).await
    }

    /// Swaps the model, keeping the current agent.
    pub async fn switch_to_model(&self, model: &str) -> Result<(), AgentError> {
        let agent = self
            .current_agent
            .read()
            .await
            .clone()
            .ok_or_else(|| AgentError::UnknownAgent {
                id: "<none loaded>".to_string(),
            })?;
        if !self.runtime.model_exists(&agent, model).await {
            return Err(AgentError::UnknownModel {
                id: model.to_string(),
            });
        }
        *self.current_model.write().await = Some(model.to_string());
        Ok(())
    }

    pub async fn current_agent(&self) -> Option<String> {
        self.current_agent.read().await.clone()
    }

    pub async fn current_model(&self) -> Option<String> {
        self.current_model.read().await.clone()
    }

    pub async fn step(
        &self,
        prompt: &Prompt,
        options: StepOptions,
    ) -> Result<StepOutcome, AgentError> {
        let agent = self
            .current_agent
            .read()
            .await
            .clone()
            .ok_or_else(|| AgentError::UnknownAgent {
                id: "<none loaded>".to_string(),
            })?;
        let model = self
            .current_model
            .read()
            .await
            .clone()
            .ok_or_else(|| AgentError::UnknownModel {
                id: "<none loaded>".to_string(),
            })?;

        let mut outcome = self.runtime.step(&agent, &model, prompt, options).await?;

        for call in outcome.delegate_calls.drain(..) {
            outcome.tool_calls.push(RawToolCall {
                name: self.delegation_func_id.clone(),
                arguments: tag_delegate_target(call.name, call.arguments),
            });
        }

        Ok(outcome)
    }
}

/// Stashes the original delegate-target name into the call arguments so
/// the delegation function (invoked under `delegation_func_id`) can still
/// tell which agent it is being asked to hand off to.
fn tag_delegate_target(target: String, arguments: ArgumentPayload) -> ArgumentPayload {
    match arguments {
        ArgumentPayload::Decoded(Value::Object(mut map)) => {
            map.insert("target_agent".to_string(), Value::String(target));
            ArgumentPayload::Decoded(Value::Object(map))
        }
        ArgumentPayload::Decoded(other) => ArgumentPayload::Decoded(other),
        ArgumentPayload::Encoded(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(mut map)) => {
                map.insert("target_agent".to_string(), Value::String(target));
                ArgumentPayload::Encoded(
                    serde_json::to_string(&Value::Object(map)).unwrap_or(s),
                )
            }
            _ => ArgumentPayload::Encoded(s),
        },
    }
}
