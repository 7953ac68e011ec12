//! `ToolCaller`: validates and dispatches a batch of tool calls.
//!
//! Two phases: `validate` resolves each call's schema, mints a
//! [`CallId`], and enforces the exclusivity rule; `execute` dispatches
//! the validated batch sequentially or in parallel (the default), fanning
//! out with a [`tokio::task::JoinSet`] and collecting a per-call result
//! keyed by `call_id`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::ToolError;
use crate::ids::{CallId, SessionId, UserId};
use crate::registry::{ArgumentPayload, RawToolCall, ToolExecutionContext, ToolRegistry};

#[derive(Debug, Clone)]
pub struct ValidatedCall {
    pub call_id: CallId,
    pub name: String,
    pub arguments: Value,
    pub exclusive: bool,
    pub private: bool,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub calls: Vec<ValidatedCall>,
    /// Names of calls dropped because an exclusive call won the batch.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success { call: ValidatedCall, result: Value },
    Error { call: ValidatedCall, error: String },
}

impl CallOutcome {
    pub fn call(&self) -> &ValidatedCall {
        match self {
            CallOutcome::Success { call, .. } | CallOutcome::Error { call, .. } => call,
        }
    }
}

pub struct ToolCaller {
    registry: Arc<dyn ToolRegistry>,
}

impl ToolCaller {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self { registry }
    }

    pub async fn validate(&self, raw: Vec<RawToolCall>) -> Result<ValidationOutcome, ToolError> {
        let mut resolved = Vec::with_capacity(raw.len());
        for call in raw {
            let schema = self.registry.schema(&call.name).await?;
            let arguments = decode_arguments(call.arguments)?;
            resolved.push(ValidatedCall {
                call_id: CallId::new(),
                name: call.name,
                arguments,
                exclusive: schema.exclusive,
                private: schema.private,
            });
        }

        let exclusive_count = resolved.iter().filter(|c| c.exclusive).count();
        if exclusive_count > 1 {
            return Err(ToolError::MultipleExclusive);
        }

        if exclusive_count == 1 {
            let mut kept = Vec::new();
            let mut skipped = Vec::new();
            for call in resolved {
                if call.exclusive {
                    kept.push(call);
                } else {
                    skipped.push(call.name);
                }
            }
            Ok(ValidationOutcome { calls: kept, skipped })
        } else {
            Ok(ValidationOutcome {
                calls: resolved,
                skipped: Vec::new(),
            })
        }
    }

    pub async fn execute(
        &self,
        calls: Vec<ValidatedCall>,
        session_id: SessionId,
        user_id: UserId,
        strategy: ExecutionStrategy,
    ) -> Vec<CallOutcome> {
        match strategy {
            ExecutionStrategy::Sequential => {
                let mut outcomes = Vec::with_capacity(calls.len());
                for call in calls {
                    outcomes.push(execute_one(self.registry.clone(), call, session_id, user_id).await);
                }
                outcomes
            }
            ExecutionStrategy::Parallel => {
                let mut set = tokio::task::JoinSet::new();
                for call in calls {
                    let registry = self.registry.clone();
                    set.spawn(async move { execute_one(registry, call, session_id, user_id).await });
                }
                let mut outcomes = Vec::new();
                while let Some(joined) = set.join_next().await {
                    if let Ok(outcome) = joined {
                        outcomes.push(outcome);
                    }
                }
                outcomes
            }
        }
    }
}

async fn execute_one(
    registry: Arc<dyn ToolRegistry>,
    call: ValidatedCall,
    session_id: SessionId,
    user_id: UserId,
) -> CallOutcome {
    let ctx = ToolExecutionContext {
        session_id,
        user_id,
        call_id: call.call_id,
    };
    match registry.execute(&call.name, call.arguments.clone(), ctx).await {
        Ok(result) => CallOutcome::Success { call, result },
        Err(e) => CallOutcome::Error {
            error: e.to_string(),
            call,
        },
    }
}

fn decode_arguments(payload: ArgumentPayload) -> Result<Value, ToolError> {
    match payload {
        ArgumentPayload::Decoded(v) => Ok(v),
        ArgumentPayload::Encoded(s) => {
            serde_json::from_str(&s).map_err(|e| ToolError::InvalidArguments {
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolSchema;
    use async_trait::async_trait;

    struct FakeRegistry;

    #[async_trait]
    impl ToolRegistry for FakeRegistry {
        async fn schema(&self, name: &str) -> Result<ToolSchema, ToolError> {
            Ok(ToolSchema {
                name: name.to_string(),
                exclusive: name == "stop_all",
                private: false,
                parameters: Value::Null,
            })
        }

        async fn execute(
            &self,
            name: &str,
            args: Value,
            _ctx: ToolExecutionContext,
        ) -> Result<Value, ToolError> {
            if name == "boom" {
                return Err(ToolError::ExecutionFailed {
                    name: name.to_string(),
                    reason: "kaboom".to_string(),
                });
            }
            Ok(serde_json::json!({"echo": args}))
        }
    }

    fn raw(name: &str, args: Value) -> RawToolCall {
        RawToolCall {
            name: name.to_string(),
            arguments: ArgumentPayload::Decoded(args),
        }
    }

    #[tokio::test]
    async fn exclusive_call_suppresses_the_rest() {
        let caller = ToolCaller::new(Arc::new(FakeRegistry));
        let outcome = caller
            .validate(vec![
                raw("search", Value::Null),
                raw("stop_all", Value::Null),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.calls.len(), 1);
        assert_eq!(outcome.calls[0].name, "stop_all");
        assert_eq!(outcome.skipped, vec!["search".to_string()]);
    }

    #[tokio::test]
    async fn two_exclusive_calls_fail_the_batch() {
        let caller = ToolCaller::new(Arc::new(FakeRegistry));
        let err = caller
            .validate(vec![raw("stop_all", Value::Null), raw("stop_all", Value::Null)])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MultipleExclusive));
    }

    #[tokio::test]
    async fn json_string_arguments_are_decoded_before_dispatch() {
        let caller = ToolCaller::new(Arc::new(FakeRegistry));
        let call = RawToolCall {
            name: "search".to_string(),
            arguments: ArgumentPayload::Encoded(r#"{"q":"rust"}"#.to_string()),
        };
        let outcome = caller.validate(vec![call]).await.unwrap();
        assert_eq!(outcome.calls[0].arguments, serde_json::json!({"q": "rust"}));
    }

    #[tokio::test]
    async fn per_call_failure_does_not_abort_the_batch() {
        let caller = ToolCaller::new(Arc::new(FakeRegistry));
        let outcome = caller
            .validate(vec![raw("boom", Value::Null), raw("search", Value::Null)])
            .await
            .unwrap();
        let results = caller
            .execute(
                outcome.calls,
                SessionId::new(),
                UserId::from_uuid(uuid::Uuid::now_v7()),
                ExecutionStrategy::Parallel,
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| matches!(r, CallOutcome::Error { .. })));
        assert!(results.iter().any(|r| matches!(r, CallOutcome::Success { .. })));
    }
}
