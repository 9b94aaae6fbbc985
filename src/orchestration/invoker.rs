//! Tool invocation with caching, timeouts and retry.
//!
//! The invoker consults the result cache first. On a miss it resolves the
//! tool in the registry, calls it under a timeout, and retries transient
//! failures with exponential backoff. Every attempt, cache hits included,
//! produces an [`InvocationRecord`].

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::{Fingerprint, TaskId, ToolRef};
use crate::error::ToolError;
use crate::state::{InvocationOutcome, InvocationRecord, ResultCache};

use super::{RetryPolicy, ToolRegistry};

/// Final result of invoking one task's tool, with its attempt records.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    /// Attempt that produced `result`.
    pub attempt: u32,
    pub result: Result<Value, ToolError>,
    pub records: Vec<InvocationRecord>,
}

#[derive(Debug, Clone)]
pub struct ToolInvoker {
    registry: ToolRegistry,
    cache: Option<Arc<ResultCache>>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: ToolRegistry, retry: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            registry,
            cache: None,
            retry,
            default_timeout,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Timeout for `tool`: its own override, else the configured default.
    pub fn timeout_for(&self, tool: &ToolRef) -> Duration {
        tool.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    /// Run `tool` for `task_id` to a terminal result.
    pub async fn invoke(&self, task_id: &TaskId, tool: &ToolRef) -> TaskOutcome {
        let fingerprint = tool.fingerprint();
        let mut records = Vec::new();

        if let Some(value) = self.cache.as_ref().and_then(|c| c.get(&fingerprint)) {
            tracing::debug!(task_id = %task_id, fingerprint = %fingerprint.short(), "cache hit");
            records.push(self.record(
                task_id,
                1,
                tool,
                &fingerprint,
                Utc::now(),
                Duration::ZERO,
                InvocationOutcome::CacheHit,
            ));
            return TaskOutcome {
                task_id: task_id.clone(),
                attempt: 1,
                result: Ok(value),
                records,
            };
        }

        let timeout = self.timeout_for(tool);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started_at = Utc::now();
            let clock = Instant::now();
            tracing::trace!(task_id = %task_id, attempt, args = %tool.args, "calling tool");
            let result = self.call_once(tool, timeout).await;
            let duration = clock.elapsed();

            match result {
                Ok(value) => {
                    if let Some(cache) = &self.cache {
                        cache.insert(fingerprint.clone(), value.clone());
                    }
                    tracing::debug!(task_id = %task_id, attempt, ?duration, "tool succeeded");
                    records.push(self.record(
                        task_id,
                        attempt,
                        tool,
                        &fingerprint,
                        started_at,
                        duration,
                        InvocationOutcome::Succeeded,
                    ));
                    return TaskOutcome {
                        task_id: task_id.clone(),
                        attempt,
                        result: Ok(value),
                        records,
                    };
                }
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    let retry_in = self.retry.delay_after(attempt);
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        error = %err,
                        ?retry_in,
                        "transient tool failure, retrying"
                    );
                    records.push(self.record(
                        task_id,
                        attempt,
                        tool,
                        &fingerprint,
                        started_at,
                        duration,
                        InvocationOutcome::Retrying {
                            error: err.to_string(),
                            retry_in,
                        },
                    ));
                    tokio::time::sleep(retry_in).await;
                }
                Err(err) => {
                    tracing::warn!(task_id = %task_id, attempt, error = %err, "tool failed");
                    records.push(self.record(
                        task_id,
                        attempt,
                        tool,
                        &fingerprint,
                        started_at,
                        duration,
                        InvocationOutcome::Failed {
                            error: err.to_string(),
                            transient: err.is_transient(),
                        },
                    ));
                    return TaskOutcome {
                        task_id: task_id.clone(),
                        attempt,
                        result: Err(err),
                        records,
                    };
                }
            }
        }
    }

    async fn call_once(&self, tool: &ToolRef, timeout: Duration) -> Result<Value, ToolError> {
        let handler = self
            .registry
            .get(&tool.name)
            .ok_or_else(|| ToolError::UnknownTool(tool.name.clone()))?;
        match tokio::time::timeout(timeout, handler.call(&tool.args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(timeout)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        task_id: &TaskId,
        attempt: u32,
        tool: &ToolRef,
        fingerprint: &Fingerprint,
        started_at: chrono::DateTime<Utc>,
        duration: Duration,
        outcome: InvocationOutcome,
    ) -> InvocationRecord {
        InvocationRecord {
            task_id: task_id.clone(),
            iteration: 0,
            attempt,
            tool: tool.name.clone(),
            fingerprint: fingerprint.clone(),
            started_at,
            duration,
            outcome,
        }
    }
}
