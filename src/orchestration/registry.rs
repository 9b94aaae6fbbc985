//! Tool capabilities and the registry that resolves them by name.
//!
//! Registration happens once through [`ToolRegistryBuilder`]; the built
//! registry is immutable and cheap to clone into worker tasks.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ToolError;

/// A single external effect the engine can invoke.
///
/// Implementations classify their own failures: [`ToolError::Transient`]
/// is retried with backoff, [`ToolError::Permanent`] fails the task at once.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Default registry key.
    fn name(&self) -> &str;

    async fn call(&self, args: &Value) -> Result<Value, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered keys, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Register `tool` under its own name. A later registration with the
    /// same key replaces the earlier one.
    pub fn register(self, tool: impl Tool + 'static) -> Self {
        let name = tool.name().to_string();
        self.register_as(name, tool)
    }

    /// Register `tool` as `"<namespace>.<name>"`.
    pub fn register_namespaced(self, namespace: &str, tool: impl Tool + 'static) -> Self {
        let name = format!("{}.{}", namespace, tool.name());
        self.register_as(name, tool)
    }

    pub fn register_as(mut self, name: impl Into<String>, tool: impl Tool + 'static) -> Self {
        let name = name.into();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the later one");
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        tracing::debug!(count = self.tools.len(), "tool registry built");
        ToolRegistry {
            tools: Arc::new(self.tools),
        }
    }
}
