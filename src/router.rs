use async_trait::async_trait;
use color_eyre::eyre::Result;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A named capability supplied by the host application. Handlers receive the
/// opaque parameters document for one invocation and either return a success
/// payload or signal a failure.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, params: JsonValue) -> Result<JsonValue>;
}

pub type BoxedHandler = Arc<dyn ToolHandler>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// Name-to-handler mapping, populated once at process start and frozen behind
/// an `Arc` afterwards. Resolution is a case-insensitive exact match; any name
/// outside the registry fails closed.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: BoxedHandler) {
        let key = handler.name().to_lowercase();
        if self.handlers.insert(key.clone(), handler).is_some() {
            tracing::warn!(tool = %key, "Replaced an already registered tool handler");
        }
    }

    pub fn resolve(&self, tool: &str) -> Result<&BoxedHandler, RouterError> {
        self.handlers
            .get(&tool.to_lowercase())
            .ok_or_else(|| RouterError::UnknownTool(tool.to_string()))
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Closure-backed handler for tests.
#[cfg(test)]
pub struct FnHandler {
    name: String,
    func: Box<dyn Fn(JsonValue) -> Result<JsonValue> + Send + Sync>,
}

#[cfg(test)]
impl FnHandler {
    pub fn new<F>(name: &str, func: F) -> Arc<Self>
    where
        F: Fn(JsonValue) -> Result<JsonValue> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            func: Box::new(func),
        })
    }
}

#[cfg(test)]
#[async_trait]
impl ToolHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: JsonValue) -> Result<JsonValue> {
        (self.func)(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;
    use serde_json::json;

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(FnHandler::new("echo", |params| Ok(params)));
        registry
    }

    #[tokio::test]
    async fn resolves_registered_tool() {
        let registry = registry_with_echo();
        let handler = registry.resolve("echo").expect("echo is registered");
        let out = handler.execute(json!({"msg": "hi"})).await.expect("echo");
        assert_eq!(out, json!({"msg": "hi"}));
    }

    #[test]
    fn resolution_is_case_insensitive() {
        let registry = registry_with_echo();
        assert!(registry.resolve("Echo").is_ok());
        assert!(registry.resolve("ECHO").is_ok());
    }

    #[test]
    #[tracing_test::traced_test]
    fn replacing_a_handler_warns_with_the_tool_name() {
        let mut registry = registry_with_echo();
        registry.register(FnHandler::new("echo", |_| Ok(json!(null))));
        assert!(logs_contain("echo"));
        assert!(logs_contain("Replaced an already registered tool handler"));
    }

    #[test]
    fn unknown_tool_fails_closed() {
        let registry = registry_with_echo();
        let err = registry
            .resolve("manage_nothing")
            .err()
            .expect("unknown tool");
        assert_eq!(err.to_string(), "Unknown tool: manage_nothing");
    }

    #[tokio::test]
    async fn handler_failure_is_propagated() {
        let mut registry = ToolRegistry::new();
        registry.register(FnHandler::new("broken", |_| Err(eyre!("host refused"))));
        let handler = registry.resolve("broken").expect("registered");
        let err = handler.execute(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("host refused"));
    }
}
