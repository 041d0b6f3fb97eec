use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use hostlink_core::request::CoordinationRequest;

/// What a handler reports when it returns normally.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The work ran to its end and this is its determinate result.
    Completed {
        summary: Option<String>,
        data: Option<serde_json::Value>,
    },
    /// The work was started but its effect cannot be confirmed.
    Inconclusive(String),
}

impl HandlerOutcome {
    pub fn completed() -> Self {
        Self::Completed {
            summary: None,
            data: None,
        }
    }

    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self::Completed {
            summary: Some(summary.into()),
            data: None,
        }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self::Completed {
            summary: None,
            data: Some(data),
        }
    }
}

/// Executes requests of one kind on the host's main context.
///
/// Returning `Err` fails the request with the error chain as its message.
/// Panics are caught and also fail the request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn kind(&self) -> &str;

    async fn handle(&self, request: &CoordinationRequest) -> anyhow::Result<HandlerOutcome>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its kind. A later registration for the same
    /// kind replaces the earlier one.
    pub fn register(&mut self, handler: Arc<dyn RequestHandler>) {
        let kind = handler.kind().to_string();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::warn!(kind = %kind, "request_handler_replaced");
        }
    }

    pub fn with(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl RequestHandler for Named {
        fn kind(&self) -> &str {
            self.0
        }

        async fn handle(&self, _request: &CoordinationRequest) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::with_summary(self.0))
        }
    }

    #[test]
    fn registry_lists_sorted_kinds() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Named("refresh")))
            .with(Arc::new(Named("build")));
        assert_eq!(registry.kinds(), vec!["build".to_string(), "refresh".to_string()]);
        assert!(registry.get("build").is_some());
        assert!(registry.get("deploy").is_none());
    }
}
