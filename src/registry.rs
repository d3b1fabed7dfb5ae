use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::handler::IdempotencyHandler;

/// Explicit registry of named idempotency handlers.
///
/// Replaces implicit module-scoped default providers: the registry is
/// constructed by the application, passed through context, and can be cleared
/// for test isolation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<IdempotencyHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, handler: Arc<IdempotencyHandler>) {
        self.handlers.write().unwrap().insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<IdempotencyHandler>> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<IdempotencyHandler>> {
        self.handlers.write().unwrap().remove(name)
    }

    /// Drops every registered handler. Test isolation helper.
    pub fn clear(&self) {
        self.handlers.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdempotencyConfig;
    use crate::persistence::InMemoryStore;

    fn handler() -> Arc<IdempotencyHandler> {
        Arc::new(IdempotencyHandler::new(
            Arc::new(InMemoryStore::new()),
            IdempotencyConfig::default(),
        ))
    }

    #[test]
    fn test_register_and_get() {
        let registry = HandlerRegistry::new();
        registry.register("payments", handler());

        assert!(registry.get("payments").is_some());
        assert!(registry.get("orders").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = HandlerRegistry::new();
        let first = handler();
        registry.register("payments", Arc::clone(&first));
        let second = handler();
        registry.register("payments", Arc::clone(&second));

        let current = registry.get("payments").unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clear_for_test_isolation() {
        let registry = HandlerRegistry::new();
        registry.register("a", handler());
        registry.register("b", handler());

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove() {
        let registry = HandlerRegistry::new();
        registry.register("a", handler());

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
    }
}
