//! Task handler registry.
//!
//! Built once at process start and handed to [`Queue::start`](super::Queue::start);
//! read-only afterwards, so workers share it without locking.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::Task;
use crate::Error;

/// Executes tasks of one name.
///
/// Delivery is at-least-once, so handlers must tolerate running the same
/// task more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), Error>;
}

/// Task name to handler map.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateHandler` if the name is already taken.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Result<(), Error> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(Error::DuplicateHandler(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("handlers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _task: &Task) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registered_handler_runs() {
        let mut registry = Registry::new();
        registry.register("Ok", Arc::new(OkHandler)).unwrap();

        let handler = registry.get("Ok").unwrap();
        handler.handle(&Task::new("Ok", Map::new())).await.unwrap();
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = Registry::new();
        registry.register("Ok", Arc::new(OkHandler)).unwrap();
        let err = registry.register("Ok", Arc::new(OkHandler)).unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(name) if name == "Ok"));
        assert_eq!(registry.len(), 1);
    }
}
