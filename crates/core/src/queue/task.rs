//! Task records: named units of work with scheduling and retry state.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{Error, now_unix};

/// Priority for work a user is waiting on.
pub const PRIORITY_INTERACTIVE: i64 = 8;
/// Priority for ordinary background work.
pub const PRIORITY_DEFAULT: i64 = 128;
/// Priority for best-effort batch work.
pub const PRIORITY_BATCH: i64 = 1024;

/// A scheduled unit of work. Lower `priority` runs first.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    /// Handler key.
    pub name: String,
    pub arguments: Map<String, Value>,
    /// Dedup key; tasks with the same name and signature collapse in storage.
    pub signature: Option<String>,
    pub create_date: i64,
    /// Earliest time the task may run.
    pub start_date: i64,
    /// Lock expiry. Once past, any worker may claim the task.
    pub timeout_date: i64,
    pub priority: i64,
    pub retry_count: u32,
    /// Retry budget; `None` takes the queue's default when pushed.
    pub retry_max: Option<u32>,
    /// Owning poll batch, empty when unclaimed.
    pub lock_id: String,
    /// Last handler error.
    pub error: String,
}

impl Task {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        let now = now_unix();
        Self {
            task_id: ulid::Ulid::new().to_string(),
            name: name.into(),
            arguments,
            signature: None,
            create_date: now,
            start_date: now,
            timeout_date: now,
            priority: PRIORITY_DEFAULT,
            retry_count: 0,
            retry_max: None,
            lock_id: String::new(),
            error: String::new(),
        }
    }

    /// Build a task from any serializable argument struct.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `args` does not serialize to a JSON object.
    pub fn with_args<T: Serialize>(name: impl Into<String>, args: &T) -> Result<Self, Error> {
        match serde_json::to_value(args)? {
            Value::Object(map) => Ok(Self::new(name, map)),
            other => Err(Error::InvalidInput(format!("task arguments must be an object, got {other}"))),
        }
    }

    /// Decode the arguments into a typed struct.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(Value::Object(self.arguments.clone()))
            .map_err(|e| Error::InvalidInput(format!("{} arguments: {e}", self.name)))
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the task back for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.start_date = self.create_date + delay.as_secs() as i64;
        self.timeout_date = self.start_date;
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_retry_max(mut self, retry_max: u32) -> Self {
        self.retry_max = Some(retry_max);
        self
    }

    /// Seconds until the task becomes eligible, zero if it already is.
    pub fn delay_from(&self, now: i64) -> Duration {
        Duration::from_secs(self.start_date.saturating_sub(now).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        url: String,
    }

    #[test]
    fn test_builder() {
        let task = Task::new("Noop", Map::new())
            .with_priority(PRIORITY_BATCH)
            .with_delay(Duration::from_secs(60))
            .with_signature("https://remote/note/1");
        assert_eq!(task.priority, 1024);
        assert_eq!(task.start_date, task.create_date + 60);
        assert_eq!(task.timeout_date, task.start_date);
        assert_eq!(task.signature.as_deref(), Some("https://remote/note/1"));
        assert!(task.lock_id.is_empty());
    }

    #[test]
    fn test_typed_arguments() {
        let args = Args { url: "https://remote/note/1".into() };
        let task = Task::with_args("Fetch", &args).unwrap();
        assert_eq!(task.arguments["url"], "https://remote/note/1");
        assert_eq!(task.args::<Args>().unwrap(), args);
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        let result = Task::with_args("Fetch", &vec![1, 2]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_bad_arguments_are_client_errors() {
        let task = Task::new("Fetch", Map::new());
        let err = task.args::<Args>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Task::new("Noop", Map::new());
        let b = Task::new("Noop", Map::new());
        assert_ne!(a.task_id, b.task_id);
    }
}
