//! Core types and shared functionality for outpost.
//!
//! This crate provides:
//! - ActivityStreams documents and Cache-Control parsing
//! - SQLite storage for cached documents and queued tasks
//! - A priority task queue with retry and failure logging
//! - Unified error types and layered configuration

pub mod cachecontrol;
pub mod config;
pub mod document;
pub mod error;
pub mod queue;
pub mod storage;

pub use cachecontrol::CacheControl;
pub use config::AppConfig;
pub use document::{Document, Outbox, Page, Relation, RelationType};
pub use error::{Error, ErrorKind};
pub use queue::{Queue, QueueHandle, Registry, Task, TaskHandler};
pub use storage::{CachedDocument, DocumentStore, FailedTask, Store, TaskStore};

/// Current wall-clock time as Unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
