//! Incremental static page cache for crawler serving.
//!
//! Pages are rendered in resumable, per-type batches into a blob store with a
//! SQLite index; the resolver serves them with hit/stale/miss semantics.

pub mod admin;
pub mod app;
pub mod blob;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod generator;
pub mod http;
pub mod model;
pub mod paths;
pub mod progress;
pub mod purge;
pub mod render;
pub mod resolver;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod store;

pub use error::{CacheError, Result};
