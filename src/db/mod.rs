//! Database module: write payloads and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: payloads and view models crossing the SQL boundary.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `prerender_cache::db`; the repository
//! API and the payload types are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EntryUpsert, RunOutcome};
