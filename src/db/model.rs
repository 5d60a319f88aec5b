//! Write payloads and view models used by repositories.
//!
//! Keep these structs focused on the data crossing the SQL boundary. Business
//! logic should live in higher layers.

use crate::model::{GenerationStatus, NaturalKey, PageType};
use chrono::{DateTime, Utc};

/// Row written by a successful render. Replaces any existing row for `path`.
#[derive(Debug, Clone)]
pub struct EntryUpsert<'a> {
    pub path: &'a str,
    pub page_type: PageType,
    pub natural_key: &'a NaturalKey,
    pub html_ref: &'a str,
    pub content_hash: &'a str,
    pub generated_at: DateTime<Utc>,
}

/// Final write of a run, applied only while the run still owns the row.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub current_offset: u64,
    pub status: GenerationStatus,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}
