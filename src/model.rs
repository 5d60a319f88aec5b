use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition of the source-entity space. Each variant owns one progress cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    State,
    City,
    Service,
    ServiceLocation,
    EntityDetail,
}

impl PageType {
    pub const ALL: [PageType; 5] = [
        PageType::State,
        PageType::City,
        PageType::Service,
        PageType::ServiceLocation,
        PageType::EntityDetail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::State => "state",
            PageType::City => "city",
            PageType::Service => "service",
            PageType::ServiceLocation => "service_location",
            PageType::EntityDetail => "entity_detail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "state" => Some(PageType::State),
            "city" => Some(PageType::City),
            "service" => Some(PageType::Service),
            "service_location" => Some(PageType::ServiceLocation),
            "entity_detail" => Some(PageType::EntityDetail),
            _ => None,
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of one source entity within a page type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct NaturalKey(pub String);

impl NaturalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Slug segments of a composite key (`state/city/service`).
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NaturalKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Idle,
    Running,
    Complete,
    Error,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Idle => "idle",
            GenerationStatus::Running => "running",
            GenerationStatus::Complete => "complete",
            GenerationStatus::Error => "error",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(GenerationStatus::Idle),
            "running" => Some(GenerationStatus::Running),
            "complete" => Some(GenerationStatus::Complete),
            "error" => Some(GenerationStatus::Error),
            _ => None,
        }
    }
}

/// One rendered page. The HTML itself lives in the blob store under `html_ref`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub page_type: PageType,
    pub natural_key: NaturalKey,
    pub html_ref: String,
    pub content_hash: String,
    pub generated_at: DateTime<Utc>,
    pub is_stale: bool,
}

/// Resumable build cursor for one page type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationProgress {
    pub page_type: PageType,
    pub current_offset: u64,
    pub total_count: u64,
    pub status: GenerationStatus,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationProgress {
    /// Row shown for a page type that has never been generated.
    pub fn unstarted(page_type: PageType) -> Self {
        Self {
            page_type,
            current_offset: 0,
            total_count: 0,
            status: GenerationStatus::Idle,
            last_error: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total_count.saturating_sub(self.current_offset)
    }

    pub fn is_done(&self) -> bool {
        self.current_offset >= self.total_count
    }
}

/// Resolver classification of a cache lookup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Stale => "stale",
            CacheStatus::Miss => "miss",
        }
    }
}

/// Which entries a purge deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    Stale,
    PageType(PageType),
}

impl PurgeScope {
    /// `None`, `"all"`, `"stale"` or a page type name.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            None | Some("all") => Some(PurgeScope::All),
            Some("stale") => Some(PurgeScope::Stale),
            Some(other) => PageType::parse(other).map(PurgeScope::PageType),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PurgeScope::All => "all",
            PurgeScope::Stale => "stale",
            PurgeScope::PageType(pt) => pt.as_str(),
        }
    }
}

/// Entries flipped by a mark-stale call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleTarget {
    AllOfType(PageType),
    Key(PageType, NaturalKey),
    Path(String),
}

/// Outcome of one batch generator invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub page_type: PageType,
    pub processed: u64,
    pub generated: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub error_details: Vec<String>,
    pub current_offset: u64,
    pub total_count: u64,
    pub remaining: u64,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_type_round_trips_through_str() {
        for pt in PageType::ALL {
            assert_eq!(PageType::parse(pt.as_str()), Some(pt));
        }
        assert_eq!(PageType::parse("clinic"), None);
    }

    #[test]
    fn page_type_serde_uses_snake_case() {
        let json = serde_json::to_string(&PageType::ServiceLocation).unwrap();
        assert_eq!(json, "\"service_location\"");
    }

    #[test]
    fn purge_scope_parses_special_values() {
        assert_eq!(PurgeScope::parse(None), Some(PurgeScope::All));
        assert_eq!(PurgeScope::parse(Some("all")), Some(PurgeScope::All));
        assert_eq!(PurgeScope::parse(Some("stale")), Some(PurgeScope::Stale));
        assert_eq!(
            PurgeScope::parse(Some("city")),
            Some(PurgeScope::PageType(PageType::City))
        );
        assert_eq!(PurgeScope::parse(Some("bogus")), None);
    }

    #[test]
    fn remaining_saturates() {
        let mut p = GenerationProgress::unstarted(PageType::City);
        p.total_count = 10;
        p.current_offset = 12;
        assert_eq!(p.remaining(), 0);
        assert!(p.is_done());
    }

    #[test]
    fn composite_key_segments() {
        let key = NaturalKey::new("dubai/marina/implants");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["dubai", "marina", "implants"]);
    }
}
