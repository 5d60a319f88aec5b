//! Canonical request paths and their mapping to page types.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CacheError, Result};
use crate::model::{NaturalKey, PageType};

static SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("slug regex"));

const SERVICES_PREFIX: &str = "services";
const ENTITY_PREFIX: &str = "clinic";

/// Application routes that are never served from the page cache.
const PRIVATE_PREFIXES: &[&str] = &[
    "/admin",
    "/dashboard",
    "/auth",
    "/onboarding",
    "/gmb-select",
    "/claim-profile",
    "/list-your-practice",
    "/review/",
    "/rq/",
    "/appointment/",
    "/form/",
    "/book/",
    "/search",
    "/find-dentist",
];

const ASSET_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".map", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".woff",
    ".woff2", ".ttf", ".otf", ".eot", ".pdf", ".xml", ".txt", ".json", ".mp4", ".webm",
];

fn expected_segments(page_type: PageType) -> usize {
    match page_type {
        PageType::State | PageType::Service | PageType::EntityDetail => 1,
        PageType::City => 2,
        PageType::ServiceLocation => 3,
    }
}

/// Canonical cache path of one page, always with a trailing slash.
pub fn canonical_path(page_type: PageType, key: &NaturalKey) -> Result<String> {
    let segments: Vec<&str> = key.segments().collect();
    if segments.len() != expected_segments(page_type) {
        return Err(CacheError::validation(format!(
            "natural key `{key}` does not fit page type `{page_type}`"
        )));
    }
    if let Some(bad) = segments.iter().find(|s| !SLUG.is_match(s)) {
        return Err(CacheError::validation(format!(
            "natural key `{key}` has invalid segment `{bad}`"
        )));
    }
    let joined = segments.join("/");
    Ok(match page_type {
        PageType::Service => format!("/{SERVICES_PREFIX}/{joined}/"),
        PageType::EntityDetail => format!("/{ENTITY_PREFIX}/{joined}/"),
        PageType::State | PageType::City | PageType::ServiceLocation => format!("/{joined}/"),
    })
}

/// Inverse of [`canonical_path`] for paths that follow the layout.
pub fn classify(path: &str) -> Option<(PageType, NaturalKey)> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.iter().any(|p| !SLUG.is_match(p)) {
        return None;
    }
    let (page_type, key_parts) = match parts.as_slice() {
        [SERVICES_PREFIX, slug] => (PageType::Service, vec![*slug]),
        [ENTITY_PREFIX, slug] => (PageType::EntityDetail, vec![*slug]),
        [SERVICES_PREFIX] | [ENTITY_PREFIX] => return None,
        [state] => (PageType::State, vec![*state]),
        [state, city] => (PageType::City, vec![*state, *city]),
        [state, city, service] => (PageType::ServiceLocation, vec![*state, *city, *service]),
        _ => return None,
    };
    Some((page_type, NaturalKey::new(key_parts.join("/"))))
}

/// Normalize a raw request path: leading slash, no empty segments, trailing
/// slash on page paths (file-like paths keep their extension untouched).
pub fn canonicalize(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(CacheError::validation("path contains whitespace or control characters"));
    }
    let raw = raw.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(CacheError::validation("path must not contain dot segments"));
    }
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    let joined = segments.join("/");
    let is_file = segments
        .last()
        .is_some_and(|last| last.contains('.'));
    Ok(if is_file {
        format!("/{joined}")
    } else {
        format!("/{joined}/")
    })
}

pub fn is_private(path: &str) -> bool {
    PRIVATE_PREFIXES.iter().any(|p| path.starts_with(p))
}

pub fn is_asset(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with("/assets/") || ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths_per_type() {
        let cases = [
            (PageType::State, "dubai", "/dubai/"),
            (PageType::City, "dubai/marina", "/dubai/marina/"),
            (PageType::Service, "implants", "/services/implants/"),
            (PageType::ServiceLocation, "dubai/marina/implants", "/dubai/marina/implants/"),
            (PageType::EntityDetail, "smile-clinic", "/clinic/smile-clinic/"),
        ];
        for (pt, key, want) in cases {
            let key = NaturalKey::new(key);
            assert_eq!(canonical_path(pt, &key).unwrap(), want);
            assert_eq!(classify(want), Some((pt, key)));
        }
    }

    #[test]
    fn canonical_path_rejects_mismatched_keys() {
        assert!(canonical_path(PageType::City, &NaturalKey::new("dubai")).is_err());
        assert!(canonical_path(PageType::State, &NaturalKey::new("Dubai")).is_err());
        assert!(canonical_path(PageType::State, &NaturalKey::new("du bai")).is_err());
    }

    #[test]
    fn canonicalize_adds_slashes() {
        assert_eq!(canonicalize("").unwrap(), "/");
        assert_eq!(canonicalize("dubai").unwrap(), "/dubai/");
        assert_eq!(canonicalize("/dubai//marina").unwrap(), "/dubai/marina/");
        assert_eq!(canonicalize("/dubai/marina/?x=1").unwrap(), "/dubai/marina/");
        assert_eq!(canonicalize("/robots.txt").unwrap(), "/robots.txt");
        assert!(canonicalize("/a/../b").is_err());
        assert!(canonicalize("/a b").is_err());
    }

    #[test]
    fn private_and_asset_paths() {
        assert!(is_private("/admin/"));
        assert!(is_private("/dashboard/settings/"));
        assert!(!is_private("/dubai/"));
        assert!(is_asset("/assets/app.js"));
        assert!(is_asset("/logo.PNG"));
        assert!(!is_asset("/services/implants/"));
    }

    #[test]
    fn classify_rejects_unknown_shapes() {
        assert_eq!(classify("/"), None);
        assert_eq!(classify("/services/"), None);
        assert_eq!(classify("/a/b/c/d/"), None);
    }
}
