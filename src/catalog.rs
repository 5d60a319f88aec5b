//! YAML-backed page source.
//!
//! The catalog lists the slugs of every state, city, service and entity.
//! `service_location` pages are not listed: they are the cross product of
//! cities and services, enumerated city-major so the order stays stable as
//! long as the two lists do.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{NaturalKey, PageType};
use crate::paths;
use crate::source::{PageSource, SourceError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    pub states: Vec<String>,
    /// `state/city` composite keys.
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl StaticCatalog {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let catalog: StaticCatalog = serde_yaml::from_str(raw).context("invalid catalog yaml")?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    /// Every listed key must map to a canonical path, and every city must
    /// belong to a listed state.
    fn validate(&self) -> Result<()> {
        let lists = [
            (PageType::State, &self.states),
            (PageType::City, &self.cities),
            (PageType::Service, &self.services),
            (PageType::EntityDetail, &self.entities),
        ];
        for (page_type, keys) in lists {
            for key in keys {
                paths::canonical_path(page_type, &NaturalKey::new(key.as_str()))
                    .with_context(|| format!("catalog entry `{key}` ({page_type})"))?;
            }
        }
        for city in &self.cities {
            let state = city.split('/').next().unwrap_or_default();
            if !self.states.iter().any(|s| s == state) {
                anyhow::bail!("city `{city}` references unknown state `{state}`");
            }
        }
        Ok(())
    }

    fn len(&self, page_type: PageType) -> u64 {
        let n = match page_type {
            PageType::State => self.states.len(),
            PageType::City => self.cities.len(),
            PageType::Service => self.services.len(),
            PageType::ServiceLocation => self.cities.len() * self.services.len(),
            PageType::EntityDetail => self.entities.len(),
        };
        n as u64
    }

    fn key_at(&self, page_type: PageType, index: usize) -> Option<NaturalKey> {
        let key = match page_type {
            PageType::State => self.states.get(index)?.clone(),
            PageType::City => self.cities.get(index)?.clone(),
            PageType::Service => self.services.get(index)?.clone(),
            PageType::EntityDetail => self.entities.get(index)?.clone(),
            PageType::ServiceLocation => {
                let per_city = self.services.len();
                if per_city == 0 {
                    return None;
                }
                let city = self.cities.get(index / per_city)?;
                let service = &self.services[index % per_city];
                format!("{city}/{service}")
            }
        };
        Some(NaturalKey(key))
    }
}

#[async_trait]
impl PageSource for StaticCatalog {
    async fn count(&self, page_type: PageType) -> Result<u64, SourceError> {
        Ok(self.len(page_type))
    }

    async fn fetch_slice(
        &self,
        page_type: PageType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<NaturalKey>, SourceError> {
        let end = offset.saturating_add(limit).min(self.len(page_type));
        Ok((offset..end)
            .filter_map(|i| self.key_at(page_type, i as usize))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
states: [dubai, sharjah]
cities: [dubai/marina, dubai/jumeirah, sharjah/al-nahda]
services: [implants, whitening]
entities: [smile-clinic]
"#;

    #[tokio::test]
    async fn counts_and_cross_product() {
        let catalog = StaticCatalog::from_yaml(SAMPLE).unwrap();
        assert_eq!(catalog.count(PageType::City).await.unwrap(), 3);
        assert_eq!(catalog.count(PageType::ServiceLocation).await.unwrap(), 6);

        let keys = catalog
            .fetch_slice(PageType::ServiceLocation, 1, 3)
            .await
            .unwrap();
        let keys: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["dubai/marina/whitening", "dubai/jumeirah/implants", "dubai/jumeirah/whitening"]
        );
    }

    #[tokio::test]
    async fn slice_past_end_is_short() {
        let catalog = StaticCatalog::from_yaml(SAMPLE).unwrap();
        let keys = catalog.fetch_slice(PageType::State, 1, 50).await.unwrap();
        assert_eq!(keys, vec![NaturalKey::new("sharjah")]);
        assert!(catalog.fetch_slice(PageType::State, 5, 50).await.unwrap().is_empty());
    }

    #[test]
    fn rejects_orphan_city_and_bad_slug() {
        assert!(StaticCatalog::from_yaml("states: [dubai]\ncities: [abu-dhabi/khalifa]\n").is_err());
        assert!(StaticCatalog::from_yaml("services: [Teeth Whitening]\n").is_err());
    }
}
