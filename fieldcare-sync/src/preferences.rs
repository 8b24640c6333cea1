//! Persisted loading preferences
//!
//! Per resource type "enabled for loading" and "loaded at least once" flags,
//! plus the periodic synchronize frequency. Stored as plain key/value pairs.

use crate::error::SyncResult;
use crate::keyvalue::KeyValueStore;
use crate::resource::{ResourceCategory, ResourceType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const ENABLED_PREFIX: &str = "load:";
const LOADED_PREFIX: &str = "loaded:";
const UPDATE_FREQUENCY_KEY: &str = "update_frequency";

/// Which client flavour the installation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Anonymous events only
    EventCapture,
    /// Event capture plus tracked entities and their enrollments
    Tracker,
}

impl LoadMode {
    /// Toggleable resource types switched on by this mode
    pub fn resources(self) -> &'static [ResourceType] {
        use ResourceType::*;
        match self {
            LoadMode::EventCapture => &[
                OptionSets,
                Constants,
                DataElements,
                RelationshipTypes,
                ProgramRules,
                ProgramRuleVariables,
                ProgramRuleActions,
                ValidationRules,
                Events,
                DataValues,
            ],
            LoadMode::Tracker => &[
                OptionSets,
                Constants,
                DataElements,
                RelationshipTypes,
                ProgramRules,
                ProgramRuleVariables,
                ProgramRuleActions,
                ValidationRules,
                Events,
                DataValues,
                TrackedEntityTypes,
                TrackedEntityAttributes,
                ProgramTrackedEntityAttributes,
                TrackedEntityInstances,
                Enrollments,
            ],
        }
    }
}

/// How often the background synchronizer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateFrequency {
    Manual,
    QuarterHourly,
    #[default]
    Hourly,
    Daily,
    Weekly,
}

impl UpdateFrequency {
    pub fn index(self) -> u8 {
        match self {
            UpdateFrequency::Manual => 0,
            UpdateFrequency::QuarterHourly => 1,
            UpdateFrequency::Hourly => 2,
            UpdateFrequency::Daily => 3,
            UpdateFrequency::Weekly => 4,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(UpdateFrequency::Manual),
            1 => Some(UpdateFrequency::QuarterHourly),
            2 => Some(UpdateFrequency::Hourly),
            3 => Some(UpdateFrequency::Daily),
            4 => Some(UpdateFrequency::Weekly),
            _ => None,
        }
    }

    /// `None` for manual
    pub fn period(self) -> Option<Duration> {
        const MINUTE: u64 = 60;
        match self {
            UpdateFrequency::Manual => None,
            UpdateFrequency::QuarterHourly => Some(Duration::from_secs(15 * MINUTE)),
            UpdateFrequency::Hourly => Some(Duration::from_secs(60 * MINUTE)),
            UpdateFrequency::Daily => Some(Duration::from_secs(24 * 60 * MINUTE)),
            UpdateFrequency::Weekly => Some(Duration::from_secs(7 * 24 * 60 * MINUTE)),
        }
    }
}

#[derive(Clone)]
pub struct Preferences {
    kv: Arc<dyn KeyValueStore>,
}

impl Preferences {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    async fn flag(&self, key: String) -> SyncResult<bool> {
        Ok(self.kv.get(&key).await?.as_deref() == Some("true"))
    }

    /// Non-toggleable resource types are always enabled
    pub async fn is_enabled(&self, resource: ResourceType) -> SyncResult<bool> {
        if !resource.is_toggleable() {
            return Ok(true);
        }
        self.flag(format!("{}{}", ENABLED_PREFIX, resource.watermark_key())).await
    }

    pub async fn set_enabled(&self, resource: ResourceType, enabled: bool) -> SyncResult<()> {
        let key = format!("{}{}", ENABLED_PREFIX, resource.watermark_key());
        if enabled {
            self.kv.set(&key, "true").await
        } else {
            self.kv.remove(&key).await
        }
    }

    pub async fn enable_mode(&self, mode: LoadMode) -> SyncResult<()> {
        for resource in mode.resources() {
            self.set_enabled(*resource, true).await?;
        }
        tracing::debug!(mode = ?mode, "Enabled loading");
        Ok(())
    }

    pub async fn clear_load_flags(&self) -> SyncResult<()> {
        self.kv.remove_prefix(ENABLED_PREFIX).await
    }

    /// Enabled resource types of a category, in dependency order
    pub async fn enabled_resources(&self, category: ResourceCategory) -> SyncResult<Vec<ResourceType>> {
        let mut enabled = Vec::new();
        for resource in ResourceType::sync_order(category) {
            if self.is_enabled(resource).await? {
                enabled.push(resource);
            }
        }
        Ok(enabled)
    }

    pub async fn is_loaded(&self, resource: ResourceType) -> SyncResult<bool> {
        self.flag(format!("{}{}", LOADED_PREFIX, resource.watermark_key())).await
    }

    pub async fn set_loaded(&self, resource: ResourceType, loaded: bool) -> SyncResult<()> {
        let key = format!("{}{}", LOADED_PREFIX, resource.watermark_key());
        if loaded {
            self.kv.set(&key, "true").await
        } else {
            self.kv.remove(&key).await
        }
    }

    pub async fn clear_loaded_flags(&self) -> SyncResult<()> {
        self.kv.remove_prefix(LOADED_PREFIX).await
    }

    async fn is_category_loaded(&self, category: ResourceCategory) -> SyncResult<bool> {
        for resource in self.enabled_resources(category).await? {
            if !self.is_loaded(resource).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn is_metadata_loaded(&self) -> SyncResult<bool> {
        self.is_category_loaded(ResourceCategory::Metadata).await
    }

    pub async fn is_data_values_loaded(&self) -> SyncResult<bool> {
        self.is_category_loaded(ResourceCategory::DataValues).await
    }

    pub async fn is_initial_data_loaded(&self) -> SyncResult<bool> {
        Ok(self.is_metadata_loaded().await? && self.is_data_values_loaded().await?)
    }

    pub async fn update_frequency(&self) -> SyncResult<UpdateFrequency> {
        let stored = self
            .kv
            .get(UPDATE_FREQUENCY_KEY)
            .await?
            .and_then(|raw| raw.parse::<u8>().ok())
            .and_then(UpdateFrequency::from_index);
        Ok(stored.unwrap_or_default())
    }

    pub async fn set_update_frequency(&self, frequency: UpdateFrequency) -> SyncResult<()> {
        self.kv
            .set(UPDATE_FREQUENCY_KEY, &frequency.index().to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvalue::MemoryKeyValueStore;

    fn preferences() -> Preferences {
        Preferences::new(Arc::new(MemoryKeyValueStore::new()))
    }

    #[tokio::test]
    async fn test_core_resources_always_enabled() {
        let prefs = preferences();
        assert!(prefs.is_enabled(ResourceType::Programs).await.unwrap());
        assert!(prefs.is_enabled(ResourceType::OrganisationUnits).await.unwrap());
        assert!(!prefs.is_enabled(ResourceType::Events).await.unwrap());
    }

    #[tokio::test]
    async fn test_modes() {
        let prefs = preferences();
        prefs.enable_mode(LoadMode::EventCapture).await.unwrap();
        assert!(prefs.is_enabled(ResourceType::Events).await.unwrap());
        assert!(!prefs.is_enabled(ResourceType::Enrollments).await.unwrap());

        prefs.enable_mode(LoadMode::Tracker).await.unwrap();
        assert!(prefs.is_enabled(ResourceType::Enrollments).await.unwrap());

        prefs.clear_load_flags().await.unwrap();
        assert!(!prefs.is_enabled(ResourceType::Events).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_loaded_requires_every_enabled_resource() {
        let prefs = preferences();
        let enabled = prefs.enabled_resources(ResourceCategory::Metadata).await.unwrap();
        assert_eq!(
            enabled,
            vec![
                ResourceType::OrganisationUnits,
                ResourceType::Programs,
                ResourceType::ProgramStages
            ]
        );

        prefs.set_loaded(ResourceType::OrganisationUnits, true).await.unwrap();
        prefs.set_loaded(ResourceType::Programs, true).await.unwrap();
        assert!(!prefs.is_metadata_loaded().await.unwrap());

        prefs.set_loaded(ResourceType::ProgramStages, true).await.unwrap();
        assert!(prefs.is_metadata_loaded().await.unwrap());

        prefs.clear_loaded_flags().await.unwrap();
        assert!(!prefs.is_metadata_loaded().await.unwrap());
    }

    #[tokio::test]
    async fn test_nothing_enabled_counts_as_loaded() {
        let prefs = preferences();
        assert!(prefs.is_data_values_loaded().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_frequency_default_and_persistence() {
        let prefs = preferences();
        assert_eq!(prefs.update_frequency().await.unwrap(), UpdateFrequency::Hourly);

        prefs.set_update_frequency(UpdateFrequency::Weekly).await.unwrap();
        assert_eq!(prefs.update_frequency().await.unwrap(), UpdateFrequency::Weekly);
        assert_eq!(UpdateFrequency::Manual.period(), None);
        assert_eq!(UpdateFrequency::from_index(9), None);
    }
}
