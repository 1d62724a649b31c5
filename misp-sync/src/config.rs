//! Configuration loading, recognized keys per spec §6.1. Mirrors the
//! teacher agent's `toml`-backed config struct tree with per-field
//! `#[serde(default = "...")]` fallbacks.

use crate::model::InstanceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MispSyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub case_template: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub instances: HashMap<String, InstanceSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    pub url: String,
    pub key: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub case_template: Option<String>,
}

fn default_interval_secs() -> u64 {
    3600
}

impl MispSyncConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: MispSyncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Resolves each configured instance into an `InstanceConfig`,
    /// inheriting the global `tags`/`case_template` defaults.
    pub fn instance_configs(&self) -> Vec<InstanceConfig> {
        self.instances
            .iter()
            .map(|(name, settings)| InstanceConfig {
                name: name.clone(),
                base_url: settings.url.clone(),
                api_key: settings.key.clone(),
                case_template: settings
                    .case_template
                    .clone()
                    .or_else(|| self.case_template.clone()),
                artifact_tags: settings.tags.clone().unwrap_or_else(|| self.tags.clone()),
            })
            .collect()
    }

    pub fn default_config() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            case_template: None,
            tags: vec![],
            instances: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_inherits_global_tags_and_template() {
        let mut config = MispSyncConfig::default_config();
        config.case_template = Some("global-template".to_string());
        config.tags = vec!["global-tag".to_string()];
        config.instances.insert(
            "demo".to_string(),
            InstanceSettings {
                url: "https://misp.example".to_string(),
                key: "k".to_string(),
                tags: None,
                case_template: None,
            },
        );

        let instances = config.instance_configs();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].case_template.as_deref(), Some("global-template"));
        assert_eq!(instances[0].artifact_tags, vec!["global-tag".to_string()]);
    }

    #[test]
    fn instance_override_takes_precedence() {
        let mut config = MispSyncConfig::default_config();
        config.tags = vec!["global-tag".to_string()];
        config.instances.insert(
            "demo".to_string(),
            InstanceSettings {
                url: "https://misp.example".to_string(),
                key: "k".to_string(),
                tags: Some(vec!["instance-tag".to_string()]),
                case_template: Some("instance-template".to_string()),
            },
        );

        let instances = config.instance_configs();
        assert_eq!(instances[0].artifact_tags, vec!["instance-tag".to_string()]);
        assert_eq!(instances[0].case_template.as_deref(), Some("instance-template"));
    }
}
