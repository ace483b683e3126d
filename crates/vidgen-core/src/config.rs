//! Static generation configuration: provider groups, models, relocation.
//!
//! Loaded once at startup from a TOML document and shared read-only
//! afterwards (`Arc<GenerationConfig>`).
//!
//! ```toml
//! [groups.zhipu]
//! base_url = "https://open.bigmodel.cn/api/paas/v4"
//! api_key_env = "ZHIPU_API_KEY"
//! max_concurrent = 2
//! cooldown_ms = 3000
//!
//! [[models]]
//! id = "cogvideox-flash"
//! group = "zhipu"
//!
//! [relocation]
//! max_bytes = 104857600
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};
use thiserror::Error;

/// Errors raised while loading or validating a [`GenerationConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("model '{model}' references undeclared group '{group}'")]
    UndeclaredGroup { model: String, group: String },

    #[error("duplicate model id '{0}'")]
    DuplicateModel(String),

    #[error("group '{group}': {message}")]
    InvalidPolicy { group: String, message: String },
}

/// Concurrency, cooldown and polling limits shared by every model of one
/// provider group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    /// Maximum simultaneously admitted tasks.
    pub max_concurrent: usize,
    /// Minimum spacing between two task creations.
    pub cooldown_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub max_poll_attempts: u32,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            cooldown_ms: 1_000,
            poll_interval_ms: 5_000,
            poll_timeout_ms: 10 * 60 * 1_000,
            max_poll_attempts: 120,
        }
    }
}

impl GroupPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Where the provider API of a group lives and how to authenticate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEndpoint {
    #[serde(default)]
    pub base_url: String,
    /// Inline API key. Prefer `api_key_env` outside of local setups.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderEndpoint {
    /// Inline key first, then the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .filter(|v| !v.is_empty())
        })
    }
}

/// A `[groups.<name>]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfig {
    #[serde(flatten)]
    pub policy: GroupPolicy,
    #[serde(flatten)]
    pub endpoint: ProviderEndpoint,
}

/// What a model produces; decides the relocation kind of its primary media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Video,
    Image,
}

/// One entry of the model catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    /// Identifier used by callers.
    pub id: String,
    /// Provider group this model belongs to.
    pub group: String,
    /// Model name sent to the provider; defaults to `id`.
    #[serde(default)]
    pub remote_model: Option<String>,
    #[serde(default)]
    pub kind: OutputKind,
}

impl ModelSpec {
    pub fn remote_name(&self) -> &str {
        self.remote_model.as_deref().unwrap_or(&self.id)
    }
}

/// Limits applied when copying provider media to permanent storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    pub max_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    /// Fetch proxy used for hosts in `proxied_hosts`; the original URL is
    /// passed as the `url` query parameter.
    pub proxy_url: Option<String>,
    pub proxied_hosts: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            max_bytes: 200 * 1024 * 1024,
            allowed_mime_types: [
                "video/mp4",
                "video/webm",
                "video/quicktime",
                "image/png",
                "image/jpeg",
                "image/webp",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            proxy_url: None,
            proxied_hosts: Vec::new(),
            request_timeout_secs: 120,
        }
    }
}

/// Root of the generation configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub relocation: RelocationConfig,
}

impl GenerationConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, group) in &self.groups {
            if group.policy.max_concurrent == 0 {
                return Err(ConfigError::InvalidPolicy {
                    group: name.clone(),
                    message: "max_concurrent must be at least 1".into(),
                });
            }
            if group.policy.poll_interval_ms == 0 {
                return Err(ConfigError::InvalidPolicy {
                    group: name.clone(),
                    message: "poll_interval_ms must be at least 1".into(),
                });
            }
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::DuplicateModel(model.id.clone()));
            }
            if !self.groups.contains_key(&model.group) {
                return Err(ConfigError::UndeclaredGroup {
                    model: model.id.clone(),
                    group: model.group.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn policy(&self, group: &str) -> Option<&GroupPolicy> {
        self.groups.get(group).map(|g| &g.policy)
    }

    pub fn endpoint(&self, group: &str) -> Option<&ProviderEndpoint> {
        self.groups.get(group).map(|g| &g.endpoint)
    }
}
