//! Pipeline configuration and configuration errors.
//!
//! A config file is plain JSON; every field is optional:
//!
//! ```json
//! {
//!   "models": { "flash": "gemini-2.5-flash", "pro": "gemini-2.5-pro" },
//!   "persona_scope": "every_stage",
//!   "max_refine_concurrency": 4,
//!   "run_timeout_secs": 300,
//!   "topology": { "heavy": { "refine_agents": 6 } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::prompts::PersonaScope;
use crate::topology::{Mode, ModelTier, TopologyOverride, TopologyTable};

/// Rejected before any network call is made.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("unknown mode '{0}' (expected one of: quick, flash, pro, heavy, image_gen)")]
    UnknownMode(String),
    #[error("no topology configured for mode '{0}'")]
    MissingMode(Mode),
    #[error("invalid topology for mode '{mode}': {reason}")]
    InvalidTopology { mode: Mode, reason: String },
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Concrete model ids per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIds {
    #[serde(default = "default_flash_model")]
    pub flash: String,
    #[serde(default = "default_pro_model")]
    pub pro: String,
    #[serde(default = "default_image_model")]
    pub image: String,
}

fn default_flash_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_pro_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            flash: default_flash_model(),
            pro: default_pro_model(),
            image: default_image_model(),
        }
    }
}

impl ModelIds {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Flash => &self.flash,
            ModelTier::Pro => &self.pro,
            ModelTier::Image => &self.image,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub models: ModelIds,
    #[serde(default)]
    pub persona_scope: PersonaScope,
    /// Upper bound on refinement requests in flight at once (default: all).
    #[serde(default)]
    pub max_refine_concurrency: Option<usize>,
    /// Abort the whole run after this many seconds (default: no limit).
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// Per-mode overrides of the built-in topology table.
    #[serde(default)]
    pub topology: BTreeMap<Mode, TopologyOverride>,
}

impl PipelineConfig {
    /// Load and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (tier, id) in [
            (ModelTier::Flash, &self.models.flash),
            (ModelTier::Pro, &self.models.pro),
            (ModelTier::Image, &self.models.image),
        ] {
            if id.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "model id for tier '{}' must be non-empty",
                    tier.as_str()
                )));
            }
        }
        if self.max_refine_concurrency == Some(0) {
            return Err(ConfigurationError::Invalid(
                "max_refine_concurrency must be at least 1".into(),
            ));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(ConfigurationError::Invalid(
                "run_timeout_secs must be at least 1".into(),
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigurationError::Invalid(format!(
                    "temperature {t} outside 0.0..=2.0"
                )));
            }
        }
        self.topology_table()?;
        Ok(())
    }

    /// Built-in topology table with this config's overrides applied.
    pub fn topology_table(&self) -> Result<TopologyTable, ConfigurationError> {
        TopologyTable::with_overrides(&self.topology)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}
