//! Mode → pipeline topology table.
//!
//! Every quality mode maps to one [`PipelineTopology`]: which model tier
//! answers, how many refinement agents run after the draft, and which
//! per-call flags apply. The built-in table below is the only place these
//! shapes are defined; configuration may override entries but not add modes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigurationError;

/// Quality tier selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Quick,
    Flash,
    Pro,
    Heavy,
    /// Single image-capable call; never staged.
    ImageGen,
}

impl Mode {
    pub const ALL: [Mode; 5] = [Mode::Quick, Mode::Flash, Mode::Pro, Mode::Heavy, Mode::ImageGen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Flash => "flash",
            Mode::Pro => "pro",
            Mode::Heavy => "heavy",
            Mode::ImageGen => "image_gen",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "quick" => Ok(Mode::Quick),
            "flash" => Ok(Mode::Flash),
            "pro" => Ok(Mode::Pro),
            "heavy" => Ok(Mode::Heavy),
            "image_gen" | "imagegen" | "image" => Ok(Mode::ImageGen),
            _ => Err(ConfigurationError::UnknownMode(s.to_string())),
        }
    }
}

/// Model family a topology runs on. Concrete model ids come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Flash,
    Pro,
    Image,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Flash => "flash",
            ModelTier::Pro => "pro",
            ModelTier::Image => "image",
        }
    }
}

/// Per-call flags carried by a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraConfig {
    pub disable_reasoning: bool,
    pub enable_search_tool: bool,
}

/// Shape of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTopology {
    pub model: ModelTier,
    /// Always 1.
    pub draft_agents: u32,
    /// 0 for single-call modes, otherwise a positive even count.
    pub refine_agents: u32,
    pub extra: ExtraConfig,
}

impl PipelineTopology {
    const fn single(model: ModelTier, disable_reasoning: bool, enable_search_tool: bool) -> Self {
        Self {
            model,
            draft_agents: 1,
            refine_agents: 0,
            extra: ExtraConfig {
                disable_reasoning,
                enable_search_tool,
            },
        }
    }

    const fn staged(model: ModelTier, refine_agents: u32, enable_search_tool: bool) -> Self {
        Self {
            model,
            draft_agents: 1,
            refine_agents,
            extra: ExtraConfig {
                disable_reasoning: false,
                enable_search_tool,
            },
        }
    }

    /// No Draft/Refine/Synthesize overlay: one direct call.
    pub fn is_single_call(&self) -> bool {
        self.refine_agents == 0
    }

    /// Calls issued by a run that does not short-circuit on an empty draft.
    pub fn max_calls(&self) -> usize {
        if self.is_single_call() {
            1
        } else {
            self.draft_agents as usize + self.refine_agents as usize + 1
        }
    }

    fn validate(&self, mode: Mode) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidTopology {
            mode,
            reason: reason.to_string(),
        };
        if self.draft_agents != 1 {
            return Err(invalid("draft_agents must be 1"));
        }
        if self.refine_agents % 2 != 0 {
            return Err(invalid("refine_agents must be 0 or an even number"));
        }
        if mode == Mode::ImageGen && !self.is_single_call() {
            return Err(invalid("image generation is always a single call"));
        }
        if self.model == ModelTier::Image && !self.is_single_call() {
            return Err(invalid("the image tier cannot run a staged pipeline"));
        }
        Ok(())
    }
}

const BUILTIN_TOPOLOGY: [(Mode, PipelineTopology); 5] = [
    (Mode::Quick, PipelineTopology::single(ModelTier::Flash, true, false)),
    (Mode::Flash, PipelineTopology::staged(ModelTier::Flash, 2, true)),
    (Mode::Pro, PipelineTopology::staged(ModelTier::Pro, 2, true)),
    (Mode::Heavy, PipelineTopology::staged(ModelTier::Pro, 4, true)),
    (Mode::ImageGen, PipelineTopology::single(ModelTier::Image, false, false)),
];

/// Partial override of one table entry, as read from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyOverride {
    #[serde(default)]
    pub model: Option<ModelTier>,
    #[serde(default)]
    pub refine_agents: Option<u32>,
    #[serde(default)]
    pub disable_reasoning: Option<bool>,
    #[serde(default)]
    pub enable_search_tool: Option<bool>,
}

/// The mode → topology table consulted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyTable {
    entries: BTreeMap<Mode, PipelineTopology>,
}

impl Default for TopologyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TopologyTable {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_TOPOLOGY.into_iter().collect(),
        }
    }

    /// Built-in table with `overrides` applied and every entry validated.
    pub fn with_overrides(
        overrides: &BTreeMap<Mode, TopologyOverride>,
    ) -> Result<Self, ConfigurationError> {
        let mut table = Self::builtin();
        for (mode, o) in overrides {
            let entry = table
                .entries
                .get_mut(mode)
                .ok_or(ConfigurationError::MissingMode(*mode))?;
            if let Some(model) = o.model {
                entry.model = model;
            }
            if let Some(n) = o.refine_agents {
                entry.refine_agents = n;
            }
            if let Some(v) = o.disable_reasoning {
                entry.extra.disable_reasoning = v;
            }
            if let Some(v) = o.enable_search_tool {
                entry.extra.enable_search_tool = v;
            }
        }
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for mode in Mode::ALL {
            let topology = self
                .entries
                .get(&mode)
                .ok_or(ConfigurationError::MissingMode(mode))?;
            topology.validate(mode)?;
        }
        Ok(())
    }

    /// Look up the topology for `mode`.
    pub fn resolve(&self, mode: Mode) -> Result<PipelineTopology, ConfigurationError> {
        self.entries
            .get(&mode)
            .copied()
            .ok_or(ConfigurationError::MissingMode(mode))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Mode, &PipelineTopology)> {
        self.entries.iter().map(|(m, t)| (*m, t))
    }
}

/// Resolve `mode` against the built-in table.
pub fn resolve(mode: Mode) -> Result<PipelineTopology, ConfigurationError> {
    TopologyTable::builtin().resolve(mode)
}

/// Parse a mode name and resolve it against the built-in table.
pub fn resolve_named(name: &str) -> Result<PipelineTopology, ConfigurationError> {
    resolve(name.parse()?)
}
