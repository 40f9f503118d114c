#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-component engine settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BehaviorTreeConfig {
    /// When false, `start_tree` refuses to run anything.
    pub enabled: bool,
    /// Seed for service interval jitter.
    pub seed: u64,
    /// Maximum number of levels on the instance stack (root tree included).
    pub max_instance_depth: usize,
    /// How many times a looping tree may restart from its root within one processing pass.
    pub max_loop_restarts_per_pass: u32,
    /// Emit a `bt.search.step` trace event for every node the search visits.
    pub trace_search_steps: bool,
}

impl Default for BehaviorTreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: 0,
            max_instance_depth: 32,
            max_loop_restarts_per_pass: 1,
            trace_search_steps: false,
        }
    }
}

#[cfg(feature = "serde")]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[cfg(feature = "serde")]
impl BehaviorTreeConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}
