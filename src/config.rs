//! Runtime configuration, read from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid configuration.
//!
//! ```toml
//! [llm]
//! model = "gpt-4"
//! api_key_env = "OPENAI_API_KEY"
//! temperature = 0.2
//!
//! [solver]
//! framework = "constraint-based"
//! name = "highs"
//! time_limit = 30.0
//!
//! [sandbox]
//! max_steps = 1000000
//!
//! [validation]
//! gate = "syntax"
//! ```
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framework::Framework;
use crate::llm::prompt::PromptStyle;
use crate::script::Limits;

/// Why a configuration could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether validation results keep a fragment from running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePolicy {
    /// Validation is reported but never blocks execution
    #[default]
    Advisory,
    /// Fragments that do not parse are not executed
    Syntax,
    /// Fragments that do not parse or break a structural rule are not executed
    Strict,
}

impl Display for GatePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GatePolicy::Advisory => "advisory",
            GatePolicy::Syntax => "syntax",
            GatePolicy::Strict => "strict",
        })
    }
}

impl FromStr for GatePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(GatePolicy::Advisory),
            "syntax" => Ok(GatePolicy::Syntax),
            "strict" => Ok(GatePolicy::Strict),
            other => Err(ConfigError::Invalid(format!(
                "unknown gate policy '{other}' (expected advisory, syntax or strict)"
            ))),
        }
    }
}

/// `[llm]`: the text-generation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Chat completions endpoint
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub system_prompt: String,
    pub prompt_style: PromptStyle,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            timeout_secs: 120,
            system_prompt: "You are an expert in optimization modeling.".to_string(),
            prompt_style: PromptStyle::default(),
        }
    }
}

impl LlmConfig {
    /// The API key, read from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|key| !key.trim().is_empty())
    }
}

/// `[solver]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    pub framework: Framework,
    /// The registry name; `None` picks the registry default
    pub name: Option<String>,
    /// Seconds, forwarded to backends that accept a limit
    pub time_limit: Option<f64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            framework: Framework::ConstraintBased,
            name: None,
            time_limit: None,
        }
    }
}

/// `[sandbox]`: ceilings on fragment execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub max_steps: u64,
    pub max_depth: usize,
    pub max_collection: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = Limits::default();
        SandboxConfig {
            max_steps: limits.max_steps,
            max_depth: limits.max_depth,
            max_collection: limits.max_collection,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_steps: self.max_steps,
            max_depth: self.max_depth,
            max_collection: self.max_collection,
        }
    }
}

/// `[validation]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    pub gate: GatePolicy,
}

/// The whole configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub llm: LlmConfig,
    pub solver: SolverConfig,
    pub sandbox: SandboxConfig,
    pub validation: ValidationConfig,
}

impl Config {
    /// Read and check the configuration file at `path`
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Reject values that parse but cannot work
    pub fn check(&self) -> Result<(), ConfigError> {
        if !(0. ..=2.).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(format!(
                "llm.temperature must be between 0 and 2, got {}",
                self.llm.temperature
            )));
        }
        if self.llm.max_tokens == 0 {
            return Err(ConfigError::Invalid("llm.max_tokens must be positive".to_string()));
        }
        if self.sandbox.max_steps == 0 || self.sandbox.max_depth == 0 || self.sandbox.max_collection == 0 {
            return Err(ConfigError::Invalid("sandbox limits must be positive".to_string()));
        }
        if let Some(limit) = self.solver.time_limit {
            if !(limit.is_finite() && limit > 0.) {
                return Err(ConfigError::Invalid(format!(
                    "solver.time_limit must be a positive number of seconds, got {limit}"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.check()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.validation.gate, GatePolicy::Advisory);
        assert_eq!(config.sandbox.limits(), Limits::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config: Config = "[solver]\nframework = \"linear-expression\"\nname = \"cbc\"\ntime_limit = 5.0\n\
                              [validation]\ngate = \"strict\"\n[llm]\ntemperature = 0.0\n"
            .parse()
            .unwrap();
        assert_eq!(config.solver.framework, Framework::LinearExpression);
        assert_eq!(config.solver.name.as_deref(), Some("cbc"));
        assert_float_eq!(config.solver.time_limit.unwrap(), 5., abs <= 1e-12);
        assert_eq!(config.validation.gate, GatePolicy::Strict);
        assert_float_eq!(config.llm.temperature, 0., abs <= 1e-12);
        assert_eq!(config.llm.model, "gpt-4");
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(matches!("[solver]\nengine = 1\n".parse::<Config>(), Err(ConfigError::Parse(_))));
        assert!(matches!("[llm]\ntemperature = 7.5\n".parse::<Config>(), Err(ConfigError::Invalid(_))));
        assert!(matches!("[sandbox]\nmax_steps = 0\n".parse::<Config>(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));

        let present = dir.path().join("autoopt.toml");
        std::fs::write(&present, "[validation]\ngate = \"syntax\"\n").unwrap();
        assert_eq!(Config::load(&present).unwrap().validation.gate, GatePolicy::Syntax);
    }

    #[test]
    fn gate_policy_names() {
        assert_eq!("Strict".parse::<GatePolicy>().unwrap(), GatePolicy::Strict);
        assert!("never".parse::<GatePolicy>().is_err());
        assert_eq!(GatePolicy::Syntax.to_string(), "syntax");
    }
}
