//! Configuration module for logdrift.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation and defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{engine::EngineKind, errors::DomainError, filter::parse_patterns, EngineParams};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for the logdrift daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub state: StateConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
    /// One entry per followed source.
    #[serde(default)]
    pub followers: Vec<FollowerDecl>,
}

/// Offset persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path of the durable offset store.
    pub file: PathBuf,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum simultaneously live followers; 0 disables the cap.
    pub max_followers: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

/// One followed source as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerDecl {
    /// Logical source name; becomes the `config_name` of the spec.
    pub name: String,
    /// Directory the patterns apply under (absolute).
    pub dir: PathBuf,
    /// Pattern grammar: comma-separated globs, optionally `{`-wrapped.
    pub patterns: String,
    /// Whether subdirectories are followed as well.
    #[serde(default)]
    pub recursive: bool,
    /// Record-extraction engine for matched files.
    #[serde(default)]
    pub engine: EngineDecl,
}

/// Engine selection for one followed source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDecl {
    /// `line` or `regex`.
    pub kind: EngineKind,
    /// Delimiter expression; required when `kind` is `regex`.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Ceiling on a single record in bytes; defaults to 16 MiB.
    #[serde(default)]
    pub max_record_len: Option<usize>,
}

impl Default for EngineDecl {
    fn default() -> Self {
        Self {
            kind: EngineKind::Line,
            pattern: None,
            max_record_len: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/logdrift/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("logdrift")
            .join("config.yaml")
    }

    /// Validates every follower declaration.
    ///
    /// Checks that directories are absolute, pattern grammars parse and
    /// engine arguments are coherent, so a bad configuration fails at
    /// startup rather than mid-follow.
    pub fn validate(&self) -> anyhow::Result<()> {
        for decl in &self.followers {
            if decl.name.is_empty() {
                anyhow::bail!("follower declaration with empty name");
            }
            if !decl.dir.is_absolute() {
                anyhow::bail!(
                    "follower `{}`: directory must be absolute: {}",
                    decl.name,
                    decl.dir.display()
                );
            }
            parse_patterns(&decl.patterns)
                .map_err(|e| anyhow::anyhow!("follower `{}`: {}", decl.name, e))?;
            decl.engine_params(&decl.name)
                .map_err(|e| anyhow::anyhow!("follower `{}`: {}", decl.name, e))?;
        }
        Ok(())
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            file: dirs::state_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("logdrift")
                .join("state.json"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_followers: 256 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl FollowerDecl {
    /// Builds the engine parameters for this declaration.
    pub fn engine_params(&self, name: &str) -> Result<EngineParams, DomainError> {
        let mut params = match self.engine.kind {
            EngineKind::Line => EngineParams::line(),
            EngineKind::Regex => match &self.engine.pattern {
                Some(p) => EngineParams::regex(p.clone())?,
                None => return Err(DomainError::MissingRegex(name.to_string())),
            },
        };
        if let Some(max) = self.engine.max_record_len {
            params = params.with_max_record_len(max);
        }
        Ok(params)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
