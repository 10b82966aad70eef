//! CLI configuration.
//!
//! Settings come from an optional TOML file, then CLI flags override them.
//! Every section has defaults, so an empty file is a valid configuration.

use convoy_orchestrator::{DockerConfig, EngineConfig, FailurePolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    /// Engine settings handed to the orchestrator.
    pub engine: EngineConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Docker daemon connection.
    pub docker: DockerConfig,

    /// Topology file lookup.
    pub project: ProjectConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Where the topology file is found and which profiles are active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Topology file path.
    pub file: PathBuf,

    /// Profiles enabled in addition to services without a profile.
    pub profiles: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("convoy.yaml"),
            profiles: Vec::new(),
        }
    }
}

impl ConvoyConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &super::CliArgs) {
        if let Some(ref file) = args.file {
            self.project.file = file.clone();
        }

        if let Some(ref name) = args.project_name {
            self.engine.project_name = name.clone();
        }

        if !args.profile.is_empty() {
            self.project.profiles = args.profile.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(timeout) = args.readiness_timeout {
            self.engine.readiness_timeout_ms = timeout * 1000;
        }

        if args.abort_on_failure {
            self.engine.failure_policy = FailurePolicy::Abort;
        }

        if let Some(ref host) = args.docker_host {
            self.docker.host = Some(host.clone());
        }

        // Relative bind mounts resolve next to the topology file unless the
        // configuration names a directory explicitly.
        if self.engine.base_dir == Path::new(".") {
            if let Some(parent) = self.project.file.parent() {
                if !parent.as_os_str().is_empty() {
                    self.engine.base_dir = parent.to_path_buf();
                }
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        // Full filter directives such as `convoy_orchestrator=debug` are
        // passed through to the subscriber as-is.
        if !self.logging.level.contains('=')
            && !valid_levels.contains(&self.logging.level.to_lowercase().as_str())
        {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        if self.docker.timeout_secs == 0 {
            anyhow::bail!("Docker request timeout must be positive");
        }

        self.engine.validate()?;
        Ok(())
    }

    /// Returns the grace period for stopping containers.
    pub fn stop_timeout(&self) -> Duration {
        self.engine.stop_timeout()
    }
}
