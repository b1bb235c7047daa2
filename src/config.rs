//! Gateway configuration.
//!
//! Settings are layered file → environment → CLI. The file is `gateway.toml`
//! (or the path given with `--config`); a missing default file means defaults.
//!
//! ```toml
//! [assistant]
//! command = "claude"
//! model = "opus"
//! permission_mode = "bypass"
//!
//! [limits]
//! max_concurrent = 3
//! turn_timeout_secs = 300
//! idle_timeout_secs = 120
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8450
//! ```
//!
//! Numeric limits outside their safe range are clamped rather than rejected;
//! every clamp is recorded and reported by [`GatewayConfig::validate`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::control::PermissionWireFormat;

pub const DEFAULT_CONFIG_FILE: &str = "gateway.toml";

/// How the assistant handles tool permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Skip all permission prompts (`--dangerously-skip-permissions`)
    #[default]
    Bypass,
    /// Route permission prompts to the client over stdio
    Prompt,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Bypass => write!(f, "bypass"),
            PermissionMode::Prompt => write!(f, "prompt"),
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bypass" => Ok(PermissionMode::Bypass),
            "prompt" => Ok(PermissionMode::Prompt),
            _ => anyhow::bail!(
                "Invalid permission mode '{}'. Valid values: bypass, prompt",
                s
            ),
        }
    }
}

/// Output layout for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Assistant CLI invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSection {
    /// Executable to launch for every turn
    pub command: String,
    /// Model used when a turn does not name one
    pub model: String,
    pub permission_mode: PermissionMode,
    /// Extra flags appended verbatim after the protocol flags
    pub extra_args: Vec<String>,
    /// Working directory for the child process
    pub working_dir: Option<PathBuf>,
    /// Wire shapes used for permission responses, written in this order
    pub permission_formats: Vec<PermissionWireFormat>,
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: "opus".to_string(),
            permission_mode: PermissionMode::default(),
            extra_args: Vec::new(),
            working_dir: None,
            permission_formats: PermissionWireFormat::ALL.to_vec(),
        }
    }
}

/// Concurrency, timeout and size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_concurrent: usize,
    pub turn_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lines: usize,
    pub max_line_bytes: usize,
    pub max_input_length: usize,
    pub attachment_char_budget: usize,
    pub max_attachments: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            turn_timeout_secs: 300,
            idle_timeout_secs: 120,
            max_lines: 10_000,
            max_line_bytes: 16 * 1024 * 1024,
            max_input_length: 10_000,
            attachment_char_budget: 50_000,
            max_attachments: 5,
        }
    }
}

/// Grace periods used when tearing a process down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    /// Wait for natural exit after stdin is closed
    pub exit_grace_ms: u64,
    /// Wait after SIGTERM before SIGKILL
    pub terminate_grace_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            exit_grace_ms: 5_000,
            terminate_grace_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local frontend development
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8450,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".gateway/gateway.db"),
            upload_dir: PathBuf::from(".gateway/uploads"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub assistant: AssistantSection,
    pub limits: LimitsSection,
    pub shutdown: ShutdownSection,
    pub server: ServerSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
    /// Problems found while loading (clamped values, bad env values)
    #[serde(skip)]
    warnings: Vec<String>,
}

impl GatewayConfig {
    /// Load configuration from an explicit path, or from `./gateway.toml` if
    /// present, then apply environment overrides and clamp limits.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.normalize();
        Ok(config)
    }

    /// Read a TOML file without env overrides or clamping.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gateway.toml")
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.assistant.command = cmd;
        }
        if let Some(model) = lookup("CLAUDE_MODEL") {
            self.assistant.model = model;
        }
        if let Some(mode) = lookup("PERMISSION_MODE") {
            match mode.parse() {
                Ok(mode) => self.assistant.permission_mode = mode,
                Err(e) => self.warnings.push(format!("PERMISSION_MODE ignored: {}", e)),
            }
        }
        self.env_number(&lookup, "MAX_CONCURRENT", |c, v: usize| c.limits.max_concurrent = v);
        self.env_number(&lookup, "CLAUDE_TIMEOUT", |c, v: u64| c.limits.turn_timeout_secs = v);
        self.env_number(&lookup, "IDLE_TIMEOUT", |c, v: u64| c.limits.idle_timeout_secs = v);
        self.env_number(&lookup, "MAX_INPUT_LENGTH", |c, v: usize| c.limits.max_input_length = v);
        self.env_number(&lookup, "PORT", |c, v: u16| c.server.port = v);
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(dev) = lookup("DEV_MODE") {
            self.server.dev_mode = matches!(dev.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(path) = lookup("DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(path);
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            match format.parse() {
                Ok(format) => self.logging.format = format,
                Err(e) => self.warnings.push(format!("LOG_FORMAT ignored: {}", e)),
            }
        }
    }

    fn env_number<F, T, S>(&mut self, lookup: &F, key: &str, set: S)
    where
        F: Fn(&str) -> Option<String>,
        T: std::str::FromStr,
        S: FnOnce(&mut Self, T),
    {
        if let Some(raw) = lookup(key) {
            match raw.trim().parse::<T>() {
                Ok(value) => set(self, value),
                Err(_) => self
                    .warnings
                    .push(format!("{} ignored: '{}' is not a valid number", key, raw)),
            }
        }
    }

    /// Clamp every limit into its safe range, recording a warning per clamp.
    pub fn normalize(&mut self) {
        let mut warnings = std::mem::take(&mut self.warnings);
        let limits = &mut self.limits;
        limits.max_concurrent =
            clamp_setting("limits.max_concurrent", limits.max_concurrent, 1, 10, &mut warnings);
        limits.turn_timeout_secs = clamp_setting(
            "limits.turn_timeout_secs",
            limits.turn_timeout_secs,
            30,
            1800,
            &mut warnings,
        );
        limits.idle_timeout_secs = clamp_setting(
            "limits.idle_timeout_secs",
            limits.idle_timeout_secs,
            5,
            limits.turn_timeout_secs,
            &mut warnings,
        );
        limits.max_input_length = clamp_setting(
            "limits.max_input_length",
            limits.max_input_length,
            100,
            100_000,
            &mut warnings,
        );
        limits.max_lines =
            clamp_setting("limits.max_lines", limits.max_lines, 1, usize::MAX, &mut warnings);
        limits.max_line_bytes = clamp_setting(
            "limits.max_line_bytes",
            limits.max_line_bytes,
            1024,
            usize::MAX,
            &mut warnings,
        );
        if self.assistant.command.trim().is_empty() {
            warnings.push("assistant.command is empty; using 'claude'".to_string());
            self.assistant.command = "claude".to_string();
        }
        if self.assistant.permission_formats.is_empty() {
            warnings.push(
                "assistant.permission_formats is empty; permission responses cannot be delivered"
                    .to_string(),
            );
        }
        self.warnings = warnings;
    }

    /// Warnings collected while loading and normalizing.
    pub fn validate(&self) -> Vec<String> {
        self.warnings.clone()
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.turn_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.idle_timeout_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.exit_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.terminate_grace_ms)
    }

    /// Serialize the effective configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize gateway config")
    }
}

fn clamp_setting<T>(name: &str, value: T, min: T, max: T, warnings: &mut Vec<String>) -> T
where
    T: Ord + Copy + Display,
{
    let clamped = value.clamp(min, max);
    if clamped != value {
        warnings.push(format!(
            "{} = {} is out of range {}..={}; using {}",
            name, value, min, max, clamped
        ));
    }
    clamped
}
