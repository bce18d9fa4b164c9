//! Bridge configuration loading.
//!
//! Precedence, lowest first: built-in defaults, `bridge.toml`, `PLC_BRIDGE_*`
//! environment variables, command-line flags (applied by the binary).

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use smol_str::SmolStr;

use crate::command::CommandKind;
use crate::error::BridgeError;
use crate::facade::{HostLinkConfig, LaunchMode};
use crate::health::HealthConfig;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:5050";
pub const CONFIG_ENV: &str = "PLC_BRIDGE_CONFIG";
const ENV_PREFIX: &str = "PLC_BRIDGE_";

/// What to do with a facade call whose caller already received a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Leave the call running and discard its eventual result.
    #[default]
    Abandon,
    /// Terminate the launched automation host process.
    Kill,
}

impl TimeoutPolicy {
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        match text.trim().to_ascii_lowercase().as_str() {
            "abandon" => Ok(Self::Abandon),
            "kill" => Ok(Self::Kill),
            _ => Err(BridgeError::InvalidConfig(
                format!("invalid host.timeout_policy '{text}'").into(),
            )),
        }
    }
}

/// Per-operation deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutTable {
    entries: IndexMap<CommandKind, Duration>,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        let entries = [
            (CommandKind::Connect, 120_000),
            (CommandKind::OpenProject, 120_000),
            (CommandKind::ListBlocks, 30_000),
            (CommandKind::ImportSource, 60_000),
            (CommandKind::ExportSource, 30_000),
            (CommandKind::Compile, 300_000),
            (CommandKind::ProjectInfo, 30_000),
            (CommandKind::CloseProject, 60_000),
            (CommandKind::Disconnect, 30_000),
            (CommandKind::Probe, 3_000),
        ]
        .into_iter()
        .map(|(kind, ms)| (kind, Duration::from_millis(ms)))
        .collect();
        Self { entries }
    }
}

impl TimeoutTable {
    #[must_use]
    pub fn get(&self, kind: CommandKind) -> Duration {
        self.entries
            .get(&kind)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn set(&mut self, kind: CommandKind, timeout: Duration) {
        self.entries.insert(kind, timeout);
    }

    /// Every configured deadline scaled to `timeout`; convenient for tests.
    #[must_use]
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            entries: CommandKind::ALL
                .into_iter()
                .map(|kind| (kind, timeout))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CommandKind, Duration)> + '_ {
        self.entries.iter().map(|(kind, timeout)| (*kind, *timeout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SmolStr,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SmolStr::new(DEFAULT_LISTEN),
            request_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub address: Option<SmolStr>,
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub project_dir: Option<PathBuf>,
    pub launch_mode: LaunchMode,
    pub timeout_policy: TimeoutPolicy,
}

impl HostConfig {
    #[must_use]
    pub fn link_config(&self) -> HostLinkConfig {
        HostLinkConfig {
            address: self.address.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub host: HostConfig,
    pub max_pending: usize,
    pub health: HealthConfig,
    pub timeouts: TimeoutTable,
    pub log_level: SmolStr,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            host: HostConfig::default(),
            max_pending: 32,
            health: HealthConfig::default(),
            timeouts: TimeoutTable::default(),
            log_level: SmolStr::new("info"),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            BridgeError::InvalidConfig(format!("{}: {err}", path.display()).into())
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, BridgeError> {
        let raw: BridgeToml = toml::from_str(text)
            .map_err(|err| BridgeError::InvalidConfig(format!("bridge.toml: {err}").into()))?;
        raw.into_config()
    }

    /// Load `path` if given, else the file named by `PLC_BRIDGE_CONFIG`, else
    /// defaults; then apply environment overrides and validate.
    pub fn resolve(path: Option<&Path>) -> Result<Self, BridgeError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PLC_BRIDGE_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), BridgeError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(listen) = var("LISTEN") {
            self.server.listen = listen.into();
        }
        if let Some(address) = var("HOST_ADDRESS") {
            self.host.address = Some(address.into());
        }
        if let Some(command) = var("HOST_COMMAND") {
            self.host.command = Some(PathBuf::from(command));
        }
        if let Some(dir) = var("PROJECT_DIR") {
            self.host.project_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = var("MAX_PENDING") {
            self.max_pending = parse_number(&value, "PLC_BRIDGE_MAX_PENDING")? as usize;
        }
        if let Some(value) = var("PROBE_INTERVAL_MS") {
            self.health.interval = Duration::from_millis(parse_number(
                &value,
                "PLC_BRIDGE_PROBE_INTERVAL_MS",
            )?);
        }
        if let Some(level) = var("LOG") {
            self.log_level = level.into();
        }
        for kind in CommandKind::ALL {
            if kind == CommandKind::Probe {
                continue;
            }
            let name = format!("TIMEOUT_{}_MS", kind.config_key().to_ascii_uppercase());
            if let Some(value) = var(&name) {
                let ms = parse_number(&value, &format!("{ENV_PREFIX}{name}"))?;
                self.timeouts.set(kind, Duration::from_millis(ms));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.server.listen.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("server.listen must not be empty".into()));
        }
        if self.server.request_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "server.request_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.max_pending == 0 {
            return Err(BridgeError::InvalidConfig(
                "queue.max_pending must be greater than zero".into(),
            ));
        }
        if self.health.interval.is_zero() || self.health.probe_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "health intervals must be greater than zero".into(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(BridgeError::InvalidConfig(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if let Some((kind, _)) = self.timeouts.iter().find(|(_, timeout)| timeout.is_zero()) {
            return Err(BridgeError::InvalidConfig(
                format!("timeouts.{} must be greater than zero", kind.config_key()).into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BridgeToml {
    server: ServerSection,
    host: HostSection,
    queue: QueueSection,
    health: HealthSection,
    timeouts: IndexMap<String, u64>,
    log: LogSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    listen: Option<String>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostSection {
    address: Option<String>,
    command: Option<String>,
    args: Vec<String>,
    project_dir: Option<String>,
    launch_mode: Option<String>,
    timeout_policy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueueSection {
    max_pending: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HealthSection {
    interval_ms: Option<u64>,
    failure_threshold: Option<u32>,
    probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogSection {
    level: Option<String>,
}

impl BridgeToml {
    fn into_config(self) -> Result<BridgeConfig, BridgeError> {
        let defaults = BridgeConfig::default();

        let mut timeouts = defaults.timeouts;
        for (key, ms) in self.timeouts {
            let kind = CommandKind::from_config_key(&key)
                .filter(|kind| *kind != CommandKind::Probe)
                .ok_or_else(|| {
                    BridgeError::InvalidConfig(format!("unknown timeouts key '{key}'").into())
                })?;
            timeouts.set(kind, Duration::from_millis(ms));
        }

        let health = HealthConfig {
            interval: self
                .health
                .interval_ms
                .map_or(defaults.health.interval, Duration::from_millis),
            failure_threshold: self
                .health
                .failure_threshold
                .unwrap_or(defaults.health.failure_threshold),
            probe_timeout: self
                .health
                .probe_timeout_ms
                .map_or(defaults.health.probe_timeout, Duration::from_millis),
        };
        timeouts.set(CommandKind::Probe, health.probe_timeout);

        let launch_mode = match self.host.launch_mode.as_deref() {
            Some(text) => LaunchMode::parse(text)?,
            None => LaunchMode::default(),
        };
        let timeout_policy = match self.host.timeout_policy.as_deref() {
            Some(text) => TimeoutPolicy::parse(text)?,
            None => TimeoutPolicy::default(),
        };

        Ok(BridgeConfig {
            server: ServerConfig {
                listen: self
                    .server
                    .listen
                    .map_or(defaults.server.listen, SmolStr::new),
                request_timeout: self
                    .server
                    .request_timeout_ms
                    .map_or(defaults.server.request_timeout, Duration::from_millis),
            },
            host: HostConfig {
                address: self.host.address.map(SmolStr::new),
                command: self.host.command.map(PathBuf::from),
                args: self.host.args,
                project_dir: self.host.project_dir.map(PathBuf::from),
                launch_mode,
                timeout_policy,
            },
            max_pending: self.queue.max_pending.unwrap_or(defaults.max_pending),
            health,
            timeouts,
            log_level: self.log.level.map_or(defaults.log_level, SmolStr::new),
        })
    }
}

fn parse_number(text: &str, name: &str) -> Result<u64, BridgeError> {
    text.trim().parse::<u64>().map_err(|err| {
        BridgeError::InvalidConfig(format!("invalid {name} '{text}': {err}").into())
    })
}
