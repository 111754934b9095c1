#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{CitadelError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Recognized configuration surface (spec §6). Loaded from a TOML document
/// and overridden by `CITADEL_*` environment variables, the way the teacher
/// crate layers `database_url`/stage-command overrides on top of file
/// defaults in `config.rs`.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker: PoolConfig,
    pub gatekeeper: PoolConfig,
    pub beads: BeadsConfig,
    pub bridge: BridgeConfig,
    pub conductor: ConductorConfig,
    pub agents: BTreeMap<String, AgentConfig>,
}

/// Per-role agent wiring (spec §6 `agents.<role>.{...}`). Entirely external
/// to the core's own decision-making — the conductor never reads this —
/// but the config surface must still recognize it so a single
/// `.citadel/config.toml` document covers both the core and the agent
/// runtime that drives it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub mcp_tools: Vec<String>,
    pub mcp_resources: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    pub load_factor: f64,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            load_factor: 1.0,
            timeout_ms: 300_000,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeadsConfig {
    pub path: PathBuf,
    pub binary: String,
    pub auto_sync: bool,
}

impl Default for BeadsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".citadel"),
            binary: "bd".to_string(),
            auto_sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BridgeConfig {
    pub max_logs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConductorConfig {
    pub tick_interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub grace_ms: u64,
    pub max_pipe_cycles: u32,
    pub queue_path: PathBuf,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            stall_timeout_ms: 120_000,
            grace_ms: 5_000,
            max_pipe_cycles: 10,
            queue_path: PathBuf::from(".citadel/queue.sqlite"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: PoolConfig::default(),
            gatekeeper: PoolConfig {
                min_workers: 1,
                max_workers: 2,
                ..PoolConfig::default()
            },
            beads: BeadsConfig::default(),
            bridge: BridgeConfig::default(),
            conductor: ConductorConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

/// Raw TOML document shape; all sections are optional and fall back to
/// `Default` values, mirroring the teacher's tolerant config parsing
/// (unknown keys are accepted and ignored, per spec §6).
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    worker: Option<RawPool>,
    gatekeeper: Option<RawPool>,
    beads: Option<RawBeads>,
    bridge: Option<RawBridge>,
    conductor: Option<RawConductor>,
    agents: Option<BTreeMap<String, RawAgent>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawAgent {
    provider: Option<String>,
    model: Option<String>,
    #[serde(rename = "mcpTools", default)]
    mcp_tools: Vec<String>,
    #[serde(rename = "mcpResources", default)]
    mcp_resources: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPool {
    min_workers: Option<u32>,
    max_workers: Option<u32>,
    load_factor: Option<f64>,
    timeout: Option<u64>,
    #[serde(rename = "maxRetries")]
    max_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBeads {
    path: Option<String>,
    binary: Option<String>,
    #[serde(rename = "autoSync")]
    auto_sync: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBridge {
    #[serde(rename = "maxLogs")]
    max_logs: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConductor {
    tick_interval_ms: Option<u64>,
    stall_timeout_ms: Option<u64>,
    grace_ms: Option<u64>,
    max_pipe_cycles: Option<u32>,
    queue_path: Option<String>,
}

fn merge_pool(base: PoolConfig, raw: Option<RawPool>) -> PoolConfig {
    let Some(raw) = raw else { return base };
    PoolConfig {
        min_workers: raw.min_workers.unwrap_or(base.min_workers),
        max_workers: raw.max_workers.unwrap_or(base.max_workers),
        load_factor: raw.load_factor.unwrap_or(base.load_factor),
        timeout_ms: raw.timeout.unwrap_or(base.timeout_ms),
        max_retries: raw.max_retries.unwrap_or(base.max_retries),
    }
}

/// Loads configuration from `path` (default `.citadel/config.toml`), falling
/// back to built-in defaults when the file is absent, then applying
/// `CITADEL_*` environment overrides.
///
/// # Errors
/// Returns [`CitadelError::Config`] if the file exists but is not valid TOML.
pub async fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config_path = path.unwrap_or_else(|| PathBuf::from(".citadel/config.toml"));
    let raw = if config_path.exists() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|e| CitadelError::Config(format!("failed to read config: {e}")))?;
        parse_config_content(&content)?
    } else {
        RawConfig::default()
    };

    Ok(apply_env_overrides(build_config(raw)))
}

fn parse_config_content(content: &str) -> Result<RawConfig> {
    toml::from_str(content).map_err(|e| CitadelError::Config(format!("invalid TOML: {e}")))
}

fn build_config(raw: RawConfig) -> Config {
    let defaults = Config::default();
    Config {
        worker: merge_pool(defaults.worker, raw.worker),
        gatekeeper: merge_pool(defaults.gatekeeper, raw.gatekeeper),
        beads: raw.beads.map_or_else(
            || defaults.beads.clone(),
            |b| BeadsConfig {
                path: b.path.map_or(defaults.beads.path.clone(), PathBuf::from),
                binary: b.binary.unwrap_or(defaults.beads.binary.clone()),
                auto_sync: b.auto_sync.unwrap_or(defaults.beads.auto_sync),
            },
        ),
        bridge: BridgeConfig {
            max_logs: raw.bridge.and_then(|b| b.max_logs).or(defaults.bridge.max_logs),
        },
        conductor: raw.conductor.map_or_else(
            || defaults.conductor.clone(),
            |c| ConductorConfig {
                tick_interval_ms: c.tick_interval_ms.unwrap_or(defaults.conductor.tick_interval_ms),
                stall_timeout_ms: c.stall_timeout_ms.unwrap_or(defaults.conductor.stall_timeout_ms),
                grace_ms: c.grace_ms.unwrap_or(defaults.conductor.grace_ms),
                max_pipe_cycles: c.max_pipe_cycles.unwrap_or(defaults.conductor.max_pipe_cycles),
                queue_path: c
                    .queue_path
                    .map_or(defaults.conductor.queue_path.clone(), PathBuf::from),
            },
        ),
        agents: raw
            .agents
            .unwrap_or_default()
            .into_iter()
            .map(|(role, a)| {
                (
                    role,
                    AgentConfig {
                        provider: a.provider,
                        model: a.model,
                        mcp_tools: a.mcp_tools,
                        mcp_resources: a.mcp_resources,
                    },
                )
            })
            .collect(),
    }
}

fn apply_env_overrides(mut config: Config) -> Config {
    if let Some(v) = env_u32("CITADEL_WORKER_MIN") {
        config.worker.min_workers = v;
    }
    if let Some(v) = env_u32("CITADEL_WORKER_MAX") {
        config.worker.max_workers = v;
    }
    if let Some(v) = env_u32("CITADEL_GATEKEEPER_MIN") {
        config.gatekeeper.min_workers = v;
    }
    if let Some(v) = env_u32("CITADEL_GATEKEEPER_MAX") {
        config.gatekeeper.max_workers = v;
    }
    if let Ok(v) = std::env::var("CITADEL_BEADS_BINARY") {
        config.beads.binary = v;
    }
    if let Ok(v) = std::env::var("CITADEL_QUEUE_PATH") {
        config.conductor.queue_path = PathBuf::from(v);
    }
    config
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Resolves the `.citadel` directory used for config, formulas, and the
/// queue database, relative to `base`.
#[must_use]
pub fn citadel_dir(base: &Path) -> PathBuf {
    base.join(".citadel")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let config = Config::default();
        assert_eq!(config.worker.min_workers, 1);
        assert_eq!(config.worker.max_workers, 4);
        assert!((config.worker.load_factor - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.conductor.tick_interval_ms, 5_000);
        assert_eq!(config.conductor.stall_timeout_ms, 120_000);
    }

    #[test]
    fn parses_overrides_from_toml() {
        let content = r#"
            [worker]
            min_workers = 2
            max_workers = 8
            load_factor = 0.5

            [gatekeeper]
            max_workers = 3

            [beads]
            binary = "bd2"
        "#;
        let raw = parse_config_content(content).expect("toml parses");
        let config = build_config(raw);
        assert_eq!(config.worker.min_workers, 2);
        assert_eq!(config.worker.max_workers, 8);
        assert_eq!(config.gatekeeper.max_workers, 3);
        assert_eq!(config.beads.binary, "bd2");
        // Unset fields keep defaults.
        assert_eq!(config.gatekeeper.min_workers, 1);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let content = r#"
            [some_unknown_section]
            foo = "bar"
        "#;
        assert!(parse_config_content(content).is_ok());
    }

    #[test]
    fn parses_per_role_agent_config() {
        let content = r#"
            [agents.worker]
            provider = "anthropic"
            model = "claude"
            mcpTools = ["fs_read", "fs_write"]

            [agents.worker.mcpResources]
            docs = ["file:///README.md"]
        "#;
        let raw = parse_config_content(content).expect("toml parses");
        let config = build_config(raw);
        let worker_agent = config.agents.get("worker").expect("worker agent section present");
        assert_eq!(worker_agent.provider.as_deref(), Some("anthropic"));
        assert_eq!(worker_agent.mcp_tools, vec!["fs_read".to_string(), "fs_write".to_string()]);
        assert_eq!(
            worker_agent.mcp_resources.get("docs"),
            Some(&vec!["file:///README.md".to_string()])
        );
    }
}
