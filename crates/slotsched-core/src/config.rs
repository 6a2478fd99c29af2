//! Configuration types for slotsched

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::device::AllocMapSpec;
use crate::error::{SlotschedError, SlotschedResult};
use crate::session::{
    AgentId, ExistingSession, PendingSession, SessionType, DEFAULT_ARCHITECTURE,
};

/// Scheduling policy of a scaling group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Oldest first with head-of-line blocking avoidance
    #[default]
    Fifo,
    /// Newest first
    Lifo,
    /// Dominant resource fairness across access keys
    Drf,
    /// Most-free agent first
    Mof,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Fifo => write!(f, "fifo"),
            SchedulerKind::Lifo => write!(f, "lifo"),
            SchedulerKind::Drf => write!(f, "drf"),
            SchedulerKind::Mof => write!(f, "mof"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = SlotschedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(SchedulerKind::Fifo),
            "lifo" => Ok(SchedulerKind::Lifo),
            "drf" => Ok(SchedulerKind::Drf),
            "mof" => Ok(SchedulerKind::Mof),
            other => Err(SlotschedError::UnknownScheduler(other.to_string())),
        }
    }
}

fn default_allowed_session_types() -> Vec<SessionType> {
    vec![
        SessionType::Interactive,
        SessionType::Batch,
        SessionType::Inference,
    ]
}

/// Per scaling group scheduling options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingGroupOpts {
    /// Scheduling policy
    #[serde(default)]
    pub scheduler: SchedulerKind,
    /// Pending sessions older than this are cancelled (0 disables)
    #[serde(default)]
    pub pending_timeout_secs: u64,
    /// Session types this group accepts
    #[serde(default = "default_allowed_session_types")]
    pub allowed_session_types: Vec<SessionType>,
    /// Rotate single-node sessions over agents instead of asking the policy
    #[serde(default)]
    pub roundrobin: bool,
    /// Policy specific settings, validated when the policy is built
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Default for ScalingGroupOpts {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            pending_timeout_secs: 0,
            allowed_session_types: default_allowed_session_types(),
            roundrobin: false,
            config: serde_json::Map::new(),
        }
    }
}

impl ScalingGroupOpts {
    /// Pending timeout as a duration; zero means disabled
    pub fn pending_timeout(&self) -> SlotschedResult<Duration> {
        i64::try_from(self.pending_timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                SlotschedError::ConfigValidation(format!(
                    "pending_timeout_secs is out of range: {}",
                    self.pending_timeout_secs
                ))
            })
    }
}

/// A named scaling group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingGroupSpec {
    pub name: String,
    #[serde(default)]
    pub opts: ScalingGroupOpts,
}

fn default_agent_architecture() -> String {
    DEFAULT_ARCHITECTURE.to_string()
}

/// An agent and its device inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_agent_architecture")]
    pub architecture: String,
    pub scaling_group: String,
    /// Allocation maps; each slot name must be owned by one map only
    #[serde(default)]
    pub alloc_maps: Vec<AllocMapSpec>,
}

/// A complete cluster snapshot used by the simulator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub scaling_groups: Vec<ScalingGroupSpec>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub pending_sessions: Vec<PendingSession>,
    #[serde(default)]
    pub existing_sessions: Vec<ExistingSession>,
}

impl ScenarioConfig {
    /// Load a scenario from a TOML file
    pub fn from_file(path: &Path) -> SlotschedResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SlotschedError::Config(format!("Failed to read scenario file: {}", e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a scenario from TOML text
    pub fn parse(content: &str) -> SlotschedResult<Self> {
        let mut scenario: ScenarioConfig = toml::from_str(content)
            .map_err(|e| SlotschedError::Config(format!("Failed to parse scenario: {}", e)))?;
        for session in &mut scenario.pending_sessions {
            session.ensure_main_kernel();
        }
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> SlotschedResult<()> {
        let groups: HashSet<&str> = self.scaling_groups.iter().map(|g| g.name.as_str()).collect();
        if groups.len() != self.scaling_groups.len() {
            return Err(SlotschedError::Config(
                "Duplicate scaling group name".to_string(),
            ));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(SlotschedError::Config(format!(
                    "Duplicate agent id: {}",
                    agent.id
                )));
            }
            if !groups.contains(agent.scaling_group.as_str()) {
                return Err(SlotschedError::Config(format!(
                    "Agent {} refers to unknown scaling group {}",
                    agent.id, agent.scaling_group
                )));
            }
        }

        for session in &self.pending_sessions {
            if !groups.contains(session.scaling_group.as_str()) {
                return Err(SlotschedError::Config(format!(
                    "Session {} refers to unknown scaling group {}",
                    session.id, session.scaling_group
                )));
            }
        }
        Ok(())
    }
}

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Scheduling loop configuration
    #[serde(default)]
    pub scheduler: LoopConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> SlotschedResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SlotschedError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| SlotschedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Scheduling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Seconds between scheduling passes
    pub tick_interval_secs: u64,
    /// Stop after this many passes (runs until interrupted if unset)
    #[serde(default)]
    pub max_ticks: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            max_ticks: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.scheduler.tick_interval_secs, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_scheduler_kind_from_str() {
        assert_eq!("fifo".parse::<SchedulerKind>().unwrap(), SchedulerKind::Fifo);
        assert_eq!("LIFO".parse::<SchedulerKind>().unwrap(), SchedulerKind::Lifo);
        assert_eq!("drf".parse::<SchedulerKind>().unwrap(), SchedulerKind::Drf);
        assert_eq!("mof".parse::<SchedulerKind>().unwrap(), SchedulerKind::Mof);
        assert!(matches!(
            "round-robin".parse::<SchedulerKind>(),
            Err(SlotschedError::UnknownScheduler(_))
        ));
    }

    #[test]
    fn test_scaling_group_opts_defaults() {
        let opts: ScalingGroupOpts = toml::from_str("").unwrap();
        assert_eq!(opts.scheduler, SchedulerKind::Fifo);
        assert_eq!(opts.pending_timeout().unwrap(), Duration::zero());
        assert!(!opts.roundrobin);
        assert_eq!(opts.allowed_session_types.len(), 3);
        assert!(opts.config.is_empty());
    }

    #[test]
    fn test_scaling_group_opts_parse() {
        let toml_str = r#"
scheduler = "drf"
pending_timeout_secs = 172800
allowed_session_types = ["batch"]
roundrobin = true

[config]
num_retries_to_skip = 5
extra_config = "kept"
"#;
        let opts: ScalingGroupOpts = toml::from_str(toml_str).unwrap();
        assert_eq!(opts.scheduler, SchedulerKind::Drf);
        assert_eq!(opts.pending_timeout().unwrap(), Duration::days(2));
        assert_eq!(opts.allowed_session_types, vec![SessionType::Batch]);
        assert!(opts.roundrobin);
        assert_eq!(opts.config["num_retries_to_skip"], 5);
        assert_eq!(opts.config["extra_config"], "kept");
    }

    #[test]
    fn test_pending_timeout_out_of_range() {
        let opts: ScalingGroupOpts =
            toml::from_str("pending_timeout_secs = 10_000_000_000_000_000").unwrap();
        assert!(matches!(
            opts.pending_timeout(),
            Err(SlotschedError::ConfigValidation(_))
        ));

        let opts = ScalingGroupOpts {
            pending_timeout_secs: u64::MAX,
            ..Default::default()
        };
        assert!(opts.pending_timeout().is_err());
    }

    const SCENARIO: &str = r#"
[[scaling_groups]]
name = "default"

[scaling_groups.opts]
scheduler = "fifo"

[[agents]]
id = "i-001"
scaling_group = "default"

[[agents.alloc_maps]]
kind = "discrete"

[[agents.alloc_maps.devices]]
id = "cpu0"
slot_name = "cpu"
amount = 4

[[pending_sessions]]
access_key = "user01"
scaling_group = "default"

[pending_sessions.requested_slots]
cpu = 2
"#;

    #[test]
    fn test_scenario_parse() {
        let scenario = ScenarioConfig::parse(SCENARIO).unwrap();
        assert_eq!(scenario.scaling_groups.len(), 1);
        assert_eq!(scenario.agents[0].alloc_maps[0].devices.len(), 1);
        assert_eq!(scenario.pending_sessions[0].kernels.len(), 1);
        assert_eq!(scenario.agents[0].architecture, DEFAULT_ARCHITECTURE);
    }

    #[test]
    fn test_scenario_unknown_scaling_group() {
        let broken = SCENARIO.replace("scaling_group = \"default\"\n\n[pending", "scaling_group = \"gpu\"\n\n[pending");
        let result = ScenarioConfig::parse(&broken);
        assert!(matches!(result, Err(SlotschedError::Config(_))));
    }

    #[test]
    fn test_daemon_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
tick_interval_secs = 3
max_ticks = 5

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();
        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 3);
        assert_eq!(config.scheduler.max_ticks, Some(5));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_daemon_config_missing_file() {
        let result = DaemonConfig::from_file(Path::new("/nonexistent/slotsched.toml"));
        assert!(matches!(result, Err(SlotschedError::Config(_))));
    }
}
