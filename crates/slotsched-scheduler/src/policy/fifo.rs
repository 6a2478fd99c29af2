//! First-in-first-out and last-in-first-out policies

use serde::Deserialize;
use serde_json::{Map, Value};
use slotsched_core::{
    AgentContext, AgentId, ExistingSession, PendingSession, ResourceSlot, ScalingGroupOpts,
    SchedulerKind, SessionId, SlotschedError, SlotschedResult,
};
use tracing::debug;

use super::{select_fewest_extras, Scheduler};

/// FIFO specific settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FifoConfig {
    /// Sessions that failed this many passes stop blocking the queue head
    /// (0 disables skipping)
    #[serde(default)]
    pub num_retries_to_skip: u32,
    /// Settings meant for other components of the scaling group
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FifoConfig {
    /// Validate raw scaling group config
    pub fn from_map(config: &Map<String, Value>) -> SlotschedResult<Self> {
        serde_json::from_value(Value::Object(config.clone())).map_err(|e| {
            SlotschedError::ConfigValidation(format!("Invalid FIFO scheduler config: {}", e))
        })
    }
}

/// Oldest pending session first, with head-of-line blocking avoidance
#[derive(Debug, Clone)]
pub struct FifoScheduler {
    opts: ScalingGroupOpts,
    config: FifoConfig,
}

impl FifoScheduler {
    pub fn new(opts: &ScalingGroupOpts, config: &Map<String, Value>) -> SlotschedResult<Self> {
        Ok(Self {
            opts: opts.clone(),
            config: FifoConfig::from_map(config)?,
        })
    }

    pub fn config(&self) -> &FifoConfig {
        &self.config
    }

    pub fn opts(&self) -> &ScalingGroupOpts {
        &self.opts
    }
}

impl Scheduler for FifoScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Fifo
    }

    fn pick_session(
        &self,
        _total_capacity: &ResourceSlot,
        pending: &[PendingSession],
        _existing: &[ExistingSession],
    ) -> Option<SessionId> {
        let head = pending.first()?;
        let skip_threshold = self.config.num_retries_to_skip;
        if skip_threshold == 0 {
            return Some(head.id);
        }

        for session in pending {
            match session.retries() {
                Some(retries) if retries >= skip_threshold => {
                    debug!(
                        session_id = %session.id,
                        retries = retries,
                        "Skipping session blocking the queue head"
                    );
                }
                _ => return Some(session.id),
            }
        }
        // Every session is past the threshold; fall back to the oldest.
        Some(head.id)
    }

    fn select_agent(&self, agents: &[AgentContext], requested: &ResourceSlot) -> Option<AgentId> {
        select_fewest_extras(agents, requested)
    }
}

/// Newest pending session first
#[derive(Debug, Clone)]
pub struct LifoScheduler {
    opts: ScalingGroupOpts,
}

impl LifoScheduler {
    pub fn new(opts: &ScalingGroupOpts, _config: &Map<String, Value>) -> SlotschedResult<Self> {
        Ok(Self { opts: opts.clone() })
    }

    pub fn opts(&self) -> &ScalingGroupOpts {
        &self.opts
    }
}

impl Scheduler for LifoScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Lifo
    }

    fn pick_session(
        &self,
        _total_capacity: &ResourceSlot,
        pending: &[PendingSession],
        _existing: &[ExistingSession],
    ) -> Option<SessionId> {
        pending.last().map(|s| s.id)
    }

    fn select_agent(&self, agents: &[AgentContext], requested: &ResourceSlot) -> Option<AgentId> {
        select_fewest_extras(agents, requested)
    }
}
