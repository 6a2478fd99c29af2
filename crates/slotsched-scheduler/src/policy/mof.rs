//! Most-occupancy-free placement

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use slotsched_core::{
    AgentContext, AgentId, ExistingSession, PendingSession, ResourceSlot, ScalingGroupOpts,
    SchedulerKind, SessionId, SlotschedResult,
};

use super::{fitting_agents, Scheduler};

/// Oldest session first, placed on the least occupied agent
///
/// Agent contexts carry the allocations made earlier in the same pass, so
/// consecutive sessions spread over the agents.
#[derive(Debug, Clone)]
pub struct MofScheduler {
    opts: ScalingGroupOpts,
}

impl MofScheduler {
    pub fn new(opts: &ScalingGroupOpts, _config: &Map<String, Value>) -> SlotschedResult<Self> {
        Ok(Self { opts: opts.clone() })
    }

    pub fn opts(&self) -> &ScalingGroupOpts {
        &self.opts
    }
}

/// Highest occupied ratio over the agent's slots
fn occupancy_ratio(agent: &AgentContext) -> Decimal {
    agent
        .available_slots
        .iter()
        .filter(|(_, capacity)| !capacity.is_zero())
        .map(|(slot_name, capacity)| agent.occupied_slots.get(slot_name) / capacity)
        .max()
        .unwrap_or(Decimal::ZERO)
}

impl Scheduler for MofScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Mof
    }

    fn pick_session(
        &self,
        _total_capacity: &ResourceSlot,
        pending: &[PendingSession],
        _existing: &[ExistingSession],
    ) -> Option<SessionId> {
        pending.first().map(|s| s.id)
    }

    fn select_agent(&self, agents: &[AgentContext], requested: &ResourceSlot) -> Option<AgentId> {
        let mut best: Option<(Decimal, &AgentContext)> = None;
        for agent in fitting_agents(agents, requested) {
            let ratio = occupancy_ratio(agent);
            match best {
                Some((best_ratio, _)) if best_ratio <= ratio => {}
                _ => best = Some((ratio, agent)),
            }
        }
        best.map(|(_, agent)| agent.id.clone())
    }
}
