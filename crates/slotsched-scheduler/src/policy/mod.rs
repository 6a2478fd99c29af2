//! Scheduling policies
//!
//! A policy decides which pending session is tried next and which agent
//! receives it. Policies never mutate the session lists they are given; the
//! dispatcher owns all state transitions.

mod drf;
mod fifo;
mod mof;

pub use drf::DrfScheduler;
pub use fifo::{FifoConfig, FifoScheduler, LifoScheduler};
pub use mof::MofScheduler;

use serde_json::{Map, Value};
use slotsched_core::{
    AgentContext, AgentId, ExistingSession, KernelInfo, PendingSession, ResourceSlot,
    ScalingGroupOpts, SchedulerKind, SessionId, SlotschedResult,
};
use tracing::debug;

/// Queueing and agent selection policy of a scaling group
pub trait Scheduler: Send + Sync {
    /// Policy kind
    fn kind(&self) -> SchedulerKind;

    /// Pick the next session to try; `None` only if `pending` is empty
    fn pick_session(
        &self,
        total_capacity: &ResourceSlot,
        pending: &[PendingSession],
        existing: &[ExistingSession],
    ) -> Option<SessionId>;

    /// Choose an agent whose free capacity covers `requested`
    fn select_agent(&self, agents: &[AgentContext], requested: &ResourceSlot) -> Option<AgentId>;

    /// Choose an agent for a whole single-node session
    fn assign_agent_for_session(
        &self,
        agents: &[AgentContext],
        session: &PendingSession,
    ) -> Option<AgentId> {
        self.select_agent(agents, &session.requested_slots)
    }

    /// Choose an agent for one kernel of a multi-node session
    fn assign_agent_for_kernel(
        &self,
        agents: &[AgentContext],
        kernel: &KernelInfo,
    ) -> Option<AgentId> {
        self.select_agent(agents, &kernel.requested_slots)
    }

    /// Called after `session` has been placed in the current pass
    fn update_allocation(&mut self, _session: &PendingSession) {}
}

/// Build the policy `kind` for a scaling group, validating its config
pub fn load_scheduler(
    kind: SchedulerKind,
    opts: &ScalingGroupOpts,
    config: &Map<String, Value>,
) -> SlotschedResult<Box<dyn Scheduler>> {
    let scheduler: Box<dyn Scheduler> = match kind {
        SchedulerKind::Fifo => Box::new(FifoScheduler::new(opts, config)?),
        SchedulerKind::Lifo => Box::new(LifoScheduler::new(opts, config)?),
        SchedulerKind::Drf => Box::new(DrfScheduler::new(opts, config)?),
        SchedulerKind::Mof => Box::new(MofScheduler::new(opts, config)?),
    };
    debug!(scheduler = %kind, "Scheduler loaded");
    Ok(scheduler)
}

/// Agents whose free capacity covers `requested`, in list order
pub(crate) fn fitting_agents<'a>(
    agents: &'a [AgentContext],
    requested: &'a ResourceSlot,
) -> impl Iterator<Item = &'a AgentContext> + 'a {
    agents.iter().filter(move |agent| *requested <= agent.free_slots())
}

/// Slots the agent offers but the request does not use
///
/// Agents with idle accelerators are kept for sessions that need them.
fn num_extras(agent: &AgentContext, requested: &ResourceSlot) -> usize {
    agent
        .available_slots
        .iter()
        .filter(|(slot_name, amount)| !amount.is_zero() && requested.get(slot_name).is_zero())
        .count()
}

/// First fitting agent with the fewest unused slot kinds
pub(crate) fn select_fewest_extras(
    agents: &[AgentContext],
    requested: &ResourceSlot,
) -> Option<AgentId> {
    let mut best: Option<(usize, &AgentContext)> = None;
    for agent in fitting_agents(agents, requested) {
        let extras = num_extras(agent, requested);
        match best {
            Some((best_extras, _)) if best_extras <= extras => {}
            _ => best = Some((extras, agent)),
        }
    }
    best.map(|(_, agent)| agent.id.clone())
}
