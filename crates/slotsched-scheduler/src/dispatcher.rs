//! One scheduling pass over the pending sessions of a scaling group

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use slotsched_core::{
    AgentContext, AgentId, ClusterMode, ExistingSession, KernelId, KernelInfo, PendingSession,
    ResourceSlot, ScalingGroupOpts, SessionId, SlotAllocation, SlotschedError, SlotschedResult,
    StatusData,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::agent::AgentAllocator;
use crate::alloc_map::AllocateOptions;
use crate::policy::{load_scheduler, Scheduler};
use crate::predicates::check_predicates;

/// Where one kernel landed and what it holds
#[derive(Debug, Clone, Serialize)]
pub struct KernelPlacement {
    pub kernel_id: KernelId,
    pub agent_id: AgentId,
    pub allocation: SlotAllocation,
}

/// A session moved from PENDING to SCHEDULED
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleDecision {
    pub session_id: SessionId,
    pub placements: Vec<KernelPlacement>,
}

impl ScheduleDecision {
    /// Distinct agents hosting the session, in placement order
    pub fn agent_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.placements
            .iter()
            .map(|p| p.agent_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// A session moved from PENDING to CANCELLED
#[derive(Debug, Clone, Serialize)]
pub struct Cancellation {
    pub session_id: SessionId,
    pub reason: String,
}

/// A session that stays PENDING with refreshed status data
#[derive(Debug, Clone, Serialize)]
pub struct PendingUpdate {
    pub session_id: SessionId,
    pub status_info: String,
    pub status_data: StatusData,
}

/// Everything a pass decided
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickOutcome {
    pub scheduled: Vec<ScheduleDecision>,
    pub cancelled: Vec<Cancellation>,
    pub pending: Vec<PendingUpdate>,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.cancelled.is_empty() && self.pending.is_empty()
    }
}

/// Where the round-robin rotation continues for one architecture
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoundRobinState {
    /// Agent ids in id order when the state was recorded
    agent_ids: Vec<AgentId>,
    next_index: usize,
}

/// Runs scheduling passes for one scaling group
#[derive(Debug)]
pub struct Dispatcher {
    scaling_group: String,
    opts: ScalingGroupOpts,
    pending_timeout: Duration,
    roundrobin: Mutex<HashMap<String, RoundRobinState>>,
}

impl Dispatcher {
    /// Create a dispatcher; the policy config is validated here
    pub fn new(scaling_group: impl Into<String>, opts: ScalingGroupOpts) -> SlotschedResult<Self> {
        let scaling_group = scaling_group.into();
        load_scheduler(opts.scheduler, &opts, &opts.config)?;
        let pending_timeout = opts.pending_timeout()?;

        info!(
            scaling_group = %scaling_group,
            scheduler = %opts.scheduler,
            pending_timeout_secs = opts.pending_timeout_secs,
            roundrobin = opts.roundrobin,
            "Dispatcher initialized"
        );

        Ok(Self {
            scaling_group,
            opts,
            pending_timeout,
            roundrobin: Mutex::new(HashMap::new()),
        })
    }

    pub fn scaling_group(&self) -> &str {
        &self.scaling_group
    }

    pub fn opts(&self) -> &ScalingGroupOpts {
        &self.opts
    }

    /// Split pending sessions into scheduling candidates and timed-out ones
    pub fn list_pending_sessions(
        &self,
        pending: Vec<PendingSession>,
        now: DateTime<Utc>,
    ) -> (Vec<PendingSession>, Vec<PendingSession>) {
        if self.pending_timeout <= Duration::zero() {
            return (pending, Vec::new());
        }
        pending
            .into_iter()
            .partition(|session| now - session.created_at < self.pending_timeout)
    }

    /// Run one pass: cancel timed-out sessions and place as many of the rest as possible
    ///
    /// Allocations of scheduled sessions stay applied on `agents`.
    pub fn tick(
        &self,
        pending: Vec<PendingSession>,
        existing: &[ExistingSession],
        agents: &mut [AgentAllocator],
        now: DateTime<Utc>,
    ) -> SlotschedResult<TickOutcome> {
        let mut scheduler = load_scheduler(self.opts.scheduler, &self.opts, &self.opts.config)?;
        let (mut candidates, timed_out) = self.list_pending_sessions(pending, now);
        let mut outcome = TickOutcome::default();

        for session in timed_out {
            info!(
                scaling_group = %self.scaling_group,
                session_id = %session.id,
                created_at = %session.created_at,
                "Cancelling session after pending timeout"
            );
            outcome.cancelled.push(Cancellation {
                session_id: session.id,
                reason: "pending-timeout".to_string(),
            });
        }

        candidates.sort_by_key(|s| s.created_at);
        let total_capacity: ResourceSlot = agents.iter().map(|a| a.capacity()).sum();

        while !candidates.is_empty() {
            let picked = match scheduler.pick_session(&total_capacity, &candidates, existing) {
                Some(id) => id,
                None => break,
            };
            let idx = match candidates.iter().position(|s| s.id == picked) {
                Some(idx) => idx,
                None => {
                    warn!(session_id = %picked, "Scheduler picked a session outside the queue");
                    break;
                }
            };
            let mut session = candidates.remove(idx);

            let predicates = check_predicates(&session, &self.opts, now);
            let status = session.status_data.scheduler_mut();
            status.last_try = Some(now);
            status.passed_predicates = predicates.passed.clone();
            status.failed_predicates = predicates.failed.clone();
            if !predicates.is_ok() {
                status.retries += 1;
                status.msg = Some(predicates.failure_message());
                warn!(
                    session_id = %session.id,
                    failed = ?predicates.failed.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
                    "predicate-checks-failed (temporary)"
                );
                outcome.pending.push(PendingUpdate {
                    session_id: session.id,
                    status_info: "predicate-checks-failed".to_string(),
                    status_data: session.status_data,
                });
                continue;
            }

            let placed = match session.cluster_mode {
                ClusterMode::SingleNode => {
                    self.schedule_single_node(scheduler.as_ref(), &session, agents)
                }
                ClusterMode::MultiNode => {
                    self.schedule_multi_node(scheduler.as_ref(), &session, agents)
                }
            };

            match placed {
                Ok(placements) => {
                    scheduler.update_allocation(&session);
                    let decision = ScheduleDecision {
                        session_id: session.id,
                        placements,
                    };
                    info!(
                        scaling_group = %self.scaling_group,
                        session_id = %session.id,
                        access_key = %session.access_key,
                        agents = ?decision.agent_ids(),
                        requested = %session.requested_slots,
                        "Session scheduled"
                    );
                    outcome.scheduled.push(decision);
                }
                Err(e) => outcome.pending.push(self.keep_pending(session, &e)),
            }
        }

        Ok(outcome)
    }

    fn keep_pending(&self, mut session: PendingSession, error: &SlotschedError) -> PendingUpdate {
        let status = session.status_data.scheduler_mut();
        status.msg = Some(error.to_string());
        let status_info = if error.is_recoverable() {
            status.retries += 1;
            debug!(session_id = %session.id, reason = %error, "no-available-instances");
            "no-available-instances"
        } else {
            warn!(session_id = %session.id, error = %error, "Failed to schedule session");
            "scheduler-error"
        };
        PendingUpdate {
            session_id: session.id,
            status_info: status_info.to_string(),
            status_data: session.status_data,
        }
    }

    /// Place every kernel of `session` on one agent
    fn schedule_single_node(
        &self,
        scheduler: &dyn Scheduler,
        session: &PendingSession,
        agents: &mut [AgentAllocator],
    ) -> SlotschedResult<Vec<KernelPlacement>> {
        let architectures: HashSet<&str> = session
            .kernels
            .iter()
            .map(|k| k.architecture.as_str())
            .collect();
        if architectures.len() > 1 {
            return Err(SlotschedError::GenericBadRequest(
                "Cannot assign multiple kernels with different architectures to a single node session"
                    .to_string(),
            ));
        }
        let architecture = architectures.into_iter().next().ok_or_else(|| {
            SlotschedError::GenericBadRequest(format!(
                "The session {} does not have any kernel",
                session.id
            ))
        })?;

        let contexts = self.compatible_contexts(agents, architecture)?;
        let pinned = pinned_agent(
            session.designated_agent().map(String::as_str),
            &session.requested_slots,
            &contexts,
        );
        let agent_id = match pinned {
            Some(agent_id) => agent_id,
            None => self.assign_agent(scheduler, session, architecture, &contexts)?,
        };

        let agent = find_agent(agents, &agent_id)?;
        let mut placements = Vec::with_capacity(session.kernels.len());
        for kernel in &session.kernels {
            match allocate_kernel(agent, kernel) {
                Ok(placement) => placements.push(placement),
                Err(e) => {
                    for placement in &placements {
                        agent.free(&placement.allocation);
                    }
                    return Err(e);
                }
            }
        }
        Ok(placements)
    }

    /// Pick an agent for a session without a usable pin, rotating over agents
    /// when the group asks for round-robin
    fn assign_agent(
        &self,
        scheduler: &dyn Scheduler,
        session: &PendingSession,
        architecture: &str,
        contexts: &[AgentContext],
    ) -> SlotschedResult<AgentId> {
        if self.opts.roundrobin {
            if let Some(agent_id) =
                self.next_roundrobin_agent(architecture, contexts, &session.requested_slots)
            {
                debug!(session_id = %session.id, agent_id = %agent_id, "Round-robin assignment");
                return Ok(agent_id);
            }
        }

        let agent_id = scheduler
            .assign_agent_for_session(contexts, session)
            .ok_or_else(|| {
                SlotschedError::InstanceNotAvailable(format!(
                    "Could not find a contiguous resource region in any agent big enough to host the session (id: {}, resource group: {})",
                    session.id, self.scaling_group
                ))
            })?;
        if self.opts.roundrobin {
            self.reset_roundrobin(architecture, contexts, &agent_id);
        }
        Ok(agent_id)
    }

    /// First agent from the saved position, in id order, that can host `requested`
    ///
    /// Gives up when there is no saved position or the agent set changed since.
    fn next_roundrobin_agent(
        &self,
        architecture: &str,
        contexts: &[AgentContext],
        requested: &ResourceSlot,
    ) -> Option<AgentId> {
        let sorted = sorted_by_id(contexts);
        let mut states = self.roundrobin.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.get_mut(architecture)?;
        if state.agent_ids.len() != sorted.len()
            || state.agent_ids.iter().zip(&sorted).any(|(id, c)| *id != c.id)
        {
            return None;
        }

        let len = sorted.len();
        let start = state.next_index;
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|idx| *requested <= sorted[*idx].free_slots())
            .map(|idx| {
                state.next_index = (idx + 1) % len;
                sorted[idx].id.clone()
            })
    }

    /// Continue the rotation after `agent_id` on the current agent set
    fn reset_roundrobin(&self, architecture: &str, contexts: &[AgentContext], agent_id: &str) {
        let agent_ids: Vec<AgentId> = sorted_by_id(contexts)
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        let next_index = agent_ids
            .iter()
            .position(|id| id == agent_id)
            .map_or(0, |idx| (idx + 1) % agent_ids.len());
        let mut states = self.roundrobin.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(
            architecture.to_string(),
            RoundRobinState {
                agent_ids,
                next_index,
            },
        );
    }

    /// Place each kernel of `session` separately; all or nothing
    fn schedule_multi_node(
        &self,
        scheduler: &dyn Scheduler,
        session: &PendingSession,
        agents: &mut [AgentAllocator],
    ) -> SlotschedResult<Vec<KernelPlacement>> {
        if session.kernels.is_empty() {
            return Err(SlotschedError::GenericBadRequest(format!(
                "The session {} does not have any kernel",
                session.id
            )));
        }

        let mut placements: Vec<KernelPlacement> = Vec::with_capacity(session.kernels.len());
        for kernel in &session.kernels {
            match self.schedule_kernel(scheduler, kernel, agents) {
                Ok(placement) => placements.push(placement),
                Err(e) => {
                    for placement in &placements {
                        if let Ok(agent) = find_agent(agents, &placement.agent_id) {
                            agent.free(&placement.allocation);
                        }
                    }
                    debug!(
                        session_id = %session.id,
                        kernel_id = %kernel.id,
                        rolled_back = placements.len(),
                        "Multi-node placement failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(placements)
    }

    fn schedule_kernel(
        &self,
        scheduler: &dyn Scheduler,
        kernel: &KernelInfo,
        agents: &mut [AgentAllocator],
    ) -> SlotschedResult<KernelPlacement> {
        let contexts = self.compatible_contexts(agents, &kernel.architecture)?;
        let agent_id = pinned_agent(kernel.agent_id.as_deref(), &kernel.requested_slots, &contexts)
            .or_else(|| scheduler.assign_agent_for_kernel(&contexts, kernel))
            .ok_or_else(|| {
                SlotschedError::InstanceNotAvailable(format!(
                    "Could not find an agent big enough to host the kernel {} (resource group: {})",
                    kernel.id, self.scaling_group
                ))
            })?;
        allocate_kernel(find_agent(agents, &agent_id)?, kernel)
    }

    fn compatible_contexts(
        &self,
        agents: &[AgentAllocator],
        architecture: &str,
    ) -> SlotschedResult<Vec<AgentContext>> {
        if agents.is_empty() {
            return Err(SlotschedError::InstanceNotAvailable(
                "No agents are available for scheduling".to_string(),
            ));
        }
        let contexts: Vec<AgentContext> = agents
            .iter()
            .filter(|a| a.architecture() == architecture)
            .map(AgentAllocator::to_context)
            .collect();
        if contexts.is_empty() {
            return Err(SlotschedError::InstanceNotAvailable(format!(
                "No agents found to be compatible with the image architecture ({})",
                architecture
            )));
        }
        Ok(contexts)
    }
}

fn sorted_by_id(contexts: &[AgentContext]) -> Vec<&AgentContext> {
    let mut sorted: Vec<&AgentContext> = contexts.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted
}

/// A manually designated agent, if it can still host `requested`
fn pinned_agent(
    designated: Option<&str>,
    requested: &ResourceSlot,
    contexts: &[AgentContext],
) -> Option<AgentId> {
    let agent_id = designated?;
    match contexts.iter().find(|c| c.id == agent_id) {
        Some(context) if *requested <= context.free_slots() => Some(context.id.clone()),
        Some(context) => {
            info!(
                agent_id = %agent_id,
                requested = %requested,
                free = %context.free_slots(),
                "Designated agent lacks capacity, falling back to normal assignment"
            );
            None
        }
        None => {
            info!(agent_id = %agent_id, "Designated agent is not a candidate, falling back");
            None
        }
    }
}

fn find_agent<'a>(
    agents: &'a mut [AgentAllocator],
    agent_id: &str,
) -> SlotschedResult<&'a mut AgentAllocator> {
    agents
        .iter_mut()
        .find(|a| a.id() == agent_id)
        .ok_or_else(|| SlotschedError::AgentNotFound(agent_id.to_string()))
}

fn allocate_kernel(agent: &mut AgentAllocator, kernel: &KernelInfo) -> SlotschedResult<KernelPlacement> {
    let options = AllocateOptions {
        context_tag: Some(kernel.id.to_string()),
        ..Default::default()
    };
    let allocation = agent.allocate(&kernel.requested_slots, &options)?;
    Ok(KernelPlacement {
        kernel_id: kernel.id,
        agent_id: agent.id().to_string(),
        allocation,
    })
}
