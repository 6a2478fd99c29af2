//! Async scheduling loop over a pluggable session repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use slotsched_core::{
    AgentSpec, ExistingSession, PendingSession, ScalingGroupSpec, ScenarioConfig, SessionId,
    SlotschedError, SlotschedResult,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::agent::AgentAllocator;
use crate::dispatcher::{Cancellation, Dispatcher, ScheduleDecision, TickOutcome};

/// Everything one pass needs to know about a scaling group
#[derive(Debug)]
pub struct ScalingGroupSnapshot {
    pub pending: Vec<PendingSession>,
    pub existing: Vec<ExistingSession>,
    /// Agents with their current allocations applied
    pub agents: Vec<AgentAllocator>,
}

/// Storage the scheduling loop reads sessions from and writes decisions to
#[async_trait]
pub trait SchedulingRepository: Send + Sync {
    /// Scaling groups to schedule
    async fn scaling_groups(&self) -> SlotschedResult<Vec<ScalingGroupSpec>>;

    /// Load pending and existing sessions and agent allocations of a group
    async fn load_snapshot(&self, scaling_group: &str) -> SlotschedResult<ScalingGroupSnapshot>;

    /// Apply the decisions of one pass
    async fn persist_outcome(&self, scaling_group: &str, outcome: &TickOutcome)
        -> SlotschedResult<()>;
}

#[derive(Debug, Default)]
struct RepositoryState {
    scaling_groups: Vec<ScalingGroupSpec>,
    agents: Vec<AgentSpec>,
    pending: Vec<PendingSession>,
    existing: Vec<ExistingSession>,
    scheduled: Vec<ScheduleDecision>,
    cancelled: Vec<Cancellation>,
}

/// Repository keeping everything in memory
///
/// Agents are rebuilt from their inventory on every load and the recorded
/// kernel allocations are re-applied on top.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<RepositoryState>,
}

impl InMemoryRepository {
    /// Create a repository seeded with a scenario
    pub fn from_scenario(scenario: ScenarioConfig) -> Self {
        info!(
            scaling_groups = scenario.scaling_groups.len(),
            agents = scenario.agents.len(),
            pending = scenario.pending_sessions.len(),
            existing = scenario.existing_sessions.len(),
            "Repository loaded"
        );
        Self {
            state: RwLock::new(RepositoryState {
                scaling_groups: scenario.scaling_groups,
                agents: scenario.agents,
                pending: scenario.pending_sessions,
                existing: scenario.existing_sessions,
                scheduled: Vec::new(),
                cancelled: Vec::new(),
            }),
        }
    }

    pub async fn pending_sessions(&self) -> Vec<PendingSession> {
        self.state.read().await.pending.clone()
    }

    pub async fn existing_sessions(&self) -> Vec<ExistingSession> {
        self.state.read().await.existing.clone()
    }

    pub async fn scheduled(&self) -> Vec<ScheduleDecision> {
        self.state.read().await.scheduled.clone()
    }

    pub async fn cancelled(&self) -> Vec<Cancellation> {
        self.state.read().await.cancelled.clone()
    }
}

#[async_trait]
impl SchedulingRepository for InMemoryRepository {
    async fn scaling_groups(&self) -> SlotschedResult<Vec<ScalingGroupSpec>> {
        Ok(self.state.read().await.scaling_groups.clone())
    }

    async fn load_snapshot(&self, scaling_group: &str) -> SlotschedResult<ScalingGroupSnapshot> {
        let state = self.state.read().await;
        if !state.scaling_groups.iter().any(|g| g.name == scaling_group) {
            return Err(SlotschedError::Config(format!(
                "Unknown scaling group: {}",
                scaling_group
            )));
        }

        let mut agents = state
            .agents
            .iter()
            .filter(|a| a.scaling_group == scaling_group)
            .map(AgentAllocator::from_spec)
            .collect::<SlotschedResult<Vec<_>>>()?;
        for placement in state.scheduled.iter().flat_map(|d| &d.placements) {
            if let Some(agent) = agents.iter_mut().find(|a| a.id() == placement.agent_id) {
                agent.apply_allocation(&placement.allocation);
            }
        }

        Ok(ScalingGroupSnapshot {
            pending: state
                .pending
                .iter()
                .filter(|s| s.scaling_group == scaling_group)
                .cloned()
                .collect(),
            existing: state
                .existing
                .iter()
                .filter(|s| s.scaling_group == scaling_group)
                .cloned()
                .collect(),
            agents,
        })
    }

    async fn persist_outcome(
        &self,
        scaling_group: &str,
        outcome: &TickOutcome,
    ) -> SlotschedResult<()> {
        let mut state = self.state.write().await;

        let scheduled: HashSet<SessionId> =
            outcome.scheduled.iter().map(|d| d.session_id).collect();
        let cancelled: HashSet<SessionId> =
            outcome.cancelled.iter().map(|c| c.session_id).collect();
        let updates: HashMap<SessionId, _> = outcome
            .pending
            .iter()
            .map(|u| (u.session_id, &u.status_data))
            .collect();

        let mut still_pending = Vec::with_capacity(state.pending.len());
        let mut started = Vec::new();
        for mut session in std::mem::take(&mut state.pending) {
            if scheduled.contains(&session.id) {
                started.push(ExistingSession {
                    id: session.id,
                    access_key: session.access_key,
                    scaling_group: session.scaling_group,
                    occupying_slots: session.requested_slots,
                    created_at: session.created_at,
                });
            } else if !cancelled.contains(&session.id) {
                if let Some(status_data) = updates.get(&session.id) {
                    session.status_data = (*status_data).clone();
                }
                still_pending.push(session);
            }
        }
        state.pending = still_pending;
        state.existing.extend(started);
        state.scheduled.extend(outcome.scheduled.iter().cloned());
        state.cancelled.extend(outcome.cancelled.iter().cloned());

        debug!(
            scaling_group = %scaling_group,
            pending = state.pending.len(),
            existing = state.existing.len(),
            "Outcome persisted"
        );
        Ok(())
    }
}

/// Periodically runs a dispatcher pass for every scaling group
pub struct SchedulerLoop {
    repository: Arc<dyn SchedulingRepository>,
    /// Dispatchers with a lock serializing passes of the same group
    dispatchers: Vec<(Dispatcher, Mutex<()>)>,
}

impl SchedulerLoop {
    /// Build a dispatcher for every scaling group of the repository
    pub async fn new(repository: Arc<dyn SchedulingRepository>) -> SlotschedResult<Self> {
        let dispatchers = repository
            .scaling_groups()
            .await?
            .into_iter()
            .map(|group| Ok((Dispatcher::new(group.name, group.opts)?, Mutex::new(()))))
            .collect::<SlotschedResult<Vec<_>>>()?;

        info!(scaling_groups = dispatchers.len(), "Scheduler loop initialized");
        Ok(Self {
            repository,
            dispatchers,
        })
    }

    /// Names of the scheduled groups
    pub fn scaling_groups(&self) -> Vec<&str> {
        self.dispatchers
            .iter()
            .map(|(d, _)| d.scaling_group())
            .collect()
    }

    /// Run one pass for a single scaling group
    pub async fn tick_group(
        &self,
        scaling_group: &str,
        now: DateTime<Utc>,
    ) -> SlotschedResult<TickOutcome> {
        let (dispatcher, lock) = self
            .dispatchers
            .iter()
            .find(|(d, _)| d.scaling_group() == scaling_group)
            .ok_or_else(|| {
                SlotschedError::Config(format!("Unknown scaling group: {}", scaling_group))
            })?;
        let _guard = lock.lock().await;

        let snapshot = self.repository.load_snapshot(scaling_group).await?;
        let mut agents = snapshot.agents;
        let outcome = dispatcher.tick(snapshot.pending, &snapshot.existing, &mut agents, now)?;
        self.repository
            .persist_outcome(scaling_group, &outcome)
            .await?;

        if !outcome.is_empty() {
            info!(
                scaling_group = %scaling_group,
                scheduled = outcome.scheduled.len(),
                cancelled = outcome.cancelled.len(),
                pending = outcome.pending.len(),
                "Scheduling pass finished"
            );
        }
        Ok(outcome)
    }

    /// Run one pass for every scaling group concurrently
    pub async fn tick_all(&self, now: DateTime<Utc>) -> Vec<(String, SlotschedResult<TickOutcome>)> {
        let passes = self.dispatchers.iter().map(|(d, _)| async move {
            let name = d.scaling_group().to_string();
            let result = self.tick_group(&name, now).await;
            (name, result)
        });
        join_all(passes).await
    }

    /// Tick every `interval` until `max_ticks` passes ran or `shutdown` resolves
    pub async fn run<F>(&self, interval: Duration, max_ticks: Option<u64>, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);
        let mut ticks = 0;

        info!(interval_secs = interval.as_secs(), max_ticks = ?max_ticks, "Scheduler loop started");
        loop {
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    for (scaling_group, result) in self.tick_all(Utc::now()).await {
                        if let Err(e) = result {
                            error!(scaling_group = %scaling_group, error = %e, "Scheduling pass failed");
                        }
                    }
                    ticks += 1;
                }
            }
        }
        info!(ticks = ticks, "Scheduler loop stopped");
        ticks
    }
}
