//! Dominant resource fairness across access keys

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use slotsched_core::{
    AccessKey, AgentContext, AgentId, ExistingSession, PendingSession, ResourceSlot,
    ScalingGroupOpts, SchedulerKind, SessionId, SlotschedResult,
};
use std::collections::HashMap;
use tracing::debug;

use super::{select_fewest_extras, Scheduler};

/// Picks the session of the access key holding the smallest dominant share
#[derive(Debug, Clone)]
pub struct DrfScheduler {
    opts: ScalingGroupOpts,
    /// Slots of sessions placed during the current pass, per access key
    placed_in_pass: HashMap<AccessKey, ResourceSlot>,
}

impl DrfScheduler {
    pub fn new(opts: &ScalingGroupOpts, _config: &Map<String, Value>) -> SlotschedResult<Self> {
        Ok(Self {
            opts: opts.clone(),
            placed_in_pass: HashMap::new(),
        })
    }

    pub fn opts(&self) -> &ScalingGroupOpts {
        &self.opts
    }

    fn occupancy_by_key(&self, existing: &[ExistingSession]) -> HashMap<AccessKey, ResourceSlot> {
        let mut occupancy = self.placed_in_pass.clone();
        for session in existing {
            *occupancy.entry(session.access_key.clone()).or_default() += &session.occupying_slots;
        }
        occupancy
    }
}

/// Largest fraction of any slot `occupied` takes out of `total_capacity`
pub fn dominant_share(occupied: &ResourceSlot, total_capacity: &ResourceSlot) -> Decimal {
    occupied
        .iter()
        .filter_map(|(slot_name, amount)| {
            let capacity = total_capacity.get(slot_name);
            if capacity.is_zero() {
                None
            } else {
                Some(amount / capacity)
            }
        })
        .max()
        .unwrap_or(Decimal::ZERO)
}

impl Scheduler for DrfScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Drf
    }

    fn pick_session(
        &self,
        total_capacity: &ResourceSlot,
        pending: &[PendingSession],
        existing: &[ExistingSession],
    ) -> Option<SessionId> {
        let occupancy = self.occupancy_by_key(existing);
        let shares: HashMap<&str, Decimal> = occupancy
            .iter()
            .map(|(access_key, occupied)| {
                (access_key.as_str(), dominant_share(occupied, total_capacity))
            })
            .collect();

        let mut best: Option<(Decimal, &PendingSession)> = None;
        for session in pending {
            let share = shares
                .get(session.access_key.as_str())
                .copied()
                .unwrap_or(Decimal::ZERO);
            let better = match best {
                None => true,
                Some((best_share, best_session)) => {
                    (share, session.created_at) < (best_share, best_session.created_at)
                }
            };
            if better {
                best = Some((share, session));
            }
        }

        best.map(|(share, session)| {
            debug!(
                session_id = %session.id,
                access_key = %session.access_key,
                dominant_share = %share,
                "Picked session with the lowest dominant share"
            );
            session.id
        })
    }

    fn select_agent(&self, agents: &[AgentContext], requested: &ResourceSlot) -> Option<AgentId> {
        select_fewest_extras(agents, requested)
    }

    fn update_allocation(&mut self, session: &PendingSession) {
        *self
            .placed_in_pass
            .entry(session.access_key.clone())
            .or_default() += &session.requested_slots;
    }
}
