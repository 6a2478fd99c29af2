//! Allocation map for whole-unit slots

use rust_decimal::Decimal;
use slotsched_core::{
    AllocMapSpec, AllocationStrategy, DeviceId, DeviceSlotInfo, ResourceSlot, SlotAllocation,
    SlotType, SlotschedError, SlotschedResult,
};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::{insufficient, AllocMap, AllocMapState, AllocateOptions};

/// Upper bound on redistribution rounds of an even allocation
const MAX_EVEN_ROUNDS: usize = 100;

/// Allocation map whose devices hold whole units (e.g. 1.0 means one device)
#[derive(Debug, Clone)]
pub struct DiscretePropertyAllocMap {
    state: AllocMapState,
    strategy: AllocationStrategy,
}

impl DiscretePropertyAllocMap {
    /// Create a map over `device_slots`
    pub fn new(
        device_slots: Vec<(DeviceId, DeviceSlotInfo)>,
        strategy: AllocationStrategy,
        exclusive_slot_types: &[String],
    ) -> SlotschedResult<Self> {
        Ok(Self {
            state: AllocMapState::new(device_slots, exclusive_slot_types)?,
            strategy,
        })
    }

    /// Create a map from its configuration
    pub fn from_spec(spec: &AllocMapSpec) -> SlotschedResult<Self> {
        Ok(Self {
            state: AllocMapState::from_spec(spec)?,
            strategy: spec.strategy,
        })
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    fn plan_fill(
        &self,
        slot_name: &str,
        requested: Decimal,
    ) -> SlotschedResult<BTreeMap<DeviceId, Decimal>> {
        let devices = self.state.sorted_headroom(slot_name);
        let total_allocatable: Decimal = devices.iter().map(|d| d.free.trunc()).sum();
        if total_allocatable < requested {
            return Err(insufficient(
                "DiscretePropertyAllocMap: insufficient allocatable amount",
                slot_name,
                requested,
                total_allocatable,
            ));
        }

        let mut plan = BTreeMap::new();
        let mut remaining = requested;
        for device in devices {
            if device.free > Decimal::ZERO {
                let taken = remaining.min(device.free);
                plan.insert(device.device_id, taken);
                remaining -= taken;
            }
            if remaining.is_zero() {
                break;
            }
        }
        Ok(plan)
    }

    fn plan_evenly(
        &self,
        slot_name: &str,
        requested: Decimal,
    ) -> SlotschedResult<BTreeMap<DeviceId, Decimal>> {
        let devices = self.state.sorted_headroom(slot_name);
        let mut new_alloc = vec![Decimal::ZERO; devices.len()];
        let mut remaining = requested.trunc();

        let mut rounds = 0;
        while remaining > Decimal::ZERO {
            if rounds >= MAX_EVEN_ROUNDS {
                return Err(SlotschedError::Internal(format!(
                    "Too many rounds while spreading {} over {}",
                    requested, slot_name
                )));
            }

            let total_allocatable: Decimal = devices
                .iter()
                .zip(&new_alloc)
                .map(|(d, n)| d.free - n)
                .sum::<Decimal>()
                .trunc();
            if total_allocatable < remaining {
                return Err(insufficient(
                    "DiscretePropertyAllocMap: insufficient allocatable amount",
                    slot_name,
                    requested,
                    total_allocatable,
                ));
            }

            let candidates: Vec<usize> = (0..devices.len())
                .filter(|&i| devices[i].free - new_alloc[i] > Decimal::ZERO)
                .collect();
            if candidates.is_empty() {
                return Err(insufficient(
                    "DiscretePropertyAllocMap: no candidate devices left",
                    slot_name,
                    requested,
                    total_allocatable,
                ));
            }

            let shares = distribute(remaining, candidates.len());
            for (&i, share) in candidates.iter().zip(shares) {
                let diff = (devices[i].free - new_alloc[i]).trunc().min(share);
                new_alloc[i] += diff;
                remaining -= diff;
                if remaining.is_zero() {
                    break;
                }
            }
            rounds += 1;
        }

        Ok(devices
            .into_iter()
            .zip(new_alloc)
            .filter(|(_, amount)| *amount > Decimal::ZERO)
            .map(|(d, amount)| (d.device_id, amount))
            .collect())
    }
}

/// Split `num_items` units over `groups` slots; the first groups get the remainder
fn distribute(num_items: Decimal, groups: usize) -> Vec<Decimal> {
    let n = Decimal::from(groups);
    let base = (num_items / n).trunc();
    let extra = num_items - base * n;
    (0..groups)
        .map(|i| {
            if Decimal::from(i) < extra {
                base + Decimal::ONE
            } else {
                base
            }
        })
        .collect()
}

impl AllocMap for DiscretePropertyAllocMap {
    fn allocate(
        &mut self,
        requested: &ResourceSlot,
        options: &AllocateOptions,
    ) -> SlotschedResult<SlotAllocation> {
        let requested = requested.nonzero();
        self.state.check_combination(&requested)?;

        for (slot_name, amount) in requested.iter() {
            if self.state.slot_type(slot_name) == SlotType::Unique && amount != Decimal::ONE {
                return Err(SlotschedError::InvalidResourceArgument(format!(
                    "You may allocate only 1 for the unique-type slot {}",
                    slot_name
                )));
            }
        }

        let mut allocation = SlotAllocation::new();
        for (slot_name, amount) in requested.iter() {
            let plan = match self.strategy {
                AllocationStrategy::Fill => self.plan_fill(slot_name, amount)?,
                AllocationStrategy::Evenly => self.plan_evenly(slot_name, amount)?,
            };
            debug!(
                slot = %slot_name,
                requested = %amount,
                strategy = %self.strategy,
                context = options.context_tag.as_deref().unwrap_or("-"),
                plan = ?plan,
                "Planned discrete allocation"
            );
            allocation.insert(slot_name.to_string(), plan);
        }

        self.state.apply(&allocation);
        Ok(allocation)
    }

    fn state(&self) -> &AllocMapState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AllocMapState {
        &mut self.state
    }
}

impl fmt::Display for DiscretePropertyAllocMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.state, f)
    }
}
