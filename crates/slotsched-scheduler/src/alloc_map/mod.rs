//! Device slot allocation maps
//!
//! An allocation map owns a fixed set of devices, each contributing capacity
//! to exactly one slot name, and tracks how much of every device is taken.
//! `allocate` either applies the whole request or leaves the map untouched.

mod discrete;
mod fraction;

pub use discrete::DiscretePropertyAllocMap;
pub use fraction::FractionAllocMap;

use rust_decimal::Decimal;
use slotsched_core::{
    AllocMapKind, AllocMapSpec, DeviceId, DeviceSlotInfo, ResourceSlot, SlotAllocation,
    SlotName, SlotType, SlotschedError, SlotschedResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::warn;

/// Per-call options for [`AllocMap::allocate`]
#[derive(Debug, Clone, Default)]
pub struct AllocateOptions {
    /// Devices with less free capacity than this are skipped when spreading
    pub min_memory: Option<Decimal>,
    /// Tag attached to log lines and errors (usually a kernel id)
    pub context_tag: Option<String>,
}

/// Common allocate/free contract of every allocation map
pub trait AllocMap: fmt::Display + Send + Sync {
    /// Reserve `requested` and return the per-device breakdown actually applied
    fn allocate(
        &mut self,
        requested: &ResourceSlot,
        options: &AllocateOptions,
    ) -> SlotschedResult<SlotAllocation>;

    /// Shared device and allocation bookkeeping
    fn state(&self) -> &AllocMapState;

    fn state_mut(&mut self) -> &mut AllocMapState;

    /// Re-apply an allocation restored from persistent storage
    fn apply_allocation(&mut self, existing: &SlotAllocation) {
        self.state_mut().apply(existing);
    }

    /// Release an allocation previously returned by `allocate`
    fn free(&mut self, existing: &SlotAllocation) {
        self.state_mut().release(existing);
    }

    /// Drop every allocation
    fn clear(&mut self) {
        self.state_mut().clear();
    }
}

/// Build an allocation map from its configuration
pub fn build_alloc_map(spec: &AllocMapSpec) -> SlotschedResult<Box<dyn AllocMap>> {
    match spec.kind {
        AllocMapKind::Discrete => Ok(Box::new(DiscretePropertyAllocMap::from_spec(spec)?)),
        AllocMapKind::Fraction => Ok(Box::new(FractionAllocMap::from_spec(spec)?)),
    }
}

/// Free capacity of one device, used to order placement candidates
#[derive(Debug, Clone)]
pub(crate) struct Headroom {
    pub device_id: DeviceId,
    pub free: Decimal,
}

/// Slot names that must not be requested together
#[derive(Debug, Clone, Default)]
struct ExclusiveSlotTypes {
    names: Vec<String>,
    patterns: Vec<glob::Pattern>,
}

impl ExclusiveSlotTypes {
    fn new(entries: &[String]) -> SlotschedResult<Self> {
        let mut patterns = Vec::new();
        for entry in entries.iter().filter(|e| e.contains('*')) {
            let pattern = glob::Pattern::new(entry).map_err(|e| {
                SlotschedError::Config(format!("Invalid exclusive slot pattern {}: {}", entry, e))
            })?;
            patterns.push(pattern);
        }
        Ok(Self {
            names: entries.to_vec(),
            patterns,
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name) || self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Device inventory and allocation table shared by every map kind
#[derive(Debug, Clone)]
pub struct AllocMapState {
    device_slots: Vec<(DeviceId, DeviceSlotInfo)>,
    device_index: HashMap<DeviceId, usize>,
    slot_types: HashMap<SlotName, SlotType>,
    exclusive_slot_types: ExclusiveSlotTypes,
    allocations: SlotAllocation,
}

impl AllocMapState {
    /// Create the state for `device_slots`, kept in declaration order
    pub fn new(
        device_slots: Vec<(DeviceId, DeviceSlotInfo)>,
        exclusive_slot_types: &[String],
    ) -> SlotschedResult<Self> {
        let mut device_index = HashMap::new();
        let mut slot_types = HashMap::new();
        for (idx, (device_id, info)) in device_slots.iter().enumerate() {
            if info.amount < Decimal::ZERO {
                return Err(SlotschedError::Config(format!(
                    "Device {} has a negative capacity",
                    device_id
                )));
            }
            if device_index.insert(device_id.clone(), idx).is_some() {
                return Err(SlotschedError::Config(format!(
                    "Duplicate device id: {}",
                    device_id
                )));
            }
            slot_types.insert(info.slot_name.clone(), info.slot_type);
        }

        let mut state = Self {
            device_slots,
            device_index,
            slot_types,
            exclusive_slot_types: ExclusiveSlotTypes::new(exclusive_slot_types)?,
            allocations: SlotAllocation::new(),
        };
        state.clear();
        Ok(state)
    }

    pub(crate) fn from_spec(spec: &AllocMapSpec) -> SlotschedResult<Self> {
        let devices = spec
            .devices
            .iter()
            .map(|d| (d.id.clone(), d.slot_info()))
            .collect();
        Self::new(devices, &spec.exclusive_slot_types)
    }

    pub fn device_slots(&self) -> &[(DeviceId, DeviceSlotInfo)] {
        &self.device_slots
    }

    /// Current allocation table
    pub fn allocations(&self) -> &SlotAllocation {
        &self.allocations
    }

    /// Amount currently allocated on `device_id` under `slot_name`
    pub fn allocated(&self, slot_name: &str, device_id: &str) -> Decimal {
        self.allocations
            .get(slot_name)
            .and_then(|per_device| per_device.get(device_id))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Slot type of `slot_name`; unknown slots count as `Count`
    pub fn slot_type(&self, slot_name: &str) -> SlotType {
        self.slot_types
            .get(slot_name)
            .copied()
            .unwrap_or(SlotType::Count)
    }

    /// Slot names backed by at least one device
    pub fn slot_names(&self) -> BTreeSet<&str> {
        self.device_slots
            .iter()
            .map(|(_, info)| info.slot_name.as_str())
            .collect()
    }

    /// Total capacity per slot name
    pub fn capacity(&self) -> ResourceSlot {
        let mut total = ResourceSlot::new();
        for (_, info) in &self.device_slots {
            total.set(
                info.slot_name.clone(),
                total.get(&info.slot_name) + info.amount,
            );
        }
        total
    }

    /// Allocated amount per slot name
    pub fn occupied(&self) -> ResourceSlot {
        self.allocations
            .iter()
            .map(|(slot_name, per_device)| {
                (slot_name.clone(), per_device.values().copied().sum::<Decimal>())
            })
            .collect()
    }

    pub(crate) fn capacity_of(&self, device_id: &str) -> Decimal {
        self.device_index
            .get(device_id)
            .map(|idx| self.device_slots[*idx].1.amount)
            .unwrap_or(Decimal::ZERO)
    }

    /// Whether `a` and `b` belong to different exclusive families
    pub fn check_exclusive(&self, a: &str, b: &str) -> bool {
        if self.exclusive_slot_types.names.is_empty() || a == b {
            return false;
        }
        self.exclusive_slot_types.contains(a) && self.exclusive_slot_types.contains(b)
    }

    /// Reject requests that mix exclusive slot families
    pub(crate) fn check_combination(&self, requested: &ResourceSlot) -> SlotschedResult<()> {
        for a in requested.slot_names() {
            for b in requested.slot_names() {
                if self.check_exclusive(a, b) {
                    return Err(SlotschedError::InvalidResourceCombination(format!(
                        "Slots {} and {} cannot be allocated at the same time",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }

    /// Devices serving `slot_name`, most free first; ties keep declaration order
    pub(crate) fn sorted_headroom(&self, slot_name: &str) -> Vec<Headroom> {
        let mut devices: Vec<Headroom> = self
            .device_slots
            .iter()
            .filter(|(_, info)| info.slot_name == slot_name)
            .map(|(device_id, info)| Headroom {
                device_id: device_id.clone(),
                free: info.amount - self.allocated(slot_name, device_id),
            })
            .collect();
        devices.sort_by(|a, b| b.free.cmp(&a.free));
        devices
    }

    pub(crate) fn apply(&mut self, allocation: &SlotAllocation) {
        for (slot_name, per_device) in allocation {
            for (device_id, amount) in per_device {
                match self
                    .allocations
                    .get_mut(slot_name)
                    .and_then(|m| m.get_mut(device_id))
                {
                    Some(current) => *current += *amount,
                    None => warn!(
                        slot = %slot_name,
                        device = %device_id,
                        "Ignoring allocation for an unknown device"
                    ),
                }
            }
        }
    }

    pub(crate) fn release(&mut self, allocation: &SlotAllocation) {
        for (slot_name, per_device) in allocation {
            for (device_id, amount) in per_device {
                match self
                    .allocations
                    .get_mut(slot_name)
                    .and_then(|m| m.get_mut(device_id))
                {
                    Some(current) => *current -= *amount,
                    None => warn!(
                        slot = %slot_name,
                        device = %device_id,
                        "Ignoring release for an unknown device"
                    ),
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.allocations.clear();
        for (device_id, info) in &self.device_slots {
            self.allocations
                .entry(info.slot_name.clone())
                .or_insert_with(BTreeMap::new)
                .insert(device_id.clone(), Decimal::ZERO);
        }
    }
}

impl fmt::Display for AllocMapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, slot_name) in self.slot_names().into_iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "slot[{}]:", slot_name)?;
            for (device_id, info) in &self.device_slots {
                if info.slot_name == slot_name {
                    write!(
                        f,
                        "\n  {}: {}",
                        device_id,
                        self.allocated(slot_name, device_id).normalize()
                    )?;
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn insufficient(
    message: &str,
    slot_name: &str,
    requested: Decimal,
    allocatable: Decimal,
) -> SlotschedError {
    SlotschedError::InsufficientResource {
        message: message.to_string(),
        slot_name: slot_name.to_string(),
        requested,
        allocatable,
    }
}
