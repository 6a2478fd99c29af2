//! Per-agent slot allocator tracking several allocation maps

use rust_decimal::Decimal;
use slotsched_core::{
    AgentContext, AgentId, AgentSpec, ResourceSlot, SlotAllocation, SlotName, SlotschedError,
    SlotschedResult,
};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::alloc_map::{build_alloc_map, AllocMap, AllocateOptions};

/// Allocator that owns every allocation map of one agent
pub struct AgentAllocator {
    id: AgentId,
    addr: String,
    architecture: String,
    scaling_group: String,
    /// Allocation maps, each owning a disjoint set of slot names
    maps: Vec<Box<dyn AllocMap>>,
    /// Index of the map owning each slot name
    owners: HashMap<SlotName, usize>,
}

impl AgentAllocator {
    /// Create an allocator over `maps`
    pub fn new(
        id: impl Into<AgentId>,
        architecture: impl Into<String>,
        scaling_group: impl Into<String>,
        maps: Vec<Box<dyn AllocMap>>,
    ) -> SlotschedResult<Self> {
        let id = id.into();
        let mut owners = HashMap::new();
        for (idx, map) in maps.iter().enumerate() {
            for slot_name in map.state().slot_names() {
                if owners.insert(slot_name.to_string(), idx).is_some() {
                    return Err(SlotschedError::Config(format!(
                        "Slot {} of agent {} is owned by more than one allocation map",
                        slot_name, id
                    )));
                }
            }
        }

        Ok(Self {
            id,
            addr: String::new(),
            architecture: architecture.into(),
            scaling_group: scaling_group.into(),
            maps,
            owners,
        })
    }

    /// Create an allocator from an agent's configuration
    pub fn from_spec(spec: &AgentSpec) -> SlotschedResult<Self> {
        let maps = spec
            .alloc_maps
            .iter()
            .map(build_alloc_map)
            .collect::<SlotschedResult<Vec<_>>>()?;
        let mut allocator = Self::new(
            spec.id.clone(),
            spec.architecture.clone(),
            spec.scaling_group.clone(),
            maps,
        )?;
        allocator.addr = spec.addr.clone();

        info!(
            agent_id = %allocator.id,
            scaling_group = %allocator.scaling_group,
            capacity = %allocator.capacity(),
            "Agent registered"
        );
        Ok(allocator)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn scaling_group(&self) -> &str {
        &self.scaling_group
    }

    /// Total capacity of all maps
    pub fn capacity(&self) -> ResourceSlot {
        self.maps.iter().map(|m| m.state().capacity()).sum()
    }

    /// Currently allocated amounts of all maps
    pub fn occupied(&self) -> ResourceSlot {
        self.maps.iter().map(|m| m.state().occupied()).sum()
    }

    /// Capacity snapshot handed to scheduling policies
    pub fn to_context(&self) -> AgentContext {
        AgentContext {
            id: self.id.clone(),
            addr: self.addr.clone(),
            architecture: self.architecture.clone(),
            scaling_group: self.scaling_group.clone(),
            available_slots: self.capacity(),
            occupied_slots: self.occupied(),
        }
    }

    /// Allocate `requested` across the owning maps
    ///
    /// Either every map succeeds or none keeps anything.
    pub fn allocate(
        &mut self,
        requested: &ResourceSlot,
        options: &AllocateOptions,
    ) -> SlotschedResult<SlotAllocation> {
        let mut per_map: Vec<ResourceSlot> = vec![ResourceSlot::new(); self.maps.len()];
        for (slot_name, amount) in requested.nonzero().iter() {
            match self.owners.get(slot_name) {
                Some(idx) => per_map[*idx].set(slot_name, amount),
                None => {
                    return Err(SlotschedError::InsufficientResource {
                        message: format!("Agent {} has no device for slot {}", self.id, slot_name),
                        slot_name: slot_name.to_string(),
                        requested: amount,
                        allocatable: Decimal::ZERO,
                    })
                }
            }
        }

        let mut applied: Vec<(usize, SlotAllocation)> = Vec::new();
        for (idx, slots) in per_map.iter().enumerate() {
            if slots.is_empty() {
                continue;
            }
            match self.maps[idx].allocate(slots, options) {
                Ok(allocation) => applied.push((idx, allocation)),
                Err(e) => {
                    for (done_idx, allocation) in &applied {
                        self.maps[*done_idx].free(allocation);
                    }
                    debug!(
                        agent_id = %self.id,
                        rolled_back = applied.len(),
                        error = %e,
                        "Allocation failed, rolled back"
                    );
                    return Err(e);
                }
            }
        }

        let mut result = SlotAllocation::new();
        for (_, allocation) in applied {
            result.extend(allocation);
        }
        Ok(result)
    }

    /// Release an allocation returned by [`allocate`](Self::allocate)
    pub fn free(&mut self, allocation: &SlotAllocation) {
        for (idx, part) in self.split_by_owner(allocation) {
            self.maps[idx].free(&part);
        }
    }

    /// Re-apply an allocation restored from persistent storage
    pub fn apply_allocation(&mut self, allocation: &SlotAllocation) {
        for (idx, part) in self.split_by_owner(allocation) {
            self.maps[idx].apply_allocation(&part);
        }
    }

    fn split_by_owner(&self, allocation: &SlotAllocation) -> Vec<(usize, SlotAllocation)> {
        let mut parts: HashMap<usize, SlotAllocation> = HashMap::new();
        for (slot_name, per_device) in allocation {
            if let Some(idx) = self.owners.get(slot_name) {
                parts
                    .entry(*idx)
                    .or_default()
                    .insert(slot_name.clone(), per_device.clone());
            }
        }
        parts.into_iter().collect()
    }
}

impl std::fmt::Debug for AgentAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAllocator")
            .field("id", &self.id)
            .field("architecture", &self.architecture)
            .field("scaling_group", &self.scaling_group)
            .field("occupied", &self.occupied().to_string())
            .finish()
    }
}
