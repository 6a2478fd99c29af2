//! Device slot descriptions and allocation map settings

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::slot::{DeviceId, SlotName, SlotType};

/// Per-device breakdown of an allocation: slot name -> device -> amount
pub type SlotAllocation = BTreeMap<SlotName, BTreeMap<DeviceId, Decimal>>;

/// The single slot a device contributes to its allocation map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSlotInfo {
    /// How the amount is interpreted
    pub slot_type: SlotType,
    /// Slot the capacity is accounted under
    pub slot_name: SlotName,
    /// Total capacity of the device
    pub amount: Decimal,
}

impl DeviceSlotInfo {
    pub fn new(slot_type: SlotType, slot_name: impl Into<SlotName>, amount: Decimal) -> Self {
        Self {
            slot_type,
            slot_name: slot_name.into(),
            amount,
        }
    }
}

/// How an allocation map spreads a request over its devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Exhaust the most free device before moving on to the next
    Fill,
    /// Spread the request across devices as evenly as possible
    #[default]
    Evenly,
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStrategy::Fill => write!(f, "fill"),
            AllocationStrategy::Evenly => write!(f, "evenly"),
        }
    }
}

/// Kind of allocation map backing a set of devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocMapKind {
    /// Whole units only (cores, whole accelerators)
    Discrete,
    /// Fractional amounts with a quantum (accelerator shares)
    Fraction,
}

/// A device entry in an agent inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Device identifier, unique within the agent
    pub id: DeviceId,
    /// Slot type of the device
    #[serde(default = "default_slot_type")]
    pub slot_type: SlotType,
    /// Slot name of the device
    pub slot_name: SlotName,
    /// Capacity of the device
    pub amount: Decimal,
}

fn default_slot_type() -> SlotType {
    SlotType::Count
}

impl DeviceSpec {
    pub fn slot_info(&self) -> DeviceSlotInfo {
        DeviceSlotInfo::new(self.slot_type, self.slot_name.clone(), self.amount)
    }
}

/// Settings for one allocation map of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocMapSpec {
    /// Discrete or fractional accounting
    pub kind: AllocMapKind,
    /// Spreading strategy
    #[serde(default)]
    pub strategy: AllocationStrategy,
    /// Quantum for fractional maps (defaults to 0.01)
    #[serde(default)]
    pub quantum_size: Option<Decimal>,
    /// Slot name patterns that must not be mixed in one request
    #[serde(default)]
    pub exclusive_slot_types: Vec<String>,
    /// Devices managed by this map, in declaration order
    pub devices: Vec<DeviceSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alloc_map_spec_parse() {
        let toml_str = r#"
kind = "fraction"
strategy = "fill"
quantum_size = "0.25"
exclusive_slot_types = ["cuda.device:*-mig", "cuda.device", "cuda.shares"]

[[devices]]
id = "cuda0"
slot_name = "cuda.shares"
amount = 1

[[devices]]
id = "cuda1"
slot_type = "count"
slot_name = "cuda.shares"
amount = "1.5"
"#;
        let spec: AllocMapSpec = toml::from_str(toml_str).unwrap();
        assert_eq!(spec.kind, AllocMapKind::Fraction);
        assert_eq!(spec.strategy, AllocationStrategy::Fill);
        assert_eq!(spec.quantum_size, Some(dec!(0.25)));
        assert_eq!(spec.exclusive_slot_types.len(), 3);
        assert_eq!(spec.devices[1].slot_info().amount, dec!(1.5));
        assert_eq!(spec.devices[0].slot_type, SlotType::Count);
    }

    #[test]
    fn test_default_strategy_is_evenly() {
        let toml_str = r#"
kind = "discrete"

[[devices]]
id = "cpu0"
slot_name = "cpu"
amount = 4
"#;
        let spec: AllocMapSpec = toml::from_str(toml_str).unwrap();
        assert_eq!(spec.strategy, AllocationStrategy::Evenly);
        assert!(spec.quantum_size.is_none());
    }
}
