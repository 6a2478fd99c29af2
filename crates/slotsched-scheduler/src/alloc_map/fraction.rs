//! Allocation map for fractional slots
//!
//! Amounts are spread over devices with a fixed working precision of two
//! decimal places and then rounded down to the map's quantum. The even
//! strategy prefers, in order: the most even split, the fewest devices, and
//! the least fragmentation (devices left with a sliver below `min_memory`).

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::ToPrimitive;
use slotsched_core::{
    round_down, AllocMapSpec, AllocationStrategy, DeviceId, DeviceSlotInfo, ResourceSlot,
    SlotAllocation, SlotType, SlotschedError, SlotschedResult,
};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::{insufficient, AllocMap, AllocMapState, AllocateOptions, Headroom};

/// Decimal places the even strategy works with
const WORKING_DP: u32 = 2;

/// Default quantum of a fractional map (0.01)
pub const DEFAULT_QUANTUM_SIZE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Default lower bound of free capacity for a device to receive a share (0.01)
pub const DEFAULT_MIN_MEMORY: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

fn working_step() -> Decimal {
    Decimal::new(1, WORKING_DP)
}

fn round_working(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(WORKING_DP, RoundingStrategy::ToZero)
}

/// One way of splitting a request over a window of devices
struct Candidate {
    allocation: BTreeMap<DeviceId, Decimal>,
    evenness: Decimal,
    neg_devices: i64,
    neg_fragmentation: i64,
}

impl Candidate {
    fn key(&self) -> (Decimal, i64, i64) {
        (self.evenness, self.neg_devices, self.neg_fragmentation)
    }
}

/// Pick the last item among those with the largest key
fn last_max_by_key<T, K: Ord>(items: Vec<T>, key: impl Fn(&T) -> K) -> Option<T> {
    let mut best: Option<(K, T)> = None;
    for item in items {
        let k = key(&item);
        match &best {
            Some((best_key, _)) if k < *best_key => {}
            _ => best = Some((k, item)),
        }
    }
    best.map(|(_, item)| item)
}

/// Allocation map whose devices can be shared in fractions
#[derive(Debug, Clone)]
pub struct FractionAllocMap {
    state: AllocMapState,
    strategy: AllocationStrategy,
    quantum_size: Decimal,
}

impl FractionAllocMap {
    /// Create a map over `device_slots`
    pub fn new(
        device_slots: Vec<(DeviceId, DeviceSlotInfo)>,
        strategy: AllocationStrategy,
        quantum_size: Decimal,
        exclusive_slot_types: &[String],
    ) -> SlotschedResult<Self> {
        if quantum_size <= Decimal::ZERO {
            return Err(SlotschedError::Config(format!(
                "Quantum size must be positive, got {}",
                quantum_size
            )));
        }
        Ok(Self {
            state: AllocMapState::new(device_slots, exclusive_slot_types)?,
            strategy,
            quantum_size,
        })
    }

    /// Create a map from its configuration
    pub fn from_spec(spec: &AllocMapSpec) -> SlotschedResult<Self> {
        let quantum_size = spec.quantum_size.unwrap_or(DEFAULT_QUANTUM_SIZE);
        if quantum_size <= Decimal::ZERO {
            return Err(SlotschedError::Config(format!(
                "Quantum size must be positive, got {}",
                quantum_size
            )));
        }
        Ok(Self {
            state: AllocMapState::from_spec(spec)?,
            strategy: spec.strategy,
            quantum_size,
        })
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn quantum_size(&self) -> Decimal {
        self.quantum_size
    }

    fn plan_fill(
        &self,
        slot_name: &str,
        requested: Decimal,
    ) -> SlotschedResult<BTreeMap<DeviceId, Decimal>> {
        let devices = self.state.sorted_headroom(slot_name);
        let total_allocatable: Decimal = devices.iter().map(|d| d.free).sum();
        if total_allocatable < requested {
            return Err(insufficient(
                "FractionAllocMap: insufficient allocatable amount",
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
            if remaining <= Decimal::ZERO {
                break;
            }
        }
        Ok(plan)
    }

    fn plan_evenly(
        &self,
        slot_name: &str,
        requested: Decimal,
        min_memory: Decimal,
    ) -> SlotschedResult<BTreeMap<DeviceId, Decimal>> {
        let min_memory = round_working(min_memory);
        let devices: Vec<Headroom> = self
            .state
            .sorted_headroom(slot_name)
            .into_iter()
            .filter(|d| d.free > Decimal::ZERO && d.free >= min_memory)
            .collect();

        let total_allocatable: Decimal = devices.iter().map(|d| d.free).sum();
        if devices.is_empty() || round_working(total_allocatable) < round_working(requested) {
            return Err(insufficient(
                "FractionAllocMap: insufficient allocatable amount",
                slot_name,
                requested,
                total_allocatable,
            ));
        }

        // Best fit on a single device, scanning from the least free one.
        if requested <= devices[0].free {
            if let Some(device) = devices.iter().rev().find(|d| requested <= d.free) {
                let mut plan = BTreeMap::new();
                plan.insert(
                    device.device_id.clone(),
                    round_working(requested).min(device.free),
                );
                return Ok(plan);
            }
        }

        let target = round_working(requested);
        let mut min_devices = 0;
        let mut accumulated = Decimal::ZERO;
        for device in &devices {
            min_devices += 1;
            accumulated += device.free;
            if round_working(accumulated) >= target {
                break;
            }
        }

        // Widen the window one device at a time; within a width, slide it towards
        // the less free devices while the split stays as even as the first one.
        let mut best_per_width = Vec::new();
        for width in min_devices..=devices.len() {
            let mut allocatable: Decimal = devices[..width].iter().map(|d| d.free).sum();
            let first = self.allocate_across(&devices[..width], requested, min_memory);
            let max_evenness = first.evenness;
            let mut window_candidates = vec![first];

            for start in 1..=(devices.len() - width) {
                allocatable -= devices[start - 1].free;
                allocatable += devices[start + width - 1].free;
                if round_working(allocatable) < target {
                    break;
                }
                let candidate =
                    self.allocate_across(&devices[start..start + width], requested, min_memory);
                if candidate.evenness < max_evenness {
                    break;
                }
                window_candidates.push(candidate);
            }

            if let Some(best) = last_max_by_key(window_candidates, |c| c.neg_devices) {
                best_per_width.push(best);
            }
        }

        let best = last_max_by_key(best_per_width, Candidate::key).ok_or_else(|| {
            insufficient(
                "FractionAllocMap: no allocation candidate",
                slot_name,
                requested,
                total_allocatable,
            )
        })?;

        let mut plan = best.allocation;
        for device in &devices {
            if let Some(amount) = plan.get_mut(&device.device_id) {
                *amount = (*amount).min(device.free);
            }
        }
        Ok(plan)
    }

    /// Use every device of `devices`: the ones too small for an even share are
    /// filled up, the rest share what is left
    fn allocate_across(
        &self,
        devices: &[Headroom],
        requested: Decimal,
        min_memory: Decimal,
    ) -> Candidate {
        let mut allocation = BTreeMap::new();
        let mut remaining = requested;
        let mut n = devices.len();
        while n > 0 {
            let device = &devices[n - 1];
            if device.free >= remaining / Decimal::from(n) {
                break;
            }
            allocation.insert(device.device_id.clone(), round_working(device.free));
            remaining -= device.free;
            n -= 1;
        }
        if n > 0 {
            distribute_evenly(&devices[..n], remaining, &mut allocation);
        }
        self.score(allocation, min_memory)
    }

    fn score(&self, allocation: BTreeMap<DeviceId, Decimal>, min_memory: Decimal) -> Candidate {
        let evenness = match (allocation.values().min(), allocation.values().max()) {
            (Some(min), Some(max)) => *min - *max,
            _ => Decimal::ZERO,
        };
        let fragmentation = self.fragmentation(&allocation, min_memory);
        Candidate {
            neg_devices: -(allocation.len() as i64),
            neg_fragmentation: -fragmentation,
            evenness,
            allocation,
        }
    }

    /// Devices that would be left with a non-trivial but unusable remainder
    fn fragmentation(&self, allocation: &BTreeMap<DeviceId, Decimal>, min_memory: Decimal) -> i64 {
        let step = working_step();
        allocation
            .iter()
            .map(|(device_id, amount)| round_working(self.state.capacity_of(device_id) - *amount))
            .filter(|left| *left > step && *left < min_memory)
            .count() as i64
    }
}

/// Split `remaining` over `devices` in steps of 0.01; the leading devices take
/// the leftover steps
fn distribute_evenly(
    devices: &[Headroom],
    remaining: Decimal,
    allocation: &mut BTreeMap<DeviceId, Decimal>,
) {
    let n = Decimal::from(devices.len());
    let share = round_working(remaining / n);
    for device in devices {
        allocation.insert(device.device_id.clone(), share);
    }

    let powers = Decimal::from(10u32.pow(WORKING_DP));
    let leftover = (remaining * powers - share * n * powers)
        .floor()
        .to_usize()
        .unwrap_or(0)
        .min(devices.len());
    for device in &devices[..leftover] {
        if let Some(amount) = allocation.get_mut(&device.device_id) {
            *amount = (*amount + working_step()).min(device.free);
        }
    }
}

impl AllocMap for FractionAllocMap {
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

        let min_memory = options.min_memory.unwrap_or(DEFAULT_MIN_MEMORY);
        let mut allocation = SlotAllocation::new();
        for (slot_name, amount) in requested.iter() {
            let calculated = match self.strategy {
                AllocationStrategy::Fill => self.plan_fill(slot_name, amount)?,
                AllocationStrategy::Evenly => self.plan_evenly(slot_name, amount, min_memory)?,
            };
            let actual: BTreeMap<DeviceId, Decimal> = calculated
                .iter()
                .map(|(device_id, value)| (device_id.clone(), round_down(*value, self.quantum_size)))
                .filter(|(_, value)| *value > Decimal::ZERO)
                .collect();
            if actual.is_empty() {
                return Err(SlotschedError::NotMultipleOfQuantum(format!(
                    "Requested resource amount for {} is {} but actual calculated amount is zero. \
                     This can happen if the requested amount is smaller than the quantum size ({}) \
                     of the target devices.",
                    slot_name, amount, self.quantum_size
                )));
            }
            debug!(
                slot = %slot_name,
                requested = %amount,
                strategy = %self.strategy,
                quantum = %self.quantum_size,
                context = options.context_tag.as_deref().unwrap_or("-"),
                calculated = ?calculated,
                actual = ?actual,
                "Planned fractional allocation"
            );
            allocation.insert(slot_name.to_string(), actual);
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

impl fmt::Display for FractionAllocMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.state, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn create_test_map(
        amounts: &[Decimal],
        strategy: AllocationStrategy,
        quantum_size: Decimal,
    ) -> FractionAllocMap {
        let devices = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                (
                    format!("a{}", i),
                    DeviceSlotInfo::new(SlotType::Count, "x", *amount),
                )
            })
            .collect();
        FractionAllocMap::new(devices, strategy, quantum_size, &[]).unwrap()
    }

    fn request(slot_name: &str, amount: Decimal) -> ResourceSlot {
        [(slot_name, amount)].into_iter().collect()
    }

    fn with_min_memory(min_memory: Decimal) -> AllocateOptions {
        AllocateOptions {
            min_memory: Some(min_memory),
            ..Default::default()
        }
    }

    fn alloc(map: &FractionAllocMap, device: &str) -> Decimal {
        map.state().allocated("x", device)
    }

    fn total(map: &FractionAllocMap) -> Decimal {
        map.state().occupied().get("x")
    }

    fn free_on(map: &mut FractionAllocMap, device: &str, amount: Decimal) {
        let mut allocation = SlotAllocation::new();
        allocation
            .entry("x".to_string())
            .or_default()
            .insert(device.to_string(), amount);
        map.free(&allocation);
    }

    #[test]
    fn test_fill_two_devices() {
        let mut map = create_test_map(
            &[dec!(1.0), dec!(1.0)],
            AllocationStrategy::Fill,
            DEFAULT_QUANTUM_SIZE,
        );
        let result = map
            .allocate(&request("x", dec!(1.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(result["x"]["a0"], dec!(1.0));
        assert_eq!(result["x"]["a1"], dec!(0.5));
        assert_eq!(alloc(&map, "a0"), dec!(1.0));
        assert_eq!(alloc(&map, "a1"), dec!(0.5));

        let err = map
            .allocate(&request("x", dec!(1.5)), &AllocateOptions::default())
            .unwrap_err();
        assert!(matches!(err, SlotschedError::InsufficientResource { .. }));
        assert_eq!(alloc(&map, "a0"), dec!(1.0));
        assert_eq!(alloc(&map, "a1"), dec!(0.5));

        map.free(&result);
        assert_eq!(alloc(&map, "a0"), Decimal::ZERO);
        assert_eq!(alloc(&map, "a1"), Decimal::ZERO);
    }

    #[test]
    fn test_fill_many_devices() {
        let mut map = create_test_map(&[dec!(1.0); 8], AllocationStrategy::Fill, DEFAULT_QUANTUM_SIZE);
        let result = map
            .allocate(&request("x", dec!(7.95)), &AllocateOptions::default())
            .unwrap();
        for idx in 0..7 {
            assert_eq!(result["x"][&format!("a{}", idx)], dec!(1.0));
        }
        assert_eq!(result["x"]["a7"], dec!(0.95));

        assert!(map
            .allocate(&request("x", dec!(1.0)), &AllocateOptions::default())
            .is_err());
        assert_eq!(alloc(&map, "a7"), dec!(0.95));

        map.free(&result);
        assert!(map.state().occupied().is_zero());
    }

    #[test]
    fn test_fill_tiny_quantum_alternates() {
        let mut map = create_test_map(
            &[dec!(1.0), dec!(1.0)],
            AllocationStrategy::Fill,
            dec!(0.00001),
        );
        for _ in 0..1000 {
            map.allocate(&request("x", dec!(0.00001)), &AllocateOptions::default())
                .unwrap();
        }
        assert_eq!(alloc(&map, "a0"), dec!(0.005));
        assert_eq!(alloc(&map, "a1"), dec!(0.005));

        free_on(&mut map, "a0", dec!(0.00001));
        assert_eq!(alloc(&map, "a0"), dec!(0.00499));
        assert_eq!(alloc(&map, "a1"), dec!(0.005));

        for _ in 0..499 {
            free_on(&mut map, "a0", dec!(0.00001));
        }
        assert_eq!(alloc(&map, "a0"), Decimal::ZERO);
        assert_eq!(alloc(&map, "a1"), dec!(0.005));
    }

    #[test]
    fn test_even_small_devices() {
        let mut map = create_test_map(
            &[dec!(0.05), dec!(0.1), dec!(0.2), dec!(0.3), dec!(0.0)],
            AllocationStrategy::Evenly,
            DEFAULT_QUANTUM_SIZE,
        );
        assert!(matches!(
            map.allocate(&request("x", dec!(0.66)), &AllocateOptions::default()),
            Err(SlotschedError::InsufficientResource { .. })
        ));
        assert!(matches!(
            map.allocate(&request("x", dec!(0.06)), &with_min_memory(dec!(0.6))),
            Err(SlotschedError::InsufficientResource { .. })
        ));

        // Single units go to the smallest device that still fits.
        for _ in 0..20 {
            map.allocate(&request("x", dec!(0.01)), &AllocateOptions::default())
                .unwrap();
        }
        assert_eq!(alloc(&map, "a0"), dec!(0.05));
        assert_eq!(alloc(&map, "a1"), dec!(0.1));
        assert_eq!(alloc(&map, "a2"), dec!(0.05));
        map.clear();

        let result = map
            .allocate(&request("x", dec!(0.2)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a2"), dec!(0.2));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.2)), &with_min_memory(dec!(0.25)))
            .unwrap();
        assert_eq!(alloc(&map, "a3"), dec!(0.2));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a2"), dec!(0.2));
        assert_eq!(alloc(&map, "a3"), dec!(0.3));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.65)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.05));
        assert_eq!(alloc(&map, "a1"), dec!(0.1));
        assert_eq!(alloc(&map, "a2"), dec!(0.2));
        assert_eq!(alloc(&map, "a3"), dec!(0.3));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.6)), &with_min_memory(dec!(0.1)))
            .unwrap();
        assert_eq!(alloc(&map, "a0"), Decimal::ZERO);
        assert_eq!(alloc(&map, "a1"), dec!(0.1));
        assert_eq!(alloc(&map, "a2"), dec!(0.2));
        assert_eq!(alloc(&map, "a3"), dec!(0.3));
        map.free(&result);
        assert!(map.state().occupied().is_zero());
    }

    #[test]
    fn test_even_fills_small_devices_first() {
        let mut map = create_test_map(
            &[dec!(0.3), dec!(0.3), dec!(0.9)],
            AllocationStrategy::Evenly,
            DEFAULT_QUANTUM_SIZE,
        );
        map.allocate(&request("x", dec!(1)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.3));
        assert_eq!(alloc(&map, "a1"), dec!(0.3));
        assert_eq!(alloc(&map, "a2"), dec!(0.4));
    }

    #[test]
    fn test_even_fractions() {
        let mut map = create_test_map(
            &[dec!(0.8), dec!(0.75), dec!(0.7), dec!(0.3), dec!(0.0)],
            AllocationStrategy::Evenly,
            DEFAULT_QUANTUM_SIZE,
        );
        let result = map
            .allocate(&request("x", dec!(2.31)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.67));
        assert_eq!(alloc(&map, "a1"), dec!(0.67));
        assert_eq!(alloc(&map, "a2"), dec!(0.67));
        assert_eq!(alloc(&map, "a3"), dec!(0.3));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(2)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.67));
        assert_eq!(alloc(&map, "a1"), dec!(0.67));
        assert_eq!(alloc(&map, "a2"), dec!(0.66));
        assert_eq!(alloc(&map, "a3"), Decimal::ZERO);
        map.free(&result);
        assert!(map.state().occupied().is_zero());
    }

    #[test]
    fn test_even_prefers_fewest_devices() {
        let mut map = create_test_map(
            &[dec!(2), dec!(3), dec!(3), dec!(5)],
            AllocationStrategy::Evenly,
            DEFAULT_QUANTUM_SIZE,
        );
        let result = map
            .allocate(&request("x", dec!(6)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a1"), dec!(3));
        assert_eq!(alloc(&map, "a2"), dec!(3));
        assert_eq!(result["x"].len(), 2);
    }

    #[test]
    fn test_even_many_devices_with_min_memory() {
        let mut map = create_test_map(
            &[
                dec!(1),
                dec!(1.5),
                dec!(2),
                dec!(3),
                dec!(3),
                dec!(4),
                dec!(4.5),
                dec!(5),
                dec!(5),
            ],
            AllocationStrategy::Evenly,
            DEFAULT_QUANTUM_SIZE,
        );
        let result = map
            .allocate(&request("x", dec!(6)), &with_min_memory(dec!(2.5)))
            .unwrap();
        assert_eq!(alloc(&map, "a3"), dec!(3));
        assert_eq!(alloc(&map, "a4"), dec!(3));
        map.free(&result);
        assert!(map.state().occupied().is_zero());

        let result = map
            .allocate(&request("x", dec!(11)), &with_min_memory(dec!(0.84)))
            .unwrap();
        for device in ["a3", "a4", "a5", "a6"] {
            assert_eq!(alloc(&map, device), dec!(2.75));
        }
        assert_eq!(total(&map), dec!(11));
        map.free(&result);
        assert!(map.state().occupied().is_zero());
    }

    #[test]
    fn test_even_favors_tail_of_equal_devices() {
        let mut map = create_test_map(&[dec!(1.0); 8], AllocationStrategy::Evenly, DEFAULT_QUANTUM_SIZE);
        let result = map
            .allocate(&request("x", dec!(6)), &AllocateOptions::default())
            .unwrap();
        let full = (0..8)
            .filter(|i| alloc(&map, &format!("a{}", i)) == dec!(1))
            .count();
        let empty = (0..8)
            .filter(|i| alloc(&map, &format!("a{}", i)) == Decimal::ZERO)
            .count();
        assert_eq!(full, 6);
        assert_eq!(empty, 2);
        assert_eq!(alloc(&map, "a0"), Decimal::ZERO);
        assert_eq!(alloc(&map, "a1"), Decimal::ZERO);
        map.free(&result);
        assert!(map.state().occupied().is_zero());
    }

    #[test]
    fn test_quantum_size_even() {
        let mut map = create_test_map(&[dec!(1), dec!(1)], AllocationStrategy::Evenly, dec!(0.25));
        let result = map
            .allocate(&request("x", dec!(0.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(total(&map), dec!(0.5));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(1.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.75));
        assert_eq!(alloc(&map, "a1"), dec!(0.75));
        map.free(&result);

        let err = map
            .allocate(&request("x", dec!(0.24)), &AllocateOptions::default())
            .unwrap_err();
        match err {
            SlotschedError::NotMultipleOfQuantum(msg) => {
                assert!(msg.contains("actual calculated amount is zero"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(map.state().occupied().is_zero());

        // 0.88 and 0.87 are both rounded down to the quantum.
        let result = map
            .allocate(&request("x", dec!(1.75)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(total(&map), dec!(1.5));
        assert_eq!(alloc(&map, "a0"), dec!(0.75));
        assert_eq!(alloc(&map, "a1"), dec!(0.75));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.52)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a1"), dec!(0.5));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.42)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a1"), dec!(0.25));
        map.free(&result);

        assert!(matches!(
            map.allocate(&request("x", dec!(3.99)), &AllocateOptions::default()),
            Err(SlotschedError::InsufficientResource { .. })
        ));
    }

    #[test]
    fn test_quantum_size_fill() {
        let mut map = create_test_map(&[dec!(1), dec!(1)], AllocationStrategy::Fill, dec!(0.25));
        let result = map
            .allocate(&request("x", dec!(0.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.5));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(1.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(1.00));
        assert_eq!(alloc(&map, "a1"), dec!(0.50));
        map.free(&result);

        assert!(matches!(
            map.allocate(&request("x", dec!(0.24)), &AllocateOptions::default()),
            Err(SlotschedError::NotMultipleOfQuantum(_))
        ));

        let result = map
            .allocate(&request("x", dec!(0.52)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.5));
        map.free(&result);

        let result = map
            .allocate(&request("x", dec!(0.42)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.25));
        map.free(&result);

        assert!(map
            .allocate(&request("x", dec!(3.99)), &AllocateOptions::default())
            .is_err());

        map.allocate(&request("x", dec!(1.75)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(1.00));
        assert_eq!(alloc(&map, "a1"), dec!(0.75));

        let mut map = create_test_map(&[dec!(1), dec!(1)], AllocationStrategy::Fill, dec!(0.3));
        map.allocate(&request("x", dec!(0.5)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(total(&map), dec!(0.3));
        assert_eq!(alloc(&map, "a0"), dec!(0.3));
    }

    #[test]
    fn test_non_positive_quantum_rejected() {
        let result = FractionAllocMap::new(Vec::new(), AllocationStrategy::Fill, Decimal::ZERO, &[]);
        assert!(matches!(result, Err(SlotschedError::Config(_))));
    }

    fn create_mig_map() -> FractionAllocMap {
        let devices = vec![
            (
                "a0".to_string(),
                DeviceSlotInfo::new(SlotType::Unique, "cuda.device:1g.5gb-mig", dec!(1)),
            ),
            (
                "a1".to_string(),
                DeviceSlotInfo::new(SlotType::Unique, "cuda.device:1g.5gb-mig", dec!(1)),
            ),
            (
                "a2".to_string(),
                DeviceSlotInfo::new(SlotType::Count, "cuda.shares", dec!(1.0)),
            ),
            (
                "a3".to_string(),
                DeviceSlotInfo::new(SlotType::Count, "cuda.shares", dec!(1.0)),
            ),
            (
                "a4".to_string(),
                DeviceSlotInfo::new(SlotType::Unique, "cuda.device:3g.20gb-mig", dec!(1)),
            ),
        ];
        let exclusive = vec![
            "cuda.device:*-mig".to_string(),
            "cuda.device".to_string(),
            "cuda.shares".to_string(),
        ];
        FractionAllocMap::new(devices, AllocationStrategy::Fill, DEFAULT_QUANTUM_SIZE, &exclusive)
            .unwrap()
    }

    #[test]
    fn test_heterogeneous_slots() {
        let mut map = create_mig_map();
        let options = AllocateOptions::default();

        let result = map.allocate(&request("cuda.shares", dec!(2.0)), &options).unwrap();
        assert_eq!(map.state().allocated("cuda.shares", "a2"), dec!(1.0));
        assert_eq!(map.state().allocated("cuda.shares", "a3"), dec!(1.0));
        assert_eq!(map.state().allocated("cuda.device:1g.5gb-mig", "a0"), Decimal::ZERO);
        map.free(&result);
        assert!(map.state().occupied().is_zero());

        assert!(matches!(
            map.allocate(&request("cuda.shares", dec!(2.5)), &options),
            Err(SlotschedError::InsufficientResource { .. })
        ));

        let noop = map
            .allocate(&request("cuda.device:1g.5gb-mig", Decimal::ZERO), &options)
            .unwrap();
        assert!(noop.is_empty());

        for amount in [dec!(0.3), dec!(1.5)] {
            assert!(matches!(
                map.allocate(&request("cuda.device:1g.5gb-mig", amount), &options),
                Err(SlotschedError::InvalidResourceArgument(_))
            ));
        }
        assert!(map.state().occupied().is_zero());

        let first = map
            .allocate(&request("cuda.device:1g.5gb-mig", dec!(1)), &options)
            .unwrap();
        assert_eq!(map.state().allocated("cuda.device:1g.5gb-mig", "a0"), dec!(1));
        assert_eq!(map.state().allocated("cuda.device:1g.5gb-mig", "a1"), Decimal::ZERO);
        let second = map
            .allocate(&request("cuda.device:1g.5gb-mig", dec!(1)), &options)
            .unwrap();
        assert_eq!(map.state().allocated("cuda.device:1g.5gb-mig", "a1"), dec!(1));
        assert!(map
            .allocate(&request("cuda.device:1g.5gb-mig", dec!(1)), &options)
            .is_err());
        map.free(&first);
        map.free(&second);
        assert!(map.state().occupied().is_zero());

        let mixed: ResourceSlot = [("cuda.device:1g.5gb-mig", dec!(1)), ("cuda.shares", dec!(1))]
            .into_iter()
            .collect();
        assert!(matches!(
            map.allocate(&mixed, &options),
            Err(SlotschedError::InvalidResourceCombination(_))
        ));
    }

    #[test]
    fn test_failed_slot_leaves_map_untouched() {
        let devices = vec![
            ("g0".to_string(), DeviceSlotInfo::new(SlotType::Count, "cuda.shares", dec!(1))),
            ("m0".to_string(), DeviceSlotInfo::new(SlotType::Bytes, "cuda.mem", dec!(1024))),
        ];
        let mut map =
            FractionAllocMap::new(devices, AllocationStrategy::Evenly, DEFAULT_QUANTUM_SIZE, &[])
                .unwrap();
        let requested: ResourceSlot = [("cuda.shares", dec!(0.5)), ("cuda.mem", dec!(2048))]
            .into_iter()
            .collect();
        assert!(map.allocate(&requested, &AllocateOptions::default()).is_err());
        assert!(map.state().occupied().is_zero());
    }

    #[test]
    fn test_distribute_evenly_leftover_goes_first() {
        let devices: Vec<Headroom> = (0..3)
            .map(|i| Headroom {
                device_id: format!("a{}", i),
                free: dec!(1),
            })
            .collect();
        let mut allocation = BTreeMap::new();
        distribute_evenly(&devices, dec!(2), &mut allocation);
        assert_eq!(allocation["a0"], dec!(0.67));
        assert_eq!(allocation["a1"], dec!(0.67));
        assert_eq!(allocation["a2"], dec!(0.66));
    }

    #[test]
    fn test_even_never_rounds_past_capacity() {
        let mut map = create_test_map(&[dec!(0.316)], AllocationStrategy::Evenly, dec!(0.001));
        map.allocate(&request("x", dec!(0.316)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(alloc(&map, "a0"), dec!(0.31));
        assert!(alloc(&map, "a0") <= dec!(0.316));
    }

    #[test]
    fn test_even_leftover_steps_capped_at_headroom() {
        let mut map = create_test_map(&[dec!(0.6667); 3], AllocationStrategy::Evenly, dec!(0.0001));
        let result = map
            .allocate(&request("x", dec!(2.0001)), &AllocateOptions::default())
            .unwrap();
        assert_eq!(result["x"].len(), 3);
        for device in ["a0", "a1", "a2"] {
            assert!(alloc(&map, device) <= dec!(0.6667));
        }
        assert_eq!(alloc(&map, "a2"), dec!(0.66));
        map.free(&result);
        assert!(map.state().occupied().is_zero());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn test_even_stays_within_capacity(
            capacities in prop::collection::vec(1u32..3000, 1..6),
            requests in prop::collection::vec(1u32..5000, 1..8)
        ) {
            let capacities: Vec<Decimal> = capacities
                .iter()
                .map(|m| Decimal::new(*m as i64, 3))
                .collect();
            let mut map = create_test_map(&capacities, AllocationStrategy::Evenly, dec!(0.001));
            for m in &requests {
                let amount = Decimal::new(*m as i64, 3);
                if let Ok(result) = map.allocate(&request("x", amount), &AllocateOptions::default()) {
                    let granted: Decimal = result["x"].values().copied().sum();
                    prop_assert!(granted <= amount);
                }
                for (i, capacity) in capacities.iter().enumerate() {
                    let used = alloc(&map, &format!("a{}", i));
                    prop_assert!(used >= Decimal::ZERO && used <= *capacity);
                }
            }
        }

        #[test]
        fn test_fill_conserves_and_stays_within_capacity(
            cents in prop::collection::vec(0u32..10, 1..10)
        ) {
            let mut map = create_test_map(
                &[dec!(1.0), dec!(1.0)],
                AllocationStrategy::Fill,
                DEFAULT_QUANTUM_SIZE,
            );
            let mut results = Vec::new();
            for c in &cents {
                let amount = Decimal::new(*c as i64, 2);
                match map.allocate(&request("x", amount), &AllocateOptions::default()) {
                    Ok(result) => {
                        let granted: Decimal = result
                            .get("x")
                            .map(|per_device| per_device.values().copied().sum())
                            .unwrap_or(Decimal::ZERO);
                        prop_assert_eq!(granted, amount);
                        results.push(result);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
                for device in ["a0", "a1"] {
                    let used = alloc(&map, device);
                    prop_assert!(used >= Decimal::ZERO && used <= dec!(1.0));
                }
            }
            for result in &results {
                map.free(result);
            }
            prop_assert!(map.state().occupied().is_zero());
        }
    }
}
