//! Resource slot types and arithmetic

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Name of a resource slot (e.g. "cpu", "mem", "cuda.shares")
pub type SlotName = String;

/// Identifier of a device inside an agent
pub type DeviceId = String;

/// How a slot's quantity is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    /// A countable amount (cores, shares)
    Count,
    /// A byte size
    Bytes,
    /// A whole device that can only be taken as exactly one unit
    Unique,
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Count => write!(f, "count"),
            SlotType::Bytes => write!(f, "bytes"),
            SlotType::Unique => write!(f, "unique"),
        }
    }
}

/// Rounds `value` down to a multiple of `quantum`
pub fn round_down(value: Decimal, quantum: Decimal) -> Decimal {
    if quantum <= Decimal::ZERO {
        return value;
    }
    (value / quantum).floor() * quantum
}

/// A mapping from slot names to decimal quantities.
///
/// Absent keys are treated as zero by every operation: arithmetic is a keyed
/// union and comparisons are element-wise over the union of keys. The ordering
/// is partial, so two slots that are neither element-wise `<=` nor `>=` compare
/// as `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSlot(BTreeMap<SlotName, Decimal>);

impl ResourceSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Quantity for `name`, zero when absent
    pub fn get(&self, name: &str) -> Decimal {
        self.0.get(name).copied().unwrap_or(Decimal::ZERO)
    }

    /// Set the quantity for `name`
    pub fn set(&mut self, name: impl Into<SlotName>, amount: Decimal) {
        self.0.insert(name.into(), amount);
    }

    /// Whether `name` is explicitly present
    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterate over the explicitly present entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Explicitly present slot names
    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every quantity is zero
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| v.is_zero())
    }

    /// Entries with a strictly positive quantity
    pub fn nonzero(&self) -> ResourceSlot {
        self.0
            .iter()
            .filter(|(_, v)| **v > Decimal::ZERO)
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Round every quantity down to a multiple of `step`
    pub fn quantize(&self, step: Decimal) -> ResourceSlot {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), round_down(*v, step)))
            .collect()
    }

    fn key_union<'a>(&'a self, other: &'a ResourceSlot) -> BTreeSet<&'a str> {
        self.slot_names().chain(other.slot_names()).collect()
    }
}

impl<K: Into<SlotName>> FromIterator<(K, Decimal)> for ResourceSlot {
    fn from_iter<I: IntoIterator<Item = (K, Decimal)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl PartialEq for ResourceSlot {
    fn eq(&self, other: &Self) -> bool {
        self.key_union(other)
            .into_iter()
            .all(|k| self.get(k) == other.get(k))
    }
}

impl PartialOrd for ResourceSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut all_le = true;
        let mut all_ge = true;
        for k in self.key_union(other) {
            match self.get(k).cmp(&other.get(k)) {
                Ordering::Less => all_ge = false,
                Ordering::Greater => all_le = false,
                Ordering::Equal => {}
            }
        }
        match (all_le, all_ge) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl Add<&ResourceSlot> for &ResourceSlot {
    type Output = ResourceSlot;

    fn add(self, rhs: &ResourceSlot) -> ResourceSlot {
        self.key_union(rhs)
            .into_iter()
            .map(|k| (k, self.get(k) + rhs.get(k)))
            .collect()
    }
}

impl Add for ResourceSlot {
    type Output = ResourceSlot;

    fn add(self, rhs: ResourceSlot) -> ResourceSlot {
        &self + &rhs
    }
}

impl AddAssign<&ResourceSlot> for ResourceSlot {
    fn add_assign(&mut self, rhs: &ResourceSlot) {
        for (k, v) in rhs.iter() {
            *self.0.entry(k.to_string()).or_insert(Decimal::ZERO) += v;
        }
    }
}

impl Sub<&ResourceSlot> for &ResourceSlot {
    type Output = ResourceSlot;

    fn sub(self, rhs: &ResourceSlot) -> ResourceSlot {
        self.key_union(rhs)
            .into_iter()
            .map(|k| (k, self.get(k) - rhs.get(k)))
            .collect()
    }
}

impl Sub for ResourceSlot {
    type Output = ResourceSlot;

    fn sub(self, rhs: ResourceSlot) -> ResourceSlot {
        &self - &rhs
    }
}

impl SubAssign<&ResourceSlot> for ResourceSlot {
    fn sub_assign(&mut self, rhs: &ResourceSlot) {
        for (k, v) in rhs.iter() {
            *self.0.entry(k.to_string()).or_insert(Decimal::ZERO) -= v;
        }
    }
}

impl Sum for ResourceSlot {
    fn sum<I: Iterator<Item = ResourceSlot>>(iter: I) -> Self {
        iter.fold(ResourceSlot::new(), |mut acc, s| {
            acc += &s;
            acc
        })
    }
}

impl<'a> Sum<&'a ResourceSlot> for ResourceSlot {
    fn sum<I: Iterator<Item = &'a ResourceSlot>>(iter: I) -> Self {
        iter.fold(ResourceSlot::new(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

impl fmt::Display for ResourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v.normalize())?;
        }
        write!(f, "}}")
    }
}
