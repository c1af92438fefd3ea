//! Resource quantities and vectors
//!
//! CPU and RAM are continuous quantities stored as integer milli-units so that
//! repeated reserve/release cycles never drift. GPU is a whole-device count.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Number of stored milli-units per whole unit
pub const MILLIS_PER_UNIT: u64 = 1000;

/// Non-negative fixed-point amount with three decimal places
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Quantity(u64);

impl Quantity {
    /// Zero quantity
    pub const ZERO: Quantity = Quantity(0);

    /// Create from raw milli-units
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Create from whole units
    pub const fn from_units(units: u64) -> Self {
        Self(units * MILLIS_PER_UNIT)
    }

    /// Create from a float, rounding to the nearest milli-unit.
    ///
    /// Returns `None` for negative, NaN or infinite input.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let millis = (value * MILLIS_PER_UNIT as f64).round();
        if millis > u64::MAX as f64 {
            return None;
        }
        Some(Self(millis as u64))
    }

    /// Raw milli-units
    pub const fn millis(self) -> u64 {
        self.0
    }

    /// Lossy float view, for reporting only
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MILLIS_PER_UNIT as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }

    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_sub(other.0).map(Quantity)
    }

    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MILLIS_PER_UNIT;
        let frac = self.0 % MILLIS_PER_UNIT;
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            let digits = format!("{:03}", frac);
            write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
        }
    }
}

impl FromStr for Quantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("invalid quantity: '{}'", s));
        }
        if frac.len() > 3 {
            return Err(format!("quantity '{}' has more than 3 decimal places", s));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(format!("invalid quantity: '{}'", s));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|e| format!("invalid quantity '{}': {}", s, e))?
        };
        let frac_millis: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<3}", frac)
                .parse()
                .map_err(|e| format!("invalid quantity '{}': {}", s, e))?
        };

        whole
            .checked_mul(MILLIS_PER_UNIT)
            .and_then(|m| m.checked_add(frac_millis))
            .map(Quantity)
            .ok_or_else(|| format!("quantity '{}' out of range", s))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Whole(u64),
            Float(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Whole(units) => units
                .checked_mul(MILLIS_PER_UNIT)
                .map(Quantity)
                .ok_or_else(|| serde::de::Error::custom("quantity out of range")),
            Repr::Float(v) => Quantity::from_f64(v)
                .ok_or_else(|| serde::de::Error::custom("quantity must be a non-negative number")),
        }
    }
}

/// A {cpu, ram, gpu} resource amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU cores
    #[serde(default)]
    pub cpu: Quantity,
    /// RAM in MB
    #[serde(default)]
    pub ram: Quantity,
    /// Whole GPU devices
    #[serde(default)]
    pub gpu: u32,
}

impl ResourceVector {
    pub const fn new(cpu: Quantity, ram: Quantity, gpu: u32) -> Self {
        Self { cpu, ram, gpu }
    }

    /// Build a vector from whole CPU cores and MB of RAM
    pub const fn units(cpu: u64, ram: u64, gpu: u32) -> Self {
        Self {
            cpu: Quantity::from_units(cpu),
            ram: Quantity::from_units(ram),
            gpu,
        }
    }

    pub const fn zero() -> Self {
        Self {
            cpu: Quantity::ZERO,
            ram: Quantity::ZERO,
            gpu: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu.is_zero() && self.ram.is_zero() && self.gpu == 0
    }

    /// True when every dimension is less than or equal to `other`
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        self.cpu <= other.cpu && self.ram <= other.ram && self.gpu <= other.gpu
    }

    pub fn checked_add(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(ResourceVector {
            cpu: self.cpu.checked_add(other.cpu)?,
            ram: self.ram.checked_add(other.ram)?,
            gpu: self.gpu.checked_add(other.gpu)?,
        })
    }

    /// Subtract on every dimension, or `None` if any dimension would go negative
    pub fn checked_sub(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(ResourceVector {
            cpu: self.cpu.checked_sub(other.cpu)?,
            ram: self.ram.checked_sub(other.ram)?,
            gpu: self.gpu.checked_sub(other.gpu)?,
        })
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: self.cpu.saturating_sub(other.cpu),
            ram: self.ram.saturating_sub(other.ram),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Shortfall of `available` against this request (zero where it already fits)
    pub fn deficit(&self, available: &ResourceVector) -> ResourceVector {
        self.saturating_sub(available)
    }

    /// Percentage of `total` this vector represents on each dimension
    pub fn utilization_of(&self, total: &ResourceVector) -> Utilization {
        fn pct(used: f64, total: f64) -> f64 {
            if total > 0.0 {
                ((used / total) * 10000.0).round() / 100.0
            } else {
                0.0
            }
        }
        Utilization {
            cpu: pct(self.cpu.as_f64(), total.cpu.as_f64()),
            ram: pct(self.ram.as_f64(), total.ram.as_f64()),
            gpu: pct(self.gpu as f64, total.gpu as f64),
        }
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu: self.cpu + rhs.cpu,
            ram: self.ram + rhs.ram,
            gpu: self.gpu + rhs.gpu,
        }
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: ResourceVector) {
        *self = *self + rhs;
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} ram={} gpu={}", self.cpu, self.ram, self.gpu)
    }
}

/// Utilization percentages (0-100), rounded to two decimals
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu: f64,
    pub ram: f64,
    pub gpu: f64,
}
