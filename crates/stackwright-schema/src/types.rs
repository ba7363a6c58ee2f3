//! Ordering primitive for provisioning phases.
//!
//! Phase numbers are a presentation and ordering convenience: they allow a new
//! phase to be slotted in between two existing ones (`11.5`) without
//! renumbering anything. The stable identity of a phase is its key.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseNumber(f64);

impl PhaseNumber {
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    /// Finite and strictly positive. Registries reject anything else.
    pub fn is_valid(self) -> bool {
        self.0.is_finite() && self.0 > 0.0
    }
}

impl PartialEq for PhaseNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PhaseNumber {}

impl PartialOrd for PhaseNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PhaseNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for PhaseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<f64> for PhaseNumber {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<u32> for PhaseNumber {
    fn from(value: u32) -> Self {
        Self(f64::from(value))
    }
}
