//! Memory budget derivation.
//!
//! `budget = max(0, available × safety_factor − os_reserved)`, where
//! `available` is sampled from the host and the safety factor also pads
//! per-model estimates elsewhere. The probe is a trait so tests pin the
//! sample instead of reading the real host.

use std::sync::Mutex;

use sysinfo::System;

use crate::inference::scale_bytes;

/// One mebibyte, in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Source of the host's available-memory sample.
pub trait MemoryProbe: Send + Sync {
    /// Memory currently available to the process, in bytes.
    fn available_memory_bytes(&self) -> u64;
}

/// Probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    /// Probe reading the live host.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn available_memory_bytes(&self) -> u64 {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_memory();
        system.available_memory()
    }
}

/// Probe returning a fixed sample, for tests and capacity planning.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe {
    bytes: u64,
}

impl FixedProbe {
    /// Probe that always reports `bytes` available.
    pub fn new(bytes: u64) -> Self {
        Self { bytes }
    }
}

impl MemoryProbe for FixedProbe {
    fn available_memory_bytes(&self) -> u64 {
        self.bytes
    }
}

/// Derives the admission budget from a probe and configuration.
pub struct MemoryBudget {
    probe: Box<dyn MemoryProbe>,
    safety_factor: f64,
    os_reserved_mb: u64,
}

impl MemoryBudget {
    /// Budget around a probe.
    pub fn new(probe: Box<dyn MemoryProbe>, safety_factor: f64, os_reserved_mb: u64) -> Self {
        Self {
            probe,
            safety_factor,
            os_reserved_mb,
        }
    }

    /// Update the derivation parameters (applied on the next sample).
    pub fn set_parameters(&mut self, safety_factor: f64, os_reserved_mb: u64) {
        self.safety_factor = safety_factor;
        self.os_reserved_mb = os_reserved_mb;
    }

    /// Sample the host and compute the current budget, in MB.
    pub fn current_budget_mb(&self) -> u64 {
        let available_mb = self.probe.available_memory_bytes() / MIB;
        scale_bytes(available_mb, self.safety_factor).saturating_sub(self.os_reserved_mb)
    }
}

/// Effective concurrent slot count for a budget.
///
/// `min(configured_max, floor(budget / p50_task_memory))`, but at least 1
/// while the budget is non-zero so the head of the queue can be tried
/// (per-task fit is still enforced at admission).
pub fn effective_slots(configured_max: usize, budget_mb: u64, p50_task_mb: u64) -> usize {
    if budget_mb == 0 || configured_max == 0 {
        return 0;
    }
    let by_memory = budget_mb
        .checked_div(p50_task_mb.max(1))
        .unwrap_or(0)
        .max(1);
    let by_memory = usize::try_from(by_memory).unwrap_or(usize::MAX);
    configured_max.min(by_memory)
}

/// Median of task memory estimates, in MB. `None` when empty.
pub fn p50_memory_mb(mut estimates: Vec<u64>) -> Option<u64> {
    if estimates.is_empty() {
        return None;
    }
    estimates.sort_unstable();
    Some(estimates[estimates.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB_MB: u64 = 1024;

    fn budget_with(available_gib: u64, safety: f64, reserved_mb: u64) -> MemoryBudget {
        MemoryBudget::new(
            Box::new(FixedProbe::new(available_gib * 1024 * MIB)),
            safety,
            reserved_mb,
        )
    }

    #[test]
    fn test_budget_formula() {
        // 16 GiB available × 1.5 − 2 GiB reserved = 22 GiB.
        let budget = budget_with(16, 1.5, 2 * GIB_MB);
        assert_eq!(budget.current_budget_mb(), 22 * GIB_MB);
    }

    #[test]
    fn test_budget_clamps_to_zero() {
        // 1 GiB available × 1.0 − 2 GiB reserved → 0, not negative.
        let budget = budget_with(1, 1.0, 2 * GIB_MB);
        assert_eq!(budget.current_budget_mb(), 0);
    }

    #[test]
    fn test_set_parameters_applies_next_sample() {
        let mut budget = budget_with(8, 1.0, 0);
        assert_eq!(budget.current_budget_mb(), 8 * GIB_MB);
        budget.set_parameters(1.5, GIB_MB);
        assert_eq!(budget.current_budget_mb(), 11 * GIB_MB);
    }

    #[test]
    fn test_effective_slots_bounded_by_config_and_memory() {
        // Budget fits 3 median tasks; configured max is 4.
        assert_eq!(effective_slots(4, 12 * GIB_MB, 4 * GIB_MB), 3);
        // Configured max is the binding constraint.
        assert_eq!(effective_slots(2, 12 * GIB_MB, GIB_MB), 2);
    }

    #[test]
    fn test_effective_slots_at_least_one_when_budget_nonzero() {
        // Budget smaller than the median task still yields one slot; the
        // per-task fit check at admission does the real gating.
        assert_eq!(effective_slots(4, GIB_MB, 4 * GIB_MB), 1);
    }

    #[test]
    fn test_effective_slots_zero_when_budget_zero() {
        assert_eq!(effective_slots(4, 0, GIB_MB), 0);
        assert_eq!(effective_slots(0, GIB_MB, GIB_MB), 0);
    }

    #[test]
    fn test_p50_memory() {
        assert_eq!(p50_memory_mb(vec![]), None);
        assert_eq!(p50_memory_mb(vec![100]), Some(100));
        assert_eq!(p50_memory_mb(vec![300, 100, 200]), Some(200));
        assert_eq!(p50_memory_mb(vec![400, 100, 200, 300]), Some(300));
    }
}
