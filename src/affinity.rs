//! CPU topology detection and thread placement for the two pipeline
//! stages.
//!
//! The producer (socket readiness + ring push) and the consumer
//! (decode/arbitrate/persist) each want their own physical core to
//! avoid scheduler jitter and L1/L2 thrashing; sharing L3 is fine and
//! helps the ring. Pinning is expressed as a post-construction
//! configuration step so the same pipeline logic runs (and is tested)
//! unpinned.
//!
//! Uses `num_cpus` for physical/logical core counts and `core_affinity`
//! for pinning. On most systems, core IDs 0..N map to separate physical
//! cores before SMT siblings are enumerated.

use core_affinity::CoreId;

use crate::trace::warn;

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            available_cores,
        }
    }

    /// Selects placement for the two pipeline stages.
    ///
    /// With two or more logical cores available the stages get the
    /// first two core IDs (separate physical cores where the ID
    /// enumeration allows); on a single-core box both stages stay
    /// unpinned — pinning them to the same core would only hurt.
    #[must_use]
    pub fn select_placement(&self) -> StagePlacement {
        if self.available_cores.len() >= 2 {
            StagePlacement {
                producer_core: self.available_cores.first().copied(),
                consumer_core: self.available_cores.get(1).copied(),
            }
        } else {
            StagePlacement::unpinned()
        }
    }
}

/// Core assignments for the two pipeline threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlacement {
    /// Core for the socket/ring producer thread (None = unpinned).
    pub producer_core: Option<usize>,
    /// Core for the decode/persist consumer thread (None = unpinned).
    pub consumer_core: Option<usize>,
}

impl StagePlacement {
    /// Placement with both stages unpinned.
    #[must_use]
    pub const fn unpinned() -> Self {
        Self {
            producer_core: None,
            consumer_core: None,
        }
    }
}

/// Configuration for CPU pinning behavior.
#[derive(Debug, Clone, Default)]
pub enum CpuConfig {
    /// Auto-detect topology and choose placement.
    #[default]
    Auto,
    /// User-specified core assignments.
    Manual {
        producer_core: Option<usize>,
        consumer_core: Option<usize>,
    },
    /// Disable CPU pinning entirely.
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete placement.
    #[must_use]
    pub fn resolve(&self) -> StagePlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(),
            Self::Manual {
                producer_core,
                consumer_core,
            } => StagePlacement {
                producer_core: *producer_core,
                consumer_core: *consumer_core,
            },
            Self::Disabled => StagePlacement::unpinned(),
        }
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded. Pinning may fail if the core ID
/// is invalid or the OS denies the request; callers treat that as a
/// performance hint that did not apply, never as an error.
pub fn pin_to_core(core_id: usize) -> bool {
    let pinned = core_affinity::set_for_current(CoreId { id: core_id });
    if !pinned {
        warn!(core_id, "failed to pin thread to core");
    }
    pinned
}

/// Pins the current thread if a core was assigned.
pub fn pin_if_assigned(core: Option<usize>) {
    if let Some(core_id) = core {
        let _ = pin_to_core(core_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(topo.physical_cores > 0, "should have at least 1 physical core");
        assert!(
            topo.logical_cores >= topo.physical_cores,
            "logical >= physical"
        );
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn placement_uses_available_cores() {
        let topo = CpuTopology::detect();
        let placement = topo.select_placement();

        if let Some(core) = placement.producer_core {
            assert!(topo.available_cores.contains(&core));
        }
        if let Some(core) = placement.consumer_core {
            assert!(topo.available_cores.contains(&core));
        }
    }

    #[test]
    fn stages_get_distinct_cores_when_possible() {
        let topo = CpuTopology::detect();
        let placement = topo.select_placement();

        if topo.available_cores.len() >= 2 {
            assert_ne!(placement.producer_core, placement.consumer_core);
        }
    }

    #[test]
    fn cpu_config_disabled_returns_unpinned() {
        assert_eq!(CpuConfig::Disabled.resolve(), StagePlacement::unpinned());
    }

    #[test]
    fn cpu_config_manual_uses_specified_cores() {
        let config = CpuConfig::Manual {
            producer_core: Some(5),
            consumer_core: Some(6),
        };
        let placement = config.resolve();

        assert_eq!(placement.producer_core, Some(5));
        assert_eq!(placement.consumer_core, Some(6));
    }
}
