//! N+1 fault detection.
//!
//! Every lazy relationship fault costs one storage round trip. Faulting the
//! same relationship on many objects one by one is the N+1 pattern; a
//! prefetch on the originating select resolves all of them in one fetch.
//!
//! ```ignore
//! // Warns once the threshold is reached:
//! for artist in &artists {
//!     ctx.to_many(artist, "paintings")?;
//! }
//!
//! // The fix:
//! ctx.select(&SelectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::DisjointById))?;
//! ```

use std::collections::HashMap;

/// Default number of faults per relationship before warning.
pub const DEFAULT_FAULT_WARNING_THRESHOLD: usize = 10;

/// Where a fault was triggered.
#[derive(Debug, Clone)]
pub struct FaultSite {
    pub entity: &'static str,
    pub relationship: &'static str,
    pub file: &'static str,
    pub line: u32,
}

/// Aggregate fault counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub total_faults: usize,
    pub relationships_faulted: usize,
    /// Relationships at or above the warning threshold.
    pub potential_n1: usize,
}

/// Counts relationship faults per (entity, relationship).
#[derive(Debug)]
pub struct FaultTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    enabled: bool,
    sites: Vec<FaultSite>,
}

impl Default for FaultTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_WARNING_THRESHOLD)
    }
}

impl FaultTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
            enabled: true,
            sites: Vec::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Record one lazy fault. Warns when the count reaches the threshold.
    #[track_caller]
    pub fn record(&mut self, entity: &'static str, relationship: &'static str) {
        if !self.enabled {
            return;
        }
        let count = self.counts.entry((entity, relationship)).or_insert(0);
        *count += 1;
        let count = *count;

        let caller = std::panic::Location::caller();
        self.sites.push(FaultSite {
            entity,
            relationship,
            file: caller.file(),
            line: caller.line(),
        });

        if count == self.threshold {
            tracing::warn!(
                target: "rowgraph::faults",
                entity,
                relationship,
                faults = count,
                threshold = self.threshold,
                "Repeated relationship faults; consider prefetching '{relationship}'"
            );
            for site in self
                .sites
                .iter()
                .filter(|s| s.entity == entity && s.relationship == relationship)
                .take(5)
            {
                tracing::debug!(target: "rowgraph::faults", file = site.file, line = site.line, "fault site");
            }
        }
    }

    pub fn count_for(&self, entity: &str, relationship: &str) -> usize {
        self.counts
            .iter()
            .find(|((e, r), _)| *e == entity && *r == relationship)
            .map_or(0, |(_, c)| *c)
    }

    pub fn stats(&self) -> FaultStats {
        FaultStats {
            total_faults: self.counts.values().sum(),
            relationships_faulted: self.counts.len(),
            potential_n1: self.counts.values().filter(|c| **c >= self.threshold).count(),
        }
    }

    pub fn sites(&self) -> &[FaultSite] {
        &self.sites
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.sites.clear();
    }
}
