//! Rebalancing loop
//!
//! Periodically scans the capacity snapshot for imbalance: overutilized
//! nodes (CPU or memory above the scale-up threshold) hosting workloads
//! that an underutilized node (average utilization below the scale-down
//! threshold) could absorb without itself crossing the threshold. Matching
//! pairs are emitted as migration suggestions. Suggestions are advisory:
//! nothing in the resource manager executes them, and the reconciler only
//! acts when policy permits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capacity::{NodeResourceInfo, ResourceUtilization};

use super::ResourceManager;

/// A recommendation to move a workload off a hot node
#[derive(Clone, Debug, PartialEq)]
pub struct MigrationSuggestion {
    /// Workload key (`namespace/name`)
    pub workload_key: String,
    /// Node the workload currently occupies
    pub from_node: String,
    /// Node that could absorb it
    pub to_node: String,
    /// Why the move is suggested
    pub reason: String,
}

impl ResourceManager {
    fn is_underutilized(&self, node: &NodeResourceInfo) -> bool {
        let avg = (node.utilization.cpu + node.utilization.memory) / 2.0;
        avg < self.config().scale_down_threshold * 100.0
    }

    fn is_overutilized(&self, node: &NodeResourceInfo) -> bool {
        let threshold = self.config().scale_up_threshold * 100.0;
        node.utilization.cpu > threshold || node.utilization.memory > threshold
    }

    /// One rebalancing pass over the current snapshot.
    ///
    /// At most one suggestion per overutilized node per pass; moving one
    /// workload changes the picture enough that further moves should wait
    /// for the next cycle's observations.
    pub fn rebalance_once(&self) -> Vec<MigrationSuggestion> {
        let snapshot = self.cache().snapshot();

        let underutilized: Vec<&NodeResourceInfo> = snapshot
            .nodes
            .iter()
            .filter(|n| self.is_underutilized(n))
            .collect();
        let overutilized: Vec<&NodeResourceInfo> = snapshot
            .nodes
            .iter()
            .filter(|n| self.is_overutilized(n))
            .collect();

        if overutilized.is_empty() || underutilized.is_empty() {
            return Vec::new();
        }

        let threshold_pct = self.config().scale_up_threshold * 100.0;
        let mut suggestions = Vec::new();

        for hot in &overutilized {
            let allocations = self.cache().allocations_on(&hot.name);

            'workloads: for allocation in &allocations {
                for cold in &underutilized {
                    if !allocation.resources.fits_within(&cold.available) {
                        continue;
                    }

                    // The move must not push the target past the threshold
                    let moved_used = cold.used.plus(&allocation.resources);
                    let moved = ResourceUtilization::derive(&moved_used, &cold.allocatable);
                    if moved.cpu > threshold_pct || moved.memory > threshold_pct {
                        continue;
                    }

                    suggestions.push(MigrationSuggestion {
                        workload_key: allocation.workload_key(),
                        from_node: hot.name.clone(),
                        to_node: cold.name.clone(),
                        reason: format!(
                            "load balancing: {} at cpu {:.0}% / memory {:.0}%",
                            hot.name, hot.utilization.cpu, hot.utilization.memory
                        ),
                    });
                    break 'workloads;
                }
            }
        }

        if !suggestions.is_empty() {
            info!(
                suggestions = suggestions.len(),
                overutilized = overutilized.len(),
                underutilized = underutilized.len(),
                "rebalancing suggestions"
            );
        }

        suggestions
    }
}

/// Periodic rebalance task; runs until cancelled
pub async fn run_rebalance_loop(
    manager: Arc<ResourceManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("rebalance loop stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        for suggestion in manager.rebalance_once() {
            info!(
                workload = %suggestion.workload_key,
                from = %suggestion.from_node,
                to = %suggestion.to_node,
                reason = %suggestion.reason,
                "migration suggested"
            );
        }
    }
}
