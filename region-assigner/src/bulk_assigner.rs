use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::assignment::AssignmentManager;
use crate::error::{Error, Result};
use crate::types::{RegionInfo, ServerName};

#[derive(Debug, Clone)]
pub struct BulkAssignConfig {
    /// Destinations opened in parallel.
    pub max_concurrency: usize,
    /// Expected time for one server to open one region; scales the wait
    /// for a batch to settle.
    pub per_region_open_time: Duration,
    pub max_wait: Duration,
}

impl Default for BulkAssignConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 20,
            per_region_open_time: Duration::from_secs(1),
            max_wait: Duration::from_secs(600),
        }
    }
}

impl BulkAssignConfig {
    /// How long a plan of `regions` over `servers` destinations is waited
    /// for.
    pub fn wait_for(&self, regions: usize, servers: usize) -> Duration {
        let per_server = u32::try_from(regions / servers.max(1) + 1).unwrap_or(u32::MAX);
        self.per_region_open_time
            .saturating_mul(per_server)
            .min(self.max_wait)
    }
}

/// Opens a precomputed plan, one batched request per destination.
///
/// Regions a destination could not take are assigned one by one once the
/// batch has settled.
pub struct BulkAssigner {
    am: Arc<AssignmentManager>,
    plan: HashMap<ServerName, Vec<RegionInfo>>,
    config: BulkAssignConfig,
}

impl BulkAssigner {
    pub fn new(
        am: Arc<AssignmentManager>,
        plan: HashMap<ServerName, Vec<RegionInfo>>,
        config: BulkAssignConfig,
    ) -> Self {
        Self { am, plan, config }
    }

    /// Send every batch. With `sync`, wait until the sent regions leave
    /// transition; returns false if they did not in time.
    pub async fn bulk_assign(self, sync: bool) -> Result<bool> {
        let Self { am, plan, config } = self;
        let region_count: usize = plan.values().map(Vec::len).sum();
        let server_count = plan.len();
        if region_count == 0 {
            return Ok(true);
        }
        tracing::info!(regions = region_count, servers = server_count, "bulk assigning");

        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (server, regions) in plan {
            let am = Arc::clone(&am);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = am.assign_batch(&server, &regions).await;
                (server, regions, outcome)
            });
        }

        let mut sent = Vec::with_capacity(region_count);
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (server, regions, outcome) = joined
                .map_err(|e| Error::invalid_state(format!("bulk assign task panicked: {e}")))?;
            match outcome {
                Ok(outcome) => {
                    sent.extend(outcome.sent);
                    failed.extend(outcome.failed);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "batch failed");
                    failed.extend(regions);
                }
            }
        }

        let converged = if sync {
            wait_until_done(&am, &sent, config.wait_for(region_count, server_count)).await
        } else {
            true
        };

        if !failed.is_empty() {
            tracing::info!(regions = failed.len(), "reassigning regions the bulk assignment could not place");
        }
        for region in failed {
            match am.assign(&region, true, true).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(region = %region, error = %e, "reassignment failed"),
            }
        }
        Ok(converged)
    }
}

async fn wait_until_done(am: &AssignmentManager, regions: &[RegionInfo], timeout: Duration) -> bool {
    let states = am.region_states();
    let deadline = Instant::now() + timeout;
    loop {
        let pending = regions
            .iter()
            .filter(|r| states.is_region_in_transition(r))
            .count();
        if pending == 0 {
            return true;
        }
        if Instant::now() >= deadline || am.is_aborted() {
            tracing::warn!(pending, ?timeout, "bulk assignment still in progress");
            return false;
        }
        states.wait_for_update(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_scales_with_regions_per_server_and_is_capped() {
        let config = BulkAssignConfig {
            max_concurrency: 4,
            per_region_open_time: Duration::from_millis(100),
            max_wait: Duration::from_secs(2),
        };
        assert_eq!(config.wait_for(10, 5), Duration::from_millis(300));
        assert_eq!(config.wait_for(0, 0), Duration::from_millis(100));
        assert_eq!(config.wait_for(10_000, 1), Duration::from_secs(2));
    }
}
