use std::collections::HashMap;
use std::time::Instant;

use futures::future::join_all;

use crate::bulk_assigner::BulkAssigner;
use crate::error::{Error, Result};
use crate::metrics_consts::*;
use crate::rpc::RpcError;
use crate::transition;
use crate::types::{OpenOutcome, RegionInfo, RegionPlan, RegionState, ServerName};

use super::AssignmentManager;

/// Result of one batched open.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Regions the destination accepted.
    pub sent: Vec<RegionInfo>,
    /// Regions that must go through single assignment instead.
    pub failed: Vec<RegionInfo>,
}

impl AssignmentManager {
    /// Open `regions` on `destination` with one request.
    ///
    /// Regions that are open or already in transition are skipped. Regions
    /// whose node could not be forced offline, or that the destination
    /// failed to open, come back in [`BatchOutcome::failed`].
    pub async fn assign_batch(
        &self,
        destination: &ServerName,
        regions: &[RegionInfo],
    ) -> Result<BatchOutcome> {
        let keys: Vec<String> = regions.iter().map(RegionInfo::encoded_name).collect();
        let _locks = self.locker.acquire_all(&keys).await;

        let mut batch = Vec::with_capacity(regions.len());
        for region in regions {
            let state = self.region_states.create_region_state(region);
            if state.is_open() {
                tracing::debug!(region = %region, "region already open, skipping");
                continue;
            }
            if !state.is_offline() && !state.is_closed() {
                tracing::debug!(region = %region, state = %state.state, "region busy, skipping");
                continue;
            }
            if self.table_states.is_disabling_or_disabled(&region.table) {
                continue;
            }
            self.region_states
                .update_region_state(region, RegionState::Offline, None);
            batch.push(region.clone());
        }
        self.plans.set_all(
            batch
                .iter()
                .map(|r| RegionPlan::new(r.clone(), None, destination.clone())),
        );

        let writes = join_all(batch.iter().map(|region| {
            transition::create_or_force_node_offline(
                self.coordination.as_ref(),
                region,
                &self.master,
            )
        }))
        .await;

        let mut outcome = BatchOutcome::default();
        let mut to_open = Vec::with_capacity(batch.len());
        for (region, write) in batch.into_iter().zip(writes) {
            match write {
                Ok(Some(version)) => to_open.push((region, version)),
                Ok(None) => {
                    tracing::warn!(region = %region, "could not force region offline, dropping it from the batch");
                    outcome.failed.push(region);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(region = %region, error = %e, "failed to force region offline");
                    outcome.failed.push(region);
                }
            }
        }
        if to_open.is_empty() {
            return Ok(outcome);
        }

        for (region, _) in &to_open {
            self.region_states.update_region_state(
                region,
                RegionState::PendingOpen,
                Some(destination.clone()),
            );
        }
        metrics::counter!(BULK_ASSIGN_REGIONS).increment(to_open.len() as u64);
        tracing::info!(
            server = %destination,
            regions = to_open.len(),
            "sending batched open"
        );

        let startup_deadline = Instant::now() + self.config.server_startup_wait;
        let outcomes = loop {
            match self
                .call_rpc(self.rpc.open_regions(destination, &to_open))
                .await
            {
                Ok(outcomes) if outcomes.len() == to_open.len() => break outcomes,
                Ok(outcomes) => {
                    tracing::warn!(
                        server = %destination,
                        sent = to_open.len(),
                        received = outcomes.len(),
                        "batched open answered for the wrong number of regions"
                    );
                    return Ok(self.fail_all(outcome, to_open));
                }
                Err(RpcError::ServerNotRunningYet) if Instant::now() < startup_deadline => {
                    tracing::debug!(server = %destination, "destination not running yet, waiting");
                    tokio::time::sleep(self.config.server_startup_retry_interval).await;
                }
                Err(e) => {
                    metrics::counter!(OPEN_RPC_FAILURES).increment(1);
                    tracing::warn!(server = %destination, error = %e, "batched open failed");
                    return Ok(self.fail_all(outcome, to_open));
                }
            }
        };

        for ((region, _), result) in to_open.into_iter().zip(outcomes) {
            match result {
                OpenOutcome::Opened => outcome.sent.push(region),
                OpenOutcome::AlreadyOpened => {
                    self.process_already_opened(&region, destination).await?;
                    outcome.sent.push(region);
                }
                OpenOutcome::FailedOpening => {
                    tracing::warn!(region = %region, server = %destination, "region failed to open in batch");
                    self.region_states
                        .update_region_state(&region, RegionState::Offline, None);
                    outcome.failed.push(region);
                }
            }
        }
        Ok(outcome)
    }

    fn fail_all(&self, mut outcome: BatchOutcome, regions: Vec<(RegionInfo, i64)>) -> BatchOutcome {
        for (region, _) in regions {
            self.region_states
                .update_region_state(&region, RegionState::Offline, None);
            outcome.failed.push(region);
        }
        outcome
    }

    /// Spread `regions` over the online servers and open them in batches,
    /// waiting for them to settle.
    pub async fn assign_regions(&self, regions: Vec<RegionInfo>) -> Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        let servers = self.server_manager.destination_servers(None);
        if servers.is_empty() {
            self.set_all_servers_offline(true);
            for region in &regions {
                self.region_states
                    .update_region_state(region, RegionState::Offline, None);
            }
            return Err(Error::NoServersAvailable(format!("{} regions", regions.len())));
        }
        let plan = self.balancer.round_robin_assignment(&regions, &servers);
        self.run_bulk(plan).await
    }

    /// Like [`assign_regions`](Self::assign_regions), but keep every region
    /// on the host it was last on when that host is still around.
    pub async fn assign_retaining(
        &self,
        regions: HashMap<RegionInfo, Option<ServerName>>,
    ) -> Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        let servers = self.server_manager.destination_servers(None);
        if servers.is_empty() {
            self.set_all_servers_offline(true);
            for region in regions.keys() {
                self.region_states
                    .update_region_state(region, RegionState::Offline, None);
            }
            return Err(Error::NoServersAvailable(format!("{} regions", regions.len())));
        }
        let plan = self.balancer.retain_assignment(&regions, &servers);
        self.run_bulk(plan).await
    }

    async fn run_bulk(&self, plan: HashMap<ServerName, Vec<RegionInfo>>) -> Result<()> {
        let Some(am) = self.this.upgrade() else {
            return Ok(());
        };
        let converged = BulkAssigner::new(am, plan, self.bulk_config.clone())
            .bulk_assign(true)
            .await?;
        if !converged {
            tracing::warn!("bulk assignment did not settle in time, the timeout monitor will follow up");
        }
        Ok(())
    }
}
