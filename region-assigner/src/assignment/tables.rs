use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::error::{Error, Result};
use crate::table_state::TableState;
use crate::types::{RegionInfo, TableName};

use super::AssignmentManager;

impl AssignmentManager {
    /// Close every region of `table` and mark it disabled. Regions that
    /// open while the table is disabling are closed again as they report in.
    pub async fn disable_table(&self, table: &TableName, timeout: Duration) -> Result<()> {
        self.table_states
            .set_state(table, TableState::Disabling)
            .await?;

        let online: Vec<RegionInfo> = self
            .region_states
            .regions_of_table(table)
            .into_iter()
            .filter(|r| r.is_open())
            .map(|r| r.region)
            .collect();
        tracing::info!(table = %table, regions = online.len(), "disabling table");

        let results = join_all(online.iter().map(|r| self.unassign(r, false, None))).await;
        for (region, result) in online.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(region = %region, error = %e, "failed to close region"),
            }
        }

        self.wait_for_table(table, timeout, |am, r| {
            !am.region_states.is_region_online(r) && !am.region_states.is_region_in_transition(r)
        })
        .await?;

        self.table_states
            .set_state(table, TableState::Disabled)
            .await?;
        tracing::info!(table = %table, "table disabled");
        Ok(())
    }

    /// Open every region of `table` and mark it enabled.
    pub async fn enable_table(&self, table: &TableName, timeout: Duration) -> Result<()> {
        self.table_states
            .set_state(table, TableState::Enabling)
            .await?;

        let offline: Vec<RegionInfo> = self
            .region_states
            .regions_of_table(table)
            .into_iter()
            .filter(|r| !r.region.is_split_parent() && !r.is_open() && !r.is_in_transition())
            .map(|r| r.region)
            .collect();
        tracing::info!(table = %table, regions = offline.len(), "enabling table");
        self.assign_regions(offline).await?;

        self.wait_for_table(table, timeout, |am, r| {
            am.region_states.is_region_online(r) && !am.region_states.is_region_in_transition(r)
        })
        .await?;

        self.table_states
            .set_state(table, TableState::Enabled)
            .await?;
        tracing::info!(table = %table, "table enabled");
        Ok(())
    }

    async fn wait_for_table<F>(&self, table: &TableName, timeout: Duration, settled: F) -> Result<()>
    where
        F: Fn(&Self, &RegionInfo) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self
                .region_states
                .regions_of_table(table)
                .into_iter()
                .filter(|r| !r.region.is_split_parent() && !settled(self, &r.region))
                .count();
            if pending == 0 {
                return Ok(());
            }
            if self.is_aborted() {
                return Err(Error::Aborted(format!("waiting for table {table}")));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(
                    timeout,
                    format!("{pending} regions of table {table}"),
                ));
            }
            self.region_states
                .wait_for_update(Duration::from_millis(100))
                .await;
        }
    }
}
