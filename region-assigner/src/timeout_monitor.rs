use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use region_coordination::util::now_millis;

use crate::assignment::AssignmentManager;
use crate::error::Result;
use crate::metrics_consts::*;
use crate::types::{RegionState, RegionStateRecord};

#[derive(Debug, Clone)]
pub struct TimeoutMonitorConfig {
    /// Time between sweeps.
    pub period: Duration,
    /// How long a region may stay in one transition state.
    pub timeout: Duration,
    /// The same for catalog regions, which block everything else.
    pub catalog_timeout: Duration,
    /// Regions in transition longer than this are counted as stuck.
    pub rit_warning_threshold: Duration,
}

impl Default for TimeoutMonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
            timeout: Duration::from_secs(1800),
            catalog_timeout: Duration::from_secs(60),
            rit_warning_threshold: Duration::from_secs(60),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub in_transition: usize,
    pub over_threshold: usize,
    pub acted_on: usize,
}

/// Periodically looks for regions stuck in transition and pushes them
/// forward.
pub struct TimeoutMonitor {
    am: Arc<AssignmentManager>,
    config: TimeoutMonitorConfig,
}

impl TimeoutMonitor {
    pub fn new(am: Arc<AssignmentManager>, config: TimeoutMonitorConfig) -> Self {
        Self { am, config }
    }

    /// Sweep every period, and immediately whenever the assignment engine
    /// flags a region that cannot wait for its deadline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
                _ = self.am.timeout_wakeup().notified() => {
                    tracing::debug!("timeout monitor woken early");
                }
            }
            self.sweep();
        }
    }

    /// Check every region in transition once. Actions run in the
    /// background; the report counts the ones started.
    pub fn sweep(&self) -> SweepReport {
        let now = now_millis();
        let records = self.am.region_states().regions_in_transition();
        let servers_available = !self
            .am
            .server_manager()
            .destination_servers(None)
            .is_empty();
        // Servers came back after an assignment found none: act on
        // everything now instead of waiting for each deadline.
        let eager = self.am.all_servers_offline() && servers_available;
        if eager {
            tracing::info!(regions = records.len(), "region servers available again, retrying regions in transition");
        }

        let threshold = duration_millis(self.config.rit_warning_threshold);
        let mut report = SweepReport {
            in_transition: records.len(),
            ..SweepReport::default()
        };
        let mut oldest = 0;
        for record in &records {
            let age = now.saturating_sub(record.stamp);
            oldest = oldest.max(age);
            if age > threshold {
                report.over_threshold += 1;
            }
        }
        metrics::gauge!(REGIONS_IN_TRANSITION).set(report.in_transition as f64);
        metrics::gauge!(REGIONS_IN_TRANSITION_OVER_THRESHOLD).set(report.over_threshold as f64);
        metrics::gauge!(OLDEST_REGION_IN_TRANSITION_MS).set(oldest as f64);
        if report.over_threshold > 0 {
            tracing::warn!(
                over_threshold = report.over_threshold,
                oldest_ms = oldest,
                "regions in transition for too long"
            );
        }

        for record in records {
            let timeout = if record.region.is_catalog() {
                self.config.catalog_timeout
            } else {
                self.config.timeout
            };
            let expired = now.saturating_sub(record.stamp) > duration_millis(timeout);
            if (expired || eager) && self.act_on_timeout(record) {
                report.acted_on += 1;
            }
        }

        self.am.set_all_servers_offline(!servers_available);
        report
    }

    fn act_on_timeout(&self, record: RegionStateRecord) -> bool {
        let region = record.region;
        let stamp = record.stamp;
        tracing::info!(
            region = %region,
            state = %record.state,
            server = ?record.server.as_ref().map(ToString::to_string),
            "region in transition timed out"
        );
        match record.state {
            RegionState::Closed => {
                // The close completion handler is on its way.
                self.am.region_states().update_timestamp(&region);
                return false;
            }
            RegionState::Open => {
                tracing::warn!(region = %region, "region open but still in transition");
                self.am.region_states().update_timestamp(&region);
                return false;
            }
            RegionState::Split | RegionState::Splitting => return false,
            RegionState::Offline | RegionState::PendingOpen => {
                self.am
                    .spawn_region_task("timed out assignment", region, move |am, region| async move {
                        am.retry_stuck_assignment(&region, stamp).await
                    });
            }
            RegionState::Opening => {
                self.am
                    .spawn_region_task("timed out open", region, move |am, region| async move {
                        am.retry_stuck_opening(&region, stamp).await
                    });
            }
            RegionState::PendingClose | RegionState::Closing => {
                self.am
                    .spawn_region_task("timed out close", region, |am, region| async move {
                        am.unassign(&region, true, None).await
                    });
            }
        }
        metrics::counter!(TIMEOUTS_ACTED_ON, "state" => record.state.to_string()).increment(1);
        true
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
