use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assignment::AssignmentManager;
use crate::catalog::{CatalogRow, CatalogTable, RegionFileSystem};
use crate::error::Result;
use crate::metrics_consts::*;
use crate::types::parent_first_order;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            enabled: true,
        }
    }
}

// The janitor reports its own metrics, this is mostly for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorScanResult {
    pub scanned: usize,
    pub split_parents: usize,
    pub cleaned: usize,
}

/// Garbage collects split parents once neither daughter references their
/// files any more.
pub struct CatalogJanitor {
    am: Arc<AssignmentManager>,
    catalog: Arc<dyn CatalogTable>,
    fs: Arc<dyn RegionFileSystem>,
    config: JanitorConfig,
    running: AtomicBool,
}

/// Clears the running flag when a scan ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CatalogJanitor {
    pub fn new(
        am: Arc<AssignmentManager>,
        catalog: Arc<dyn CatalogTable>,
        fs: Arc<dyn RegionFileSystem>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            am,
            catalog,
            fs,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            info!("catalog janitor disabled");
            return Ok(());
        }
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }
            match self.scan().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "catalog janitor scan failed"),
            }
        }
    }

    /// One pass over the catalog. A scan requested while another one runs
    /// does nothing.
    pub async fn scan(&self) -> Result<JanitorScanResult> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("catalog janitor already running, skipping scan");
            return Ok(JanitorScanResult::default());
        }
        let _running = RunningGuard(&self.running);
        let started = Instant::now();
        metrics::counter!(JANITOR_RUN_STARTS).increment(1);

        let rows = self.catalog.scan().await?;
        let mut result = JanitorScanResult {
            scanned: rows.len(),
            ..JanitorScanResult::default()
        };
        let mut parents: Vec<CatalogRow> = rows
            .into_iter()
            .filter(|row| row.region.is_split_parent() && !row.region.is_catalog())
            .collect();
        parents.sort_by(|a, b| parent_first_order(&a.region, &b.region));
        result.split_parents = parents.len();

        // A daughter that split again is kept while its parent is kept:
        // removing it would hide the references that keep the parent alive.
        let mut not_cleaned: HashSet<String> = HashSet::new();
        for row in &parents {
            let encoded = row.region.encoded_name();
            if !not_cleaned.contains(&encoded) && self.clean_parent(row).await? {
                result.cleaned += 1;
                continue;
            }
            for daughter in [&row.split_a, &row.split_b].into_iter().flatten() {
                not_cleaned.insert(daughter.encoded_name());
            }
        }

        metrics::counter!(JANITOR_PARENTS_CLEANED).increment(result.cleaned as u64);
        metrics::histogram!(JANITOR_RUN_TIME).record(started.elapsed().as_millis() as f64);
        if result.cleaned > 0 {
            info!(
                scanned = result.scanned,
                split_parents = result.split_parents,
                cleaned = result.cleaned,
                "catalog janitor cleaned split parents"
            );
        }
        Ok(result)
    }

    /// Returns whether the parent was removed.
    async fn clean_parent(&self, row: &CatalogRow) -> Result<bool> {
        let parent = &row.region;
        for daughter in [&row.split_a, &row.split_b].into_iter().flatten() {
            if self.fs.has_references(daughter).await? {
                tracing::debug!(
                    parent = %parent,
                    daughter = %daughter,
                    "daughter still references parent"
                );
                return Ok(false);
            }
        }

        info!(parent = %parent, "deleting split parent");
        self.catalog.remove_daughter_references(parent).await?;
        self.am.region_offline(parent);
        self.fs.archive_region(parent).await?;
        self.catalog.delete_region(parent).await?;
        Ok(true)
    }
}
