use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use region_coordination::CoordinationClient;

use crate::assignment::{AssignmentConfig, AssignmentManager, Collaborators};
use crate::balancer::DefaultLoadBalancer;
use crate::bulk_assigner::BulkAssignConfig;
use crate::catalog::{CatalogTable, RegionFileSystem};
use crate::catalog_janitor::{CatalogJanitor, JanitorConfig};
use crate::error::{Error, Result};
use crate::metrics_consts::*;
use crate::rpc::RegionServerRpc;
use crate::server_manager::ServerManager;
use crate::server_tracker::ServerTracker;
use crate::table_state::TableStateManager;
use crate::timeout_monitor::{TimeoutMonitor, TimeoutMonitorConfig};
use crate::types::ServerName;
use crate::watcher::TransitionWatcher;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub assignment: AssignmentConfig,
    pub bulk_assign: BulkAssignConfig,
    pub timeout_monitor: TimeoutMonitorConfig,
    pub janitor: JanitorConfig,
    pub balancer_period: Duration,
    pub balancer_enabled: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            assignment: AssignmentConfig::default(),
            bulk_assign: BulkAssignConfig::default(),
            timeout_monitor: TimeoutMonitorConfig::default(),
            janitor: JanitorConfig::default(),
            balancer_period: Duration::from_secs(300),
            balancer_enabled: true,
        }
    }
}

/// One term of the active master: everything built here is discarded when
/// leadership is lost and rebuilt from the coordination service and the
/// catalog by the next term.
pub struct Master {
    name: ServerName,
    config: MasterConfig,
    am: Arc<AssignmentManager>,
    tracker: Arc<ServerTracker>,
    watcher: Arc<TransitionWatcher>,
    timeout_monitor: Arc<TimeoutMonitor>,
    janitor: Arc<CatalogJanitor>,
    abort: CancellationToken,
    ready: AtomicBool,
}

impl Master {
    pub fn new(
        name: ServerName,
        coordination: Arc<dyn CoordinationClient>,
        rpc: Arc<dyn RegionServerRpc>,
        catalog: Arc<dyn CatalogTable>,
        fs: Arc<dyn RegionFileSystem>,
        config: MasterConfig,
    ) -> Self {
        let abort = CancellationToken::new();
        let collaborators = Collaborators {
            coordination: Arc::clone(&coordination),
            server_manager: Arc::new(ServerManager::new()),
            rpc,
            balancer: Arc::new(DefaultLoadBalancer),
            catalog: Arc::clone(&catalog),
            table_states: Arc::new(TableStateManager::new(Arc::clone(&coordination))),
        };
        let am = AssignmentManager::new(
            name.clone(),
            collaborators,
            config.assignment.clone(),
            config.bulk_assign.clone(),
            abort.clone(),
        );
        Self {
            tracker: Arc::new(ServerTracker::new(Arc::clone(&coordination), Arc::clone(&am))),
            watcher: Arc::new(TransitionWatcher::new(coordination, Arc::clone(&am))),
            timeout_monitor: Arc::new(TimeoutMonitor::new(
                Arc::clone(&am),
                config.timeout_monitor.clone(),
            )),
            janitor: Arc::new(CatalogJanitor::new(
                Arc::clone(&am),
                catalog,
                fs,
                config.janitor.clone(),
            )),
            name,
            config,
            am,
            abort,
            ready: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn assignment_manager(&self) -> &Arc<AssignmentManager> {
        &self.am
    }

    pub fn timeout_monitor(&self) -> &Arc<TimeoutMonitor> {
        &self.timeout_monitor
    }

    pub fn janitor(&self) -> &Arc<CatalogJanitor> {
        &self.janitor
    }

    /// Set once the cluster state has been rebuilt and regions assigned.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Run until `cancel` fires or something fails badly enough that this
    /// master can no longer be trusted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(master = %self.name, "master starting");
        let token = cancel.child_token();
        let mut tasks = JoinSet::new();

        // Membership and transition watches run before the cluster is
        // joined: bulk assignment waits on the OPENED events they deliver.
        let servers = self.tracker.start().await?;
        let transitions = self.watcher.start().await?;
        {
            let tracker = Arc::clone(&self.tracker);
            let token = token.child_token();
            tasks.spawn(async move { tracker.run(servers, token).await });
        }
        {
            let watcher = Arc::clone(&self.watcher);
            let token = token.child_token();
            tasks.spawn(async move { watcher.run(transitions, token).await });
        }

        let joined = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = self.abort.cancelled() => Some(Err(Error::Aborted("assignment engine failed while joining the cluster".to_string()))),
            report = self.am.join_cluster() => Some(report),
        };
        let result = match joined {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok(report)) => {
                info!(
                    adopted = report.adopted,
                    replayed = report.replayed,
                    assigned = report.assigned,
                    "master initialized"
                );
                self.ready.store(true, Ordering::SeqCst);
                self.spawn_chores(&mut tasks, &token);
                self.supervise(&mut tasks, &cancel).await
            }
        };

        self.ready.store(false, Ordering::SeqCst);
        token.cancel();
        self.am.shutdown();
        tasks.shutdown().await;
        match &result {
            Ok(()) => info!(master = %self.name, "master stopped"),
            Err(e) => warn!(master = %self.name, error = %e, "master stopped with error"),
        }
        result
    }

    fn spawn_chores(&self, tasks: &mut JoinSet<Result<()>>, token: &CancellationToken) {
        {
            let monitor = Arc::clone(&self.timeout_monitor);
            let token = token.child_token();
            tasks.spawn(async move { monitor.run(token).await });
        }
        {
            let janitor = Arc::clone(&self.janitor);
            let token = token.child_token();
            tasks.spawn(async move { janitor.run(token).await });
        }
        if self.config.balancer_enabled {
            let am = Arc::clone(&self.am);
            let period = self.config.balancer_period;
            let token = token.child_token();
            tasks.spawn(async move { balancer_loop(am, period, token).await });
        }
    }

    /// Wait for shutdown, an abort, or a background task failing. Tasks
    /// that finish cleanly (a disabled janitor) are not a reason to stop.
    async fn supervise(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.abort.cancelled() => {
                    return Err(Error::Aborted("assignment engine failed".to_string()));
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(Error::invalid_state(format!("task panicked: {e}"))),
                }
            }
        }
    }

    /// Run one balancer pass now. Returns the number of moves started.
    pub async fn balance(&self) -> Result<usize> {
        balance_once(&self.am).await
    }
}

async fn balancer_loop(
    am: Arc<AssignmentManager>,
    period: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = interval.tick() => {}
        }
        balance_once(&am).await?;
    }
}

/// Moves are only computed on a quiet cluster; a region in transition
/// means the current assignment is about to change anyway.
async fn balance_once(am: &AssignmentManager) -> Result<usize> {
    let in_transition = am.region_states().regions_in_transition().len();
    if in_transition > 0 {
        info!(in_transition, "regions in transition, not running balancer");
        return Ok(0);
    }
    let servers = am.server_manager().online_servers();
    let assignments = am.region_states().assignments_by_server();
    let plans = am.balancer().balance_cluster(&assignments, &servers);
    if plans.is_empty() {
        tracing::debug!(servers = servers.len(), "cluster balanced");
        return Ok(0);
    }

    let moves = plans.len();
    info!(moves, servers = servers.len(), "balancing cluster");
    metrics::counter!(BALANCER_MOVES).increment(moves as u64);
    for plan in plans {
        let region = plan.region.clone();
        match am.balance(plan).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(region = %region, error = %e, "failed to move region"),
        }
    }
    Ok(moves)
}
