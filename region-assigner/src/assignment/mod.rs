//! The assignment engine: decides where regions go and drives them there
//! through the transition protocol.
//!
//! Every mutation of one region (assign, unassign, handling a transition
//! event, acting on a timeout) runs under that region's lock from
//! [`KeyLocker`]. The locks are not reentrant, so anything that needs to
//! start another operation on the same region while holding its lock calls
//! the `*_locked` variant, and anything that needs a different region's
//! lock spawns.

mod bulk;
mod events;
mod recovery;
mod tables;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use region_coordination::CoordinationClient;

use crate::balancer::LoadBalancer;
use crate::bulk_assigner::BulkAssignConfig;
use crate::catalog::CatalogTable;
use crate::dispatcher::TransitionDispatcher;
use crate::error::{Error, Result};
use crate::locks::KeyLocker;
use crate::metrics_consts::*;
use crate::plans::RegionPlans;
use crate::region_states::RegionStates;
use crate::rpc::{RegionServerRpc, RpcError};
use crate::server_manager::ServerManager;
use crate::table_state::TableStateManager;
use crate::transition;
use crate::types::{
    EventType, OpenOutcome, RegionInfo, RegionPlan, RegionState, RegionStateRecord, ServerName,
};

pub use bulk::BatchOutcome;
pub use recovery::JoinReport;

#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Open attempts per assign call before leaving the region to the
    /// timeout monitor.
    pub max_attempts: u32,
    /// How long a destination answering "not running yet" is waited for.
    /// Those retries do not count as attempts.
    pub server_startup_wait: Duration,
    pub server_startup_retry_interval: Duration,
    pub rpc_timeout: Duration,
    /// Concurrent transition handlers.
    pub dispatcher_workers: usize,
    /// Concurrent background assign/unassign tasks.
    pub rpc_workers: usize,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            server_startup_wait: Duration::from_secs(60),
            server_startup_retry_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_secs(60),
            dispatcher_workers: 10,
            rpc_workers: 30,
        }
    }
}

/// What the assignment engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub coordination: Arc<dyn CoordinationClient>,
    pub server_manager: Arc<ServerManager>,
    pub rpc: Arc<dyn RegionServerRpc>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub catalog: Arc<dyn CatalogTable>,
    pub table_states: Arc<TableStateManager>,
}

pub struct AssignmentManager {
    this: Weak<AssignmentManager>,
    master: ServerName,
    coordination: Arc<dyn CoordinationClient>,
    server_manager: Arc<ServerManager>,
    rpc: Arc<dyn RegionServerRpc>,
    balancer: Arc<dyn LoadBalancer>,
    catalog: Arc<dyn CatalogTable>,
    table_states: Arc<TableStateManager>,
    region_states: RegionStates,
    plans: RegionPlans,
    locker: KeyLocker,
    dispatcher: TransitionDispatcher,
    background: Arc<Semaphore>,
    all_servers_offline: AtomicBool,
    timeout_wakeup: Notify,
    config: AssignmentConfig,
    bulk_config: BulkAssignConfig,
    abort: CancellationToken,
}

impl AssignmentManager {
    /// `abort` is cancelled when the engine hits an error it cannot recover
    /// from; the owner is expected to stop the master.
    pub fn new(
        master: ServerName,
        collaborators: Collaborators,
        config: AssignmentConfig,
        bulk_config: BulkAssignConfig,
        abort: CancellationToken,
    ) -> Arc<Self> {
        let Collaborators {
            coordination,
            server_manager,
            rpc,
            balancer,
            catalog,
            table_states,
        } = collaborators;
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            master,
            coordination,
            server_manager,
            rpc,
            balancer,
            catalog,
            table_states,
            region_states: RegionStates::new(),
            plans: RegionPlans::new(),
            locker: KeyLocker::new(),
            dispatcher: TransitionDispatcher::new(config.dispatcher_workers),
            background: Arc::new(Semaphore::new(config.rpc_workers.max(1))),
            all_servers_offline: AtomicBool::new(false),
            timeout_wakeup: Notify::new(),
            config,
            bulk_config,
            abort,
        })
    }

    pub fn master_name(&self) -> &ServerName {
        &self.master
    }

    pub fn region_states(&self) -> &RegionStates {
        &self.region_states
    }

    pub fn plans(&self) -> &RegionPlans {
        &self.plans
    }

    pub fn server_manager(&self) -> &Arc<ServerManager> {
        &self.server_manager
    }

    pub fn table_states(&self) -> &Arc<TableStateManager> {
        &self.table_states
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    pub fn bulk_config(&self) -> &BulkAssignConfig {
        &self.bulk_config
    }

    /// Woken whenever a region needs the timeout monitor's attention
    /// before its deadline.
    pub fn timeout_wakeup(&self) -> &Notify {
        &self.timeout_wakeup
    }

    /// Set when an assignment found no server to go to.
    pub fn all_servers_offline(&self) -> bool {
        self.all_servers_offline.load(Ordering::SeqCst)
    }

    pub fn set_all_servers_offline(&self, offline: bool) {
        self.all_servers_offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Stop handling transitions. Handlers already running finish.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown_now();
    }

    pub(crate) fn abort(&self, reason: &str, error: &Error) {
        if self.abort.is_cancelled() {
            return;
        }
        tracing::error!(reason, error = %error, "aborting master");
        self.abort.cancel();
    }

    fn report(&self, what: &str, region: &RegionInfo, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.abort(&format!("{what} of {region}"), &e),
            Err(e) => tracing::warn!(region = %region, error = %e, "{} failed", what),
        }
    }

    /// Run `f` in the background on the bounded worker pool, aborting the
    /// master if it fails fatally.
    pub(crate) fn spawn_region_task<F, Fut>(&self, what: &'static str, region: RegionInfo, f: F)
    where
        F: FnOnce(Arc<Self>, RegionInfo) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let Some(am) = self.this.upgrade() else {
            return;
        };
        let permits = Arc::clone(&self.background);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if am.is_aborted() {
                return;
            }
            let result = f(Arc::clone(&am), region.clone()).await;
            am.report(what, &region, result);
        });
    }

    pub(crate) fn spawn_assign(&self, region: RegionInfo, force_new_plan: bool) {
        self.spawn_region_task("assign", region, move |am, region| async move {
            am.assign(&region, true, force_new_plan).await
        });
    }

    pub(crate) fn spawn_unassign(&self, region: RegionInfo) {
        self.spawn_region_task("unassign", region, |am, region| async move {
            am.unassign(&region, false, None).await
        });
    }

    async fn call_rpc<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RpcError>>,
    ) -> std::result::Result<T, RpcError> {
        tokio::time::timeout(self.config.rpc_timeout, call)
            .await
            .unwrap_or(Err(RpcError::SocketTimeout))
    }

    // ── Plans ───────────────────────────────────────────────────────

    fn region_plan(
        &self,
        region: &RegionInfo,
        exclude: Option<&ServerName>,
        force_new: bool,
    ) -> Option<RegionPlan> {
        let candidates = self.server_manager.destination_servers(exclude);
        if candidates.is_empty() {
            return None;
        }
        let (plan, is_new) = self.plans.get_or_replace(region, &candidates, force_new, || {
            self.balancer.random_assignment(region, &candidates)
        })?;
        if is_new {
            tracing::debug!(
                region = %region,
                destination = ?plan.destination.as_ref().map(ToString::to_string),
                "new region plan"
            );
        }
        Some(plan)
    }

    /// Record that `region` had nowhere to go and keep it in transition so
    /// the timeout monitor picks it up once servers appear.
    fn no_servers(&self, region: &RegionInfo) -> Error {
        tracing::warn!(region = %region, "no region servers available, leaving region offline");
        self.set_all_servers_offline(true);
        self.region_states
            .update_region_state(region, RegionState::Offline, None);
        Error::NoServersAvailable(region.to_string())
    }

    // ── Assign ──────────────────────────────────────────────────────

    /// Open `region` somewhere.
    ///
    /// With `set_offline` the transition node is forced to OFFLINE first;
    /// `force_new_plan` discards any existing plan. Returns once an open
    /// request was accepted by a region server, or after the configured
    /// attempts, leaving the region to the timeout monitor.
    pub async fn assign(
        &self,
        region: &RegionInfo,
        set_offline: bool,
        force_new_plan: bool,
    ) -> Result<()> {
        let _lock = self.locker.acquire(&region.encoded_name()).await;
        self.assign_locked(region, set_offline, force_new_plan, None)
            .await
    }

    async fn assign_locked(
        &self,
        region: &RegionInfo,
        set_offline: bool,
        force_new_plan: bool,
        exclude: Option<&ServerName>,
    ) -> Result<()> {
        let current = self.region_states.create_region_state(region);
        if current.is_open() {
            tracing::debug!(region = %region, "region already open, not assigning");
            return Ok(());
        }
        if self.table_states.is_disabling_or_disabled(&region.table) {
            tracing::info!(region = %region, table = %region.table, "table is disabled, not assigning");
            return self.offline_disabled_region(region).await;
        }

        let mut offline_version: Option<i64> = None;
        let mut plan: Option<RegionPlan> = None;
        let mut startup_deadline: Option<Instant> = None;
        let mut attempt = 0;

        while attempt < self.config.max_attempts {
            if self.is_aborted() {
                return Err(Error::Aborted(format!("assignment of {region} interrupted")));
            }
            attempt += 1;

            if set_offline && offline_version.is_none() {
                match self.set_offline_in_coordination(region).await? {
                    Some(version) => offline_version = Some(version),
                    None => return Ok(()),
                }
            }

            let current = match plan.take() {
                Some(plan) => plan,
                None => match self.region_plan(region, exclude, force_new_plan) {
                    Some(plan) => plan,
                    None => return Err(self.no_servers(region)),
                },
            };
            let Some(destination) = current.destination.clone() else {
                return Err(self.no_servers(region));
            };

            self.region_states.update_region_state(
                region,
                RegionState::PendingOpen,
                Some(destination.clone()),
            );
            metrics::counter!(ASSIGN_ATTEMPTS).increment(1);
            tracing::debug!(
                region = %region,
                server = %destination,
                attempt,
                version = ?offline_version,
                "sending open"
            );

            let failure = match self
                .call_rpc(self.rpc.open_region(&destination, region, offline_version))
                .await
            {
                Ok(OpenOutcome::Opened) => return Ok(()),
                Ok(OpenOutcome::AlreadyOpened) => {
                    return self.process_already_opened(region, &destination).await
                }
                Ok(OpenOutcome::FailedOpening) => {
                    RpcError::Other("region server failed to open the region".to_string())
                }
                Err(e) => e,
            };
            metrics::counter!(OPEN_RPC_FAILURES).increment(1);

            let retry_same = match &failure {
                RpcError::RegionAlreadyInTransition => {
                    // Only a refresh until the startup wait runs out, then
                    // each retry counts.
                    let deadline = *startup_deadline
                        .get_or_insert_with(|| Instant::now() + self.config.server_startup_wait);
                    if Instant::now() < deadline {
                        attempt -= 1;
                    }
                    tokio::time::sleep(self.config.server_startup_retry_interval).await;
                    true
                }
                RpcError::ServerNotRunningYet => {
                    let deadline = *startup_deadline
                        .get_or_insert_with(|| Instant::now() + self.config.server_startup_wait);
                    if Instant::now() < deadline {
                        tokio::time::sleep(self.config.server_startup_retry_interval).await;
                        attempt -= 1;
                        true
                    } else {
                        false
                    }
                }
                RpcError::SocketTimeout => self.server_manager.is_server_online(&destination),
                _ => false,
            };
            tracing::warn!(
                region = %region,
                server = %destination,
                attempt,
                max_attempts = self.config.max_attempts,
                error = %failure,
                retry_same,
                "failed to open region"
            );

            if retry_same {
                self.region_states.update_timestamp(region);
                plan = Some(current);
                continue;
            }

            // Another server if there is one, otherwise the same one again.
            let exclude_failed = (!self
                .server_manager
                .destination_servers(Some(&destination))
                .is_empty())
            .then_some(&destination);
            let Some(next) = self.region_plan(region, exclude_failed, true) else {
                return Err(self.no_servers(region));
            };
            if !next.same_destination(&current) {
                self.region_states
                    .update_region_state(region, RegionState::Offline, None);
                offline_version = None;
            }
            plan = Some(next);
        }

        tracing::warn!(
            region = %region,
            attempts = self.config.max_attempts,
            "giving up on assignment for now, the timeout monitor will retry"
        );
        Ok(())
    }

    /// Returns the OFFLINE node version, or `None` if the assignment must be
    /// abandoned.
    async fn set_offline_in_coordination(&self, region: &RegionInfo) -> Result<Option<i64>> {
        if let Some(current) = self.region_states.get_region_state(region) {
            if !current.is_offline() && !current.is_closed() {
                tracing::warn!(
                    region = %region,
                    state = %current.state,
                    "unexpected state when forcing offline, abandoning assignment"
                );
                return Ok(None);
            }
        }
        self.region_states
            .update_region_state(region, RegionState::Offline, None);
        match transition::create_or_force_node_offline(
            self.coordination.as_ref(),
            region,
            &self.master,
        )
        .await?
        {
            Some(version) => Ok(Some(version)),
            None => self.resolve_refused_offline(region).await,
        }
    }

    /// The node could not be forced offline because a region server wrote
    /// it. Follow a live server's transition; take the node back from a
    /// dead one.
    async fn resolve_refused_offline(&self, region: &RegionInfo) -> Result<Option<i64>> {
        let encoded = region.encoded_name();
        let node = match transition::read(self.coordination.as_ref(), &encoded).await {
            Ok(Some(node)) => node,
            Ok(None) | Err(Error::MalformedTransition(..)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let rt = &node.transition;
        let origin_online = self.server_manager.is_server_online(&rt.origin);
        match rt.event_type {
            EventType::RegionOpening | EventType::RegionOpened if origin_online => {
                tracing::info!(
                    region = %region,
                    server = %rt.origin,
                    event = %rt.event_type,
                    "region server already acting on region, following its transition"
                );
                self.region_states.update_region_state(
                    region,
                    RegionState::Opening,
                    Some(rt.origin.clone()),
                );
                if rt.event_type == EventType::RegionOpened {
                    self.submit_transition(encoded);
                }
                Ok(None)
            }
            EventType::RegionOpening | EventType::RegionOpened if !origin_online => {
                tracing::info!(
                    region = %region,
                    server = %rt.origin,
                    event = %rt.event_type,
                    "taking region back from a server that is gone"
                );
                transition::force_node_offline(
                    self.coordination.as_ref(),
                    region,
                    &self.master,
                    node.version,
                )
                .await
            }
            event => {
                tracing::warn!(
                    region = %region,
                    event = %event,
                    origin = %rt.origin,
                    "transition node owned by another actor, abandoning assignment"
                );
                Ok(None)
            }
        }
    }

    async fn process_already_opened(&self, region: &RegionInfo, server: &ServerName) -> Result<()> {
        tracing::info!(region = %region, server = %server, "region was already open on destination");
        transition::delete_node(
            self.coordination.as_ref(),
            &region.encoded_name(),
            EventType::MasterRegionOffline,
            None,
        )
        .await?;
        self.mark_online(region, server).await;
        Ok(())
    }

    async fn mark_online(&self, region: &RegionInfo, server: &ServerName) {
        self.region_states.region_online(region, server.clone());
        self.plans.remove(region);
        if let Err(e) = self.catalog.update_location(region, server).await {
            tracing::warn!(region = %region, error = %e, "failed to record region location in catalog");
        }
    }

    // ── Unassign ────────────────────────────────────────────────────

    /// Close `region` on the server hosting it. With `force`, a close that
    /// is already pending is sent again. `destination` is passed along to
    /// the region server as a hint.
    pub async fn unassign(
        &self,
        region: &RegionInfo,
        force: bool,
        destination: Option<ServerName>,
    ) -> Result<()> {
        let _lock = self.locker.acquire(&region.encoded_name()).await;
        self.unassign_locked(region, force, destination.as_ref())
            .await
    }

    async fn unassign_locked(
        &self,
        region: &RegionInfo,
        force: bool,
        destination: Option<&ServerName>,
    ) -> Result<()> {
        let (server, version) = match self.region_states.region_in_transition(region) {
            None => {
                let Some(server) = self.region_states.get_region_server(region) else {
                    tracing::debug!(region = %region, "region not assigned, nothing to close");
                    return Ok(());
                };
                match transition::create_node_closing(
                    self.coordination.as_ref(),
                    region,
                    &self.master,
                )
                .await?
                {
                    Some(version) => {
                        self.region_states.update_region_state(
                            region,
                            RegionState::PendingClose,
                            Some(server.clone()),
                        );
                        (server, Some(version))
                    }
                    None => {
                        self.explain_existing_node(region).await?;
                        return Ok(());
                    }
                }
            }
            Some(rit) if force && (rit.is_pending_close() || rit.is_closing()) => {
                let Some(server) = rit.server.clone() else {
                    return Ok(());
                };
                self.region_states.update_timestamp(region);
                let version =
                    match transition::read(self.coordination.as_ref(), &region.encoded_name())
                        .await
                    {
                        Ok(Some(node))
                            if matches!(
                                node.transition.event_type,
                                EventType::MasterRegionClosing | EventType::RegionClosing
                            ) =>
                        {
                            Some(node.version)
                        }
                        Ok(_) | Err(Error::MalformedTransition(..)) => None,
                        Err(e) => return Err(e),
                    };
                tracing::info!(region = %region, server = %server, "resending close");
                (server, version)
            }
            Some(rit) => {
                tracing::debug!(region = %region, state = %rit.state, "region in transition, not closing");
                return Ok(());
            }
        };

        if !self.server_manager.is_server_online(&server) {
            tracing::info!(region = %region, server = %server, "hosting server is gone, treating region as closed");
            return self.treat_as_closed(region).await;
        }

        match self
            .call_rpc(
                self.rpc
                    .close_region(&server, region, version, destination, true),
            )
            .await
        {
            Ok(true) => {
                tracing::debug!(region = %region, server = %server, "sent close");
            }
            Ok(false) => {
                tracing::warn!(region = %region, server = %server, "region server declined to close region");
            }
            Err(e) => {
                metrics::counter!(CLOSE_RPC_FAILURES).increment(1);
                match e {
                    RpcError::NotServingRegion => {
                        tracing::info!(region = %region, server = %server, "server is not serving region, treating it as closed");
                        return self.treat_as_closed(region).await;
                    }
                    RpcError::RegionAlreadyInTransition => {
                        self.region_states.update_timestamp(region);
                    }
                    e if !self.server_manager.is_server_online(&server) => {
                        tracing::info!(region = %region, server = %server, error = %e, "close failed and server is gone");
                        return self.treat_as_closed(region).await;
                    }
                    e => {
                        tracing::warn!(region = %region, server = %server, error = %e, "failed to send close");
                    }
                }
            }
        }
        Ok(())
    }

    /// Log why a CLOSING node could not be created.
    async fn explain_existing_node(&self, region: &RegionInfo) -> Result<()> {
        match transition::read(self.coordination.as_ref(), &region.encoded_name()).await {
            Ok(Some(node))
                if matches!(
                    node.transition.event_type,
                    EventType::RegionSplitting | EventType::RegionSplit
                ) =>
            {
                tracing::info!(region = %region, "region is splitting, not closing");
            }
            Ok(Some(node)) => {
                tracing::warn!(
                    region = %region,
                    event = %node.transition.event_type,
                    "transition node already exists, not closing"
                );
            }
            Ok(None) => {
                tracing::debug!(region = %region, "transition node vanished, presuming split");
            }
            Err(Error::MalformedTransition(path, e)) => {
                tracing::warn!(path = %path, error = %e, "malformed transition node blocks close");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn treat_as_closed(&self, region: &RegionInfo) -> Result<()> {
        self.region_states
            .update_region_state(region, RegionState::Closed, None);
        self.complete_close_locked(region).await
    }

    /// A close finished: offline the region if its table is going away,
    /// otherwise open it again.
    async fn complete_close_locked(&self, region: &RegionInfo) -> Result<()> {
        match self.region_states.region_in_transition(region) {
            Some(rit) if rit.is_closed() || rit.is_pending_close() || rit.is_closing() => {}
            _ => {
                tracing::debug!(region = %region, "close already handled");
                return Ok(());
            }
        }
        if self.table_states.is_disabling_or_disabled(&region.table) {
            return self.offline_disabled_region(region).await;
        }
        self.region_states.region_offline(region);
        self.assign_locked(region, true, false, None).await
    }

    pub(crate) fn spawn_complete_close(&self, region: RegionInfo) {
        self.spawn_region_task("close completion", region, |am, region| async move {
            let _lock = am.locker.acquire(&region.encoded_name()).await;
            am.complete_close_locked(&region).await
        });
    }

    async fn offline_disabled_region(&self, region: &RegionInfo) -> Result<()> {
        let encoded = region.encoded_name();
        if !transition::delete_closing_or_closed_node(self.coordination.as_ref(), &encoded).await?
        {
            transition::delete_node(
                self.coordination.as_ref(),
                &encoded,
                EventType::MasterRegionOffline,
                None,
            )
            .await?;
        }
        tracing::info!(region = %region, "table disabled, region offline");
        self.region_offline(region);
        Ok(())
    }

    /// The region is no longer served and nothing is pending for it.
    pub fn region_offline(&self, region: &RegionInfo) {
        self.region_states.region_offline(region);
        self.plans.remove(region);
    }

    /// Move a region according to `plan`: record the plan, then close the
    /// region; the reopen after the close follows the plan.
    pub async fn balance(&self, plan: RegionPlan) -> Result<()> {
        tracing::info!(
            region = %plan.region,
            source = ?plan.source.as_ref().map(ToString::to_string),
            destination = ?plan.destination.as_ref().map(ToString::to_string),
            "moving region"
        );
        let region = plan.region.clone();
        let destination = plan.destination.clone();
        self.plans.set(plan);
        self.unassign(&region, false, destination).await
    }

    // ── Timeouts ────────────────────────────────────────────────────

    /// An OFFLINE or PENDING_OPEN region sat too long: assign it again with
    /// a new plan. `observed_stamp` is the stamp the timeout was computed
    /// from; if the region moved since, nothing is done.
    pub async fn retry_stuck_assignment(&self, region: &RegionInfo, observed_stamp: i64) -> Result<()> {
        let _lock = self.locker.acquire(&region.encoded_name()).await;
        match self.region_states.region_in_transition(region) {
            Some(rit)
                if (rit.is_offline() || rit.is_pending_open()) && rit.stamp == observed_stamp => {}
            _ => return Ok(()),
        }
        self.region_states
            .update_region_state(region, RegionState::Offline, None);
        self.assign_locked(region, true, true, None).await
    }

    /// A region sat in OPENING too long: take the node back unless the
    /// server managed to finish in the meantime, then assign elsewhere.
    pub async fn retry_stuck_opening(&self, region: &RegionInfo, observed_stamp: i64) -> Result<()> {
        let _lock = self.locker.acquire(&region.encoded_name()).await;
        match self.region_states.region_in_transition(region) {
            Some(rit) if rit.is_opening() && rit.stamp == observed_stamp => {}
            _ => return Ok(()),
        }
        let node = match transition::read(self.coordination.as_ref(), &region.encoded_name()).await
        {
            Ok(node) => node,
            Err(Error::MalformedTransition(path, e)) => {
                tracing::warn!(path = %path, error = %e, "malformed transition node for stuck region");
                None
            }
            Err(e) => return Err(e),
        };
        match node {
            Some(node) if node.transition.event_type == EventType::RegionOpened => {
                tracing::debug!(region = %region, "region opened meanwhile, leaving it to the event handler");
                return Ok(());
            }
            Some(node)
                if matches!(
                    node.transition.event_type,
                    EventType::RegionOpening | EventType::RegionFailedOpen
                ) =>
            {
                if transition::force_node_offline(
                    self.coordination.as_ref(),
                    region,
                    &self.master,
                    node.version,
                )
                .await?
                .is_none()
                {
                    tracing::info!(region = %region, "region server moved the node, not reassigning");
                    return Ok(());
                }
            }
            Some(node) => {
                tracing::warn!(
                    region = %region,
                    event = %node.transition.event_type,
                    "unexpected transition node for opening region"
                );
                return Ok(());
            }
            None => {
                tracing::warn!(region = %region, "opening region has no transition node");
            }
        }
        self.region_states
            .update_region_state(region, RegionState::Offline, None);
        self.assign_locked(region, true, true, None).await
    }

    // ── Waiting ─────────────────────────────────────────────────────

    /// Block until `region` is open and out of transition.
    pub async fn wait_for_assignment(&self, region: &RegionInfo) -> Result<()> {
        loop {
            if self.region_states.is_region_online(region)
                && !self.region_states.is_region_in_transition(region)
            {
                return Ok(());
            }
            if self.is_aborted() {
                return Err(Error::Aborted(format!("waiting for {region}")));
            }
            self.region_states
                .wait_for_update(Duration::from_millis(100))
                .await;
        }
    }

    /// Returns false if regions were still in transition after `timeout`.
    pub async fn wait_until_no_regions_in_transition(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.region_states.has_regions_in_transition() {
                return true;
            }
            if Instant::now() >= deadline || self.is_aborted() {
                return false;
            }
            self.region_states
                .wait_for_update(Duration::from_millis(100))
                .await;
        }
    }

    // ── Server shutdown ─────────────────────────────────────────────

    /// Process the death of `server`: everything it held is reassigned and
    /// everything that was in transition on it is handed to the timeout
    /// monitor immediately. Returns the in-transition records involved.
    pub fn process_server_shutdown(&self, server: &ServerName) -> Vec<RegionStateRecord> {
        metrics::counter!(SERVER_SHUTDOWNS).increment(1);
        let was_online = self.server_manager.expire_server(server);
        let dropped_plans = self.plans.remove_for_destination(server);
        let outcome = self.region_states.expire_server_regions(server);
        tracing::info!(
            server = %server,
            was_online,
            held = outcome.held.len(),
            in_transition = outcome.in_transition.len(),
            dropped_plans = dropped_plans.len(),
            "processing server shutdown"
        );

        for record in &outcome.in_transition {
            self.region_states.reset_timestamp(&record.region);
        }
        if !outcome.in_transition.is_empty() {
            self.timeout_wakeup.notify_one();
        }

        // Catalog regions come first in `held` and the pool is FIFO.
        for region in outcome.held {
            if region.is_split_parent() {
                continue;
            }
            if self.table_states.is_disabling_or_disabled(&region.table) {
                self.region_offline(&region);
                continue;
            }
            self.spawn_assign(region, true);
        }
        outcome.in_transition
    }
}
