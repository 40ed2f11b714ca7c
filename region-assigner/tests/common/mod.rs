#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use region_assigner::assignment::{AssignmentConfig, AssignmentManager};
use region_assigner::bulk_assigner::BulkAssignConfig;
use region_assigner::catalog::{CatalogRow, CatalogTable, CoordinationCatalog, RegionFileSystem};
use region_assigner::catalog_janitor::JanitorConfig;
use region_assigner::error::Result;
use region_assigner::master::{Master, MasterConfig};
use region_assigner::paths;
use region_assigner::rpc::{RegionServerRpc, RpcError};
use region_assigner::timeout_monitor::TimeoutMonitorConfig;
use region_assigner::transition;
use region_assigner::types::{
    EventType, OpenOutcome, RegionInfo, ServerName, ServerRegistration, TableName,
};
use region_coordination::memory::MemoryCoordination;
use region_coordination::util::now_millis;
use region_coordination::CoordinationClient;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const REGION_SERVER_PORT: u16 = 16020;

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

pub async fn wait_until<F>(f: F)
where
    F: Fn() -> bool,
{
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || std::future::ready(f())).await
}

// ── Regions ─────────────────────────────────────────────────────

/// `n` regions covering the whole key space of `table`.
pub fn table_regions(table: &str, n: usize) -> Vec<RegionInfo> {
    let table = TableName::new(table);
    let mut regions = Vec::with_capacity(n);
    let mut start: Vec<u8> = Vec::new();
    for i in 0..n {
        let end = if i + 1 == n {
            Vec::new()
        } else {
            format!("row{:03}", i + 1).into_bytes()
        };
        regions.push(RegionInfo::new(table.clone(), &start, &end, 1));
        start = end;
    }
    regions
}

pub fn catalog_region() -> RegionInfo {
    RegionInfo::new(TableName::catalog(), b"", b"", 0)
}

// ── Simulated region servers ────────────────────────────────────

/// How a simulated region server answers the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Accept and walk the node through OPENING/OPENED or CLOSING/CLOSED.
    Normal,
    /// Accept the open, then report FAILED_OPEN.
    FailOpen,
    /// Refuse with "not running yet".
    NotRunningYet,
    /// Every call fails to connect.
    Unreachable,
    /// Accept every request and never touch the node.
    Silent,
}

#[derive(Default)]
struct FakeState {
    behaviors: HashMap<ServerName, Behavior>,
    hosted: HashMap<ServerName, HashSet<RegionInfo>>,
    opens: HashMap<ServerName, usize>,
    batched_opens: HashMap<ServerName, usize>,
    single_opens: HashMap<RegionInfo, usize>,
    closes: HashMap<ServerName, usize>,
    fail_next_open: HashSet<RegionInfo>,
    in_transition_refusals: HashMap<ServerName, usize>,
}

/// Region servers answering RPCs in-process and writing transition nodes
/// the way real ones would.
pub struct FakeRegionServers {
    coordination: Arc<dyn CoordinationClient>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeRegionServers {
    pub fn new(coordination: Arc<dyn CoordinationClient>) -> Self {
        Self {
            coordination,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn set_behavior(&self, server: &ServerName, behavior: Behavior) {
        self.state.lock().behaviors.insert(server.clone(), behavior);
    }

    fn behavior(&self, server: &ServerName) -> Behavior {
        self.state
            .lock()
            .behaviors
            .get(server)
            .copied()
            .unwrap_or(Behavior::Normal)
    }

    /// The next open of `region`, on any server, answers FAILED_OPENING.
    pub fn fail_next_open(&self, region: &RegionInfo) {
        self.state.lock().fail_next_open.insert(region.clone());
    }

    /// Refuse the next `times` opens on `server` as already in transition.
    pub fn refuse_as_in_transition(&self, server: &ServerName, times: usize) {
        self.state
            .lock()
            .in_transition_refusals
            .insert(server.clone(), times);
    }

    /// Regions requested from `server`, batched or not, answered or not.
    pub fn open_count(&self, server: &ServerName) -> usize {
        self.state.lock().opens.get(server).copied().unwrap_or(0)
    }

    pub fn batched_open_count(&self, server: &ServerName) -> usize {
        self.state.lock().batched_opens.get(server).copied().unwrap_or(0)
    }

    /// Single-region open requests for `region`.
    pub fn single_open_count(&self, region: &RegionInfo) -> usize {
        self.state.lock().single_opens.get(region).copied().unwrap_or(0)
    }

    pub fn close_count(&self, server: &ServerName) -> usize {
        self.state.lock().closes.get(server).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.state.lock().opens.values().sum()
    }

    pub fn hosts(&self, server: &ServerName, region: &RegionInfo) -> bool {
        self.state
            .lock()
            .hosted
            .get(server)
            .is_some_and(|regions| regions.contains(region))
    }

    pub fn hosted(&self, server: &ServerName) -> Vec<RegionInfo> {
        self.state
            .lock()
            .hosted
            .get(server)
            .map(|regions| regions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pretend `server` already serves `region` without the master's help.
    pub fn host(&self, server: &ServerName, region: &RegionInfo) {
        self.state
            .lock()
            .hosted
            .entry(server.clone())
            .or_default()
            .insert(region.clone());
    }

    /// The process died: it serves nothing and answers nothing.
    pub fn kill(&self, server: &ServerName) {
        let mut state = self.state.lock();
        state.hosted.remove(server);
        state.behaviors.insert(server.clone(), Behavior::Unreachable);
    }

    fn start_open(&self, server: &ServerName, region: &RegionInfo, version: Option<i64>) -> OpenOutcome {
        if self.state.lock().fail_next_open.remove(region) {
            return OpenOutcome::FailedOpening;
        }
        let fail = match self.behavior(server) {
            Behavior::Normal => false,
            Behavior::FailOpen => true,
            _ => return OpenOutcome::Opened,
        };
        if self.hosts(server, region) {
            return OpenOutcome::AlreadyOpened;
        }
        tokio::spawn(open_and_report(
            Arc::clone(&self.coordination),
            Arc::clone(&self.state),
            server.clone(),
            region.clone(),
            version,
            fail,
        ));
        OpenOutcome::Opened
    }

    /// Split `parent`, open on `server`, at `split_key` the way a region
    /// server does: SPLITTING, then SPLIT carrying both daughters.
    pub async fn split(
        &self,
        server: &ServerName,
        parent: &RegionInfo,
        split_key: &[u8],
    ) -> (RegionInfo, RegionInfo) {
        let (a, b) = parent.daughters(split_key, parent.region_id + 1);
        let splitting = transition::create_node_splitting(self.coordination.as_ref(), parent, server)
            .await
            .unwrap()
            .expect("no other transition should be pending");
        {
            let mut state = self.state.lock();
            let hosted = state.hosted.entry(server.clone()).or_default();
            hosted.remove(parent);
            hosted.insert(a.clone());
            hosted.insert(b.clone());
        }
        transition::transition_to_split(self.coordination.as_ref(), parent, server, splitting, &a, &b)
            .await
            .unwrap()
            .expect("split node should move forward");
        (a, b)
    }
}

async fn current_version(coordination: &dyn CoordinationClient, region: &RegionInfo) -> Option<i64> {
    match transition::read(coordination, &region.encoded_name()).await {
        Ok(Some(node)) => Some(node.version),
        _ => None,
    }
}

async fn open_and_report(
    coordination: Arc<dyn CoordinationClient>,
    state: Arc<Mutex<FakeState>>,
    server: ServerName,
    region: RegionInfo,
    version: Option<i64>,
    fail: bool,
) {
    let version = match version {
        Some(v) => v,
        None => match current_version(coordination.as_ref(), &region).await {
            Some(v) => v,
            None => return,
        },
    };
    let Ok(Some(opening)) =
        transition::transition_to_opening(coordination.as_ref(), &region, &server, version).await
    else {
        return;
    };
    if fail {
        drop(transition::transition_to_failed_open(coordination.as_ref(), &region, &server, opening).await);
        return;
    }
    state
        .lock()
        .hosted
        .entry(server.clone())
        .or_default()
        .insert(region.clone());
    drop(transition::transition_to_opened(coordination.as_ref(), &region, &server, opening).await);
}

async fn close_and_report(
    coordination: Arc<dyn CoordinationClient>,
    server: ServerName,
    region: RegionInfo,
    version: Option<i64>,
) {
    let version = match version {
        Some(v) => v,
        None => match current_version(coordination.as_ref(), &region).await {
            Some(v) => v,
            None => return,
        },
    };
    let Ok(Some(closing)) =
        transition::transition_to_closing(coordination.as_ref(), &region, &server, version).await
    else {
        return;
    };
    drop(
        transition::transition_to_closed(
            coordination.as_ref(),
            &region,
            &server,
            EventType::RegionClosing,
            closing,
        )
        .await,
    );
}

#[async_trait]
impl RegionServerRpc for FakeRegionServers {
    async fn open_region(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        version: Option<i64>,
    ) -> std::result::Result<OpenOutcome, RpcError> {
        {
            let mut state = self.state.lock();
            *state.opens.entry(server.clone()).or_default() += 1;
            *state.single_opens.entry(region.clone()).or_default() += 1;
            if let Some(refusals) = state.in_transition_refusals.get_mut(server) {
                if *refusals > 0 {
                    *refusals -= 1;
                    return Err(RpcError::RegionAlreadyInTransition);
                }
            }
        }
        match self.behavior(server) {
            Behavior::NotRunningYet => Err(RpcError::ServerNotRunningYet),
            Behavior::Unreachable => Err(RpcError::ConnectionRefused),
            _ => Ok(self.start_open(server, region, version)),
        }
    }

    async fn open_regions(
        &self,
        server: &ServerName,
        regions: &[(RegionInfo, i64)],
    ) -> std::result::Result<Vec<OpenOutcome>, RpcError> {
        {
            let mut state = self.state.lock();
            *state.opens.entry(server.clone()).or_default() += regions.len();
            *state.batched_opens.entry(server.clone()).or_default() += 1;
        }
        match self.behavior(server) {
            Behavior::NotRunningYet => Err(RpcError::ServerNotRunningYet),
            Behavior::Unreachable => Err(RpcError::ConnectionRefused),
            _ => Ok(regions
                .iter()
                .map(|(region, version)| self.start_open(server, region, Some(*version)))
                .collect()),
        }
    }

    async fn close_region(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        version: Option<i64>,
        _destination: Option<&ServerName>,
        transition_in_coordination: bool,
    ) -> std::result::Result<bool, RpcError> {
        let behavior = self.behavior(server);
        if behavior == Behavior::Unreachable {
            return Err(RpcError::ConnectionRefused);
        }
        {
            let mut state = self.state.lock();
            *state.closes.entry(server.clone()).or_default() += 1;
            let served = state
                .hosted
                .get_mut(server)
                .is_some_and(|regions| regions.remove(region));
            if !served {
                return Err(RpcError::NotServingRegion);
            }
        }
        if behavior != Behavior::Silent && transition_in_coordination {
            tokio::spawn(close_and_report(
                Arc::clone(&self.coordination),
                server.clone(),
                region.clone(),
                version,
            ));
        }
        Ok(true)
    }
}

// ── Region storage ──────────────────────────────────────────────

#[derive(Default)]
pub struct FakeFileSystem {
    references: Mutex<HashSet<RegionInfo>>,
    archived: Mutex<Vec<RegionInfo>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    held_checks: AtomicUsize,
}

impl FakeFileSystem {
    pub fn set_references(&self, region: &RegionInfo, has_references: bool) {
        let mut references = self.references.lock();
        if has_references {
            references.insert(region.clone());
        } else {
            references.remove(region);
        }
    }

    pub fn archived(&self) -> Vec<RegionInfo> {
        self.archived.lock().clone()
    }

    /// Make reference checks wait until a permit is added to the returned
    /// semaphore.
    pub fn hold_reference_checks(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Reference checks currently waiting on the gate.
    pub fn held_reference_checks(&self) -> usize {
        self.held_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegionFileSystem for FakeFileSystem {
    async fn has_references(&self, region: &RegionInfo) -> Result<bool> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            self.held_checks.fetch_add(1, Ordering::SeqCst);
            drop(gate.acquire().await);
            self.held_checks.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(self.references.lock().contains(region))
    }

    async fn archive_region(&self, region: &RegionInfo) -> Result<()> {
        self.archived.lock().push(region.clone());
        Ok(())
    }
}

// ── Cluster ─────────────────────────────────────────────────────

/// Short timeouts, no periodic balancer or janitor: tests trigger those
/// explicitly.
pub fn test_config() -> MasterConfig {
    MasterConfig {
        assignment: AssignmentConfig {
            max_attempts: 5,
            server_startup_wait: Duration::from_secs(2),
            server_startup_retry_interval: Duration::from_millis(20),
            rpc_timeout: Duration::from_secs(2),
            dispatcher_workers: 4,
            rpc_workers: 8,
        },
        bulk_assign: BulkAssignConfig {
            max_concurrency: 4,
            per_region_open_time: Duration::from_millis(100),
            max_wait: Duration::from_secs(5),
        },
        timeout_monitor: TimeoutMonitorConfig {
            period: Duration::from_millis(100),
            timeout: Duration::from_secs(60),
            catalog_timeout: Duration::from_secs(60),
            rit_warning_threshold: Duration::from_secs(60),
        },
        janitor: JanitorConfig {
            interval: Duration::from_secs(3600),
            enabled: false,
        },
        balancer_period: Duration::from_secs(3600),
        balancer_enabled: false,
    }
}

pub struct TestCluster {
    pub coordination: MemoryCoordination,
    pub rpc: Arc<FakeRegionServers>,
    pub catalog: Arc<CoordinationCatalog>,
    pub fs: Arc<FakeFileSystem>,
    pub master: Arc<Master>,
    config: MasterConfig,
    cancel: CancellationToken,
    master_task: Option<JoinHandle<Result<()>>>,
    sessions: HashMap<ServerName, MemoryCoordination>,
    next_start_code: i64,
}

impl TestCluster {
    pub fn new(config: MasterConfig) -> Self {
        let coordination = MemoryCoordination::new();
        let simulated: Arc<dyn CoordinationClient> = Arc::new(coordination.session());
        let rpc = Arc::new(FakeRegionServers::new(simulated));
        let master_client: Arc<dyn CoordinationClient> = Arc::new(coordination.clone());
        let catalog = Arc::new(CoordinationCatalog::new(Arc::clone(&master_client)));
        let fs = Arc::new(FakeFileSystem::default());
        let master = Self::build_master(&coordination, &rpc, &catalog, &fs, &config);
        Self {
            coordination,
            rpc,
            catalog,
            fs,
            master,
            config,
            cancel: CancellationToken::new(),
            master_task: None,
            sessions: HashMap::new(),
            next_start_code: 1,
        }
    }

    #[allow(trivial_casts)]
    fn build_master(
        coordination: &MemoryCoordination,
        rpc: &Arc<FakeRegionServers>,
        catalog: &Arc<CoordinationCatalog>,
        fs: &Arc<FakeFileSystem>,
        config: &MasterConfig,
    ) -> Arc<Master> {
        Arc::new(Master::new(
            ServerName::new("master", 16000, now_millis()),
            Arc::new(coordination.clone()),
            Arc::clone(rpc) as Arc<dyn RegionServerRpc>,
            Arc::clone(catalog) as Arc<dyn CatalogTable>,
            Arc::clone(fs) as Arc<dyn RegionFileSystem>,
            config.clone(),
        ))
    }

    pub fn am(&self) -> &Arc<AssignmentManager> {
        self.master.assignment_manager()
    }

    /// Register a region server the way a real one does: an ephemeral node
    /// under `/rs` bound to its own session.
    pub async fn add_server(&mut self, host: &str) -> ServerName {
        let server = ServerName::new(host, REGION_SERVER_PORT, self.next_start_code);
        self.next_start_code += 1;
        self.register(&server).await;
        server
    }

    /// A new incarnation of `host` with a fresh start code.
    pub async fn restart_server(&mut self, previous: &ServerName) -> ServerName {
        self.rpc.kill(previous);
        let server = ServerName::new(previous.host.clone(), previous.port, self.next_start_code);
        self.next_start_code += 1;
        self.register(&server).await;
        server
    }

    async fn register(&mut self, server: &ServerName) {
        let session = self.coordination.session();
        let registration = ServerRegistration {
            server: server.clone(),
            registered_at: now_millis(),
        };
        session
            .create_ephemeral(
                &paths::server_node(server),
                serde_json::to_vec(&registration).unwrap(),
            )
            .await
            .unwrap();
        self.sessions.insert(server.clone(), session);
    }

    /// The server process dies and its session expires.
    pub fn kill_server(&mut self, server: &ServerName) {
        self.rpc.kill(server);
        if let Some(session) = self.sessions.remove(server) {
            session.expire();
        }
    }

    pub async fn seed_catalog(&self, regions: &[RegionInfo]) {
        for region in regions {
            self.catalog
                .put(CatalogRow::new(region.clone(), None))
                .await
                .unwrap();
        }
    }

    pub fn start_master(&mut self) {
        let master = Arc::clone(&self.master);
        let token = self.cancel.child_token();
        self.master_task = Some(tokio::spawn(async move { master.run(token).await }));
    }

    pub async fn start_and_wait_ready(&mut self) {
        self.start_master();
        let master = Arc::clone(&self.master);
        wait_until(move || master.is_ready()).await;
    }

    /// Stop the running master and start a fresh one over the same
    /// coordination state, as after a failover.
    pub async fn fail_over(&mut self) {
        self.stop_master().await;
        self.cancel = CancellationToken::new();
        self.master = Self::build_master(&self.coordination, &self.rpc, &self.catalog, &self.fs, &self.config);
        self.start_and_wait_ready().await;
    }

    pub async fn stop_master(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.master_task.take() {
            drop(task.await);
        }
    }

    pub async fn wait_online(&self, regions: &[RegionInfo]) {
        let am = Arc::clone(self.am());
        let regions = regions.to_vec();
        wait_until(move || {
            regions.iter().all(|r| {
                am.region_states().is_region_online(r) && !am.region_states().is_region_in_transition(r)
            })
        })
        .await;
    }

    pub async fn wait_no_transition_nodes(&self) {
        let client = self.coordination.clone();
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, move || {
            let client = client.clone();
            async move {
                client
                    .list_children(paths::UNASSIGNED_DIR)
                    .await
                    .map(|children| children.is_empty())
                    .unwrap_or(false)
            }
        })
        .await;
    }

    /// Wait until the catalog records a location for every region in
    /// `regions` that matches the in-memory assignment.
    pub async fn wait_catalog_locations(&self, regions: &[RegionInfo]) {
        let catalog = Arc::clone(&self.catalog);
        let am = Arc::clone(self.am());
        let regions = regions.to_vec();
        wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, move || {
            let catalog = Arc::clone(&catalog);
            let am = Arc::clone(&am);
            let regions = regions.clone();
            async move {
                for region in &regions {
                    let Ok(Some(row)) = catalog.get(region).await else {
                        return false;
                    };
                    if row.server.is_none() || row.server != am.region_states().get_region_server(region) {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    pub fn server_of(&self, region: &RegionInfo) -> Option<ServerName> {
        self.am().region_states().get_region_server(region)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
