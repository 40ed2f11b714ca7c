use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::{
    CasOutcome, CoordinationClient, ExpectedVersion, NodeEvent, NodeEventKind, Versioned,
    WatchReceiver,
};
use crate::error::{Error, Result};

struct Node {
    data: Vec<u8>,
    version: i64,
    ephemeral_owner: Option<i64>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

#[derive(Default)]
struct Namespace {
    nodes: BTreeMap<String, Node>,
    watchers: Vec<Watcher>,
    next_session: i64,
    expired: HashSet<i64>,
}

impl Namespace {
    fn notify(&mut self, kind: NodeEventKind, path: &str) {
        self.watchers.retain(|w| {
            if !path.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx
                .send(NodeEvent {
                    kind,
                    path: path.to_string(),
                })
                .is_ok()
        });
    }
}

/// In-process coordination service.
///
/// All clients created through [`MemoryCoordination::session`] share one
/// namespace, so a test can run a master and several region servers against
/// the same tree and kill a region server by expiring its session.
#[derive(Clone)]
pub struct MemoryCoordination {
    namespace: Arc<Mutex<Namespace>>,
    session: i64,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let namespace = Namespace {
            next_session: 2,
            ..Default::default()
        };
        Self {
            namespace: Arc::new(Mutex::new(namespace)),
            session: 1,
        }
    }

    /// A new client with its own session over the same namespace.
    pub fn session(&self) -> Self {
        let mut ns = self.namespace.lock();
        let session = ns.next_session;
        ns.next_session += 1;
        Self {
            namespace: Arc::clone(&self.namespace),
            session,
        }
    }

    /// End a session: its ephemeral nodes are deleted and any further call
    /// through a client bound to it fails with `SessionExpired`.
    pub fn expire_session(&self, session: i64) {
        let mut ns = self.namespace.lock();
        if !ns.expired.insert(session) {
            return;
        }
        let owned: Vec<String> = ns
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            ns.nodes.remove(&path);
            ns.notify(NodeEventKind::Deleted, &path);
        }
        tracing::debug!(session, "memory coordination session expired");
    }

    pub fn expire(&self) {
        self.expire_session(self.session);
    }

    fn check_session(&self, ns: &Namespace) -> Result<()> {
        if ns.expired.contains(&self.session) {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    fn session_id(&self) -> i64 {
        self.session
    }

    async fn create_or_set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: ExpectedVersion,
    ) -> Result<CasOutcome> {
        let mut ns = self.namespace.lock();
        self.check_session(&ns)?;
        let current = ns.nodes.get(path).map(|n| n.version);
        let (version, kind) = match (expected, current) {
            (ExpectedVersion::Absent, None) => (1, NodeEventKind::Created),
            (ExpectedVersion::Exact(want), Some(have)) if want == have => {
                (have + 1, NodeEventKind::DataChanged)
            }
            _ => return Ok(CasOutcome::Conflict),
        };
        let ephemeral_owner = ns.nodes.get(path).and_then(|n| n.ephemeral_owner);
        ns.nodes.insert(
            path.to_string(),
            Node {
                data,
                version,
                ephemeral_owner,
            },
        );
        ns.notify(kind, path);
        Ok(CasOutcome::Written(version))
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<CasOutcome> {
        let mut ns = self.namespace.lock();
        self.check_session(&ns)?;
        if ns.nodes.contains_key(path) {
            return Ok(CasOutcome::Conflict);
        }
        ns.nodes.insert(
            path.to_string(),
            Node {
                data,
                version: 1,
                ephemeral_owner: Some(self.session),
            },
        );
        ns.notify(NodeEventKind::Created, path);
        Ok(CasOutcome::Written(1))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Versioned>> {
        let ns = self.namespace.lock();
        self.check_session(&ns)?;
        Ok(ns.nodes.get(path).map(|n| Versioned {
            data: n.data.clone(),
            version: n.version,
        }))
    }

    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<bool> {
        let mut ns = self.namespace.lock();
        self.check_session(&ns)?;
        let Some(node) = ns.nodes.get(path) else {
            return Ok(false);
        };
        if expected_version.is_some_and(|v| v != node.version) {
            return Ok(false);
        }
        ns.nodes.remove(path);
        ns.notify(NodeEventKind::Deleted, path);
        Ok(true)
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let ns = self.namespace.lock();
        self.check_session(&ns)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: BTreeSet<String> = ns
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| p[prefix.len()..].split('/').next().map(str::to_string))
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let mut ns = self.namespace.lock();
        self.check_session(&ns)?;
        let (tx, rx) = mpsc::unbounded_channel();
        ns.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
