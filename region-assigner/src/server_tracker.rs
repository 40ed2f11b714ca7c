use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use region_coordination::client::node_name;
use region_coordination::{CoordinationClient, NodeEvent, NodeEventKind, WatchReceiver};

use crate::assignment::AssignmentManager;
use crate::error::{Error, Result};
use crate::paths;
use crate::types::ServerName;

/// Follows region server registrations under `/rs`. A server whose node
/// disappears has lost its session and is processed as dead.
pub struct ServerTracker {
    client: Arc<dyn CoordinationClient>,
    am: Arc<AssignmentManager>,
}

impl ServerTracker {
    pub fn new(client: Arc<dyn CoordinationClient>, am: Arc<AssignmentManager>) -> Self {
        Self { client, am }
    }

    /// Register every server already present and return the watch that
    /// [`run`](Self::run) consumes. The watch is opened first so no change
    /// between the listing and the watch is missed.
    pub async fn start(&self) -> Result<WatchReceiver> {
        let events = self.client.watch(&paths::servers_prefix()).await?;
        let children = self.client.list_children(paths::SERVERS_DIR).await?;
        for child in &children {
            self.server_added(child);
        }
        tracing::info!(servers = children.len(), "registered existing region servers");
        Ok(events)
    }

    pub async fn run(&self, mut events: WatchReceiver, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        return Err(region_coordination::Error::WatchClosed(paths::servers_prefix()).into());
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: NodeEvent) {
        let name = node_name(&event.path);
        match event.kind {
            NodeEventKind::Created => self.server_added(name),
            NodeEventKind::DataChanged => {}
            NodeEventKind::Deleted => match parse(name) {
                Ok(server) => {
                    tracing::info!(server = %server, "region server node removed");
                    self.am.process_server_shutdown(&server);
                }
                Err(e) => tracing::warn!(node = %name, error = %e, "ignoring unparseable server node"),
            },
        }
    }

    fn server_added(&self, name: &str) {
        let server = match parse(name) {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(node = %name, error = %e, "ignoring unparseable server node");
                return;
            }
        };
        let manager = self.am.server_manager();
        if manager.is_server_online(&server) {
            return;
        }
        if let Some(previous) = manager.register(server) {
            self.am.process_server_shutdown(&previous);
        }
        if self.am.all_servers_offline() {
            self.am.timeout_wakeup().notify_one();
        }
    }
}

fn parse(name: &str) -> Result<ServerName> {
    name.parse::<ServerName>()
        .map_err(|e| Error::invalid_state(e.to_string()))
}
