use std::collections::HashSet;

use parking_lot::RwLock;

use crate::types::ServerName;

#[derive(Default)]
struct Servers {
    online: HashSet<ServerName>,
    dead: HashSet<ServerName>,
}

/// Cluster membership as seen by the master. Per-server load is read
/// from the holdings kept by [`RegionStates`](crate::region_states::RegionStates).
#[derive(Default)]
pub struct ServerManager {
    servers: RwLock<Servers>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server to the online set.
    ///
    /// A previous incarnation on the same host and port is dead by
    /// definition; it is returned so the caller can process its shutdown.
    pub fn register(&self, server: ServerName) -> Option<ServerName> {
        let mut servers = self.servers.write();
        if servers.dead.contains(&server) {
            tracing::warn!(server = %server, "ignoring registration of a server already declared dead");
            return None;
        }
        let previous = servers
            .online
            .iter()
            .find(|s| s.same_host_and_port(&server) && s.start_code != server.start_code)
            .cloned();
        if let Some(old) = &previous {
            tracing::info!(server = %server, previous = %old, "server restarted, expiring previous instance");
            servers.online.remove(old);
            servers.dead.insert(old.clone());
        }
        if servers.online.insert(server.clone()) {
            tracing::info!(server = %server, "region server online");
        }
        previous
    }

    /// Move a server to the dead set. Returns whether it was online.
    pub fn expire_server(&self, server: &ServerName) -> bool {
        let mut servers = self.servers.write();
        servers.dead.insert(server.clone());
        servers.online.remove(server)
    }

    pub fn is_server_online(&self, server: &ServerName) -> bool {
        self.servers.read().online.contains(server)
    }

    pub fn is_server_dead(&self, server: &ServerName) -> bool {
        self.servers.read().dead.contains(server)
    }

    pub fn online_servers(&self) -> Vec<ServerName> {
        let mut servers: Vec<_> = self.servers.read().online.iter().cloned().collect();
        servers.sort();
        servers
    }

    /// Online servers usable as a destination, minus `exclude`.
    pub fn destination_servers(&self, exclude: Option<&ServerName>) -> Vec<ServerName> {
        let mut servers = self.online_servers();
        if let Some(exclude) = exclude {
            servers.retain(|s| s != exclude);
        }
        servers
    }
}
