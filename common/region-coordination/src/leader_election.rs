use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::{read_json, CasOutcome, CoordinationClient, NodeEventKind};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Identifier for this candidate (e.g. the master's server name).
    pub name: String,
    /// Node holding the leader record. Ephemeral, so it disappears with the
    /// leader's session.
    pub leader_path: String,
    /// How long to wait before retrying after failing to acquire leadership.
    pub retry_interval: Duration,
}

/// Written to the leader node when leadership is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub holder: String,
    pub session_id: i64,
}

/// Run a closure as leader indefinitely.
///
/// Continuously attempts to create the ephemeral leader node. When elected,
/// runs `work_fn` with a cancellation token that is cancelled when the leader
/// node vanishes (session expiry, operator delete). If `work_fn` returns,
/// waits `retry_interval` and competes again. The outer `cancel` token stops
/// the whole election loop.
pub async fn run_as_leader<F, Fut>(
    client: Arc<dyn CoordinationClient>,
    config: LeaderElectionConfig,
    cancel: CancellationToken,
    work_fn: F,
) -> Result<()>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = try_lead(client.as_ref(), &config, &cancel, &work_fn) => {
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() && !matches!(e, Error::LeadershipLost) => {
                        tracing::error!(name = %config.name, error = %e, "leader election aborted");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(name = %config.name, error = %e, "leader loop ended with error");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(config.retry_interval) => {}
                }
            }
        }
    }
}

async fn try_lead<F, Fut>(
    client: &dyn CoordinationClient,
    config: &LeaderElectionConfig,
    cancel: &CancellationToken,
    work_fn: &F,
) -> Result<()>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let record = LeaderRecord {
        holder: config.name.clone(),
        session_id: client.session_id(),
    };

    // Watch before creating so a deletion right after acquisition is not missed.
    let mut events = client.watch(&config.leader_path).await?;

    let version = match client
        .create_ephemeral(&config.leader_path, serde_json::to_vec(&record)?)
        .await?
    {
        CasOutcome::Written(v) => v,
        CasOutcome::Conflict => {
            tracing::debug!(name = %config.name, "another candidate is leader, standing by");
            return Ok(());
        }
    };

    tracing::info!(name = %config.name, "acquired leadership");

    let leadership_cancel = cancel.child_token();
    let watch_handle = {
        let token = leadership_cancel.clone();
        let path = config.leader_path.clone();
        let name = config.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = events.recv() => match event {
                        Some(e) if e.path == path && e.kind == NodeEventKind::Deleted => {
                            tracing::warn!(name = %name, "leader node removed, giving up leadership");
                            token.cancel();
                            return;
                        }
                        Some(_) => {}
                        None => {
                            tracing::error!(name = %name, "leader watch closed, giving up leadership");
                            token.cancel();
                            return;
                        }
                    }
                }
            }
        })
    };

    let result = work_fn(leadership_cancel.clone()).await;

    leadership_cancel.cancel();
    drop(watch_handle.await);
    // Best-effort so the next candidate can take over without waiting for
    // the session to expire.
    drop(client.delete(&config.leader_path, Some(version)).await);

    result
}

/// Read the current leader (if any).
pub async fn get_leader(
    client: &dyn CoordinationClient,
    leader_path: &str,
) -> Result<Option<LeaderRecord>> {
    Ok(read_json::<LeaderRecord>(client, leader_path)
        .await?
        .map(|(record, _)| record))
}
