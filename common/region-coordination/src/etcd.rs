use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{
    CasOutcome, CoordinationClient, ExpectedVersion, NodeEvent, NodeEventKind, Versioned,
    WatchReceiver,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Key prefix prepended to every node path, e.g. "/region-assigner/".
    pub prefix: String,
    /// TTL of the session lease backing ephemeral nodes.
    pub session_ttl: i64,
    pub keepalive_interval: Duration,
}

/// etcd-backed coordination client.
///
/// One lease is granted per client and kept alive in the background; it plays
/// the role of the session for ephemeral nodes. If the keepalive fails the
/// `session_lost` token is cancelled and every later call returns
/// `SessionExpired`.
#[derive(Clone)]
pub struct EtcdCoordination {
    client: Client,
    config: EtcdConfig,
    lease_id: i64,
    session_lost: CancellationToken,
}

impl EtcdCoordination {
    pub async fn connect(config: EtcdConfig, cancel: CancellationToken) -> Result<Self> {
        let mut client = Client::connect(&config.endpoints, None).await?;
        let lease_id = client.lease_grant(config.session_ttl, None).await?.id();
        let session_lost = CancellationToken::new();

        {
            let client = client.clone();
            let interval = config.keepalive_interval;
            let lost = session_lost.clone();
            tokio::spawn(async move {
                if let Err(e) = run_session_keepalive(client, lease_id, interval, cancel).await {
                    tracing::error!(lease_id, error = %e, "coordination session keepalive failed");
                    lost.cancel();
                }
            });
        }

        tracing::info!(lease_id, prefix = %config.prefix, "connected to etcd");
        Ok(Self {
            client,
            config,
            lease_id,
            session_lost,
        })
    }

    /// Cancelled once the session lease can no longer be kept alive.
    pub fn session_lost(&self) -> CancellationToken {
        self.session_lost.clone()
    }

    /// Revoke the session lease, deleting this client's ephemeral nodes.
    pub async fn close(&self) -> Result<()> {
        self.client.clone().lease_revoke(self.lease_id).await?;
        Ok(())
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.config.prefix.trim_end_matches('/'), path)
    }

    fn check_session(&self) -> Result<()> {
        if self.session_lost.is_cancelled() {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordination {
    fn session_id(&self) -> i64 {
        self.lease_id
    }

    async fn create_or_set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: ExpectedVersion,
    ) -> Result<CasOutcome> {
        self.check_session()?;
        let key = self.key(path);
        let expected_version = match expected {
            ExpectedVersion::Absent => 0,
            ExpectedVersion::Exact(v) => v,
        };
        let txn = Txn::new()
            .when(vec![Compare::version(
                key.clone(),
                CompareOp::Equal,
                expected_version,
            )])
            .and_then(vec![TxnOp::put(key, data, None)]);
        let resp = self.client.clone().txn(txn).await?;
        if resp.succeeded() {
            Ok(CasOutcome::Written(expected_version + 1))
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<CasOutcome> {
        self.check_session()?;
        let key = self.key(path);
        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                data,
                Some(PutOptions::new().with_lease(self.lease_id)),
            )]);
        let resp = self.client.clone().txn(txn).await?;
        if resp.succeeded() {
            Ok(CasOutcome::Written(1))
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn get_data(&self, path: &str) -> Result<Option<Versioned>> {
        self.check_session()?;
        let resp = self.client.clone().get(self.key(path), None).await?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            data: kv.value().to_vec(),
            version: kv.version(),
        }))
    }

    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<bool> {
        self.check_session()?;
        let key = self.key(path);
        match expected_version {
            Some(version) => {
                let txn = Txn::new()
                    .when(vec![Compare::version(key.clone(), CompareOp::Equal, version)])
                    .and_then(vec![TxnOp::delete(key, None)]);
                Ok(self.client.clone().txn(txn).await?.succeeded())
            }
            None => Ok(self.client.clone().delete(key, None).await?.deleted() > 0),
        }
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_session()?;
        let prefix = format!("{}/", self.key(path).trim_end_matches('/'));
        let options = GetOptions::new().with_prefix().with_keys_only();
        let resp = self.client.clone().get(prefix.clone(), Some(options)).await?;
        let children: BTreeSet<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = String::from_utf8_lossy(kv.key());
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.split('/').next())
                    .map(str::to_string)
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        self.check_session()?;
        let options = WatchOptions::new().with_prefix();
        let mut stream = self
            .client
            .clone()
            .watch(self.key(prefix), Some(options))
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let strip = self.config.prefix.trim_end_matches('/').to_string();
        let watched = prefix.to_string();

        tokio::spawn(async move {
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        tracing::warn!(prefix = %watched, "etcd watch stream ended");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(prefix = %watched, error = %e, "etcd watch failed");
                        return;
                    }
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let key = String::from_utf8_lossy(kv.key());
                    let path = key
                        .strip_prefix(strip.as_str())
                        .unwrap_or(key.as_ref())
                        .to_string();
                    let kind = match event.event_type() {
                        EventType::Put if kv.version() == 1 => NodeEventKind::Created,
                        EventType::Put => NodeEventKind::DataChanged,
                        EventType::Delete => NodeEventKind::Deleted,
                    };
                    if tx.send(NodeEvent { kind, path }).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

async fn run_session_keepalive(
    mut client: Client,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                match stream.message().await? {
                    Some(resp) if resp.ttl() > 0 => {}
                    _ => return Err(Error::SessionExpired),
                }
            }
        }
    }
}
