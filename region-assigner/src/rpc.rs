use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OpenOutcome, RegionInfo, ServerName};

/// Failures of a call to a region server, classified the way the retry
/// policy needs them.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum RpcError {
    #[error("region server is not running yet")]
    ServerNotRunningYet,

    #[error("call timed out")]
    SocketTimeout,

    #[error("region is already in transition on the server")]
    RegionAlreadyInTransition,

    #[error("region is not served by the server")]
    NotServingRegion,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("{0}")]
    Other(String),
}

/// Calls the master makes on region servers.
///
/// `version` is the transition node version the master last wrote for the
/// region. The server must present it when it moves the node forward, so a
/// request based on a stale view cannot win.
#[async_trait]
pub trait RegionServerRpc: Send + Sync {
    async fn open_region(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        version: Option<i64>,
    ) -> Result<OpenOutcome, RpcError>;

    /// Batched open. Outcomes are returned in request order.
    async fn open_regions(
        &self,
        server: &ServerName,
        regions: &[(RegionInfo, i64)],
    ) -> Result<Vec<OpenOutcome>, RpcError>;

    /// `destination` tells the server where the region is headed next, for
    /// its logs. With `transition_in_coordination` the server moves the
    /// region's CLOSING node to CLOSED once done.
    async fn close_region(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        version: Option<i64>,
        destination: Option<&ServerName>,
        transition_in_coordination: bool,
    ) -> Result<bool, RpcError>;
}

// ── HTTP transport ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRegionRequest {
    pub region: RegionInfo,
    pub version: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRegionsRequest {
    pub regions: Vec<OpenRegionRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRegionsResponse {
    pub outcomes: Vec<OpenOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseRegionRequest {
    pub region: RegionInfo,
    pub version: Option<i64>,
    pub destination: Option<ServerName>,
    pub transition_in_coordination: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseRegionResponse {
    pub closed: bool,
}

/// JSON-over-HTTP client for region servers listening on their advertised
/// host and port. Errors come back as a non-2xx response carrying an
/// `RpcError` body.
pub struct HttpRegionServerRpc {
    client: reqwest::Client,
}

impl HttpRegionServerRpc {
    pub fn new(timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Other(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(
        &self,
        server: &ServerName,
        route: &str,
        body: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = format!("http://{}{}", server.host_and_port(), route);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(match response.json::<RpcError>().await {
                Ok(e) => e,
                Err(_) => RpcError::Other(format!("{url} returned {status}")),
            });
        }
        response.json::<Resp>().await.map_err(classify)
    }
}

fn classify(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::SocketTimeout
    } else if e.is_connect() {
        RpcError::ConnectionRefused
    } else {
        RpcError::Other(e.to_string())
    }
}

#[async_trait]
impl RegionServerRpc for HttpRegionServerRpc {
    async fn open_region(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        version: Option<i64>,
    ) -> Result<OpenOutcome, RpcError> {
        let request = OpenRegionsRequest {
            regions: vec![OpenRegionRequest {
                region: region.clone(),
                version,
            }],
        };
        let response: OpenRegionsResponse =
            self.post(server, "/regions/open", &request).await?;
        response
            .outcomes
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Other("empty open response".to_string()))
    }

    async fn open_regions(
        &self,
        server: &ServerName,
        regions: &[(RegionInfo, i64)],
    ) -> Result<Vec<OpenOutcome>, RpcError> {
        let request = OpenRegionsRequest {
            regions: regions
                .iter()
                .map(|(region, version)| OpenRegionRequest {
                    region: region.clone(),
                    version: Some(*version),
                })
                .collect(),
        };
        let response: OpenRegionsResponse =
            self.post(server, "/regions/open", &request).await?;
        if response.outcomes.len() != regions.len() {
            return Err(RpcError::Other(format!(
                "expected {} open outcomes, got {}",
                regions.len(),
                response.outcomes.len()
            )));
        }
        Ok(response.outcomes)
    }

    async fn close_region(
        &self,
        server: &ServerName,
        region: &RegionInfo,
        version: Option<i64>,
        destination: Option<&ServerName>,
        transition_in_coordination: bool,
    ) -> Result<bool, RpcError> {
        let request = CloseRegionRequest {
            region: region.clone(),
            version,
            destination: destination.cloned(),
            transition_in_coordination,
        };
        let response: CloseRegionResponse =
            self.post(server, "/regions/close", &request).await?;
        Ok(response.closed)
    }
}
