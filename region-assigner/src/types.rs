use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name of the table holding every region's location. Its regions are
/// assigned before anything else and never moved by the balancer.
pub const CATALOG_TABLE: &str = "catalog";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn catalog() -> Self {
        Self(CATALOG_TABLE.to_string())
    }

    pub fn is_catalog(&self) -> bool {
        self.0 == CATALOG_TABLE
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous key range of a table: the unit of assignment.
///
/// Identity is `(table, start_key, end_key, region_id)`. The `offline` and
/// `split` flags are set on a parent once it has split and do not change
/// which region a value refers to, so they are ignored by `Eq` and `Hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: TableName,
    pub start_key: Vec<u8>,
    /// Empty means "to the end of the table".
    pub end_key: Vec<u8>,
    pub region_id: i64,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub split: bool,
}

impl RegionInfo {
    pub fn new(table: TableName, start_key: &[u8], end_key: &[u8], region_id: i64) -> Self {
        Self {
            table,
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
            region_id,
            offline: false,
            split: false,
        }
    }

    /// `{table},{start_key_hex},{region_id}`
    pub fn region_name(&self) -> String {
        format!(
            "{},{},{}",
            self.table,
            hex::encode(&self.start_key),
            self.region_id
        )
    }

    /// Fixed-length key used for maps and coordination node names: the first
    /// 16 bytes of SHA-256 over the region name and end key, hex encoded.
    pub fn encoded_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.region_name().as_bytes());
        hasher.update(b",");
        hasher.update(&self.end_key);
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn is_catalog(&self) -> bool {
        self.table.is_catalog()
    }

    pub fn is_split_parent(&self) -> bool {
        self.offline && self.split
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice()
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }

    /// Daughters covering `[start, split_key)` and `[split_key, end)`.
    pub fn daughters(&self, split_key: &[u8], region_id: i64) -> (RegionInfo, RegionInfo) {
        (
            RegionInfo::new(self.table.clone(), &self.start_key, split_key, region_id),
            RegionInfo::new(self.table.clone(), split_key, &self.end_key, region_id),
        )
    }

    /// This region flagged as a split parent: permanently offline.
    pub fn as_split_parent(&self) -> RegionInfo {
        RegionInfo {
            offline: true,
            split: true,
            ..self.clone()
        }
    }

    fn identity(&self) -> (&TableName, &[u8], &[u8], i64) {
        (&self.table, &self.start_key, &self.end_key, self.region_id)
    }
}

impl PartialEq for RegionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for RegionInfo {}

impl Hash for RegionInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.region_name(), self.encoded_name())
    }
}

/// Ordering that places a parent before the daughters it split into: table,
/// then start key ascending, then end key descending with an empty end key
/// (end of table) sorting first.
pub fn parent_first_order(a: &RegionInfo, b: &RegionInfo) -> Ordering {
    a.table
        .cmp(&b.table)
        .then_with(|| a.start_key.cmp(&b.start_key))
        .then_with(|| match (a.end_key.is_empty(), b.end_key.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => b.end_key.cmp(&a.end_key),
        })
        .then_with(|| a.region_id.cmp(&b.region_id))
}

/// A region server instance. A restarted process on the same host and port
/// gets a new `start_code`, making it a different server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
    pub start_code: i64,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16, start_code: i64) -> Self {
        Self {
            host: host.into(),
            port,
            start_code,
        }
    }

    pub fn same_host_and_port(&self, other: &ServerName) -> bool {
        self.host == other.host && self.port == other.port
    }

    pub fn host_and_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.host, self.port, self.start_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid server name {0:?}, expected host,port,start_code")]
pub struct ParseServerNameError(String);

impl FromStr for ServerName {
    type Err = ParseServerNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseServerNameError(s.to_string());
        let mut parts = s.split(',');
        let (Some(host), Some(port), Some(start_code), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_string(),
            port: port.parse().map_err(|_| invalid())?,
            start_code: start_code.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionState {
    Offline,
    PendingOpen,
    Opening,
    Open,
    PendingClose,
    Closing,
    Closed,
    Splitting,
    Split,
}

impl RegionState {
    /// States whose record must not carry a server.
    pub fn is_serverless(self) -> bool {
        matches!(self, RegionState::Offline | RegionState::Closed)
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionState::Offline => "OFFLINE",
            RegionState::PendingOpen => "PENDING_OPEN",
            RegionState::Opening => "OPENING",
            RegionState::Open => "OPEN",
            RegionState::PendingClose => "PENDING_CLOSE",
            RegionState::Closing => "CLOSING",
            RegionState::Closed => "CLOSED",
            RegionState::Splitting => "SPLITTING",
            RegionState::Split => "SPLIT",
        };
        f.write_str(name)
    }
}

/// The one authoritative state record of a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStateRecord {
    pub region: RegionInfo,
    pub state: RegionState,
    pub server: Option<ServerName>,
    /// Millis since the epoch of the last update. Zero forces the timeout
    /// monitor to act on the next sweep.
    pub stamp: i64,
}

impl RegionStateRecord {
    pub fn is_offline(&self) -> bool {
        self.state == RegionState::Offline
    }

    pub fn is_pending_open(&self) -> bool {
        self.state == RegionState::PendingOpen
    }

    pub fn is_opening(&self) -> bool {
        self.state == RegionState::Opening
    }

    pub fn is_open(&self) -> bool {
        self.state == RegionState::Open
    }

    pub fn is_pending_close(&self) -> bool {
        self.state == RegionState::PendingClose
    }

    pub fn is_closing(&self) -> bool {
        self.state == RegionState::Closing
    }

    pub fn is_closed(&self) -> bool {
        self.state == RegionState::Closed
    }

    pub fn is_splitting(&self) -> bool {
        self.state == RegionState::Splitting
    }

    pub fn is_split(&self) -> bool {
        self.state == RegionState::Split
    }

    pub fn is_pending_open_or_opening_on(&self, server: &ServerName) -> bool {
        (self.is_pending_open() || self.is_opening()) && self.server.as_ref() == Some(server)
    }

    pub fn is_in_transition(&self) -> bool {
        self.state != RegionState::Open
    }
}

/// Intended next placement of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPlan {
    pub region: RegionInfo,
    pub source: Option<ServerName>,
    pub destination: Option<ServerName>,
}

impl RegionPlan {
    pub fn new(region: RegionInfo, source: Option<ServerName>, destination: ServerName) -> Self {
        Self {
            region,
            source,
            destination: Some(destination),
        }
    }

    /// Plans compare by where they send the region, not by identity.
    pub fn same_destination(&self, other: &RegionPlan) -> bool {
        self.destination == other.destination
    }
}

/// Event types written to a region's transition node.
///
/// `M_ZK_*` are written by the master, `RS_ZK_*` by region servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "M_ZK_REGION_OFFLINE")]
    MasterRegionOffline,
    #[serde(rename = "M_ZK_REGION_CLOSING")]
    MasterRegionClosing,
    #[serde(rename = "RS_ZK_REGION_CLOSING")]
    RegionClosing,
    #[serde(rename = "RS_ZK_REGION_CLOSED")]
    RegionClosed,
    #[serde(rename = "RS_ZK_REGION_OPENING")]
    RegionOpening,
    #[serde(rename = "RS_ZK_REGION_OPENED")]
    RegionOpened,
    #[serde(rename = "RS_ZK_REGION_FAILED_OPEN")]
    RegionFailedOpen,
    #[serde(rename = "RS_ZK_REGION_SPLITTING")]
    RegionSplitting,
    #[serde(rename = "RS_ZK_REGION_SPLIT")]
    RegionSplit,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::MasterRegionOffline => "M_ZK_REGION_OFFLINE",
            EventType::MasterRegionClosing => "M_ZK_REGION_CLOSING",
            EventType::RegionClosing => "RS_ZK_REGION_CLOSING",
            EventType::RegionClosed => "RS_ZK_REGION_CLOSED",
            EventType::RegionOpening => "RS_ZK_REGION_OPENING",
            EventType::RegionOpened => "RS_ZK_REGION_OPENED",
            EventType::RegionFailedOpen => "RS_ZK_REGION_FAILED_OPEN",
            EventType::RegionSplitting => "RS_ZK_REGION_SPLITTING",
            EventType::RegionSplit => "RS_ZK_REGION_SPLIT",
        };
        f.write_str(name)
    }
}

/// Payload of a transition node, stored under `/unassigned/{encoded_name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionTransition {
    pub event_type: EventType,
    pub region: RegionInfo,
    pub origin: ServerName,
    pub created_at: i64,
    /// Daughters, for split events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<RegionInfo>>,
}

impl RegionTransition {
    pub fn new(event_type: EventType, region: &RegionInfo, origin: &ServerName) -> Self {
        Self {
            event_type,
            region: region.clone(),
            origin: origin.clone(),
            created_at: region_coordination::util::now_millis(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<RegionInfo>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Per-region answer of a region server to an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenOutcome {
    Opened,
    AlreadyOpened,
    FailedOpening,
}

/// Registration written by a region server to its ephemeral `/rs/{server}`
/// node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub server: ServerName,
    pub registered_at: i64,
}
