use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;

use region_coordination::etcd::EtcdConfig;
use region_coordination::leader_election::LeaderElectionConfig;

use crate::assignment::AssignmentConfig;
use crate::bulk_assigner::BulkAssignConfig;
use crate::catalog_janitor::JanitorConfig;
use crate::master::MasterConfig;
use crate::timeout_monitor::TimeoutMonitorConfig;
use crate::types::ServerName;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/region-assigner/")]
    pub etcd_prefix: String,

    #[envconfig(default = "30")]
    pub session_ttl_secs: i64,

    #[envconfig(default = "10")]
    pub session_keepalive_interval_secs: u64,

    // ── HTTP server ─────────────────────────────────────────────────
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "16010")]
    pub port: u16,

    // ── Master identity / leader election ───────────────────────────
    #[envconfig(default = "localhost")]
    pub master_host: String,

    #[envconfig(default = "16000")]
    pub master_port: u16,

    #[envconfig(default = "5")]
    pub election_retry_interval_secs: u64,

    // ── Assignment ──────────────────────────────────────────────────
    #[envconfig(default = "10")]
    pub assignment_max_attempts: u32,

    #[envconfig(default = "60000")]
    pub server_startup_wait_ms: u64,

    #[envconfig(default = "100")]
    pub server_startup_retry_ms: u64,

    #[envconfig(default = "60000")]
    pub rpc_timeout_ms: u64,

    #[envconfig(default = "10")]
    pub dispatcher_workers: usize,

    #[envconfig(default = "30")]
    pub rpc_workers: usize,

    // ── Bulk assignment ─────────────────────────────────────────────
    #[envconfig(default = "20")]
    pub bulk_assign_max_concurrency: usize,

    #[envconfig(default = "1000")]
    pub bulk_assign_per_region_open_ms: u64,

    #[envconfig(default = "600")]
    pub bulk_assign_max_wait_secs: u64,

    // ── Timeout monitor ─────────────────────────────────────────────
    #[envconfig(default = "10000")]
    pub timeout_monitor_period_ms: u64,

    #[envconfig(default = "1800000")]
    pub assignment_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub catalog_assignment_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub rit_warning_threshold_ms: u64,

    // ── Catalog janitor / balancer ──────────────────────────────────
    #[envconfig(default = "300")]
    pub janitor_interval_secs: u64,

    #[envconfig(default = "true")]
    pub janitor_enabled: bool,

    #[envconfig(default = "./data")]
    pub data_dir: String,

    #[envconfig(default = "300")]
    pub balancer_period_secs: u64,

    #[envconfig(default = "true")]
    pub balancer_enabled: bool,

    // ── Logging ─────────────────────────────────────────────────────
    #[envconfig(default = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn etcd_config(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.etcd_endpoint_list(),
            prefix: self.etcd_prefix.clone(),
            session_ttl: self.session_ttl_secs,
            keepalive_interval: Duration::from_secs(self.session_keepalive_interval_secs),
        }
    }

    /// Identity of this master process; the start code makes a restarted
    /// master distinguishable from its previous incarnation.
    pub fn master_server_name(&self, start_code: i64) -> ServerName {
        ServerName::new(self.master_host.clone(), self.master_port, start_code)
    }

    pub fn leader_election_config(&self, master: &ServerName) -> LeaderElectionConfig {
        LeaderElectionConfig {
            name: master.to_string(),
            leader_path: "/master".to_string(),
            retry_interval: Duration::from_secs(self.election_retry_interval_secs),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn assignment_config(&self) -> AssignmentConfig {
        AssignmentConfig {
            max_attempts: self.assignment_max_attempts,
            server_startup_wait: Duration::from_millis(self.server_startup_wait_ms),
            server_startup_retry_interval: Duration::from_millis(self.server_startup_retry_ms),
            rpc_timeout: self.rpc_timeout(),
            dispatcher_workers: self.dispatcher_workers,
            rpc_workers: self.rpc_workers,
        }
    }

    pub fn bulk_assign_config(&self) -> BulkAssignConfig {
        BulkAssignConfig {
            max_concurrency: self.bulk_assign_max_concurrency,
            per_region_open_time: Duration::from_millis(self.bulk_assign_per_region_open_ms),
            max_wait: Duration::from_secs(self.bulk_assign_max_wait_secs),
        }
    }

    pub fn timeout_monitor_config(&self) -> TimeoutMonitorConfig {
        TimeoutMonitorConfig {
            period: Duration::from_millis(self.timeout_monitor_period_ms),
            timeout: Duration::from_millis(self.assignment_timeout_ms),
            catalog_timeout: Duration::from_millis(self.catalog_assignment_timeout_ms),
            rit_warning_threshold: Duration::from_millis(self.rit_warning_threshold_ms),
        }
    }

    pub fn janitor_config(&self) -> JanitorConfig {
        JanitorConfig {
            interval: Duration::from_secs(self.janitor_interval_secs),
            enabled: self.janitor_enabled,
        }
    }

    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            assignment: self.assignment_config(),
            bulk_assign: self.bulk_assign_config(),
            timeout_monitor: self.timeout_monitor_config(),
            janitor: self.janitor_config(),
            balancer_period: Duration::from_secs(self.balancer_period_secs),
            balancer_enabled: self.balancer_enabled,
        }
    }
}
