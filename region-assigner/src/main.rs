use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use region_coordination::etcd::EtcdCoordination;
use region_coordination::leader_election;
use region_coordination::util::now_millis;
use region_coordination::CoordinationClient;

use region_assigner::catalog::{CatalogTable, CoordinationCatalog, LocalRegionFileSystem, RegionFileSystem};
use region_assigner::config::Config;
use region_assigner::http::{self, ActiveMaster};
use region_assigner::master::Master;
use region_assigner::rpc::{HttpRegionServerRpc, RegionServerRpc};

fn init_tracing(json: bool) {
    let fmt_layer = if json {
        fmt::layer().json().with_filter(EnvFilter::from_default_env()).boxed()
    } else {
        fmt::layer().with_filter(EnvFilter::from_default_env()).boxed()
    };
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.log_json);

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let shutdown = CancellationToken::new();
    let etcd = Arc::new(EtcdCoordination::connect(config.etcd_config(), shutdown.clone()).await?);
    let session_lost = etcd.session_lost();
    let coordination: Arc<dyn CoordinationClient> = etcd.clone();

    let master_name = config.master_server_name(now_millis());
    info!(master = %master_name, "starting region assigner");

    let rpc: Arc<dyn RegionServerRpc> = Arc::new(HttpRegionServerRpc::new(config.rpc_timeout())?);
    let catalog: Arc<dyn CatalogTable> = Arc::new(CoordinationCatalog::new(Arc::clone(&coordination)));
    let fs: Arc<dyn RegionFileSystem> = Arc::new(LocalRegionFileSystem::new(config.data_dir()));
    let active = ActiveMaster::new();

    let election = {
        let coordination = Arc::clone(&coordination);
        let election_config = config.leader_election_config(&master_name);
        let master_config = config.master_config();
        let active = active.clone();
        let shutdown = shutdown.clone();
        async move {
            leader_election::run_as_leader(
                Arc::clone(&coordination),
                election_config,
                shutdown,
                |term| {
                    // Nothing survives a lost term: a fresh master rebuilds
                    // its view from the catalog and the transition nodes.
                    let master = Arc::new(Master::new(
                        master_name.clone(),
                        Arc::clone(&coordination),
                        Arc::clone(&rpc),
                        Arc::clone(&catalog),
                        Arc::clone(&fs),
                        master_config.clone(),
                    ));
                    let active = active.clone();
                    async move {
                        active.set(Some(Arc::clone(&master)));
                        let result = master.run(term).await;
                        active.set(None);
                        result.map_err(Into::into)
                    }
                },
            )
            .await
        }
    };

    let app = http::app(active, Some(metrics));
    let bind = config.bind_address();
    info!(bind = %bind, "serving status endpoints");

    let result = tokio::select! {
        res = election => {
            res.map_err(eyre::Report::from)
        }
        res = http::listen(app, bind) => {
            error!("http server exited");
            res
        }
        _ = session_lost.cancelled() => {
            Err(eyre::eyre!("coordination session lost"))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Err(e) = etcd.close().await {
        error!(error = %e, "failed to close coordination session");
    }
    if let Err(e) = &result {
        error!(error = %e, "region assigner stopped");
    }
    result
}
