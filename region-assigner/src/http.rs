use std::future::ready;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use serde::Serialize;

use crate::master::Master;
use crate::types::RegionStateRecord;

/// The master of the current leadership term, if this process holds it.
#[derive(Clone, Default)]
pub struct ActiveMaster(Arc<RwLock<Option<Arc<Master>>>>);

impl ActiveMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, master: Option<Arc<Master>>) {
        *self.0.write() = master;
    }

    pub fn get(&self) -> Option<Arc<Master>> {
        self.0.read().clone()
    }
}

#[derive(Serialize)]
struct RegionsInTransition {
    master: Option<String>,
    regions: Vec<RegionStateRecord>,
}

pub async fn listen(app: Router, bind: String) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn app(active: ActiveMaster, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| ready("ok")))
        .route("/regions-in-transition", get(regions_in_transition))
        .with_state(active);
    match metrics {
        Some(handle) => router.route("/metrics", get(move || ready(handle.render()))),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "region assigner"
}

/// Ready only while this process is the active master and has finished
/// joining the cluster. Standby masters report unavailable.
async fn readiness(State(active): State<ActiveMaster>) -> StatusCode {
    match active.get() {
        Some(master) if master.is_ready() => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn regions_in_transition(State(active): State<ActiveMaster>) -> Json<RegionsInTransition> {
    let body = match active.get() {
        Some(master) => {
            let mut regions = master
                .assignment_manager()
                .region_states()
                .regions_in_transition();
            regions.sort_by_key(|r| r.stamp);
            RegionsInTransition {
                master: Some(master.name().to_string()),
                regions,
            }
        }
        None => RegionsInTransition {
            master: None,
            regions: Vec::new(),
        },
    };
    Json(body)
}
