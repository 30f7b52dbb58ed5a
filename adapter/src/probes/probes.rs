use std::convert::Infallible;
use std::net::SocketAddr;

use log::{error, info};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::Error;

// Process wide counters, handed to every component at construction.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub tenant_requests: IntCounterVec,
    pub cluster_reconciles: IntCounterVec,
    pub leader: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        let tenant_requests = IntCounterVec::new(
            Opts::new("whizard_adapter_tenant_requests_total", "tenant API requests handled"),
            &["operation", "code"],
        )?;
        registry.register(Box::new(tenant_requests.clone()))?;

        let cluster_reconciles = IntCounterVec::new(
            Opts::new("whizard_adapter_cluster_reconciles_total", "cluster reconciliations"),
            &["result"],
        )?;
        registry.register(Box::new(cluster_reconciles.clone()))?;

        let leader = IntGauge::with_opts(Opts::new(
            "whizard_adapter_leader",
            "1 while this replica holds the leader election lease",
        ))?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Metrics {
            registry,
            tenant_requests,
            cluster_reconciles,
            leader,
        })
    }

    // Text exposition of every registered family.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn with_metrics(metrics: Metrics) -> impl Filter<Extract = (Metrics,), Error = Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

// healthz and readyz always pass once the process serves HTTP.
pub fn health_routes() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let healthz = warp::path!("healthz").and(warp::get()).map(|| "ok");
    let readyz = warp::path!("readyz").and(warp::get()).map(|| "ok");
    healthz.or(readyz)
}

pub fn metrics_routes(metrics: Metrics) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_metrics(metrics))
        .map(|m: Metrics| match m.render() {
            Ok(body) => warp::reply::with_status(body, StatusCode::OK),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        })
}

// Serve probes until the token is cancelled.
pub async fn serve_health(address: SocketAddr, token: CancellationToken) -> Result<(), Error> {
    let (bound, server) = warp::serve(health_routes())
        .try_bind_with_graceful_shutdown(address, token.cancelled_owned())
        .map_err(|source| Error::Bind { address, source })?;
    info!("Serving health probes on {}", bound);
    server.await;
    Ok(())
}

pub async fn serve_metrics(address: SocketAddr, metrics: Metrics, token: CancellationToken) -> Result<(), Error> {
    let (bound, server) = warp::serve(metrics_routes(metrics))
        .try_bind_with_graceful_shutdown(address, token.cancelled_owned())
        .map_err(|source| Error::Bind { address, source })?;
    info!("Serving metrics on {}", bound);
    server.await;
    Ok(())
}
