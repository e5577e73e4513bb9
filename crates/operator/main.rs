use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cluster_actuator::http::{HttpClusterServiceClient, HttpMaestroClient};
use cluster_actuator::upstream::{ClusterServiceClient, DbClient, MaestroClient};
use cluster_actuator::{Actuator, MemoryStore};
use sessiongate::controllers::{dataplane_controller, session_controller, State};
use sessiongate::proxy::SessionProxy;
use sessiongate::util::telemetry;
use sessiongate::SessionRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod server;

use config::{CompletedOptions, RawOptions};

#[tokio::main]
async fn main() {
    // clap reports its own parse errors; everything after logs via tracing
    let raw = RawOptions::parse();
    telemetry::init(raw.log_format).await;

    let options = match raw.validate() {
        Ok(validated) => validated.complete(),
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(options).await {
        error!("operator failed: {e}");
        std::process::exit(1);
    }
}

async fn run(options: CompletedOptions) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("failed to create kube client")?;
    let state = State::default();
    let shutdown = CancellationToken::new();

    // Cluster actuator against the regional upstreams.
    // TODO: swap in the Cosmos-backed DbClient once the driver lands.
    let db: Arc<dyn DbClient> = Arc::new(MemoryStore::new());
    let cluster_service: Arc<dyn ClusterServiceClient> = Arc::new(HttpClusterServiceClient::new(
        &options.cluster_service_url,
        options.upstream_timeout,
    ));
    let maestro: Arc<dyn MaestroClient> = Arc::new(HttpMaestroClient::new(
        &options.maestro_url,
        options.upstream_timeout,
    ));
    let actuator = Actuator::new(db, cluster_service, maestro, options.actuator.clone());
    actuator
        .register_metrics(state.registry())
        .context("failed to register actuator metrics")?;

    // Sessiongate: management plane, data plane, proxy.
    let session_registry = Arc::new(SessionRegistry::new());
    let proxy = SessionProxy::new(Arc::clone(&session_registry), options.proxy.clone());
    proxy
        .register_metrics(state.registry())
        .context("failed to register proxy metrics")?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    let actuator_task = tokio::spawn(actuator.run(shutdown.clone()));
    let session_task = tokio::spawn(session_controller::run(
        client.clone(),
        state.clone(),
        options.session.clone(),
        shutdown.clone(),
    ));
    let dataplane_task = tokio::spawn(dataplane_controller::run(
        client.clone(),
        state.clone(),
        Arc::clone(&session_registry),
        shutdown.clone(),
    ));
    let proxy_task = tokio::spawn(proxy.run(options.proxy_addr, shutdown.clone()));

    let health = server::health_server(state.clone(), options.health_addr)
        .context("failed to bind health server")?;
    let metrics = server::metrics_server(state.clone(), options.metrics_addr)
        .context("failed to bind metrics server")?;
    for handle in [health.handle(), metrics.handle()] {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.stop(true).await;
        });
    }

    // Every runtime implements graceful shutdown; poll until all are done.
    let (actuator_res, session_res, dataplane_res, proxy_res, health_res, metrics_res) = tokio::join!(
        actuator_task,
        session_task,
        dataplane_task,
        proxy_task,
        health,
        metrics
    );
    for join in [
        actuator_res,
        session_res,
        dataplane_res,
        proxy_res.map(|r| {
            if let Err(e) = r {
                error!("proxy exited with error: {e}");
            }
        }),
    ] {
        if let Err(e) = join {
            if e.is_panic() {
                error!("unrecoverable runtime panic: {e}");
                std::process::exit(2);
            }
        }
    }
    health_res.context("health server failed")?;
    metrics_res.context("metrics server failed")?;

    info!("clean shutdown");
    Ok(())
}
