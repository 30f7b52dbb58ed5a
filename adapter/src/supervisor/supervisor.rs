use std::future::Future;
use std::sync::Arc;

use kube::Client;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use whizard_adapter_lib::{KubeResourceClient, Tenant};

use crate::controller::controller;
use crate::error::Error;
use crate::leader::leader::{self, LeaderElector};
use crate::options::options::{LeaderElectionConfig, Options};
use crate::probes::probes::{self, Metrics};
use crate::server::server::{self, Server};
use crate::tenant::tenant::TenantManager;

// Owns the single internal run of the process. Resolves Ok on external
// shutdown and with the run's error when it fails first; either way the
// run is cancelled and awaited before returning.
pub async fn supervise<S, F, Fut>(shutdown: S, run: F) -> Result<(), Error>
where
    S: Future<Output = ()>,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let token = CancellationToken::new();
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);

    let internal = run(token.clone());
    let handle = tokio::spawn(async move {
        if let Err(e) = internal.await {
            let _ = err_tx.send(e).await;
        }
    });

    // A run that finishes cleanly closes the channel; keep serving until shutdown.
    let result = tokio::select! {
        _ = shutdown => {
            info!("Shutdown requested, stopping");
            Ok(())
        }
        Some(e) = err_rx.recv() => {
            error!("Internal run failed: {}", e);
            Err(e)
        }
    };

    token.cancel();
    if let Err(e) = handle.await {
        warn!("Internal run did not stop cleanly: {}", e);
    }
    result
}

// Everything the process does, under one token.
pub async fn run(options: Options, token: CancellationToken) -> Result<(), Error> {
    let metrics = Metrics::new()?;
    let client = Client::try_default().await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(probes::serve_health(options.health_probe_bind_address, token.clone()));
    tasks.spawn(probes::serve_metrics(options.metrics_bind_address, metrics.clone(), token.clone()));

    if options.web_enabled {
        let tenants = Arc::new(TenantManager::new(
            Arc::new(KubeResourceClient::<Tenant>::new(client.clone())),
            &options.default_whizard_service,
            &options.default_storage,
        ));
        let server = Arc::new(Server::new(
            tenants,
            metrics.clone(),
            options.content_length_limit,
            token.clone(),
        ));
        tasks.spawn(server::serve(options.web_bind_address, server, token.clone()));
    }

    if options.kubesphere_adapter_enabled {
        tasks.spawn(run_controllers(
            client,
            options.leader_election.clone(),
            options.default_whizard_service.clone(),
            metrics,
            token.clone(),
        ));
    }

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| Error::Fatal(format!("task failed: {}", e)))?;
        if let Err(e) = outcome {
            token.cancel();
            return Err(e);
        }
    }
    Ok(())
}

// Controllers only run on the leader when leader election is configured.
async fn run_controllers(
    client: Client,
    leader_election: Option<LeaderElectionConfig>,
    default_service: String,
    metrics: Metrics,
    token: CancellationToken,
) -> Result<(), Error> {
    let config = match leader_election {
        None => return controller::run(client, &default_service, metrics, token).await,
        Some(config) => config,
    };

    let elector = LeaderElector::new(client.clone(), &config, &leader::identity());
    if !elector.acquire(&token).await {
        return Ok(());
    }
    metrics.leader.set(1);

    let result = tokio::select! {
        held = elector.hold(&token) => held.map_err(Error::from),
        ran = controller::run(client, &default_service, metrics.clone(), token.clone()) => ran,
    };

    metrics.leader.set(0);
    if let Err(e) = elector.release().await {
        warn!("Failed to release leader lease: {}", e);
    }
    result
}

// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
