use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use log::{debug, error, info, warn};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use whizard_adapter_lib::{Cluster, SERVICE_LABEL_KEY, SERVICE_OVERRIDE_ANNOTATION_KEY};

use crate::error::Error;
use crate::probes::probes::Metrics;

const FIELD_MANAGER: &str = "whizard-adapter";

// Binding state of one Cluster, derived from the object itself on every event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindingState {
    // Observed, but not (or no longer) labelled with its effective service.
    Unmanaged,
    // Labelled with its effective service.
    Bound,
    // Deleted.
    Removed,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to bind cluster {name} to {service}: {source}")]
    Bind {
        name: String,
        service: String,
        #[source]
        source: kube::Error,
    },
}

// Writes a cluster's monitoring service binding.
#[async_trait]
pub trait ClusterBinder: Send + Sync {
    async fn bind(&self, name: &str, service: &str) -> Result<(), ReconcileError>;
}

pub struct KubeClusterBinder {
    api: Api<Cluster>,
}

impl KubeClusterBinder {
    pub fn new(client: Client) -> KubeClusterBinder {
        KubeClusterBinder { api: Api::all(client) }
    }
}

#[async_trait]
impl ClusterBinder for KubeClusterBinder {
    async fn bind(&self, name: &str, service: &str) -> Result<(), ReconcileError> {
        let labels = BTreeMap::from([(SERVICE_LABEL_KEY, service)]);
        let patch = json!({ "metadata": { "labels": labels } });
        let patched = self.api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)).await;
        bind_outcome(name, service, patched)
    }
}

fn bind_outcome(name: &str, service: &str, patched: Result<Cluster, kube::Error>) -> Result<(), ReconcileError> {
    match patched {
        Ok(_) => Ok(()),
        // Deleted between the event and the patch; the delete event follows.
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("Cluster {} vanished before it could be bound", name);
            Ok(())
        }
        Err(source) => Err(ReconcileError::Bind {
            name: name.to_string(),
            service: service.to_string(),
            source,
        }),
    }
}


pub struct ClusterReconciler {
    default_service: String,
    binder: Arc<dyn ClusterBinder>,
    metrics: Metrics,
}

impl ClusterReconciler {
    pub fn new(default_service: &str, binder: Arc<dyn ClusterBinder>, metrics: Metrics) -> ClusterReconciler {
        ClusterReconciler {
            default_service: default_service.to_string(),
            binder,
            metrics,
        }
    }

    // The per-cluster override when set, otherwise the configured default.
    pub fn effective_service(&self, cluster: &Cluster) -> String {
        cluster
            .annotations()
            .get(SERVICE_OVERRIDE_ANNOTATION_KEY)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| self.default_service.clone())
    }

    pub fn state_of(&self, cluster: &Cluster) -> BindingState {
        if cluster.metadata.deletion_timestamp.is_some() {
            return BindingState::Removed;
        }
        match cluster.labels().get(SERVICE_LABEL_KEY) {
            Some(bound) if *bound == self.effective_service(cluster) => BindingState::Bound,
            _ => BindingState::Unmanaged,
        }
    }

    // Create or update: make the binding label match the effective service.
    // Applying the same object twice patches at most once.
    pub async fn apply(&self, cluster: &Cluster) -> Result<BindingState, ReconcileError> {
        let name = cluster.name_any();
        match self.state_of(cluster) {
            BindingState::Bound => {
                debug!("Cluster {} already bound", name);
                Ok(BindingState::Bound)
            }
            BindingState::Removed => {
                debug!("Cluster {} is being deleted, skip binding", name);
                Ok(BindingState::Removed)
            }
            BindingState::Unmanaged => {
                let service = self.effective_service(cluster);
                self.binder.bind(&name, &service).await?;
                info!("Cluster {} bound to service {}", name, service);
                Ok(BindingState::Bound)
            }
        }
    }

    // Delete: nothing is owned by the adapter, observing the event is enough.
    pub fn remove(&self, cluster: &Cluster) -> BindingState {
        info!("Cluster {} removed", cluster.name_any());
        BindingState::Removed
    }

    // Errors are logged and swallowed so one cluster never stalls the others.
    pub async fn handle(&self, event: watcher::Event<Cluster>) {
        let outcome = match event {
            watcher::Event::Apply(cluster) | watcher::Event::InitApply(cluster) => self.apply(&cluster).await,
            watcher::Event::Delete(cluster) => Ok(self.remove(&cluster)),
            watcher::Event::Init => {
                debug!("Cluster watch (re)listing");
                return;
            }
            watcher::Event::InitDone => {
                debug!("Cluster watch relist done");
                return;
            }
        };

        let result = match outcome {
            Ok(_) => "success",
            Err(e) => {
                error!("Cluster reconciliation error: {}", e);
                "error"
            }
        };
        self.metrics.cluster_reconciles.with_label_values(&[result]).inc();
    }
}

// Feed watch events to the reconciler until the token is cancelled.
// Watch errors are retried by the stream itself, an ended stream is fatal.
pub async fn watch<S>(reconciler: &ClusterReconciler, events: S, token: CancellationToken) -> Result<(), Error>
where
    S: Stream<Item = Result<watcher::Event<Cluster>, watcher::Error>>,
{
    futures::pin_mut!(events);
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Stopping the cluster controller");
                return Ok(());
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => reconciler.handle(event).await,
            Some(Err(e)) => warn!("Cluster watch error, will retry: {}", e),
            None => return Err(Error::Fatal("cluster watch stream ended".to_string())),
        }
    }
}

pub async fn run(client: Client, default_service: &str, metrics: Metrics, token: CancellationToken) -> Result<(), Error> {
    let binder = Arc::new(KubeClusterBinder::new(client.clone()));
    let reconciler = ClusterReconciler::new(default_service, binder, metrics);
    let clusters: Api<Cluster> = Api::all(client);

    info!("Starting the cluster controller, default service {}", default_service);
    let events = watcher(clusters, watcher::Config::default()).default_backoff();
    watch(&reconciler, events, token).await
}
