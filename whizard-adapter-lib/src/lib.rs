use std::fmt::Debug;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::ClusterResourceScope,
    Client, CustomResource, Resource, ResourceExt,
};
use log::debug;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

// Label binding a resource to a monitoring (whizard) service.
pub const SERVICE_LABEL_KEY: &str = "monitoring.whizard.io/service";
// Label binding a tenant to a storage backend.
pub const STORAGE_LABEL_KEY: &str = "monitoring.whizard.io/storage";
// Per-cluster override of the monitoring service a cluster is bound to.
pub const SERVICE_OVERRIDE_ANNOTATION_KEY: &str = "monitoring.whizard.io/service-override";

pub const DEFAULT_SERVICE: &str = "kubesphere-monitoring-system.central";
pub const DEFAULT_STORAGE: &str = "default";


// A whizard Tenant CRD. One tenant per monitoring tenant ID.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, PartialEq, Eq, Debug, JsonSchema)]
#[kube(group = "monitoring.whizard.io", version = "v1alpha1", kind = "Tenant", status = "TenantStatus")]
pub struct TenantSpec {
    // Tenant identifier, value to be sent with X-Scope-OrgID header
    #[serde(default)]
    pub tenant: String,
}

// Populated by the whizard controller once the tenant's workloads are placed.
#[derive(Deserialize, Serialize, Clone, Default, PartialEq, Eq, Debug, JsonSchema)]
pub struct TenantStatus {
    #[serde(default)]
    pub compactor: ObjectReference,
    #[serde(default)]
    pub ingester: ObjectReference,
    #[serde(default)]
    pub ruler: ObjectReference,
}

#[derive(Deserialize, Serialize, Clone, Default, PartialEq, Eq, Debug, JsonSchema)]
pub struct ObjectReference {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl ObjectReference {
    // Render as "<namespace>.<name>", which is "." for an unset reference.
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}


// A KubeSphere member cluster. Only metadata is touched by the adapter,
// the spec carries the few fields needed to round-trip the object.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, PartialEq, Eq, Debug, JsonSchema)]
#[kube(group = "cluster.kubesphere.io", version = "v1alpha1", kind = "Cluster")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_federation: Option<bool>,
}


#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ref resp) if resp.code == 404 => ClientError::NotFound(resp.message.clone()),
            kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClientError::AlreadyExists(resp.message.clone())
            }
            other => ClientError::Backend(Box::new(other)),
        }
    }
}

// Name-keyed access to a declarative resource.
// Not found and already exists are reported as distinct errors,
// anything else is a backend fault.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, ClientError>;

    async fn create(&self, resource: &K) -> Result<K, ClientError>;

    // Replace the stored object. The resource version carried by `resource`
    // is passed through so concurrent writers conflict at the backend.
    async fn update(&self, resource: &K) -> Result<K, ClientError>;

    async fn delete(&self, name: &str) -> Result<(), ClientError>;
}


// ResourceClient backed by the Kubernetes API for cluster scoped kinds.
pub struct KubeResourceClient<K> {
    api: Api<K>,
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = ClusterResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    pub fn new(client: Client) -> KubeResourceClient<K> {
        KubeResourceClient { api: Api::all(client) }
    }
}

impl<K> KubeResourceClient<K> {
    pub fn from_api(api: Api<K>) -> KubeResourceClient<K> {
        KubeResourceClient { api }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<K, ClientError> {
        debug!("get {} {}", K::kind(&Default::default()), name);
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, resource: &K) -> Result<K, ClientError> {
        debug!("create {} {}", K::kind(&Default::default()), resource.name_any());
        Ok(self.api.create(&PostParams::default(), resource).await?)
    }

    async fn update(&self, resource: &K) -> Result<K, ClientError> {
        let name = resource.name_any();
        debug!("update {} {}", K::kind(&Default::default()), name);
        Ok(self.api.replace(&name, &PostParams::default(), resource).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        debug!("delete {} {}", K::kind(&Default::default()), name);
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
