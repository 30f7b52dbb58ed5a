use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use whizard_adapter_lib::{
    ClientError, ResourceClient, Tenant, TenantSpec, SERVICE_LABEL_KEY, STORAGE_LABEL_KEY,
};

// Longest name the API server accepts for a cluster scoped object.
const MAX_NAME_LENGTH: usize = 253;

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .unwrap_or_else(|e| panic!("invalid DNS-1123 pattern: {}", e))
});


#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct TenantInfo {
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    pub service: String,
    pub storage: String,
    pub compactor: String,
    pub ingester: String,
    pub ruler: String,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct TenantCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq, Debug)]
pub struct TenantUpdateRequest {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

// Error envelope written for every failed request.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ErrorMessage {
    pub message: String,
}


#[derive(Debug, Error)]
pub enum TenantError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
    #[error("request cancelled")]
    Cancelled,
}

impl From<ClientError> for TenantError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NotFound(msg) => TenantError::NotFound(msg),
            ClientError::AlreadyExists(msg) => TenantError::AlreadyExists(msg),
            ClientError::Backend(source) => TenantError::Backend(source),
        }
    }
}


impl TenantCreateRequest {
    pub fn validate(&self) -> Result<(), TenantError> {
        let name = self.name.as_deref().unwrap_or_default();
        if name.is_empty() {
            return Err(TenantError::Validation("name in body is required".to_string()));
        }
        validate_length("name", name)?;
        if !DNS1123_SUBDOMAIN.is_match(name) {
            return Err(TenantError::Validation(format!(
                "name in body should be a lowercase RFC 1123 subdomain, got {:?}",
                name
            )));
        }
        validate_length("service", self.service.as_deref().unwrap_or_default())?;
        validate_length("storage", self.storage.as_deref().unwrap_or_default())
    }
}

impl TenantUpdateRequest {
    pub fn validate(&self) -> Result<(), TenantError> {
        validate_length("service", self.service.as_deref().unwrap_or_default())?;
        validate_length("storage", self.storage.as_deref().unwrap_or_default())
    }
}

fn validate_length(field: &str, value: &str) -> Result<(), TenantError> {
    if value.len() > MAX_NAME_LENGTH {
        return Err(TenantError::Validation(format!(
            "{} in body should be at most {} chars long",
            field, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

// Some(v) only for a present, non-empty value.
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}


// Maps tenant requests onto Tenant resources.
// Every call is a single pass against the resource client, nothing is cached.
pub struct TenantManager {
    client: Arc<dyn ResourceClient<Tenant>>,
    default_service: String,
    default_storage: String,
}

impl TenantManager {
    pub fn new(
        client: Arc<dyn ResourceClient<Tenant>>,
        default_service: &str,
        default_storage: &str,
    ) -> TenantManager {
        TenantManager {
            client,
            default_service: default_service.to_string(),
            default_storage: default_storage.to_string(),
        }
    }

    pub async fn get(&self, tenant_name: &str) -> Result<TenantInfo, TenantError> {
        let tenant = self.client.get(tenant_name).await?;
        let labels = tenant.labels();
        let status = tenant.status.clone().unwrap_or_default();

        Ok(TenantInfo {
            tenant_id: tenant.spec.tenant.clone(),
            service: labels.get(SERVICE_LABEL_KEY).cloned().unwrap_or_default(),
            storage: labels.get(STORAGE_LABEL_KEY).cloned().unwrap_or_default(),
            compactor: status.compactor.dotted(),
            ingester: status.ingester.dotted(),
            ruler: status.ruler.dotted(),
        })
    }

    pub async fn create(&self, req: &TenantCreateRequest) -> Result<(), TenantError> {
        req.validate()?;
        let name = req.name.as_deref().unwrap_or_default();

        let mut labels = BTreeMap::new();
        labels.insert(SERVICE_LABEL_KEY.to_string(), self.default_service.clone());
        labels.insert(STORAGE_LABEL_KEY.to_string(), self.default_storage.clone());
        if let Some(service) = non_empty(&req.service) {
            labels.insert(SERVICE_LABEL_KEY.to_string(), service.to_string());
        }
        if let Some(storage) = non_empty(&req.storage) {
            labels.insert(STORAGE_LABEL_KEY.to_string(), storage.to_string());
        }

        let mut tenant = Tenant::new(name, TenantSpec { tenant: name.to_string() });
        tenant.metadata.labels = Some(labels);

        self.client.create(&tenant).await?;
        info!("Tenant {} created", name);
        Ok(())
    }

    // Writes back even when nothing changed, the update is an idempotent no-op then.
    pub async fn update(&self, tenant_name: &str, req: &TenantUpdateRequest) -> Result<(), TenantError> {
        let mut tenant = self.client.get(tenant_name).await?;
        let labels = tenant.labels_mut();

        for (key, value) in [(SERVICE_LABEL_KEY, &req.service), (STORAGE_LABEL_KEY, &req.storage)] {
            if let Some(v) = non_empty(value) {
                if labels.get(key).map(String::as_str) != Some(v) {
                    debug!("Tenant {} label {} set to {}", tenant_name, key, v);
                    labels.insert(key.to_string(), v.to_string());
                }
            }
        }

        self.client.update(&tenant).await?;
        info!("Tenant {} updated", tenant_name);
        Ok(())
    }

    // Deleting an absent tenant succeeds, so repeated deletes are harmless.
    pub async fn delete(&self, tenant_name: &str) -> Result<(), TenantError> {
        match self.client.get(tenant_name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!("Tenant {} does not exist, nothing to delete", tenant_name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.client.delete(tenant_name).await {
            Ok(()) => {
                info!("Tenant {} deleted", tenant_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
