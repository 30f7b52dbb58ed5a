// Leader election on a coordination.k8s.io/v1 Lease.
//
// Acquire, renew and take-over are compare-and-swap writes guarded by the
// lease's resourceVersion, so two replicas can never both win the same round.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::options::options::LeaderElectionConfig;

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("leader election API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("leader election lost: lease {0} not renewed within the renew deadline")]
    LeadershipLost(String),
}

// What to do with the lease as last observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    Create,
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

pub fn next_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let spec = match lease {
        None => return LeaseAction::Create,
        Some(lease) => lease.spec.as_ref(),
    };

    let holder = spec.and_then(|s| s.holder_identity.as_deref()).filter(|h| !h.is_empty());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration) {
        (None, _, _) => true,
        (Some(_), Some(rt), Some(d)) => now > rt.0 + chrono::Duration::seconds(i64::from(d)),
        _ => true,
    };

    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

// Stable identity of this replica.
pub fn identity() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("POD_NAME"))
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("whizard-adapter-{}", std::process::id()))
}


// The Lease calls the elector makes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Lease, kube::Error>;

    async fn create(&self, lease: &Lease) -> Result<Lease, kube::Error>;

    // Fails with 409 when `lease` carries a stale resourceVersion.
    async fn replace(&self, name: &str, lease: &Lease) -> Result<Lease, kube::Error>;
}

pub struct KubeLeaseStore {
    api: Api<Lease>,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str) -> KubeLeaseStore {
        KubeLeaseStore { api: Api::namespaced(client, namespace) }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Lease, kube::Error> {
        self.api.get(name).await
    }

    async fn create(&self, lease: &Lease) -> Result<Lease, kube::Error> {
        self.api.create(&PostParams::default(), lease).await
    }

    async fn replace(&self, name: &str, lease: &Lease) -> Result<Lease, kube::Error> {
        self.api.replace(name, &PostParams::default(), lease).await
    }
}


pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, config: &LeaderElectionConfig, identity: &str) -> LeaderElector {
        LeaderElector::with_store(Arc::new(KubeLeaseStore::new(client, &config.namespace)), config, identity)
    }

    pub fn with_store(store: Arc<dyn LeaseStore>, config: &LeaderElectionConfig, identity: &str) -> LeaderElector {
        LeaderElector {
            store,
            lease_name: config.lease_name.clone(),
            identity: identity.to_string(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
        }
    }

    // Block until this replica leads. False when cancelled first.
    pub async fn acquire(&self, token: &CancellationToken) -> bool {
        info!("Attempting to acquire leader lease {} as {}", self.lease_name, self.identity);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                attempt = self.try_acquire_or_renew() => attempt,
            };
            match attempt {
                Ok(true) => {
                    info!("Successfully acquired lease {}", self.lease_name);
                    return true;
                }
                Ok(false) => debug!("Lease {} held by another replica", self.lease_name),
                Err(e) => warn!("Failed to acquire lease {}: {}", self.lease_name, e),
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    // Keep renewing until cancelled. Going a full renew deadline without a
    // successful renewal, or finding another holder, ends leadership.
    // A renewal that is still pending at the deadline counts as failed.
    pub async fn hold(&self, token: &CancellationToken) -> Result<(), LeaderElectionError> {
        let mut renewed = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.retry_period) => {}
            }

            let remaining = self.renew_deadline.saturating_sub(renewed.elapsed());
            match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => renewed = Instant::now(),
                Ok(Ok(false)) => {
                    warn!("Lease {} taken over by another replica", self.lease_name);
                    return Err(LeaderElectionError::LeadershipLost(self.lease_name.clone()));
                }
                Ok(Err(e)) => warn!("Failed to renew lease {}: {}", self.lease_name, e),
                Err(_) => warn!("Renewing lease {} timed out", self.lease_name),
            }

            if renewed.elapsed() >= self.renew_deadline {
                return Err(LeaderElectionError::LeadershipLost(self.lease_name.clone()));
            }
        }
    }

    // Clear the holder so a standby can take over without waiting for expiry.
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        let mut lease = match self.store.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!("Not holding lease {}, nothing to release", self.lease_name);
            return Ok(());
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));

        match self.store.replace(&self.lease_name, &lease).await {
            Ok(_) => {
                info!("Released lease {}", self.lease_name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Lease {} changed before release", self.lease_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let existing = match self.store.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let result = match (next_action(existing.as_ref(), &self.identity, now), existing) {
            (LeaseAction::Create, _) => {
                let lease = self.lease(ObjectMeta::default(), now, now, 0);
                self.store.create(&lease).await
            }
            (LeaseAction::Renew, Some(mut lease)) => {
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                    spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                }
                self.store.replace(&self.lease_name, &lease).await
            }
            (LeaseAction::TakeOver { transitions }, Some(lease)) => {
                let lease = self.lease(lease.metadata, now, now, transitions + 1);
                self.store.replace(&self.lease_name, &lease).await
            }
            _ => return Ok(false),
        };

        match result {
            Ok(_) => Ok(true),
            // Someone else wrote the lease since we read it.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // Lease durations travel as i32 seconds.
    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn lease(&self, meta: ObjectMeta, acquired: DateTime<Utc>, renewed: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..meta
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_seconds()),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use kube::error::ErrorResponse;

    const LEASE_NAME: &str = "whizard-controller-manager-leader-election";

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("leases.coordination.k8s.io \"{}\" {}", LEASE_NAME, reason),
            reason: reason.to_string(),
            code,
        })
    }

    // Single-lease store with resourceVersion checks. `hang` stalls every
    // call, `fail` answers every call with a server error.
    #[derive(Default)]
    struct MemoryLeaseStore {
        lease: Mutex<Option<Lease>>,
        version: Mutex<u64>,
        hang: AtomicBool,
        fail: AtomicBool,
    }

    impl MemoryLeaseStore {
        fn holder(&self) -> Option<String> {
            let lease = self.lease.lock().unwrap();
            lease.as_ref().and_then(|l| l.spec.as_ref()).and_then(|s| s.holder_identity.clone())
        }

        fn transitions(&self) -> Option<i32> {
            let lease = self.lease.lock().unwrap();
            lease.as_ref().and_then(|l| l.spec.as_ref()).and_then(|s| s.lease_transitions)
        }

        fn put(&self, mut lease: Lease) -> Lease {
            let mut version = self.version.lock().unwrap();
            *version += 1;
            lease.metadata.resource_version = Some(version.to_string());
            *self.lease.lock().unwrap() = Some(lease.clone());
            lease
        }

        async fn ready(&self) -> Result<(), kube::Error> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(api_error(500, "InternalError"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LeaseStore for MemoryLeaseStore {
        async fn get(&self, _name: &str) -> Result<Lease, kube::Error> {
            self.ready().await?;
            let lease = self.lease.lock().unwrap().clone();
            lease.ok_or_else(|| api_error(404, "NotFound"))
        }

        async fn create(&self, lease: &Lease) -> Result<Lease, kube::Error> {
            self.ready().await?;
            if self.lease.lock().unwrap().is_some() {
                return Err(api_error(409, "AlreadyExists"));
            }
            Ok(self.put(lease.clone()))
        }

        async fn replace(&self, _name: &str, lease: &Lease) -> Result<Lease, kube::Error> {
            self.ready().await?;
            let current = self.lease.lock().unwrap().as_ref().and_then(|l| l.metadata.resource_version.clone());
            if current != lease.metadata.resource_version {
                return Err(api_error(409, "Conflict"));
            }
            Ok(self.put(lease.clone()))
        }
    }

    fn config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_name: LEASE_NAME.to_string(),
            namespace: "kubesphere-monitoring-system".to_string(),
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
        }
    }

    fn elector(store: &Arc<MemoryLeaseStore>, identity: &str) -> LeaderElector {
        LeaderElector::with_store(store.clone(), &config(), identity)
    }

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration: i32, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("whizard-controller-manager-leader-election".to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(renewed_secs_ago))),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(next_action(None, "a", Utc::now()), LeaseAction::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
        let l = lease(Some("a"), 100, 30, 2);
        assert_eq!(next_action(Some(&l), "a", Utc::now()), LeaseAction::Renew);
    }

    #[test]
    fn live_foreign_lease_is_left_alone() {
        let l = lease(Some("b"), 5, 30, 2);
        assert_eq!(next_action(Some(&l), "a", Utc::now()), LeaseAction::Wait);
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let l = lease(Some("b"), 31, 30, 2);
        assert_eq!(next_action(Some(&l), "a", Utc::now()), LeaseAction::TakeOver { transitions: 2 });
    }

    #[test]
    fn released_lease_is_taken_over_immediately() {
        let l = lease(None, 0, 30, 4);
        assert_eq!(next_action(Some(&l), "a", Utc::now()), LeaseAction::TakeOver { transitions: 4 });

        let l = lease(Some(""), 0, 30, 4);
        assert_eq!(next_action(Some(&l), "a", Utc::now()), LeaseAction::TakeOver { transitions: 4 });
    }

    #[test]
    fn lease_without_spec_is_taken_over() {
        let l = Lease { metadata: ObjectMeta::default(), spec: None };
        assert_eq!(next_action(Some(&l), "a", Utc::now()), LeaseAction::TakeOver { transitions: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_creates_a_missing_lease() {
        let store = Arc::new(MemoryLeaseStore::default());
        assert!(elector(&store, "a").acquire(&CancellationToken::new()).await);
        assert_eq!(store.holder().as_deref(), Some("a"));
        assert_eq!(store.transitions(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_on_a_live_lease_until_cancelled() {
        let store = Arc::new(MemoryLeaseStore::default());
        store.put(lease(Some("b"), 0, 30, 1));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        });

        assert!(!elector(&store, "a").acquire(&token).await);
        assert_eq!(store.holder().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_is_cancellable_while_the_api_stalls() {
        let store = Arc::new(MemoryLeaseStore::default());
        store.hang.store(true, Ordering::SeqCst);
        let token = CancellationToken::new();
        token.cancel();
        assert!(!elector(&store, "a").acquire(&token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn released_lease_goes_to_the_standby() {
        let store = Arc::new(MemoryLeaseStore::default());
        let leader = elector(&store, "a");
        let standby = elector(&store, "b");
        let token = CancellationToken::new();

        assert!(leader.acquire(&token).await);
        leader.release().await.unwrap();
        assert_eq!(store.holder(), None);

        assert!(standby.acquire(&token).await);
        assert_eq!(store.holder().as_deref(), Some("b"));
        assert_eq!(store.transitions(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn release_leaves_a_foreign_lease_alone() {
        let store = Arc::new(MemoryLeaseStore::default());
        store.put(lease(Some("b"), 0, 30, 1));
        elector(&store, "a").release().await.unwrap();
        assert_eq!(store.holder().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_stops_on_cancel() {
        let store = Arc::new(MemoryLeaseStore::default());
        let leader = elector(&store, "a");
        let token = CancellationToken::new();
        assert!(leader.acquire(&token).await);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        });
        leader.hold(&token).await.unwrap();
        assert_eq!(store.holder().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_fails_when_another_replica_holds_the_lease() {
        let store = Arc::new(MemoryLeaseStore::default());
        let leader = elector(&store, "a");
        let token = CancellationToken::new();
        assert!(leader.acquire(&token).await);

        store.put(lease(Some("b"), 0, 30, 1));
        let err = leader.hold(&token).await.unwrap_err();
        assert!(matches!(err, LeaderElectionError::LeadershipLost(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_fails_when_renewals_keep_failing() {
        let store = Arc::new(MemoryLeaseStore::default());
        let leader = elector(&store, "a");
        let token = CancellationToken::new();
        assert!(leader.acquire(&token).await);

        store.fail.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let err = leader.hold(&token).await.unwrap_err();
        assert!(matches!(err, LeaderElectionError::LeadershipLost(_)));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16), "{:?}", started.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn hold_fails_by_the_deadline_when_renewals_stall() {
        let store = Arc::new(MemoryLeaseStore::default());
        let leader = elector(&store, "a");
        let token = CancellationToken::new();
        assert!(leader.acquire(&token).await);

        store.hang.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let err = leader.hold(&token).await.unwrap_err();
        assert!(matches!(err, LeaderElectionError::LeadershipLost(_)));
        assert!(started.elapsed() < Duration::from_secs(16), "{:?}", started.elapsed());
    }

    #[test]
    fn oversized_lease_duration_is_clamped() {
        let store = Arc::new(MemoryLeaseStore::default());
        let mut config = config();
        config.lease_duration = Duration::from_secs(u64::MAX);
        let leader = LeaderElector::with_store(store, &config, "a");
        assert_eq!(leader.lease_duration_seconds(), i32::MAX);
    }

    #[test]
    fn identity_is_never_empty() {
        assert!(!identity().is_empty());
    }
}
