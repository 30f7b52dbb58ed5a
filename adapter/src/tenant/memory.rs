// In-memory resource client used by the tests.
// Writes bump the resource version; an update carrying a stale version
// fails the same way the API server rejects it.
use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use whizard_adapter_lib::{ClientError, ResourceClient};

struct State<K> {
    items: BTreeMap<String, K>,
    version: u64,
    calls: usize,
    updates: usize,
    failure: Option<String>,
}

pub struct MemoryClient<K> {
    plural: &'static str,
    state: Mutex<State<K>>,
}

impl<K> MemoryClient<K>
where
    K: Resource + Clone,
{
    pub fn new(plural: &'static str) -> MemoryClient<K> {
        MemoryClient {
            plural,
            state: Mutex::new(State {
                items: BTreeMap::new(),
                version: 0,
                calls: 0,
                updates: 0,
                failure: None,
            }),
        }
    }

    pub fn stored(&self, name: &str) -> Option<K> {
        self.state.lock().unwrap().items.get(name).cloned()
    }

    // Edit a stored object out of band, as another controller would.
    pub fn modify(&self, name: &str, edit: impl FnOnce(&mut K)) {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get_mut(name) {
            edit(item);
        }
    }

    // Make every following call fail with a backend fault.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().unwrap().failure = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn updates(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    fn not_found(&self, name: &str) -> ClientError {
        ClientError::NotFound(format!("{} \"{}\" not found", self.plural, name))
    }

    fn enter(&self) -> Result<std::sync::MutexGuard<'_, State<K>>, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        match state.failure.clone() {
            Some(message) => Err(ClientError::Backend(message.into())),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl<K> ResourceClient<K> for MemoryClient<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, ClientError> {
        let state = self.enter()?;
        state.items.get(name).cloned().ok_or_else(|| self.not_found(name))
    }

    async fn create(&self, resource: &K) -> Result<K, ClientError> {
        let mut state = self.enter()?;
        let name = resource.name_any();
        if state.items.contains_key(&name) {
            return Err(ClientError::AlreadyExists(format!("{} \"{}\" already exists", self.plural, name)));
        }
        state.version += 1;
        let mut stored = resource.clone();
        stored.meta_mut().resource_version = Some(state.version.to_string());
        state.items.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, resource: &K) -> Result<K, ClientError> {
        let mut state = self.enter()?;
        let name = resource.name_any();
        let current = match state.items.get(&name) {
            Some(item) => item.resource_version(),
            None => return Err(self.not_found(&name)),
        };
        if resource.resource_version().is_some() && resource.resource_version() != current {
            return Err(ClientError::Backend(
                format!(
                    "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                    self.plural, name
                )
                .into(),
            ));
        }
        state.version += 1;
        state.updates += 1;
        let mut stored = resource.clone();
        stored.meta_mut().resource_version = Some(state.version.to_string());
        state.items.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.enter()?;
        match state.items.remove(name) {
            Some(_) => Ok(()),
            None => Err(self.not_found(name)),
        }
    }
}
