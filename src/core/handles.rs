//! Pass-through handles to external collaborators.
//!
//! The engine carries a cloud client, a certificate authority store and a
//! secret store for the tasks that need them. It never looks inside them;
//! task implementations downcast through [`as_any`](Cloud::as_any) to the
//! concrete client they were built for.

use std::any::Any;
use std::sync::Arc;

/// A cloud provider client.
pub trait Cloud: Send + Sync {
    /// Short provider name, used only for logging.
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// A certificate authority / keypair store.
pub trait CaStore: Send + Sync {
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// A secret store.
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Optional collaborator handles scoped to one convergence run.
#[derive(Clone, Default)]
pub struct Handles {
    cloud: Option<Arc<dyn Cloud>>,
    ca_store: Option<Arc<dyn CaStore>>,
    secret_store: Option<Arc<dyn SecretStore>>,
}

impl Handles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn Cloud>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_ca_store(mut self, store: Arc<dyn CaStore>) -> Self {
        self.ca_store = Some(store);
        self
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    pub fn cloud(&self) -> Option<&dyn Cloud> {
        self.cloud.as_deref()
    }

    pub fn ca_store(&self) -> Option<&dyn CaStore> {
        self.ca_store.as_deref()
    }

    pub fn secret_store(&self) -> Option<&dyn SecretStore> {
        self.secret_store.as_deref()
    }

    /// Names of the handles that are present, for logging.
    pub fn describe(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(cloud) = &self.cloud {
            out.push(format!("cloud={}", cloud.name()));
        }
        if let Some(store) = &self.ca_store {
            out.push(format!("ca={}", store.name()));
        }
        if let Some(store) = &self.secret_store {
            out.push(format!("secrets={}", store.name()));
        }
        out
    }
}

impl std::fmt::Debug for Handles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.describe()).finish()
    }
}
