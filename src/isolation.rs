// ABOUTME: Isolation resource manager allocating per-sandbox networks and volumes
// ABOUTME: Names and labels resources so orphans can be reclaimed after crashes

use crate::engine::{EngineError, SandboxEngine};
use crate::profile::{LABEL_MANAGED, LABEL_OWNER};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("failed to create isolated {kind} for {owner}: {source}")]
    ResourceCreation {
        kind: &'static str,
        owner: String,
        #[source]
        source: EngineError,
    },
}

pub type Result<T> = std::result::Result<T, IsolationError>;

/// Network and volume pair backing one sandbox instance.
#[derive(Debug, Clone)]
pub struct IsolationResources {
    pub network_id: String,
    pub volume_id: String,
}

/// Allocates and releases the isolation resources that are 1:1 with a
/// sandbox instance. Creation is fail-fast; release tolerates resources
/// that are already gone, leaving true orphans to reclamation.
pub struct IsolationManager {
    engine: Arc<dyn SandboxEngine>,
}

impl IsolationManager {
    pub fn new(engine: Arc<dyn SandboxEngine>) -> Self {
        Self { engine }
    }

    fn labels(owner_id: &str) -> Vec<(String, String)> {
        vec![
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_OWNER.to_string(), owner_id.to_string()),
        ]
    }

    pub fn network_name(owner_id: &str) -> String {
        format!("sbx-net-{}", owner_id)
    }

    pub fn volume_name(owner_id: &str) -> String {
        format!("sbx-vol-{}", owner_id)
    }

    pub async fn create_network(&self, owner_id: &str) -> Result<String> {
        let name = Self::network_name(owner_id);
        let id = self
            .engine
            .create_network(&name, &Self::labels(owner_id))
            .await
            .map_err(|source| IsolationError::ResourceCreation {
                kind: "network",
                owner: owner_id.to_string(),
                source,
            })?;
        debug!(owner = owner_id, network = %id, "created isolated network");
        Ok(id)
    }

    pub async fn create_volume(&self, owner_id: &str) -> Result<String> {
        let name = Self::volume_name(owner_id);
        let id = self
            .engine
            .create_volume(&name, &Self::labels(owner_id))
            .await
            .map_err(|source| IsolationError::ResourceCreation {
                kind: "volume",
                owner: owner_id.to_string(),
                source,
            })?;
        debug!(owner = owner_id, volume = %id, "created isolated volume");
        Ok(id)
    }

    /// Allocate both resources for one instance. If the volume fails after
    /// the network succeeded, the network is released before returning.
    pub async fn allocate(&self, owner_id: &str) -> Result<IsolationResources> {
        let network_id = self.create_network(owner_id).await?;
        match self.create_volume(owner_id).await {
            Ok(volume_id) => Ok(IsolationResources {
                network_id,
                volume_id,
            }),
            Err(e) => {
                self.release_network(&network_id).await;
                Err(e)
            }
        }
    }

    /// Remove a network, tolerating one that is already gone.
    pub async fn release_network(&self, network_id: &str) {
        if let Err(e) = self.engine.remove_network(network_id).await {
            warn!(network = network_id, error = %e, "failed to remove network");
        }
    }

    /// Remove a volume, tolerating one that is already gone.
    pub async fn release_volume(&self, volume_id: &str) {
        if let Err(e) = self.engine.remove_volume(volume_id).await {
            warn!(volume = volume_id, error = %e, "failed to remove volume");
        }
    }

    /// Release both resources of one instance. Failures are logged, never
    /// propagated; both removals are always attempted.
    pub async fn release(&self, resources: &IsolationResources) {
        self.release_network(&resources.network_id).await;
        self.release_volume(&resources.volume_id).await;
    }
}
