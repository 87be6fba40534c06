//! Persistence of applications and deployments.
//!
//! The orchestrator only needs load/save by id plus a per-application
//! deployment listing. `FileStore` keeps everything in one JSON document,
//! rewritten atomically (temp file + rename) on every save.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quark_id::{ApplicationId, DeploymentId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::{Application, Deployment};

/// State file format version.
const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_application(&self, id: ApplicationId) -> Result<Option<Application>, StoreError>;

    async fn save_application(&self, application: &Application) -> Result<(), StoreError>;

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError>;

    async fn load_deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError>;

    async fn save_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;

    /// Deployments for one application, oldest first.
    async fn list_deployments(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Deployment>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct State {
    version: u32,
    applications: BTreeMap<ApplicationId, Application>,
    deployments: BTreeMap<DeploymentId, Deployment>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            applications: BTreeMap::new(),
            deployments: BTreeMap::new(),
        }
    }
}

impl State {
    fn deployments_for(&self, application_id: ApplicationId) -> Vec<Deployment> {
        // ULIDs minted in the same millisecond are not ordered.
        let mut found: Vec<_> = self
            .deployments
            .values()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect();
        found.sort_by_key(|d| (d.created_at, d.id));
        found
    }
}

/// Store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load_application(&self, id: ApplicationId) -> Result<Option<Application>, StoreError> {
        Ok(self.state.read().await.applications.get(&id).cloned())
    }

    async fn save_application(&self, application: &Application) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .applications
            .insert(application.id, application.clone());
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        Ok(self.state.read().await.applications.values().cloned().collect())
    }

    async fn load_deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError> {
        Ok(self.state.read().await.deployments.get(&id).cloned())
    }

    async fn save_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .deployments
            .insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn list_deployments(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Deployment>, StoreError> {
        Ok(self.state.read().await.deployments_for(application_id))
    }
}

/// Store persisted to a single JSON file.
pub struct FileStore {
    path: PathBuf,
    state: RwLock<State>,
}

impl FileStore {
    /// Open the state file, starting empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: State =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                if state.version != STATE_VERSION {
                    warn!(
                        path = %path.display(),
                        file_version = state.version,
                        current_version = STATE_VERSION,
                        "State file version mismatch, starting fresh"
                    );
                    State::default()
                } else {
                    info!(
                        path = %path.display(),
                        applications = state.applications.len(),
                        deployments = state.deployments.len(),
                        "Loaded state from disk"
                    );
                    state
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting fresh");
                State::default()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Write the whole state. Called with the write lock held so saves
    /// land on disk in the order they were applied.
    async fn persist(&self, state: &State) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(io_error(parent))?;
            }
        }

        let content = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(io_error(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_error(&self.path))?;

        debug!(path = %self.path.display(), bytes = content.len(), "Saved state to disk");
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

#[async_trait]
impl Store for FileStore {
    async fn load_application(&self, id: ApplicationId) -> Result<Option<Application>, StoreError> {
        Ok(self.state.read().await.applications.get(&id).cloned())
    }

    async fn save_application(&self, application: &Application) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.applications.insert(application.id, application.clone());
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        Ok(self.state.read().await.applications.values().cloned().collect())
    }

    async fn load_deployment(&self, id: DeploymentId) -> Result<Option<Deployment>, StoreError> {
        Ok(self.state.read().await.deployments.get(&id).cloned())
    }

    async fn save_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.deployments.insert(deployment.id, deployment.clone());
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn list_deployments(
        &self,
        application_id: ApplicationId,
    ) -> Result<Vec<Deployment>, StoreError> {
        Ok(self.state.read().await.deployments_for(application_id))
    }
}
