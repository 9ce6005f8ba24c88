use anyhow::{Context, Result};
use docket_core::storage::{JobStore, JsonlTransitionLog, RedbJobStore, SqliteJobStore};
use docket_core::{JobQueue, JobStatus, QueueConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocketConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub workflows: WorkflowsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redb,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Job store file, relative to the data directory. Defaults to
    /// `jobs.redb` or `jobs.sqlite` depending on the backend.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_transitions_dir")]
    pub transitions_dir: String,
}

fn default_transitions_dir() -> String {
    "transitions".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
            transitions_dir: default_transitions_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    30
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    #[serde(default = "default_workflows_dir")]
    pub dir: String,
}

fn default_workflows_dir() -> String {
    "workflows".to_string()
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            dir: default_workflows_dir(),
        }
    }
}

impl DocketConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                queue: Default::default(),
                cleanup: Default::default(),
                workflows: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the job store path
    pub fn store_path(&self) -> PathBuf {
        let file = match (&self.storage.path, self.storage.backend) {
            (Some(path), _) => path.as_str(),
            (None, StoreBackend::Redb) => "jobs.redb",
            (None, StoreBackend::Sqlite) => "jobs.sqlite",
        };
        self.data_dir.join(file)
    }

    /// Get the transition log path
    pub fn transitions_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.transitions_dir)
    }

    /// Get the workflow definitions path
    pub fn workflows_path(&self) -> PathBuf {
        self.data_dir.join(&self.workflows.dir)
    }
}

/// Handles opened from the configuration
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub transitions: Arc<JsonlTransitionLog<JobStatus>>,
}

impl AppState {
    pub fn new(config: &DocketConfig) -> Result<Self> {
        let store: Arc<dyn JobStore> = match config.storage.backend {
            StoreBackend::Redb => Arc::new(
                RedbJobStore::new(config.store_path()).context("Failed to open redb job store")?,
            ),
            StoreBackend::Sqlite => Arc::new(
                SqliteJobStore::open(config.store_path())
                    .context("Failed to open sqlite job store")?,
            ),
        };

        let transitions = Arc::new(
            JsonlTransitionLog::new(config.transitions_path())
                .context("Failed to create transition log")?,
        );

        let queue = Arc::new(
            JobQueue::new(store, config.queue.clone()).with_transition_log(transitions.clone()),
        );

        Ok(Self { queue, transitions })
    }
}
