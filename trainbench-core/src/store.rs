//! Experiment orchestration over a storage directory.
//!
//! One subdirectory per experiment, named by a random lowercase-alphanumeric
//! id. The directory is the unit of isolation and rollback: a failed create
//! deletes it whole, and delete removes config, status, checkpoint, and model
//! log together.

use crate::catalog::ExperimentConfig;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::experiment::{CONFIG_FILE, Experiment, MODEL_LOG_FILE};
use crate::persist;
use crate::runs::RunSupervisor;
use crate::status::{StatusDocument, StatusManager};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

const ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Everything the info endpoint exposes for one experiment.
#[derive(Debug, Serialize)]
pub struct ExperimentInfo {
    /// Rendered architecture text.
    pub model: String,
    pub config: ExperimentConfig,
    pub status: StatusDocument,
}

/// Manages the set of experiment directories.
pub struct ExperimentStore {
    root: PathBuf,
    id_len: usize,
}

impl ExperimentStore {
    /// Create the store, making sure the root directory exists.
    pub fn new(config: &AppConfig) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&config.experiments.dir)?;
        Ok(Self {
            root: config.experiments.dir.clone(),
            id_len: config.experiments.id_len,
        })
    }

    /// Create a new experiment from a parsed configuration.
    ///
    /// Rejects exact structural duplicates of any stored configuration, then
    /// persists the document and opens it (which builds and validates the
    /// model). Any failure past the directory creation rolls the whole
    /// directory back.
    pub fn create(&self, config: ExperimentConfig) -> Result<String, CoreError> {
        for existing_id in self.ids()? {
            let existing: Option<ExperimentConfig> =
                persist::load_yaml(&self.root.join(&existing_id).join(CONFIG_FILE))?;
            if existing.as_ref() == Some(&config) {
                tracing::error!("[{existing_id}] Duplicate experiment config submitted");
                return Err(CoreError::already_exists(format!(
                    "experiment exists: {existing_id}"
                )));
            }
        }

        let id = self.generate_id();
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;
        persist::atomic_write_yaml(&dir.join(CONFIG_FILE), &config)?;
        tracing::info!("[{id}] Experiment config saved at {}", dir.display());

        let outcome =
            Experiment::open(&dir).and_then(|exp| exp.status.create().map(|_| exp.id.clone()));
        match outcome {
            Ok(id) => {
                tracing::info!("[{id}] Experiment created");
                Ok(id)
            }
            Err(err) => {
                let _ = std::fs::remove_dir_all(&dir);
                tracing::error!("[{id}] Experiment rejected: {err}");
                Err(err)
            }
        }
    }

    /// All experiment ids, sorted.
    pub fn ids(&self) -> Result<Vec<String>, CoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Status document of every experiment.
    pub fn list(&self) -> Result<BTreeMap<String, StatusDocument>, CoreError> {
        let mut statuses = BTreeMap::new();
        for id in self.ids()? {
            let status = StatusManager::new(&self.root.join(&id)).read()?;
            statuses.insert(id, status);
        }
        Ok(statuses)
    }

    /// Combined config + status + rendered architecture. Read-only.
    pub fn info(&self, id: &str) -> Result<ExperimentInfo, CoreError> {
        let dir = self.existing_dir(id)?;
        let model = std::fs::read_to_string(dir.join(MODEL_LOG_FILE))?;
        let config: ExperimentConfig = persist::load_yaml(&dir.join(CONFIG_FILE))?
            .ok_or_else(|| CoreError::not_found(format!("experiment {id}")))?;
        let status = StatusManager::new(&dir).read()?;
        Ok(ExperimentInfo {
            model,
            config,
            status,
        })
    }

    /// Run every start precondition and the pre-flight smoke test, returning
    /// the opened experiment ready to hand to a [`RunSupervisor`].
    pub fn prepare_start(
        &self,
        id: &str,
        supervisor: &RunSupervisor,
    ) -> Result<Experiment, CoreError> {
        let dir = self.existing_dir(id)?;
        let exp = Experiment::open(&dir)?;

        let state = exp.status.state()?;
        if !state.is_startable() || supervisor.is_running(id) {
            return Err(CoreError::state(format!(
                "experiment {id} is currently running"
            )));
        }

        exp.try_start()?;
        Ok(exp)
    }

    /// Delete an experiment directory whole. Rejected while a run is live,
    /// whether the status document already says so or the run was launched a
    /// moment ago.
    pub fn delete(&self, id: &str, supervisor: &RunSupervisor) -> Result<(), CoreError> {
        let dir = self.existing_dir(id)?;
        let state = StatusManager::new(&dir).state()?;
        if !state.is_deletable() || supervisor.is_running(id) {
            return Err(CoreError::state(format!(
                "experiment {id} is currently running"
            )));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("[{id}] Experiment deleted");
        Ok(())
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf, CoreError> {
        let dir = self.root.join(id);
        if dir.join(CONFIG_FILE).exists() {
            Ok(dir)
        } else {
            Err(CoreError::not_found(format!("experiment {id}")))
        }
    }

    fn generate_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (0..self.id_len)
                .map(|_| ID_CHARS[rng.gen_range(0..ID_CHARS.len())] as char)
                .collect();
            if !self.root.join(&id).exists() {
                return id;
            }
        }
    }
}
