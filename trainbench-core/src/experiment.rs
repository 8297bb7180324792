//! One experiment directory: config, model, trainer, and status together.

use crate::catalog::ExperimentConfig;
use crate::error::CoreError;
use crate::model::{self, ConfiguredNet, Device, NdBackend};
use crate::persist;
use crate::runs::CancelFlag;
use crate::status::StatusManager;
use crate::trainer::Trainer;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "configs.yaml";
pub const MODEL_LOG_FILE: &str = "model.log";

/// A fully opened experiment: configuration loaded, model validated, trainer
/// prepared.
pub struct Experiment {
    pub id: String,
    pub dir: PathBuf,
    pub config: ExperimentConfig,
    pub status: StatusManager,
    trainer: Trainer,
}

impl Experiment {
    /// Open an experiment directory.
    ///
    /// Loads `configs.yaml`, builds the network, validates it with the
    /// synthetic forward pass, writes the rendered architecture to
    /// `model.log`, and prepares datasets. Fails if any of these steps do —
    /// the caller decides whether to roll the directory back.
    pub fn open(dir: &Path) -> Result<Self, CoreError> {
        let id = dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CoreError::invalid_input("experiment directory has no name"))?
            .to_string();

        let config: ExperimentConfig =
            persist::load_yaml(&dir.join(CONFIG_FILE))?.ok_or_else(|| {
                CoreError::not_found(format!("experiment config in {}", dir.display()))
            })?;

        tracing::info!("[{id}] Building model");
        let device = Device::default();
        let net = ConfiguredNet::<NdBackend>::build(&config.model.layers, &device);
        if !model::validate(&net, &device) {
            return Err(CoreError::model("invalid model structure"));
        }
        persist::atomic_write(&dir.join(MODEL_LOG_FILE), model::render(&config).as_bytes())?;

        tracing::info!("[{id}] Building trainer");
        let trainer = Trainer::new(&id, dir, &config)?;

        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            config,
            status: StatusManager::new(dir),
            trainer,
        })
    }

    /// Pre-flight smoke test for the whole training pipeline.
    pub fn try_start(&self) -> Result<(), CoreError> {
        self.trainer.try_step()
    }

    /// Execute the full run on the current thread:
    /// `train → eval(train) → eval(valid) → done`.
    pub fn run(&self, cancel: &CancelFlag) -> Result<(), CoreError> {
        self.status.mark_train_start()?;
        self.trainer.train(&self.status, cancel)?;
        self.status.mark_eval_start()?;

        let train_result = self.trainer.eval(true)?;
        let valid_result = self.trainer.eval(false)?;
        self.status.mark_done(train_result, valid_result)
    }
}
