//! Training and evaluation loops for one experiment.

use crate::catalog::{ExperimentConfig, LayerConfig, LossKind, OptimKind, TrainConfig};
use crate::data::{self, BatchIter, Sample};
use crate::error::CoreError;
use crate::metrics::{EvalReport, classification_report};
use crate::model::{
    ConfiguredNet, Device, IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH, NUM_CLASSES, TrainBackend,
    VALIDATE_BATCH,
};
use crate::runs::CancelFlag;
use crate::status::StatusManager;
use burn::module::Module;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{
    AdaGradConfig, AdamConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig,
};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::{Distribution, Tensor, activation, backend::Backend};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

/// Checkpoint file stem; the recorder appends its own extension.
const CHECKPOINT_FILE: &str = "best";

/// Sentinel the running-best loss starts from, as reported in the first
/// progress update.
const INITIAL_BEST_LOSS: f64 = 999.0;

type ModelRecorder = BinFileRecorder<FullPrecisionSettings>;

/// Runs the training and evaluation loops for one experiment directory and
/// owns its checkpoint.
pub struct Trainer {
    exp_id: String,
    dir: PathBuf,
    layers: Vec<LayerConfig>,
    train_config: TrainConfig,
    train_samples: Vec<Sample>,
    valid_samples: Vec<Sample>,
}

impl Trainer {
    /// Prepare datasets and loaders from the experiment configuration.
    pub fn new(exp_id: &str, dir: &Path, config: &ExperimentConfig) -> Result<Self, CoreError> {
        let train_samples = data::load_split(&config.data, true)?;
        let valid_samples = data::load_split(&config.data, false)?;

        Ok(Self {
            exp_id: exp_id.to_string(),
            dir: dir.to_path_buf(),
            layers: config.model.layers.clone(),
            train_config: config.train.clone(),
            train_samples,
            valid_samples,
        })
    }

    /// Train for the configured number of epochs, persisting the checkpoint
    /// whenever an epoch's mean loss improves the running minimum.
    ///
    /// Progress is recorded at the start of each epoch, so the reported best
    /// loss trails the loss of the epoch being computed by one.
    pub fn train(&self, status: &StatusManager, cancel: &CancelFlag) -> Result<(), CoreError> {
        let device = Device::default();
        let net = ConfiguredNet::<TrainBackend>::build(&self.layers, &device);

        match self.train_config.optim {
            OptimKind::GradientDescent => self.fit(
                net,
                SgdConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>(),
                status,
                cancel,
            ),
            OptimKind::Adam => self.fit(
                net,
                AdamConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>(),
                status,
                cancel,
            ),
            OptimKind::Rmsprop => self.fit(
                net,
                RmsPropConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>(),
                status,
                cancel,
            ),
            OptimKind::Adagrad => self.fit(
                net,
                AdaGradConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>(),
                status,
                cancel,
            ),
        }
    }

    fn fit<O>(
        &self,
        mut net: ConfiguredNet<TrainBackend>,
        mut optim: O,
        status: &StatusManager,
        cancel: &CancelFlag,
    ) -> Result<(), CoreError>
    where
        O: Optimizer<ConfiguredNet<TrainBackend>, TrainBackend>,
    {
        let device = Device::default();
        let config = &self.train_config;
        let mut rng = StdRng::from_entropy();
        let mut min_loss = INITIAL_BEST_LOSS;

        for epoch in 0..config.num_epochs {
            status.update_progress(epoch + 1, min_loss)?;

            let mut iter = BatchIter::shuffled(&self.train_samples, config.batch_size, &mut rng);
            let total_step = iter.num_batches();
            let mut total_loss = 0.0f64;
            let mut step = 0usize;

            while let Some(batch) = iter.next_batch::<TrainBackend>(&device) {
                if cancel.is_cancelled() {
                    return Err(CoreError::training("run cancelled"));
                }
                step += 1;
                let batch_len = batch.labels.len();

                let logits = net.forward(batch.images)?;
                let targets = data::one_hot::<TrainBackend>(&batch.labels, &device);
                let loss = compute_loss(config.loss, logits, targets);
                let loss_value = scalar(&loss);
                total_loss += loss_value * batch_len as f64;

                if step % config.log_every == 0 {
                    tracing::info!(
                        "[{}] Epoch [{}/{}], Step [{}/{}], Loss: {:.4}",
                        self.exp_id,
                        epoch + 1,
                        config.num_epochs,
                        step,
                        total_step,
                        loss_value
                    );
                }

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &net);
                net = optim.step(config.lr, net, grads);
            }

            let avg_loss = total_loss / self.train_samples.len() as f64;
            if avg_loss < min_loss {
                tracing::info!(
                    "[{}] Epoch [{}/{}], Loss update: {:.4} -> {:.4}",
                    self.exp_id,
                    epoch + 1,
                    config.num_epochs,
                    min_loss,
                    avg_loss
                );
                min_loss = avg_loss;
                self.save_checkpoint(&net)?;
            }
        }

        Ok(())
    }

    /// Evaluate the best checkpoint on the train or valid split.
    ///
    /// Fails hard when no checkpoint exists; does not touch the status
    /// document — the caller decides what to do with the result.
    pub fn eval(&self, train: bool) -> Result<EvalReport, CoreError> {
        let device = Device::default();
        let net = self.load_checkpoint::<crate::model::NdBackend>(&device)?;
        let samples = if train {
            &self.train_samples
        } else {
            &self.valid_samples
        };

        let mut true_labels = Vec::with_capacity(samples.len());
        let mut predicted_labels = Vec::with_capacity(samples.len());

        let mut iter = BatchIter::sequential(samples, self.train_config.batch_size);
        while let Some(batch) = iter.next_batch::<crate::model::NdBackend>(&device) {
            let logits = net.forward(batch.images)?;
            let predicted = logits
                .argmax(1)
                .to_data()
                .to_vec::<i64>()
                .map_err(|e| CoreError::evaluation(format!("argmax readback failed: {e:?}")))?;
            predicted_labels.extend(predicted.into_iter().map(|p| p as usize));
            true_labels.extend(batch.labels);
        }

        let report = classification_report(&true_labels, &predicted_labels, NUM_CLASSES);

        let split = if train { "TRAIN" } else { "VALID" };
        tracing::info!("[{}] === RESULT ON {split} SET ===", self.exp_id);
        tracing::info!("[{}] Accuracy: {:.2}%", self.exp_id, report.accuracy * 100.0);
        tracing::info!(
            "[{}] Precision: (Micro) {:.2}% - (Macro) {:.2}%",
            self.exp_id,
            report.precision.micro * 100.0,
            report.precision.macro_avg * 100.0
        );
        tracing::info!(
            "[{}] Recall: (Micro) {:.2}% - (Macro) {:.2}%",
            self.exp_id,
            report.recall.micro * 100.0,
            report.recall.macro_avg * 100.0
        );

        Ok(report)
    }

    /// Pre-flight smoke test: one forward + backward + optimizer step on a
    /// synthetic batch. Any failure — including a panic deep in the tensor
    /// library — is surfaced synchronously instead of killing a background
    /// run later.
    pub fn try_step(&self) -> Result<(), CoreError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.try_step_inner()));
        match outcome {
            Ok(result) => result,
            Err(panic) => Err(CoreError::training(format!(
                "pre-flight training step panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    fn try_step_inner(&self) -> Result<(), CoreError> {
        let device = Device::default();
        let net = ConfiguredNet::<TrainBackend>::build(&self.layers, &device);

        let images = Tensor::<TrainBackend, 4>::random(
            [VALIDATE_BATCH, IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH],
            Distribution::Default,
            &device,
        );
        let mut rng = rand::thread_rng();
        let labels: Vec<usize> = (0..VALIDATE_BATCH)
            .map(|_| rng.gen_range(0..NUM_CLASSES))
            .collect();

        let logits = net.forward(images)?;
        let targets = data::one_hot::<TrainBackend>(&labels, &device);
        let loss = compute_loss(self.train_config.loss, logits, targets);
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &net);

        match self.train_config.optim {
            OptimKind::GradientDescent => {
                let mut optim =
                    SgdConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>();
                let _ = optim.step(self.train_config.lr, net, grads);
            }
            OptimKind::Adam => {
                let mut optim =
                    AdamConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>();
                let _ = optim.step(self.train_config.lr, net, grads);
            }
            OptimKind::Rmsprop => {
                let mut optim =
                    RmsPropConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>();
                let _ = optim.step(self.train_config.lr, net, grads);
            }
            OptimKind::Adagrad => {
                let mut optim =
                    AdaGradConfig::new().init::<TrainBackend, ConfiguredNet<TrainBackend>>();
                let _ = optim.step(self.train_config.lr, net, grads);
            }
        }
        Ok(())
    }

    fn checkpoint_stem(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn save_checkpoint(&self, net: &ConfiguredNet<TrainBackend>) -> Result<(), CoreError> {
        let recorder = ModelRecorder::new();
        recorder
            .record(net.clone().into_record(), self.checkpoint_stem())
            .map_err(|e| CoreError::checkpoint(format!("failed to save checkpoint: {e:?}")))
    }

    fn load_checkpoint<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<ConfiguredNet<B>, CoreError> {
        if !self.checkpoint_stem().with_extension("bin").exists() {
            return Err(CoreError::checkpoint(
                "no checkpoint found; the experiment has not been trained",
            ));
        }
        let recorder = ModelRecorder::new();
        let net = ConfiguredNet::<B>::build(&self.layers, device);
        net.load_file(self.checkpoint_stem(), &recorder, device)
            .map_err(|e| CoreError::checkpoint(format!("failed to load checkpoint: {e:?}")))
    }
}

fn compute_loss<B: Backend>(
    kind: LossKind,
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match kind {
        LossKind::CrossEntropy => (activation::log_softmax(logits, 1) * targets)
            .sum_dim(1)
            .mean()
            .neg(),
        LossKind::Mse => MseLoss::new().forward(logits, targets, Reduction::Mean),
        LossKind::SmoothL1 => smooth_l1(logits, targets),
    }
}

/// `0.5 * d^2` below the unit threshold, `|d| - 0.5` above it.
fn smooth_l1<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let diff = (logits - targets).abs();
    let small = diff.clone().lower_elem(1.0).float();
    let quadratic = (diff.clone() * diff.clone()).mul_scalar(0.5);
    let linear = diff.sub_scalar(0.5);
    (quadratic * small.clone() + linear * small.neg().add_scalar(1.0)).mean()
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f64 {
    loss.to_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0) as f64
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataSource, DatasetConfig, ModelConfig, TransformConfig};
    use crate::model::{IMAGE_PIXELS, NdBackend};
    use tempfile::TempDir;

    fn experiment_config(layers: Vec<LayerConfig>, optim: OptimKind) -> ExperimentConfig {
        ExperimentConfig {
            model: ModelConfig { layers },
            data: DatasetConfig {
                source: DataSource::Synthetic {
                    train_len: 32,
                    valid_len: 16,
                    seed: 11,
                },
                transforms: vec![TransformConfig::ToTensor],
            },
            train: TrainConfig {
                lr: 0.05,
                batch_size: 16,
                num_epochs: 1,
                log_every: 1,
                loss: LossKind::CrossEntropy,
                optim,
            },
        }
    }

    fn small_mlp() -> Vec<LayerConfig> {
        vec![
            LayerConfig::Flatten,
            LayerConfig::Linear {
                in_shape: IMAGE_PIXELS,
                out_shape: NUM_CLASSES,
            },
            LayerConfig::LogSoftmax,
        ]
    }

    fn trained_trainer(dir: &TempDir) -> (Trainer, StatusManager) {
        let config = experiment_config(small_mlp(), OptimKind::Adam);
        let trainer = Trainer::new("testexp", dir.path(), &config).unwrap();
        let status = StatusManager::new(dir.path());
        status.create().unwrap();
        status.mark_train_start().unwrap();
        trainer.train(&status, &CancelFlag::default()).unwrap();
        (trainer, status)
    }

    #[test]
    fn test_train_saves_checkpoint_and_progress() {
        let dir = TempDir::new().unwrap();
        let (_trainer, status) = trained_trainer(&dir);

        assert!(dir.path().join("best.bin").exists());

        let document = status.read().unwrap();
        assert_eq!(document.run.curr_epoch, Some(1));
        // Progress is recorded at epoch start, so the reported best loss is
        // still the initial sentinel after a single epoch.
        assert_eq!(document.run.best_loss, Some(INITIAL_BEST_LOSS));
    }

    #[test]
    fn test_eval_after_train_is_bounded() {
        let dir = TempDir::new().unwrap();
        let (trainer, _status) = trained_trainer(&dir);

        let train_report = trainer.eval(true).unwrap();
        let valid_report = trainer.eval(false).unwrap();
        for report in [train_report, valid_report] {
            assert!((0.0..=1.0).contains(&report.accuracy));
            assert!((0.0..=1.0).contains(&report.precision.macro_avg));
            assert!((0.0..=1.0).contains(&report.recall.micro));
        }
    }

    #[test]
    fn test_eval_without_checkpoint_fails_hard() {
        let dir = TempDir::new().unwrap();
        let config = experiment_config(small_mlp(), OptimKind::Adam);
        let trainer = Trainer::new("testexp", dir.path(), &config).unwrap();
        let err = trainer.eval(false).unwrap_err();
        assert!(matches!(err, CoreError::Checkpoint(_)));
    }

    #[test]
    fn test_try_step_succeeds_for_every_optimizer() {
        let dir = TempDir::new().unwrap();
        for optim in [
            OptimKind::GradientDescent,
            OptimKind::Adam,
            OptimKind::Rmsprop,
            OptimKind::Adagrad,
        ] {
            let config = experiment_config(small_mlp(), optim);
            let trainer = Trainer::new("testexp", dir.path(), &config).unwrap();
            trainer.try_step().unwrap();
        }
    }

    #[test]
    fn test_try_step_surfaces_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let layers = vec![
            LayerConfig::Flatten,
            LayerConfig::Linear {
                in_shape: IMAGE_PIXELS,
                out_shape: 32,
            },
            LayerConfig::Linear {
                in_shape: 64,
                out_shape: NUM_CLASSES,
            },
        ];
        let config = experiment_config(layers, OptimKind::Adam);
        let trainer = Trainer::new("testexp", dir.path(), &config).unwrap();
        assert!(trainer.try_step().is_err());
    }

    #[test]
    fn test_cancel_stops_training() {
        let dir = TempDir::new().unwrap();
        let config = experiment_config(small_mlp(), OptimKind::Adam);
        let trainer = Trainer::new("testexp", dir.path(), &config).unwrap();
        let status = StatusManager::new(dir.path());
        status.create().unwrap();
        status.mark_train_start().unwrap();

        let cancel = CancelFlag::default();
        cancel.cancel();
        let err = trainer.train(&status, &cancel).unwrap_err();
        assert!(matches!(err, CoreError::Training(_)));
    }

    #[test]
    fn test_loss_functions_agree_on_perfect_predictions() {
        let device = Device::default();
        let targets = data::one_hot::<NdBackend>(&[1, 3], &device);

        let mse = compute_loss(LossKind::Mse, targets.clone(), targets.clone());
        assert!(scalar(&mse).abs() < 1e-6);

        let huber = compute_loss(LossKind::SmoothL1, targets.clone(), targets.clone());
        assert!(scalar(&huber).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_of_uniform_logits() {
        let device = Device::default();
        let logits = Tensor::<NdBackend, 2>::zeros([2, NUM_CLASSES], &device);
        let targets = data::one_hot::<NdBackend>(&[0, 9], &device);
        let loss = compute_loss(LossKind::CrossEntropy, logits, targets);
        let expected = (NUM_CLASSES as f64).ln();
        assert!((scalar(&loss) - expected).abs() < 1e-5);
    }
}
