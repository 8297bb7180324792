//! The experiment document and its closed catalogs.
//!
//! Every selectable piece of an experiment — layers, data transforms, loss,
//! optimizer — is a tagged enum, so an unknown name in a submitted document is
//! a typed parse error at creation time instead of a silently skipped branch.

use serde::{Deserialize, Serialize};

/// One experiment's immutable configuration, persisted as `configs.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub data: DatasetConfig,
    pub train: TrainConfig,
}

/// Declarative network architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub layers: Vec<LayerConfig>,
}

/// Dataset selection and the transform pipeline applied to every sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub source: DataSource,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
}

/// Where samples come from.
///
/// `mnist` is the real dataset; `synthetic` generates a deterministic stand-in
/// with the same tensor shape, so the full pipeline can run offline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum DataSource {
    #[default]
    Mnist,
    Synthetic {
        #[serde(default = "default_synthetic_train_len")]
        train_len: usize,
        #[serde(default = "default_synthetic_valid_len")]
        valid_len: usize,
        #[serde(default = "default_synthetic_seed")]
        seed: u64,
    },
}

fn default_synthetic_train_len() -> usize {
    512
}

fn default_synthetic_valid_len() -> usize {
    128
}

fn default_synthetic_seed() -> u64 {
    42
}

/// One network layer, tagged by kind with kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum LayerConfig {
    Linear {
        in_shape: usize,
        out_shape: usize,
    },
    Flatten,
    Dropout {
        #[serde(default = "default_dropout_prob")]
        prob: f64,
    },
    Relu,
    LeakyRelu {
        #[serde(default = "default_leaky_relu_slope")]
        slope: f64,
    },
    Elu {
        #[serde(default = "default_elu_alpha")]
        alpha: f64,
    },
    Sigmoid,
    LogSigmoid,
    Tanh,
    Softmax,
    LogSoftmax,
}

fn default_dropout_prob() -> f64 {
    0.5
}

fn default_leaky_relu_slope() -> f64 {
    0.01
}

fn default_elu_alpha() -> f64 {
    1.0
}

/// One per-sample transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Scale raw pixel values from `[0, 255]` into `[0, 1]`.
    ToTensor,
    /// Shift and scale: `(x - mean) / std`.
    Normalize { mean: f32, std: f32 },
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub lr: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    pub loss: LossKind,
    pub optim: OptimKind,
}

fn default_log_every() -> usize {
    100
}

/// Loss function selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    CrossEntropy,
    Mse,
    SmoothL1,
}

/// Optimizer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimKind {
    GradientDescent,
    Adam,
    Rmsprop,
    Adagrad,
}
