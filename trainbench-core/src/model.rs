//! Declarative model building.
//!
//! Translates the ordered layer list of an [`ExperimentConfig`] into an
//! executable sequential network and checks its structural sanity with a
//! synthetic forward pass before any experiment is accepted.
//!
//! Shapes: input batches are `[B, 1, 28, 28]`; a structurally valid network
//! maps them to `[B, 10]` class scores.

use crate::catalog::{ExperimentConfig, LayerConfig};
use crate::error::CoreError;
use burn::backend::autodiff::Autodiff;
use burn::backend::ndarray::NdArray;
use burn::module::{Ignored, Module, Param};
use burn::nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig};
use burn::tensor::{Distribution, Tensor, activation, backend::Backend};

/// CPU inference backend.
pub type NdBackend = NdArray<f32>;
/// Differentiable backend used for training.
pub type TrainBackend = Autodiff<NdBackend>;
/// Device shared by both backends.
pub type Device = <NdBackend as Backend>::Device;

/// Batch size of the synthetic validation pass.
pub const VALIDATE_BATCH: usize = 32;
pub const IMAGE_CHANNELS: usize = 1;
pub const IMAGE_HEIGHT: usize = 28;
pub const IMAGE_WIDTH: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_CHANNELS * IMAGE_HEIGHT * IMAGE_WIDTH;
pub const NUM_CLASSES: usize = 10;

/// Bias value applied to freshly initialized linear layers.
const LINEAR_BIAS_INIT: f64 = 0.01;

/// Seed both backends; called once at service startup.
pub fn seed_backend(seed: u64) {
    <NdBackend as Backend>::seed(seed);
    <TrainBackend as Backend>::seed(seed);
}

/// One step of the executable plan.
///
/// Parameterized layers index into the module's own storage; everything else
/// is a pure tensor op.
#[derive(Debug, Clone)]
pub enum PlanOp {
    Linear(usize),
    Dropout(usize),
    Flatten,
    Point(PointwiseOp),
}

/// Element-wise ops that apply at any tensor rank.
#[derive(Debug, Clone)]
pub enum PointwiseOp {
    Relu,
    LeakyRelu { slope: f64 },
    Elu { alpha: f64 },
    Sigmoid,
    LogSigmoid,
    Tanh,
    Softmax,
    LogSoftmax,
}

/// An executable sequential network built from a layer list.
#[derive(Module, Debug)]
pub struct ConfiguredNet<B: Backend> {
    linears: Vec<Linear<B>>,
    dropouts: Vec<Dropout>,
    plan: Ignored<Vec<PlanOp>>,
}

/// Intermediate activation: images stay rank-4 until a flatten op, class
/// scores are rank-2.
enum Feat<B: Backend> {
    R2(Tensor<B, 2>),
    R4(Tensor<B, 4>),
}

impl<B: Backend> ConfiguredNet<B> {
    /// Build the network with fresh weights: Xavier-uniform for linear
    /// layers, bias 0.01.
    pub fn build(layers: &[LayerConfig], device: &B::Device) -> Self {
        let mut linears = Vec::new();
        let mut dropouts = Vec::new();
        let mut plan = Vec::new();

        for layer in layers {
            match layer {
                LayerConfig::Linear {
                    in_shape,
                    out_shape,
                } => {
                    let mut linear = LinearConfig::new(*in_shape, *out_shape)
                        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                        .init(device);
                    linear.bias = Some(Param::from_tensor(Tensor::full(
                        [*out_shape],
                        LINEAR_BIAS_INIT,
                        device,
                    )));
                    plan.push(PlanOp::Linear(linears.len()));
                    linears.push(linear);
                }
                LayerConfig::Flatten => plan.push(PlanOp::Flatten),
                LayerConfig::Dropout { prob } => {
                    plan.push(PlanOp::Dropout(dropouts.len()));
                    dropouts.push(DropoutConfig::new(*prob).init());
                }
                LayerConfig::Relu => plan.push(PlanOp::Point(PointwiseOp::Relu)),
                LayerConfig::LeakyRelu { slope } => {
                    plan.push(PlanOp::Point(PointwiseOp::LeakyRelu { slope: *slope }))
                }
                LayerConfig::Elu { alpha } => {
                    plan.push(PlanOp::Point(PointwiseOp::Elu { alpha: *alpha }))
                }
                LayerConfig::Sigmoid => plan.push(PlanOp::Point(PointwiseOp::Sigmoid)),
                LayerConfig::LogSigmoid => plan.push(PlanOp::Point(PointwiseOp::LogSigmoid)),
                LayerConfig::Tanh => plan.push(PlanOp::Point(PointwiseOp::Tanh)),
                LayerConfig::Softmax => plan.push(PlanOp::Point(PointwiseOp::Softmax)),
                LayerConfig::LogSoftmax => plan.push(PlanOp::Point(PointwiseOp::LogSoftmax)),
            }
        }

        Self {
            linears,
            dropouts,
            plan: Ignored(plan),
        }
    }

    /// Apply every layer in sequence.
    ///
    /// Fails with a model error when a layer cannot accept the incoming rank
    /// or when the final activation is not a `[batch, classes]` matrix.
    pub fn forward(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>, CoreError> {
        let mut feat = Feat::R4(input);
        for op in self.plan.0.iter() {
            feat = self.apply(op, feat)?;
        }
        match feat {
            Feat::R2(out) => Ok(out),
            Feat::R4(out) => Err(CoreError::model(format!(
                "network output has shape {:?}, expected a [batch, classes] matrix",
                out.dims()
            ))),
        }
    }

    fn apply(&self, op: &PlanOp, feat: Feat<B>) -> Result<Feat<B>, CoreError> {
        Ok(match op {
            PlanOp::Linear(index) => match feat {
                Feat::R2(x) => Feat::R2(self.linears[*index].forward(x)),
                Feat::R4(_) => {
                    return Err(CoreError::model(
                        "linear layer requires flattened input; add a flatten layer first",
                    ));
                }
            },
            PlanOp::Dropout(index) => match feat {
                Feat::R2(x) => Feat::R2(self.dropouts[*index].forward(x)),
                Feat::R4(x) => Feat::R4(self.dropouts[*index].forward(x)),
            },
            PlanOp::Flatten => match feat {
                Feat::R2(x) => Feat::R2(x),
                Feat::R4(x) => Feat::R2(x.flatten::<2>(1, 3)),
            },
            PlanOp::Point(point) => match feat {
                Feat::R2(x) => Feat::R2(apply_pointwise(point, x)),
                Feat::R4(x) => Feat::R4(apply_pointwise(point, x)),
            },
        })
    }
}

fn apply_pointwise<B: Backend, const D: usize>(op: &PointwiseOp, x: Tensor<B, D>) -> Tensor<B, D> {
    match op {
        PointwiseOp::Relu => activation::relu(x),
        PointwiseOp::LeakyRelu { slope } => activation::leaky_relu(x, *slope),
        PointwiseOp::Elu { alpha } => elu(x, *alpha),
        PointwiseOp::Sigmoid => activation::sigmoid(x),
        PointwiseOp::LogSigmoid => activation::log_sigmoid(x),
        PointwiseOp::Tanh => activation::tanh(x),
        PointwiseOp::Softmax => activation::softmax(x, D - 1),
        PointwiseOp::LogSoftmax => activation::log_softmax(x, D - 1),
    }
}

/// `elu(x) = max(x, 0) + alpha * (exp(min(x, 0)) - 1)`
fn elu<B: Backend, const D: usize>(x: Tensor<B, D>, alpha: f64) -> Tensor<B, D> {
    let pos = x.clone().clamp_min(0.0);
    let neg = x.clamp_max(0.0).exp().sub_scalar(1.0).mul_scalar(alpha);
    pos + neg
}

/// Run a no-grad forward pass on a synthetic batch and check the output shape.
///
/// Any failure inside the pass — including panics from shape mismatches deep
/// in the tensor library — is caught and reported as "invalid", never
/// propagated.
pub fn validate<B: Backend>(net: &ConfiguredNet<B>, device: &B::Device) -> bool {
    let batch = Tensor::<B, 4>::random(
        [VALIDATE_BATCH, IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH],
        Distribution::Default,
        device,
    );

    let outcome =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| net.forward(batch)));
    match outcome {
        Ok(Ok(output)) => {
            let dims = output.dims();
            if dims == [VALIDATE_BATCH, NUM_CLASSES] {
                tracing::info!("Valid model structure");
                true
            } else {
                tracing::error!("Invalid model structure: output shape {dims:?}");
                false
            }
        }
        Ok(Err(err)) => {
            tracing::error!("Invalid model structure: {err}");
            false
        }
        Err(_) => {
            tracing::error!("Invalid model structure: forward pass panicked");
            false
        }
    }
}

/// Human-readable architecture text, persisted as `model.log` and surfaced
/// through the info endpoint.
pub fn render(config: &ExperimentConfig) -> String {
    let mut out = String::from("ConfiguredNet(\n");
    for (index, layer) in config.model.layers.iter().enumerate() {
        let line = match layer {
            LayerConfig::Linear {
                in_shape,
                out_shape,
            } => format!("Linear(in={in_shape}, out={out_shape})"),
            LayerConfig::Flatten => "Flatten()".to_string(),
            LayerConfig::Dropout { prob } => format!("Dropout(p={prob})"),
            LayerConfig::Relu => "ReLU()".to_string(),
            LayerConfig::LeakyRelu { slope } => format!("LeakyReLU(slope={slope})"),
            LayerConfig::Elu { alpha } => format!("ELU(alpha={alpha})"),
            LayerConfig::Sigmoid => "Sigmoid()".to_string(),
            LayerConfig::LogSigmoid => "LogSigmoid()".to_string(),
            LayerConfig::Tanh => "Tanh()".to_string(),
            LayerConfig::Softmax => "Softmax()".to_string(),
            LayerConfig::LogSoftmax => "LogSoftmax()".to_string(),
        };
        out.push_str(&format!("  ({index}): {line}\n"));
    }
    out.push(')');
    out
}
