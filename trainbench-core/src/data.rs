//! Dataset loading and batching.
//!
//! Samples are kept on the host as flat pixel vectors and only turned into
//! backend tensors one batch at a time.

use crate::catalog::{DataSource, DatasetConfig, TransformConfig};
use crate::error::CoreError;
use crate::model::{IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_PIXELS, IMAGE_WIDTH, NUM_CLASSES};
use burn::data::dataset::Dataset;
use burn::data::dataset::vision::MnistDataset;
use burn::tensor::{Tensor, backend::Backend};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One image with its class label. Pixels are raw `[0, 255]` values in row
/// major order until the transform pipeline runs.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// A batch ready for the network: images as a `[B, 1, 28, 28]` tensor plus
/// the host-side labels.
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Vec<usize>,
}

/// Load one split of the configured source with transforms applied.
pub fn load_split(config: &DatasetConfig, train: bool) -> Result<Vec<Sample>, CoreError> {
    let mut samples = match &config.source {
        DataSource::Mnist => mnist_split(train),
        DataSource::Synthetic {
            train_len,
            valid_len,
            seed,
        } => synthetic_split(train, *train_len, *valid_len, *seed),
    };

    if samples.is_empty() {
        return Err(CoreError::config("dataset split is empty"));
    }
    for sample in samples.iter_mut() {
        apply_transforms(&mut sample.pixels, &config.transforms);
    }
    Ok(samples)
}

fn mnist_split(train: bool) -> Vec<Sample> {
    let dataset = if train {
        MnistDataset::train()
    } else {
        MnistDataset::test()
    };

    let mut samples = Vec::with_capacity(dataset.len());
    for index in 0..dataset.len() {
        if let Some(item) = dataset.get(index) {
            let mut pixels = Vec::with_capacity(IMAGE_PIXELS);
            for row in item.image.iter() {
                pixels.extend(row.iter().copied());
            }
            samples.push(Sample {
                pixels,
                label: item.label as usize,
            });
        }
    }
    samples
}

/// Deterministic stand-in dataset with the MNIST tensor shape.
///
/// Each class gets a distinct mean brightness so even a single epoch of a
/// small linear model separates them better than chance.
fn synthetic_split(train: bool, train_len: usize, valid_len: usize, seed: u64) -> Vec<Sample> {
    let len = if train { train_len } else { valid_len };
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(!train)));

    (0..len)
        .map(|index| {
            let label = index % NUM_CLASSES;
            let base = 12.0 + label as f32 * 24.0;
            let pixels = (0..IMAGE_PIXELS)
                .map(|_| (base + rng.gen_range(0.0..24.0)).min(255.0))
                .collect();
            Sample { pixels, label }
        })
        .collect()
}

fn apply_transforms(pixels: &mut [f32], transforms: &[TransformConfig]) {
    for transform in transforms {
        match transform {
            TransformConfig::ToTensor => {
                for value in pixels.iter_mut() {
                    *value /= 255.0;
                }
            }
            TransformConfig::Normalize { mean, std } => {
                for value in pixels.iter_mut() {
                    *value = (*value - mean) / std;
                }
            }
        }
    }
}

/// Iterates a sample slice in batches, building one tensor per call.
pub struct BatchIter<'a> {
    samples: &'a [Sample],
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a> BatchIter<'a> {
    /// In-order iteration, used for evaluation.
    pub fn sequential(samples: &'a [Sample], batch_size: usize) -> Self {
        Self {
            samples,
            order: (0..samples.len()).collect(),
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    /// Shuffled iteration, used for one training epoch.
    pub fn shuffled(samples: &'a [Sample], batch_size: usize, rng: &mut impl Rng) -> Self {
        let mut iter = Self::sequential(samples, batch_size);
        use rand::seq::SliceRandom;
        iter.order.shuffle(rng);
        iter
    }

    /// Number of batches one full pass yields.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Build the next batch, or `None` once the pass is complete.
    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> Option<ImageBatch<B>> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let mut values = Vec::with_capacity(indices.len() * IMAGE_PIXELS);
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = &self.samples[index];
            values.extend_from_slice(&sample.pixels);
            labels.push(sample.label);
        }

        let images = Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([
            indices.len(),
            IMAGE_CHANNELS,
            IMAGE_HEIGHT,
            IMAGE_WIDTH,
        ]);
        Some(ImageBatch { images, labels })
    }
}

/// One-hot encode labels as a `[B, classes]` float tensor.
pub fn one_hot<B: Backend>(labels: &[usize], device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; labels.len() * NUM_CLASSES];
    for (row, &label) in labels.iter().enumerate() {
        values[row * NUM_CLASSES + label] = 1.0;
    }
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([labels.len(), NUM_CLASSES])
}
