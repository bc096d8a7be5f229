use ndarray::{Array2, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipeline::Batch;

pub mod conv_net;
pub mod layers;
pub mod loss;
pub mod optim;

use optim::Adam;

/// Loss and number of correct predictions of one training step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub correct: usize,
}

pub trait Model {
    /// Forward, backward and one optimizer update on a batch
    fn train_step(&mut self, batch: &Batch, optimizer: &mut Adam) -> Result<StepOutput>;
    /// Class probabilities for every image, one row per image
    fn predict(&self, images: &ArrayView4<f32>) -> Result<Array2<f32>>;
}

#[derive(clap::ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InitMethod {
    #[default]
    GlorotUniform,
    HeUniform,
}

impl InitMethod {
    /// Bound of the uniform distribution weights are drawn from
    pub fn limit(&self, fan_in: usize, fan_out: usize) -> f32 {
        match self {
            InitMethod::GlorotUniform => (6.0 / (fan_in + fan_out).max(1) as f32).sqrt(),
            InitMethod::HeUniform => (6.0 / fan_in.max(1) as f32).sqrt(),
        }
    }
}

/// Shape of the convolutional classifier.
/// Each entry of `conv_filters` adds a conv / batch-norm / relu block, and every block but the last is followed by max pooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub conv_filters: Vec<usize>,
    pub kernel_size: usize,
    pub hidden_units: usize,
    pub num_classes: usize,
    pub initialization: InitMethod,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            conv_filters: vec![32, 64, 128],
            kernel_size: 3,
            hidden_units: 64,
            num_classes: 10,
            initialization: InitMethod::GlorotUniform,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.conv_filters.is_empty() || self.conv_filters.contains(&0) {
            return Err(Error::InvalidConfig(
                "conv_filters must list at least one positive filter count".to_string(),
            ));
        }
        if self.kernel_size == 0 || self.hidden_units == 0 || self.num_classes < 2 {
            return Err(Error::InvalidConfig(
                "kernel_size and hidden_units must be positive and num_classes at least 2"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
