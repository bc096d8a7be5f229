use ndarray::{Array2, Array4, ArrayView4, Ix2};
use rand::Rng;

use super::layers::{BatchNorm2d, Conv2d, Dense, Flatten, Layer, MaxPool2d, Relu};
use super::loss::{count_correct, cross_entropy, cross_entropy_grad, softmax};
use super::optim::Adam;
use super::{Model, ModelConfig, StepOutput};
use crate::error::{Error, Result};
use crate::parsing::{IMAGE_HEIGHT, IMAGE_WIDTH};
use crate::pipeline::Batch;

/// Represents a convolutional classifier over single-channel images
#[derive(Debug, Clone)]
pub struct ConvNet {
    pub layers: Vec<Layer>,
    input_shape: (usize, usize, usize),
    num_classes: usize,
}

impl ConvNet {
    /// Construct a freshly initialized network for 28x28 grayscale input
    pub fn new<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<ConvNet> {
        config.validate()?;
        let init = config.initialization;
        let k = config.kernel_size;
        let (mut channels, mut height, mut width) = (1, IMAGE_HEIGHT, IMAGE_WIDTH);
        let mut layers = vec![];

        for (idx, &filters) in config.conv_filters.iter().enumerate() {
            if height < k || width < k {
                return Err(Error::InvalidConfig(format!(
                    "conv block {idx} receives {height}x{width} maps, smaller than the {k}x{k} kernel"
                )));
            }
            layers.push(Layer::Conv2d(Conv2d::new(channels, filters, k, init, rng)));
            layers.push(Layer::BatchNorm2d(BatchNorm2d::new(filters)));
            layers.push(Layer::Relu(Relu::default()));
            height = height - k + 1;
            width = width - k + 1;
            channels = filters;

            // Every block but the last is pooled
            if idx + 1 < config.conv_filters.len() {
                if height < MaxPool2d::SIZE || width < MaxPool2d::SIZE {
                    return Err(Error::InvalidConfig(format!(
                        "conv block {idx} output {height}x{width} is too small to pool"
                    )));
                }
                layers.push(Layer::MaxPool2d(MaxPool2d::default()));
                height /= MaxPool2d::SIZE;
                width /= MaxPool2d::SIZE;
            }
        }

        let features = channels * height * width;
        layers.push(Layer::Flatten(Flatten::default()));
        layers.push(Layer::Dense(Dense::new(features, config.hidden_units, init, rng)));
        layers.push(Layer::Relu(Relu::default()));
        layers.push(Layer::Dense(Dense::new(config.hidden_units, config.num_classes, init, rng)));

        Ok(ConvNet {
            layers,
            input_shape: (1, IMAGE_HEIGHT, IMAGE_WIDTH),
            num_classes: config.num_classes,
        })
    }

    /// Assemble a network from existing layers, checking that they chain up
    pub fn from_layers(
        layers: Vec<Layer>,
        input_shape: (usize, usize, usize),
        num_classes: usize,
    ) -> Result<ConvNet> {
        let net = ConvNet {
            layers,
            input_shape,
            num_classes,
        };

        let (c, h, w) = input_shape;
        let probe = Array4::<f32>::zeros((1, c, h, w));
        let logits = net.logits(&probe.view())?;
        if logits.ncols() != num_classes {
            return Err(Error::InvalidModel(format!(
                "network produces {} outputs but declares {num_classes} classes",
                logits.ncols()
            )));
        }

        Ok(net)
    }

    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(Layer::num_params).sum()
    }

    /// Log one line per layer with its parameter count
    pub fn summary(&self) {
        for (idx, layer) in self.layers.iter().enumerate() {
            tracing::info!("layer {idx:>2} {:<12} params {}", layer.name(), layer.num_params());
        }
        tracing::info!("Total params: {}", self.num_params());
    }

    fn check_input(&self, images: &ArrayView4<f32>) -> Result<()> {
        let (_, c, h, w) = images.dim();
        if (c, h, w) != self.input_shape || images.is_empty() {
            let (ec, eh, ew) = self.input_shape;
            return Err(Error::InputShape {
                layer: "input",
                expected: format!("(batch >= 1, {ec}, {eh}, {ew})"),
                actual: images.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Pre-softmax scores, without touching any layer state
    fn logits(&self, images: &ArrayView4<f32>) -> Result<Array2<f32>> {
        self.check_input(images)?;

        let mut activation = images.to_owned().into_dyn();
        for layer in &self.layers {
            activation = layer.infer(&activation)?;
        }

        Ok(activation.into_dimensionality::<Ix2>()?)
    }
}

impl Model for ConvNet {
    fn train_step(&mut self, batch: &Batch, optimizer: &mut Adam) -> Result<StepOutput> {
        self.check_input(&batch.images.view())?;
        if let Some(&label) = batch.labels.iter().find(|&&l| l >= self.num_classes) {
            return Err(Error::InvalidLabel {
                label,
                num_classes: self.num_classes,
            });
        }

        let mut activation = batch.images.clone().into_dyn();
        for layer in self.layers.iter_mut() {
            activation = layer.forward(&activation)?;
        }

        let logits = activation.into_dimensionality::<Ix2>()?;
        let probabilities = softmax(&logits.view());
        let loss = cross_entropy(&probabilities.view(), &batch.labels);
        let correct = count_correct(&probabilities.view(), &batch.labels);

        // Softmax and cross-entropy are differentiated together
        let mut grad = cross_entropy_grad(&probabilities.view(), &batch.labels).into_dyn();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }

        optimizer.begin_step();
        let mut slot = 0;
        for layer in self.layers.iter_mut() {
            layer.apply_gradients(optimizer, &mut slot);
        }

        Ok(StepOutput { loss, correct })
    }

    fn predict(&self, images: &ArrayView4<f32>) -> Result<Array2<f32>> {
        let logits = self.logits(images)?;
        Ok(softmax(&logits.view()))
    }
}
