//! Layers of the convolutional classifier.
//!
//! Activations flow between layers as dynamic-rank arrays. Image tensors are
//! NCHW, dense tensors are (batch, features). Every layer offers an inference
//! pass that leaves it untouched, a training pass that caches what the
//! backward pass needs, and a backward pass that stores parameter gradients
//! and returns the gradient with respect to its input.

use ndarray::{
    s, Array1, Array2, Array4, ArrayBase, ArrayD, ArrayView2, ArrayView4, Axis, Data, Ix2, Ix4,
    IxDyn,
};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use super::optim::Adam;
use super::InitMethod;
use crate::error::{Error, Result};

fn as_images<'a>(layer: &'static str, input: &'a ArrayD<f32>) -> Result<ArrayView4<'a, f32>> {
    input
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| Error::InputShape {
            layer,
            expected: "(batch, channels, height, width)".to_string(),
            actual: input.shape().to_vec(),
        })
}

fn as_matrix<'a>(layer: &'static str, input: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>> {
    input
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::InputShape {
            layer,
            expected: "(batch, features)".to_string(),
            actual: input.shape().to_vec(),
        })
}

fn uniform_matrix<R: Rng>(rows: usize, cols: usize, limit: f32, rng: &mut R) -> Array2<f32> {
    let distribution = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_simple_fn((rows, cols), || distribution.sample(rng))
}

/// 2D convolution with a square kernel, stride 1 and no padding
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    /// One row per output channel, columns ordered (channel, ky, kx)
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    grad_weights: Array2<f32>,
    grad_bias: Array1<f32>,
    cache: Option<ConvCache>,
}

#[derive(Debug, Clone)]
struct ConvCache {
    cols: Array2<f32>,
    input_dim: (usize, usize, usize, usize),
}

impl Conv2d {
    pub const NAME: &'static str = "conv2d";

    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        init: InitMethod,
        rng: &mut R,
    ) -> Conv2d {
        let area = kernel_size * kernel_size;
        let limit = init.limit(in_channels * area, out_channels * area);
        let weights = uniform_matrix(out_channels, in_channels * area, limit, rng);

        Conv2d::from_parts(weights, Array1::zeros(out_channels), kernel_size)
    }

    /// Rebuild a layer from stored parameters. The input channel count is inferred from the weights.
    pub fn from_parts(weights: Array2<f32>, bias: Array1<f32>, kernel_size: usize) -> Conv2d {
        let (out_channels, fan_in) = weights.dim();
        let in_channels = fan_in / (kernel_size * kernel_size).max(1);

        Conv2d {
            in_channels,
            out_channels,
            kernel_size,
            grad_weights: Array2::zeros(weights.dim()),
            grad_bias: Array1::zeros(bias.len()),
            weights,
            bias,
            cache: None,
        }
    }

    fn check<'a>(&self, input: &'a ArrayD<f32>) -> Result<ArrayView4<'a, f32>> {
        let images = as_images(Self::NAME, input)?;
        let (_, channels, height, width) = images.dim();

        if channels != self.in_channels || height < self.kernel_size || width < self.kernel_size {
            return Err(Error::InputShape {
                layer: Self::NAME,
                expected: format!(
                    "(batch, {}, >={k}, >={k})",
                    self.in_channels,
                    k = self.kernel_size
                ),
                actual: input.shape().to_vec(),
            });
        }

        Ok(images)
    }

    fn convolve(&self, images: ArrayView4<f32>) -> Result<(Array2<f32>, ArrayD<f32>)> {
        let (n, _, h, w) = images.dim();
        let (oh, ow) = (h - self.kernel_size + 1, w - self.kernel_size + 1);

        let cols = im2col(images, self.kernel_size);
        let out = cols.dot(&self.weights.t()) + &self.bias;
        let out = out
            .into_shape((n, oh, ow, self.out_channels))?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();

        Ok((cols, out.into_dyn()))
    }

    pub fn infer(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let images = self.check(input)?;
        Ok(self.convolve(images)?.1)
    }

    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let images = self.check(input)?;
        let input_dim = images.dim();
        let (cols, out) = self.convolve(images)?;
        self.cache = Some(ConvCache { cols, input_dim });

        Ok(out)
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let cache = self.cache.take().ok_or(Error::MissingCache(Self::NAME))?;
        let grad = as_images(Self::NAME, grad)?;
        let (n, f, oh, ow) = grad.dim();

        // Rows of the gradient line up with the rows of the cached patch matrix
        let grad = grad
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape((n * oh * ow, f))?;

        self.grad_weights = grad.t().dot(&cache.cols);
        self.grad_bias = grad.sum_axis(Axis(0));
        let grad_cols = grad.dot(&self.weights);

        Ok(col2im(grad_cols.view(), cache.input_dim, self.kernel_size).into_dyn())
    }

    fn apply_gradients(&mut self, optimizer: &mut Adam, slot: &mut usize) {
        optimizer.update(*slot, &mut self.weights, &self.grad_weights);
        optimizer.update(*slot + 1, &mut self.bias, &self.grad_bias);
        *slot += 2;
    }
}

/// Unfold every k*k patch of every image into one row
fn im2col(images: ArrayView4<f32>, k: usize) -> Array2<f32> {
    let (n, c, h, w) = images.dim();
    let (oh, ow) = (h - k + 1, w - k + 1);
    let mut cols = Array2::zeros((n * oh * ow, c * k * k));

    for b in 0..n {
        for y in 0..oh {
            for x in 0..ow {
                let patch = images.slice(s![b, .., y..y + k, x..x + k]);
                let mut row = cols.row_mut((b * oh + y) * ow + x);
                for (dst, src) in row.iter_mut().zip(patch.iter()) {
                    *dst = *src;
                }
            }
        }
    }

    cols
}

/// Inverse of `im2col`: overlapping patches are summed
fn col2im(cols: ArrayView2<f32>, dim: (usize, usize, usize, usize), k: usize) -> Array4<f32> {
    let (n, c, h, w) = dim;
    let (oh, ow) = (h - k + 1, w - k + 1);
    let mut images = Array4::zeros((n, c, h, w));

    for b in 0..n {
        for y in 0..oh {
            for x in 0..ow {
                let row = cols.row((b * oh + y) * ow + x);
                let mut patch = images.slice_mut(s![b, .., y..y + k, x..x + k]);
                for (dst, src) in patch.iter_mut().zip(row.iter()) {
                    *dst += *src;
                }
            }
        }
    }

    images
}

/// Per-channel sums over batch, height and width
fn channel_sum<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix4>) -> Array1<f32> {
    x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

/// View a per-channel vector as (1, C, 1, 1) so it broadcasts over NCHW
fn per_channel(v: &Array1<f32>) -> ArrayView4<f32> {
    v.view()
        .insert_axis(Axis(0))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

/// Batch normalization over the channel axis of NCHW images
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub channels: usize,
    pub momentum: f32,
    pub epsilon: f32,
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub moving_mean: Array1<f32>,
    pub moving_variance: Array1<f32>,
    grad_gamma: Array1<f32>,
    grad_beta: Array1<f32>,
    cache: Option<NormCache>,
}

#[derive(Debug, Clone)]
struct NormCache {
    normalized: Array4<f32>,
    inv_std: Array1<f32>,
}

impl BatchNorm2d {
    pub const NAME: &'static str = "batch_norm2d";
    pub const MOMENTUM: f32 = 0.99;
    pub const EPSILON: f32 = 1e-3;

    pub fn new(channels: usize) -> BatchNorm2d {
        BatchNorm2d {
            channels,
            momentum: Self::MOMENTUM,
            epsilon: Self::EPSILON,
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            moving_mean: Array1::zeros(channels),
            moving_variance: Array1::ones(channels),
            grad_gamma: Array1::zeros(channels),
            grad_beta: Array1::zeros(channels),
            cache: None,
        }
    }

    fn check<'a>(&self, input: &'a ArrayD<f32>) -> Result<ArrayView4<'a, f32>> {
        let images = as_images(Self::NAME, input)?;
        if images.dim().1 != self.channels {
            return Err(Error::InputShape {
                layer: Self::NAME,
                expected: format!("(batch, {}, height, width)", self.channels),
                actual: input.shape().to_vec(),
            });
        }
        Ok(images)
    }

    /// Normalize with the moving statistics
    pub fn infer(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let images = self.check(input)?;
        let epsilon = self.epsilon;
        let inv_std = self.moving_variance.mapv(|v| 1.0 / (v + epsilon).sqrt());
        let scale = &self.gamma * &inv_std;
        let shift = &self.beta - &(&self.moving_mean * &scale);

        let out = &(&images * &per_channel(&scale)) + &per_channel(&shift);
        Ok(out.into_dyn())
    }

    /// Normalize with the batch statistics and update the moving averages
    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let images = self.check(input)?;
        let (n, _, h, w) = images.dim();
        let count = (n * h * w) as f32;
        let epsilon = self.epsilon;

        let mean = channel_sum(&images) / count;
        let centered = &images - &per_channel(&mean);
        let variance = channel_sum(&centered.mapv(|v| v * v)) / count;
        let inv_std = variance.mapv(|v| 1.0 / (v + epsilon).sqrt());
        let normalized = &centered * &per_channel(&inv_std);
        let out = &(&normalized * &per_channel(&self.gamma)) + &per_channel(&self.beta);

        let momentum = self.momentum;
        self.moving_mean = &self.moving_mean * momentum + &mean * (1.0 - momentum);
        self.moving_variance = &self.moving_variance * momentum + &variance * (1.0 - momentum);
        self.cache = Some(NormCache {
            normalized,
            inv_std,
        });

        Ok(out.into_dyn())
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let cache = self.cache.take().ok_or(Error::MissingCache(Self::NAME))?;
        let grad = as_images(Self::NAME, grad)?;
        let (n, _, h, w) = grad.dim();
        let count = (n * h * w) as f32;

        self.grad_beta = channel_sum(&grad);
        self.grad_gamma = channel_sum(&(&grad * &cache.normalized));

        // dx = gamma / (m * std) * (m * dy - sum(dy) - x_hat * sum(dy * x_hat))
        let scale = &self.gamma * &cache.inv_std / count;
        let centered_grad = &(&grad * count) - &per_channel(&self.grad_beta);
        let inner = &centered_grad - &(&cache.normalized * &per_channel(&self.grad_gamma));
        let grad_input = &inner * &per_channel(&scale);

        Ok(grad_input.into_dyn())
    }

    fn apply_gradients(&mut self, optimizer: &mut Adam, slot: &mut usize) {
        optimizer.update(*slot, &mut self.gamma, &self.grad_gamma);
        optimizer.update(*slot + 1, &mut self.beta, &self.grad_beta);
        *slot += 2;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Relu {
    mask: Option<ArrayD<f32>>,
}

impl Relu {
    pub const NAME: &'static str = "relu";

    pub fn infer(&self, input: &ArrayD<f32>) -> ArrayD<f32> {
        input.mapv(|v| v.max(0.0))
    }

    pub fn forward(&mut self, input: &ArrayD<f32>) -> ArrayD<f32> {
        self.mask = Some(input.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }));
        self.infer(input)
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mask = self.mask.take().ok_or(Error::MissingCache(Self::NAME))?;
        if mask.shape() != grad.shape() {
            return Err(Error::InputShape {
                layer: Self::NAME,
                expected: format!("{:?}", mask.shape()),
                actual: grad.shape().to_vec(),
            });
        }
        Ok(grad * &mask)
    }
}

/// 2x2 max pooling with stride 2. Odd trailing rows and columns are dropped.
#[derive(Debug, Clone, Default)]
pub struct MaxPool2d {
    cache: Option<PoolCache>,
}

#[derive(Debug, Clone)]
struct PoolCache {
    /// Flat index into the input of the maximum chosen for every output element
    switches: Vec<usize>,
    input_dim: (usize, usize, usize, usize),
}

impl MaxPool2d {
    pub const NAME: &'static str = "max_pool2d";
    pub const SIZE: usize = 2;

    fn pool(input: &ArrayD<f32>) -> Result<(Array4<f32>, PoolCache)> {
        let images = as_images(Self::NAME, input)?;
        let (n, c, h, w) = images.dim();
        let (oh, ow) = (h / Self::SIZE, w / Self::SIZE);
        if oh == 0 || ow == 0 {
            return Err(Error::InputShape {
                layer: Self::NAME,
                expected: "(batch, channels, >=2, >=2)".to_string(),
                actual: input.shape().to_vec(),
            });
        }

        let mut out = Array4::zeros((n, c, oh, ow));
        let mut switches = Vec::with_capacity(n * c * oh * ow);

        for ((b, ch, oy, ox), value) in out.indexed_iter_mut() {
            let mut best = f32::NEG_INFINITY;
            let mut best_idx = 0;
            for dy in 0..Self::SIZE {
                for dx in 0..Self::SIZE {
                    let (y, x) = (oy * Self::SIZE + dy, ox * Self::SIZE + dx);
                    let candidate = images[[b, ch, y, x]];
                    if candidate > best {
                        best = candidate;
                        best_idx = ((b * c + ch) * h + y) * w + x;
                    }
                }
            }
            *value = best;
            switches.push(best_idx);
        }

        Ok((
            out,
            PoolCache {
                switches,
                input_dim: (n, c, h, w),
            },
        ))
    }

    pub fn infer(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(Self::pool(input)?.0.into_dyn())
    }

    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (out, cache) = Self::pool(input)?;
        self.cache = Some(cache);
        Ok(out.into_dyn())
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let cache = self.cache.take().ok_or(Error::MissingCache(Self::NAME))?;
        let (n, c, h, w) = cache.input_dim;
        if grad.len() != cache.switches.len() {
            return Err(Error::InputShape {
                layer: Self::NAME,
                expected: format!("{} gradient elements", cache.switches.len()),
                actual: grad.shape().to_vec(),
            });
        }

        let mut grad_input = vec![0.0f32; n * c * h * w];
        for (&idx, &g) in cache.switches.iter().zip(grad.iter()) {
            grad_input[idx] += g;
        }

        Ok(Array4::from_shape_vec((n, c, h, w), grad_input)?.into_dyn())
    }
}

/// Collapse everything but the batch axis
#[derive(Debug, Clone, Default)]
pub struct Flatten {
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    pub const NAME: &'static str = "flatten";

    pub fn infer(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let n = input.shape().first().copied().unwrap_or(0);
        let features = input.len() / n.max(1);

        Ok(input
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&[n, features]))?)
    }

    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.input_shape = Some(input.shape().to_vec());
        self.infer(input)
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = self.input_shape.take().ok_or(Error::MissingCache(Self::NAME))?;
        Ok(grad
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&shape))?)
    }
}

/// Fully connected layer: y = xW + b
#[derive(Debug, Clone)]
pub struct Dense {
    /// (inputs, outputs)
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    grad_weights: Array2<f32>,
    grad_bias: Array1<f32>,
    input: Option<Array2<f32>>,
}

impl Dense {
    pub const NAME: &'static str = "dense";

    pub fn new<R: Rng>(inputs: usize, outputs: usize, init: InitMethod, rng: &mut R) -> Dense {
        let limit = init.limit(inputs, outputs);
        let weights = uniform_matrix(inputs, outputs, limit, rng);
        Dense::from_parts(weights, Array1::zeros(outputs))
    }

    pub fn from_parts(weights: Array2<f32>, bias: Array1<f32>) -> Dense {
        Dense {
            grad_weights: Array2::zeros(weights.dim()),
            grad_bias: Array1::zeros(bias.len()),
            weights,
            bias,
            input: None,
        }
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    fn check<'a>(&self, input: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>> {
        let matrix = as_matrix(Self::NAME, input)?;
        if matrix.ncols() != self.inputs() {
            return Err(Error::InputShape {
                layer: Self::NAME,
                expected: format!("(batch, {})", self.inputs()),
                actual: input.shape().to_vec(),
            });
        }
        Ok(matrix)
    }

    pub fn infer(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let matrix = self.check(input)?;
        Ok((matrix.dot(&self.weights) + &self.bias).into_dyn())
    }

    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let out = self.infer(input)?;
        self.input = Some(self.check(input)?.to_owned());
        Ok(out)
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self.input.take().ok_or(Error::MissingCache(Self::NAME))?;
        let grad = as_matrix(Self::NAME, grad)?;

        self.grad_weights = input.t().dot(&grad);
        self.grad_bias = grad.sum_axis(Axis(0));

        Ok(grad.dot(&self.weights.t()).into_dyn())
    }

    fn apply_gradients(&mut self, optimizer: &mut Adam, slot: &mut usize) {
        optimizer.update(*slot, &mut self.weights, &self.grad_weights);
        optimizer.update(*slot + 1, &mut self.bias, &self.grad_bias);
        *slot += 2;
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    BatchNorm2d(BatchNorm2d),
    Relu(Relu),
    MaxPool2d(MaxPool2d),
    Flatten(Flatten),
    Dense(Dense),
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => Conv2d::NAME,
            Layer::BatchNorm2d(_) => BatchNorm2d::NAME,
            Layer::Relu(_) => Relu::NAME,
            Layer::MaxPool2d(_) => MaxPool2d::NAME,
            Layer::Flatten(_) => Flatten::NAME,
            Layer::Dense(_) => Dense::NAME,
        }
    }

    /// Number of trainable parameters
    pub fn num_params(&self) -> usize {
        match self {
            Layer::Conv2d(l) => l.weights.len() + l.bias.len(),
            Layer::BatchNorm2d(l) => l.gamma.len() + l.beta.len(),
            Layer::Dense(l) => l.weights.len() + l.bias.len(),
            Layer::Relu(_) | Layer::MaxPool2d(_) | Layer::Flatten(_) => 0,
        }
    }

    pub fn infer(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Conv2d(l) => l.infer(input),
            Layer::BatchNorm2d(l) => l.infer(input),
            Layer::Relu(l) => Ok(l.infer(input)),
            Layer::MaxPool2d(l) => l.infer(input),
            Layer::Flatten(l) => l.infer(input),
            Layer::Dense(l) => l.infer(input),
        }
    }

    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Conv2d(l) => l.forward(input),
            Layer::BatchNorm2d(l) => l.forward(input),
            Layer::Relu(l) => Ok(l.forward(input)),
            Layer::MaxPool2d(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
            Layer::Dense(l) => l.forward(input),
        }
    }

    pub fn backward(&mut self, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Conv2d(l) => l.backward(grad),
            Layer::BatchNorm2d(l) => l.backward(grad),
            Layer::Relu(l) => l.backward(grad),
            Layer::MaxPool2d(l) => l.backward(grad),
            Layer::Flatten(l) => l.backward(grad),
            Layer::Dense(l) => l.backward(grad),
        }
    }

    /// Feed the stored gradients to the optimizer. `slot` advances past this layer's parameters.
    pub fn apply_gradients(&mut self, optimizer: &mut Adam, slot: &mut usize) {
        match self {
            Layer::Conv2d(l) => l.apply_gradients(optimizer, slot),
            Layer::BatchNorm2d(l) => l.apply_gradients(optimizer, slot),
            Layer::Dense(l) => l.apply_gradients(optimizer, slot),
            Layer::Relu(_) | Layer::MaxPool2d(_) | Layer::Flatten(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use rand::{rngs::StdRng, SeedableRng};

    fn random(shape: &[usize], seed: u64) -> ArrayD<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let distribution = Uniform::new(-1.0f32, 1.0);
        Array::from_shape_simple_fn(IxDyn(shape), || distribution.sample(&mut rng))
    }

    fn images(dim: (usize, usize, usize, usize), values: Vec<f32>) -> ArrayD<f32> {
        Array4::from_shape_vec(dim, values).unwrap().into_dyn()
    }

    /// Compare the analytic input gradient of `sum(out * weights)` with central differences
    fn check_input_gradient(layer: &mut Layer, input: ArrayD<f32>, tolerance: f32) {
        let out = layer.forward(&input).unwrap();
        let weights = random(out.shape(), 99);
        let analytic = layer.backward(&weights).unwrap();

        let objective = |layer: &mut Layer, x: &ArrayD<f32>| -> f32 {
            (layer.forward(x).unwrap() * &weights).sum()
        };

        let step = 1e-2;
        for idx in 0..input.len() {
            let mut plus = input.clone();
            plus.as_slice_mut().unwrap()[idx] += step;
            let mut minus = input.clone();
            minus.as_slice_mut().unwrap()[idx] -= step;

            let numeric = (objective(layer, &plus) - objective(layer, &minus)) / (2.0 * step);
            let exact = analytic.iter().nth(idx).copied().unwrap();
            assert!(
                (numeric - exact).abs() < tolerance,
                "{} gradient {idx}: numeric {numeric} vs analytic {exact}",
                layer.name()
            );
        }
    }

    #[test]
    fn conv_matches_direct_convolution() {
        let weights = array![[1.0, 0.0, 0.0, -1.0]];
        let conv = Conv2d::from_parts(weights, array![0.5], 2);
        let input = images((1, 1, 3, 3), (0..9).map(|v| v as f32).collect());

        let out = conv.infer(&input).unwrap();

        // x[y][x] - x[y+1][x+1] is always -4 on a counting grid
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert!(out.iter().all(|&v| (v + 3.5).abs() < 1e-6));
    }

    #[test]
    fn conv_input_gradient() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Layer::Conv2d(Conv2d::new(2, 3, 3, InitMethod::GlorotUniform, &mut rng));
        check_input_gradient(&mut layer, random(&[2, 2, 5, 4], 2), 1e-2);
    }

    #[test]
    fn conv_weight_gradient_matches_patches() {
        let mut conv = Conv2d::from_parts(Array2::zeros((1, 1)), array![0.0], 1);
        let input = images((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]);
        conv.forward(&input).unwrap();
        conv.backward(&Array4::ones((1, 1, 2, 2)).into_dyn()).unwrap();

        assert_eq!(conv.grad_weights, array![[10.0]]);
        assert_eq!(conv.grad_bias, array![4.0]);
    }

    #[test]
    fn dense_input_gradient() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Layer::Dense(Dense::new(6, 4, InitMethod::HeUniform, &mut rng));
        check_input_gradient(&mut layer, random(&[3, 6], 4), 1e-2);
    }

    #[test]
    fn max_pool_routes_gradient_to_maximum() {
        let mut layer = Layer::MaxPool2d(MaxPool2d::default());
        let input = images((1, 1, 3, 3), vec![1.0, 5.0, 2.0, 3.0, 4.0, 9.0, 7.0, 0.0, 8.0]);

        let out = layer.forward(&input).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 5.0);

        let grad = layer.backward(&images((1, 1, 1, 1), vec![2.0])).unwrap();
        let mut expected = images((1, 1, 3, 3), vec![0.0; 9]);
        expected[[0, 0, 0, 1]] = 2.0;
        assert_eq!(grad, expected);
    }

    #[test]
    fn batch_norm_normalizes_each_channel() {
        let mut norm = BatchNorm2d::new(2);
        let input = random(&[4, 2, 3, 3], 5) * 3.0 + 1.0;

        let out = norm.forward(&input).unwrap();
        let out = out.into_dimensionality::<Ix4>().unwrap();
        let means = channel_sum(&out) / 36.0;
        let variances = channel_sum(&out.mapv(|v| v * v)) / 36.0;

        for c in 0..2 {
            assert!(means[c].abs() < 1e-4);
            assert!((variances[c] - 1.0).abs() < 1e-2);
        }
        assert!(norm.moving_mean.iter().all(|&m| m != 0.0));
    }

    #[test]
    fn batch_norm_input_gradient() {
        let mut layer = Layer::BatchNorm2d(BatchNorm2d::new(2));
        check_input_gradient(&mut layer, random(&[3, 2, 2, 2], 6), 5e-2);
    }

    #[test]
    fn batch_norm_inference_uses_moving_statistics() {
        let mut norm = BatchNorm2d::new(1);
        norm.moving_mean = array![2.0];
        norm.moving_variance = array![4.0 - BatchNorm2d::EPSILON];

        let out = norm.infer(&images((1, 1, 1, 1), vec![4.0])).unwrap();
        assert!((out[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn relu_masks_negative_inputs() {
        let mut relu = Relu::default();
        let out = relu.forward(&array![[-1.0, 2.0]].into_dyn());
        assert_eq!(out, array![[0.0, 2.0]].into_dyn());

        let grad = relu.backward(&array![[5.0, 5.0]].into_dyn()).unwrap();
        assert_eq!(grad, array![[0.0, 5.0]].into_dyn());
    }

    #[test]
    fn flatten_round_trips_shape() {
        let mut flatten = Flatten::default();
        let out = flatten.forward(&random(&[2, 3, 2, 2], 7)).unwrap();
        assert_eq!(out.shape(), &[2, 12]);

        let grad = flatten.backward(&out).unwrap();
        assert_eq!(grad.shape(), &[2, 3, 2, 2]);
    }

    #[test]
    fn wrong_rank_is_an_error() {
        let conv = Conv2d::from_parts(Array2::zeros((1, 9)), array![0.0], 3);
        let err = conv.infer(&Array2::<f32>::zeros((2, 9)).into_dyn()).unwrap_err();
        assert!(matches!(err, Error::InputShape { layer: "conv2d", .. }));
    }

    #[test]
    fn backward_without_forward_is_an_error() {
        let mut relu = Relu::default();
        assert!(matches!(
            relu.backward(&array![[1.0]].into_dyn()),
            Err(Error::MissingCache("relu"))
        ));
    }
}
