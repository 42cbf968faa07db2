//! The frozen feature extractor and the handful of layer kinds the loss
//! graph knows how to traverse.
//!
//! Every layer is a pure function of its input. Parameters are read-only, so
//! the backward pass only ever propagates gradients towards the input image.

use ndarray::{Array1, Array2, Array4, ArrayView3, ArrayViewMut3, Axis, Zip};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::fmt;

use crate::Error;

/// The broad category of a layer, which determines how it is named and how
/// the mask is carried across it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    Activation,
    Pooling,
    Normalization,
}

impl LayerKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Convolution => "conv",
            Self::Activation => "relu",
            Self::Pooling => "pool",
            Self::Normalization => "bn",
        }
    }
}

/// Canonical position of a layer in a VGG style network, eg. `relu4_1`.
///
/// `block` starts at 1 and is incremented after every pooling layer, `index`
/// counts the convolutions seen so far in the current block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayerName {
    pub kind: LayerKind,
    pub block: u32,
    pub index: u32,
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}", self.kind.prefix(), self.block, self.index)
    }
}

/// A 2D convolution with a square zero padding and unit stride.
pub struct Conv2d {
    /// `[out_channels, in_channels * kh * kw]`
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    kernel: (usize, usize),
    padding: usize,
}

impl Conv2d {
    /// Creates a convolution from a `[out, in, kh, kw]` weight tensor and a
    /// bias with one entry per output channel.
    pub fn new(weight: Array4<f32>, bias: Array1<f32>, padding: usize) -> Result<Self, Error> {
        let (out_channels, in_channels, kh, kw) = weight.dim();
        if bias.len() != out_channels {
            return Err(Error::shape(
                "convolution bias",
                &[out_channels],
                &[bias.len()],
            ));
        }

        let weight = Array2::from_shape_vec(
            (out_channels, in_channels * kh * kw),
            weight.iter().copied().collect(),
        )?;

        Ok(Self {
            weight,
            bias,
            in_channels,
            kernel: (kh, kw),
            padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.bias.len()
    }

    fn output_dims(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel;
        let oh = (height + 2 * self.padding).checked_sub(kh)? + 1;
        let ow = (width + 2 * self.padding).checked_sub(kw)? + 1;
        Some((oh, ow))
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        let (batch, channels, height, width) = x.dim();
        if channels != self.in_channels {
            return Err(Error::shape(
                "convolution input",
                &[batch, self.in_channels, height, width],
                x.shape(),
            ));
        }

        let (oh, ow) = self
            .output_dims(height, width)
            .ok_or_else(|| Error::shape("convolution input", &[batch, channels, 1, 1], x.shape()))?;

        let mut out = Array4::zeros((batch, self.out_channels(), oh, ow));
        for (b, mut out_b) in out.axis_iter_mut(Axis(0)).enumerate() {
            let cols = im2col(x.index_axis(Axis(0), b), self.kernel, self.padding, (oh, ow));
            let mut res = self.weight.dot(&cols);
            for (mut row, &bias) in res.axis_iter_mut(Axis(0)).zip(self.bias.iter()) {
                row += bias;
            }
            out_b.assign(&res.into_shape((self.out_channels(), oh, ow))?);
        }

        Ok(out)
    }

    fn backward(&self, grad: &Array4<f32>, input_dims: (usize, usize)) -> Result<Array4<f32>, Error> {
        let (batch, out_channels, oh, ow) = grad.dim();
        let mut grad_in = Array4::zeros((batch, self.in_channels, input_dims.0, input_dims.1));

        for (b, mut grad_in_b) in grad_in.axis_iter_mut(Axis(0)).enumerate() {
            let grad_out = grad
                .index_axis(Axis(0), b)
                .to_owned()
                .into_shape((out_channels, oh * ow))?;
            let cols = self.weight.t().dot(&grad_out);
            col2im(&cols, &mut grad_in_b, self.kernel, self.padding, (oh, ow));
        }

        Ok(grad_in)
    }
}

fn im2col(
    x: ArrayView3<'_, f32>,
    (kh, kw): (usize, usize),
    padding: usize,
    (oh, ow): (usize, usize),
) -> Array2<f32> {
    let (channels, height, width) = x.dim();
    let mut cols = Array2::zeros((channels * kh * kw, oh * ow));

    for c in 0..channels {
        for ki in 0..kh {
            for kj in 0..kw {
                let mut dst = cols.row_mut((c * kh + ki) * kw + kj);
                for oy in 0..oh {
                    let iy = oy + ki;
                    if iy < padding || iy - padding >= height {
                        continue;
                    }
                    for ox in 0..ow {
                        let ix = ox + kj;
                        if ix < padding || ix - padding >= width {
                            continue;
                        }
                        dst[oy * ow + ox] = x[[c, iy - padding, ix - padding]];
                    }
                }
            }
        }
    }

    cols
}

fn col2im(
    cols: &Array2<f32>,
    out: &mut ArrayViewMut3<'_, f32>,
    (kh, kw): (usize, usize),
    padding: usize,
    (oh, ow): (usize, usize),
) {
    let (channels, height, width) = out.dim();

    for c in 0..channels {
        for ki in 0..kh {
            for kj in 0..kw {
                let src = cols.row((c * kh + ki) * kw + kj);
                for oy in 0..oh {
                    let iy = oy + ki;
                    if iy < padding || iy - padding >= height {
                        continue;
                    }
                    for ox in 0..ow {
                        let ix = ox + kj;
                        if ix < padding || ix - padding >= width {
                            continue;
                        }
                        out[[c, iy - padding, ix - padding]] += src[oy * ow + ox];
                    }
                }
            }
        }
    }
}

/// Max pooling without padding, dropping any trailing rows/columns that
/// don't fill a whole window.
#[derive(Copy, Clone, Debug)]
pub struct MaxPool2d {
    pub kernel: usize,
    pub stride: usize,
}

impl Default for MaxPool2d {
    fn default() -> Self {
        Self {
            kernel: 2,
            stride: 2,
        }
    }
}

impl MaxPool2d {
    pub fn output_dims(&self, height: usize, width: usize) -> (usize, usize) {
        let dim = |d: usize| {
            if d < self.kernel {
                0
            } else {
                (d - self.kernel) / self.stride + 1
            }
        };
        (dim(height), dim(width))
    }

    fn forward(&self, x: &Array4<f32>) -> (Array4<f32>, Array4<usize>) {
        let (batch, channels, height, width) = x.dim();
        let (oh, ow) = self.output_dims(height, width);

        let mut out = Array4::zeros((batch, channels, oh, ow));
        let mut argmax = Array4::zeros((batch, channels, oh, ow));

        for b in 0..batch {
            for c in 0..channels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = 0;
                        for ky in 0..self.kernel {
                            for kx in 0..self.kernel {
                                let y = oy * self.stride + ky;
                                let col = ox * self.stride + kx;
                                let v = x[[b, c, y, col]];
                                if v > best {
                                    best = v;
                                    best_idx = y * width + col;
                                }
                            }
                        }
                        out[[b, c, oy, ox]] = best;
                        argmax[[b, c, oy, ox]] = best_idx;
                    }
                }
            }
        }

        (out, argmax)
    }

    fn backward(
        grad: &Array4<f32>,
        argmax: &Array4<usize>,
        input_dims: (usize, usize),
    ) -> Array4<f32> {
        let (batch, channels, _, _) = grad.dim();
        let (height, width) = input_dims;
        let mut grad_in = Array4::zeros((batch, channels, height, width));

        for ((b, c, oy, ox), &g) in grad.indexed_iter() {
            let idx = argmax[[b, c, oy, ox]];
            grad_in[[b, c, idx / width, idx % width]] += g;
        }

        grad_in
    }
}

/// Inference mode batch normalization, folded into a per channel affine
/// transform.
pub struct BatchNorm2d {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm2d {
    pub fn new(
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        weight: Array1<f32>,
        bias: Array1<f32>,
        eps: f32,
    ) -> Result<Self, Error> {
        let channels = running_mean.len();
        for other in &[&running_var, &weight, &bias] {
            if other.len() != channels {
                return Err(Error::shape(
                    "batch norm parameters",
                    &[channels],
                    &[other.len()],
                ));
            }
        }

        let scale = Zip::from(&running_var)
            .and(&weight)
            .map_collect(|&var, &w| w / (var + eps).sqrt());
        let shift = Zip::from(&bias)
            .and(&running_mean)
            .and(&scale)
            .map_collect(|&b, &m, &s| b - m * s);

        Ok(Self { scale, shift })
    }

    fn check(&self, x: &Array4<f32>) -> Result<(), Error> {
        let (batch, channels, height, width) = x.dim();
        if channels != self.scale.len() {
            return Err(Error::shape(
                "batch norm input",
                &[batch, self.scale.len(), height, width],
                x.shape(),
            ));
        }
        Ok(())
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        self.check(x)?;
        let scale = self.scale.view().into_shape((1, self.scale.len(), 1, 1))?;
        let shift = self.shift.view().into_shape((1, self.shift.len(), 1, 1))?;
        Ok(x * &scale + &shift)
    }

    fn backward(&self, grad: &Array4<f32>) -> Result<Array4<f32>, Error> {
        let scale = self.scale.view().into_shape((1, self.scale.len(), 1, 1))?;
        Ok(grad * &scale)
    }
}

/// Maps `[0,1]` RGB images into the value range the extractor was trained
/// on: `(x * 255 - mean) / std`.
pub struct Normalization {
    mean: Array1<f32>,
    std: Array1<f32>,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: Array1::from(vec![103.939, 116.779, 123.68]),
            std: Array1::from(vec![1.0, 1.0, 1.0]),
        }
    }
}

impl Normalization {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            mean: Array1::from(mean.to_vec()),
            std: Array1::from(std.to_vec()),
        }
    }

    pub(crate) fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        let (batch, channels, height, width) = x.dim();
        if channels != self.mean.len() {
            return Err(Error::shape(
                "image",
                &[batch, self.mean.len(), height, width],
                x.shape(),
            ));
        }

        let mean = self.mean.view().into_shape((1, channels, 1, 1))?;
        let std = self.std.view().into_shape((1, channels, 1, 1))?;
        Ok((x * 255.0 - &mean) / &std)
    }

    pub(crate) fn backward(&self, grad: &Array4<f32>) -> Result<Array4<f32>, Error> {
        let std = self.std.view().into_shape((1, self.std.len(), 1, 1))?;
        Ok(grad * 255.0 / &std)
    }
}

/// A single layer of the frozen feature extractor
pub enum Layer {
    Conv2d(Conv2d),
    Relu,
    MaxPool2d(MaxPool2d),
    BatchNorm2d(BatchNorm2d),
    /// A layer the extractor was loaded with but which can't be traversed,
    /// identified by its type name
    Unsupported(String),
}

/// What a layer keeps from its forward pass for the backward pass
pub(crate) enum Saved {
    Conv { input_dims: (usize, usize) },
    Relu { output: Array4<f32> },
    Pool {
        argmax: Array4<usize>,
        input_dims: (usize, usize),
    },
    BatchNorm,
}

impl Layer {
    pub fn kind(&self) -> Result<LayerKind, Error> {
        match self {
            Self::Conv2d(_) => Ok(LayerKind::Convolution),
            Self::Relu => Ok(LayerKind::Activation),
            Self::MaxPool2d(_) => Ok(LayerKind::Pooling),
            Self::BatchNorm2d(_) => Ok(LayerKind::Normalization),
            Self::Unsupported(name) => Err(Error::UnrecognizedLayer(name.clone())),
        }
    }

    /// Evaluates the layer, returning a new tensor. The input is never
    /// modified.
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        self.forward_saved(x).map(|(out, _)| out)
    }

    pub(crate) fn forward_saved(&self, x: &Array4<f32>) -> Result<(Array4<f32>, Saved), Error> {
        let (_, _, height, width) = x.dim();
        match self {
            Self::Conv2d(conv) => Ok((
                conv.forward(x)?,
                Saved::Conv {
                    input_dims: (height, width),
                },
            )),
            Self::Relu => {
                let output = x.mapv(|v| v.max(0.0));
                Ok((
                    output.clone(),
                    Saved::Relu { output },
                ))
            }
            Self::MaxPool2d(pool) => {
                let (out, argmax) = pool.forward(x);
                Ok((
                    out,
                    Saved::Pool {
                        argmax,
                        input_dims: (height, width),
                    },
                ))
            }
            Self::BatchNorm2d(bn) => Ok((bn.forward(x)?, Saved::BatchNorm)),
            Self::Unsupported(name) => Err(Error::UnrecognizedLayer(name.clone())),
        }
    }

    pub(crate) fn backward(&self, saved: &Saved, grad: Array4<f32>) -> Result<Array4<f32>, Error> {
        match (self, saved) {
            (Self::Conv2d(conv), Saved::Conv { input_dims }) => conv.backward(&grad, *input_dims),
            (Self::Relu, Saved::Relu { output }) => {
                let mut grad = grad;
                Zip::from(&mut grad).and(output).for_each(|g, &o| {
                    if o <= 0.0 {
                        *g = 0.0;
                    }
                });
                Ok(grad)
            }
            (Self::MaxPool2d(_), Saved::Pool { argmax, input_dims }) => {
                Ok(MaxPool2d::backward(&grad, argmax, *input_dims))
            }
            (Self::BatchNorm2d(bn), Saved::BatchNorm) => bn.backward(&grad),
            (Self::Unsupported(name), _) => Err(Error::UnrecognizedLayer(name.clone())),
            _ => unreachable!("saved state always comes from the same layer's forward pass"),
        }
    }
}

/// One entry of a VGG style architecture description
#[derive(Copy, Clone, Debug)]
pub enum Block {
    /// A 3x3 convolution with the given number of output channels, followed
    /// by a ReLU (and a batch norm in between if requested)
    Conv(usize),
    /// A 2x2 max pooling with stride 2
    Pool,
}

/// The `features` part of VGG-19
pub const VGG19: &[Block] = &[
    Block::Conv(64),
    Block::Conv(64),
    Block::Pool,
    Block::Conv(128),
    Block::Conv(128),
    Block::Pool,
    Block::Conv(256),
    Block::Conv(256),
    Block::Conv(256),
    Block::Conv(256),
    Block::Pool,
    Block::Conv(512),
    Block::Conv(512),
    Block::Conv(512),
    Block::Conv(512),
    Block::Pool,
    Block::Conv(512),
    Block::Conv(512),
    Block::Conv(512),
    Block::Conv(512),
    Block::Pool,
];

/// A frozen, ordered sequence of layers.
///
/// The extractor is never mutated once built, so a single instance can be
/// shared by reference between any number of concurrent syntheses.
pub struct FeatureExtractor {
    layers: Vec<Layer>,
}

impl FeatureExtractor {
    /// Wraps layers that were loaded elsewhere, eg. from pretrained weights
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// The VGG-19 topology with deterministic, randomly initialized weights
    pub fn vgg19(seed: u64) -> Self {
        Self::vgg(VGG19, false, seed)
    }

    /// Builds a VGG style network for 3 channel input from an architecture
    /// description. Convolution weights are drawn from a He-uniform
    /// distribution, biases start at zero.
    pub fn vgg(config: &[Block], batch_norm: bool, seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(config.len() * 3);
        let mut in_channels = 3;

        for block in config {
            match *block {
                Block::Conv(out_channels) => {
                    let fan_in = (in_channels * 9) as f32;
                    let bound = (6.0 / fan_in).sqrt();
                    let weight = Array2::from_shape_simple_fn((out_channels, in_channels * 9), || {
                        rng.gen_range(-bound..bound)
                    });

                    layers.push(Layer::Conv2d(Conv2d {
                        weight,
                        bias: Array1::zeros(out_channels),
                        in_channels,
                        kernel: (3, 3),
                        padding: 1,
                    }));

                    if batch_norm {
                        layers.push(Layer::BatchNorm2d(BatchNorm2d {
                            scale: Array1::ones(out_channels),
                            shift: Array1::zeros(out_channels),
                        }));
                    }

                    layers.push(Layer::Relu);
                    in_channels = out_channels;
                }
                Block::Pool => layers.push(Layer::MaxPool2d(MaxPool2d::default())),
            }
        }

        Self { layers }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Runs the whole extractor on an already normalized input
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }
}
