//! Candidate Operation Primitives
//!
//! The building blocks placed on cell edges. Every primitive maps a
//! `[B, c_in, H, W]` tensor to `[B, c_out, ceil(H / stride), ceil(W / stride)]`
//! so that sibling operations on one edge can be mixed.

use ndarray::{s, Array2, Array3};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use super::tensor::{
    concat_channels, global_avg_pool, pool2d, relu, shape_of, shift_down_right, softmax_rows,
    BatchNorm2d, Conv2d, Linear, PoolMode, Tensor,
};
use crate::error::{KolosalError, Result};

/// Default number of horizontal bands in the part-aware block
pub const DEFAULT_PARTS: usize = 4;

/// Variant tag of an [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Identity,
    Zero,
    Pooling,
    ConvNormBlock,
    SeparableConvBlock,
    DualSeparableConvBlock,
    FactorizedReduce,
    PartAwareBlock,
    ResidualBlock,
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Shape produced by a primitive with `c_out` channels and `stride`
fn strided_shape(input: [usize; 4], c_out: usize, stride: usize) -> [usize; 4] {
    [input[0], c_out, ceil_div(input[2], stride), ceil_div(input[3], stride)]
}

fn check_channels(op: &str, expected: usize, input: [usize; 4]) -> Result<()> {
    if input[1] != expected {
        return Err(KolosalError::shape(
            format!("{} with {} input channels", op, expected),
            input,
        ));
    }
    Ok(())
}

// ─── Zero ─────────────────────────────────────────────────────────────────────

/// "No connection", expressed as an all-zero contribution of the right shape
#[derive(Debug, Clone)]
pub struct Zero {
    c_in: usize,
    c_out: usize,
    stride: usize,
}

impl Zero {
    pub fn new(c_in: usize, c_out: usize, stride: usize) -> Result<Self> {
        if stride == 0 {
            return Err(KolosalError::InvalidStride { op: "Zero".to_string(), stride });
        }
        Ok(Self { c_in, c_out, stride })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_channels("Zero", self.c_in, shape_of(x))?;
        let st = self.stride as isize;
        if self.c_in == self.c_out {
            if self.stride == 1 {
                Ok(x.mapv(|v| v * 0.0))
            } else {
                Ok(x.slice(s![.., .., ..;st, ..;st]).mapv(|v| v * 0.0))
            }
        } else {
            let [b, c, h, w] = strided_shape(shape_of(x), self.c_out, self.stride);
            Ok(Tensor::zeros((b, c, h, w)))
        }
    }
}

// ─── Convolution blocks ───────────────────────────────────────────────────────

/// ReLU → Conv → BatchNorm
#[derive(Debug, Clone)]
pub struct ConvNormBlock {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl ConvNormBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        affine: bool,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        Ok(Self {
            conv: Conv2d::new(c_in, c_out, kernel, stride, padding, dilation, 1, false, rng)?,
            bn: BatchNorm2d::new(c_out, affine, track_running_stats),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.bn.forward(&self.conv.forward(&relu(x))?)
    }

    fn output_shape(&self, input: [usize; 4]) -> Result<[usize; 4]> {
        check_channels("ConvNormBlock", self.conv.in_channels(), input)?;
        self.conv.output_shape(input)
    }

    fn num_parameters(&self) -> usize {
        self.conv.num_parameters() + self.bn.num_parameters()
    }
}

/// ReLU → depthwise Conv → pointwise Conv → BatchNorm
#[derive(Debug, Clone)]
pub struct SeparableConvBlock {
    depthwise: Conv2d,
    pointwise: Conv2d,
    bn: BatchNorm2d,
}

impl SeparableConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        affine: bool,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        Ok(Self {
            depthwise: Conv2d::new(c_in, c_in, kernel, stride, padding, dilation, c_in, false, rng)?,
            pointwise: Conv2d::new(c_in, c_out, 1, 1, 0, 1, 1, false, rng)?,
            bn: BatchNorm2d::new(c_out, affine, track_running_stats),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.depthwise.forward(&relu(x))?;
        self.bn.forward(&self.pointwise.forward(&x)?)
    }

    fn output_shape(&self, input: [usize; 4]) -> Result<[usize; 4]> {
        check_channels("SeparableConvBlock", self.depthwise.in_channels(), input)?;
        let mid = self.depthwise.output_shape(input)?;
        self.pointwise.output_shape(mid)
    }

    fn num_parameters(&self) -> usize {
        self.depthwise.num_parameters() + self.pointwise.num_parameters() + self.bn.num_parameters()
    }
}

/// Two stacked separable convolutions; only the first one strides
#[derive(Debug, Clone)]
pub struct DualSeparableConvBlock {
    op_a: SeparableConvBlock,
    op_b: SeparableConvBlock,
}

impl DualSeparableConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        affine: bool,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        Ok(Self {
            op_a: SeparableConvBlock::new(
                c_in, c_in, kernel, stride, padding, dilation, affine, track_running_stats, rng,
            )?,
            op_b: SeparableConvBlock::new(
                c_in, c_out, kernel, 1, padding, dilation, affine, track_running_stats, rng,
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.op_b.forward(&self.op_a.forward(x)?)
    }

    fn output_shape(&self, input: [usize; 4]) -> Result<[usize; 4]> {
        self.op_b.output_shape(self.op_a.output_shape(input)?)
    }

    fn num_parameters(&self) -> usize {
        self.op_a.num_parameters() + self.op_b.num_parameters()
    }
}

// ─── Pooling ──────────────────────────────────────────────────────────────────

/// 3×3 average or max pooling, with a 1×1 ConvNormBlock in front when the
/// channel count changes
#[derive(Debug, Clone)]
pub struct Pooling {
    preprocess: Option<ConvNormBlock>,
    mode: PoolMode,
    c_in: usize,
    c_out: usize,
    stride: usize,
}

impl Pooling {
    pub fn new(
        c_in: usize,
        c_out: usize,
        stride: usize,
        mode: PoolMode,
        affine: bool,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        if stride == 0 {
            return Err(KolosalError::InvalidStride { op: "Pooling".to_string(), stride });
        }
        let preprocess = if c_in == c_out {
            None
        } else {
            Some(ConvNormBlock::new(c_in, c_out, 1, 1, 0, 1, affine, track_running_stats, rng)?)
        };
        Ok(Self { preprocess, mode, c_in, c_out, stride })
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_channels("Pooling", self.c_in, shape_of(x))?;
        match &self.preprocess {
            Some(pre) => pool2d(&pre.forward(x)?, self.mode, 3, self.stride, 1, false),
            None => pool2d(x, self.mode, 3, self.stride, 1, false),
        }
    }
}

// ─── Factorized reduction ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Reduction {
    /// Two 1×1 stride-2 convs over the input and its shifted copy
    Halving([Conv2d; 2]),
    /// Plain 1×1 projection
    Projection(Conv2d),
}

/// Channel/spatial reduction without the aliasing of a single strided 1×1 conv
#[derive(Debug, Clone)]
pub struct FactorizedReduce {
    reduction: Reduction,
    bn: BatchNorm2d,
    c_in: usize,
    c_out: usize,
    stride: usize,
}

impl FactorizedReduce {
    pub fn new(
        c_in: usize,
        c_out: usize,
        stride: usize,
        affine: bool,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        let reduction = match stride {
            2 => {
                let halves = [c_out / 2, c_out - c_out / 2];
                Reduction::Halving([
                    Conv2d::new(c_in, halves[0], 1, 2, 0, 1, 1, false, rng)?,
                    Conv2d::new(c_in, halves[1], 1, 2, 0, 1, 1, false, rng)?,
                ])
            }
            1 => Reduction::Projection(Conv2d::new(c_in, c_out, 1, 1, 0, 1, 1, false, rng)?),
            _ => {
                return Err(KolosalError::InvalidStride {
                    op: "FactorizedReduce".to_string(),
                    stride,
                })
            }
        };
        Ok(Self {
            reduction,
            bn: BatchNorm2d::new(c_out, affine, track_running_stats),
            c_in,
            c_out,
            stride,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_channels("FactorizedReduce", self.c_in, shape_of(x))?;
        let out = match &self.reduction {
            Reduction::Halving([even, odd]) => {
                let x = relu(x);
                let shifted = shift_down_right(&x);
                concat_channels(&[even.forward(&x)?, odd.forward(&shifted)?])?
            }
            Reduction::Projection(conv) => conv.forward(x)?,
        };
        self.bn.forward(&out)
    }

    fn num_parameters(&self) -> usize {
        let convs = match &self.reduction {
            Reduction::Halving(convs) => convs.iter().map(Conv2d::num_parameters).sum(),
            Reduction::Projection(conv) => conv.num_parameters(),
        };
        convs + self.bn.num_parameters()
    }
}

// ─── Part-aware attention ─────────────────────────────────────────────────────

/// Part-aware block (Auto-ReID): attention across horizontal bands of the
/// feature map, fused back with the input through a factorized reduction.
#[derive(Debug, Clone)]
pub struct PartAwareBlock {
    part: usize,
    hidden: usize,
    c_in: usize,
    local: Vec<(Conv2d, BatchNorm2d)>,
    w_k: Linear,
    w_q: Linear,
    last: FactorizedReduce,
}

impl PartAwareBlock {
    pub fn new(
        c_in: usize,
        c_out: usize,
        stride: usize,
        part: usize,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        let hidden = c_in / 3;
        if hidden == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "c_in".to_string(),
                value: c_in.to_string(),
                reason: "part-aware block needs at least 3 input channels".to_string(),
            });
        }
        if part == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "part".to_string(),
                value: part.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if stride != 1 && stride != 2 {
            return Err(KolosalError::InvalidStride { op: "PartAwareBlock".to_string(), stride });
        }

        let local = (0..part)
            .map(|_| {
                Ok((
                    Conv2d::new(c_in, hidden, 1, 1, 0, 1, 1, true, rng)?,
                    BatchNorm2d::new(hidden, true, track_running_stats),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            part,
            hidden,
            c_in,
            local,
            w_k: Linear::new(hidden, hidden, rng),
            w_q: Linear::new(hidden, hidden, rng),
            last: FactorizedReduce::new(c_in + hidden, c_out, stride, true, track_running_stats, rng)?,
        })
    }

    pub fn part(&self) -> usize {
        self.part
    }

    /// Row boundaries of the bands
    fn band_bounds(&self, height: usize) -> Vec<usize> {
        let mut bounds = vec![0];
        for i in 0..self.part {
            let end = ((i + 1) as f64 * (height as f64 / self.part as f64)) as usize;
            bounds.push(end.min(height));
        }
        bounds
    }

    fn check_input(&self, input: [usize; 4]) -> Result<()> {
        check_channels("PartAwareBlock", self.c_in, input)?;
        if input[2] < self.part {
            return Err(KolosalError::PreconditionViolation(format!(
                "input size too small: {:?} vs {} parts",
                input, self.part
            )));
        }
        Ok(())
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_input(shape_of(x))?;
        let (batch, channels, height, width) = x.dim();
        let bounds = self.band_bounds(height);

        // [B, part, hidden] band embeddings
        let mut part_feature = Array3::<f64>::zeros((batch, self.part, self.hidden));
        for (i, (conv, bn)) in self.local.iter().enumerate() {
            let band = x.slice(s![.., .., bounds[i]..bounds[i + 1], ..]).to_owned();
            let pooled = global_avg_pool(&band).into_shape((batch, channels, 1, 1))?;
            let embedded = bn.forward(&conv.forward(&relu(&pooled))?)?;
            part_feature
                .slice_mut(s![.., i, ..])
                .assign(&embedded.into_shape((batch, self.hidden))?);
        }

        let mut features = Tensor::zeros((batch, self.hidden, height, width));
        for n in 0..batch {
            let pf: Array2<f64> = part_feature.slice(s![n, .., ..]).to_owned();
            let keys = self.w_k.forward(&pf)?;
            let queries = self.w_q.forward(&pf)?;
            let attention = softmax_rows(&keys.dot(&queries.t()));
            let aggregated = attention.dot(&pf);

            for i in 0..self.part {
                for h in 0..self.hidden {
                    features
                        .slice_mut(s![n, h, bounds[i]..bounds[i + 1], ..])
                        .fill(aggregated[[i, h]]);
                }
            }
        }

        self.last.forward(&concat_channels(&[x.clone(), features])?)
    }

    fn num_parameters(&self) -> usize {
        let local: usize = self
            .local
            .iter()
            .map(|(conv, bn)| conv.num_parameters() + bn.num_parameters())
            .sum();
        local + self.w_k.num_parameters() + self.w_q.num_parameters() + self.last.num_parameters()
    }
}

// ─── Residual block ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Downsample {
    None,
    /// Ceil-mode 2×2 average pool followed by a 1×1 conv (stride 2)
    PoolProject(Conv2d),
    /// 1×1 ConvNormBlock when only the channel count changes
    Project(ConvNormBlock),
}

/// ResNet basic block: two 3×3 ConvNormBlocks plus a shape-matched residual
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv_a: ConvNormBlock,
    conv_b: ConvNormBlock,
    downsample: Downsample,
    c_in: usize,
}

impl ResidualBlock {
    pub fn new(
        c_in: usize,
        c_out: usize,
        stride: usize,
        affine: bool,
        track_running_stats: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        if stride != 1 && stride != 2 {
            return Err(KolosalError::InvalidStride { op: "ResidualBlock".to_string(), stride });
        }
        let conv_a = ConvNormBlock::new(c_in, c_out, 3, stride, 1, 1, affine, track_running_stats, rng)?;
        let conv_b = ConvNormBlock::new(c_out, c_out, 3, 1, 1, 1, affine, track_running_stats, rng)?;
        let downsample = if stride == 2 {
            Downsample::PoolProject(Conv2d::new(c_in, c_out, 1, 1, 0, 1, 1, false, rng)?)
        } else if c_in != c_out {
            Downsample::Project(ConvNormBlock::new(
                c_in, c_out, 1, 1, 0, 1, affine, track_running_stats, rng,
            )?)
        } else {
            Downsample::None
        };
        Ok(Self { conv_a, conv_b, downsample, c_in })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_channels("ResidualBlock", self.c_in, shape_of(x))?;
        let block = self.conv_b.forward(&self.conv_a.forward(x)?)?;
        let residual = match &self.downsample {
            Downsample::None => x.clone(),
            Downsample::PoolProject(conv) => conv.forward(&pool2d(x, PoolMode::Avg, 2, 2, 0, true)?)?,
            Downsample::Project(proj) => proj.forward(x)?,
        };
        if residual.dim() != block.dim() {
            return Err(KolosalError::shape(shape_of(&block), shape_of(&residual)));
        }
        Ok(residual + block)
    }

    fn num_parameters(&self) -> usize {
        let downsample = match &self.downsample {
            Downsample::None => 0,
            Downsample::PoolProject(conv) => conv.num_parameters(),
            Downsample::Project(proj) => proj.num_parameters(),
        };
        self.conv_a.num_parameters() + self.conv_b.num_parameters() + downsample
    }
}

// ─── Operation ────────────────────────────────────────────────────────────────

/// A candidate operation placed on a cell edge
#[derive(Debug, Clone)]
pub enum Operation {
    Identity,
    Zero(Zero),
    Pooling(Pooling),
    ConvNormBlock(ConvNormBlock),
    SeparableConvBlock(SeparableConvBlock),
    DualSeparableConvBlock(DualSeparableConvBlock),
    FactorizedReduce(FactorizedReduce),
    PartAwareBlock(Box<PartAwareBlock>),
    ResidualBlock(Box<ResidualBlock>),
}

impl Operation {
    /// Variant tag
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Identity => OperationKind::Identity,
            Operation::Zero(_) => OperationKind::Zero,
            Operation::Pooling(_) => OperationKind::Pooling,
            Operation::ConvNormBlock(_) => OperationKind::ConvNormBlock,
            Operation::SeparableConvBlock(_) => OperationKind::SeparableConvBlock,
            Operation::DualSeparableConvBlock(_) => OperationKind::DualSeparableConvBlock,
            Operation::FactorizedReduce(_) => OperationKind::FactorizedReduce,
            Operation::PartAwareBlock(_) => OperationKind::PartAwareBlock,
            Operation::ResidualBlock(_) => OperationKind::ResidualBlock,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Operation::Zero(_))
    }

    /// Apply the operation to an NCHW tensor
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Operation::Identity => Ok(x.clone()),
            Operation::Zero(op) => op.forward(x),
            Operation::Pooling(op) => op.forward(x),
            Operation::ConvNormBlock(op) => op.forward(x),
            Operation::SeparableConvBlock(op) => op.forward(x),
            Operation::DualSeparableConvBlock(op) => op.forward(x),
            Operation::FactorizedReduce(op) => op.forward(x),
            Operation::PartAwareBlock(op) => op.forward(x),
            Operation::ResidualBlock(op) => op.forward(x),
        }
    }

    /// Output shape for a given input shape, without running the operation
    pub fn output_shape(&self, input: [usize; 4]) -> Result<[usize; 4]> {
        match self {
            Operation::Identity => Ok(input),
            Operation::Zero(op) => {
                check_channels("Zero", op.c_in, input)?;
                Ok(strided_shape(input, op.c_out, op.stride))
            }
            Operation::Pooling(op) => {
                check_channels("Pooling", op.c_in, input)?;
                Ok(strided_shape(input, op.c_out, op.stride))
            }
            Operation::ConvNormBlock(op) => op.output_shape(input),
            Operation::SeparableConvBlock(op) => op.output_shape(input),
            Operation::DualSeparableConvBlock(op) => op.output_shape(input),
            Operation::FactorizedReduce(op) => {
                check_channels("FactorizedReduce", op.c_in, input)?;
                Ok(strided_shape(input, op.c_out, op.stride))
            }
            Operation::PartAwareBlock(op) => {
                op.check_input(input)?;
                Ok(strided_shape(input, op.last.c_out, op.last.stride))
            }
            Operation::ResidualBlock(op) => op.conv_a.output_shape(input),
        }
    }

    /// Number of learnable parameters
    pub fn num_parameters(&self) -> usize {
        match self {
            Operation::Identity | Operation::Zero(_) => 0,
            Operation::Pooling(op) => op.preprocess.as_ref().map_or(0, |p| p.num_parameters()),
            Operation::ConvNormBlock(op) => op.num_parameters(),
            Operation::SeparableConvBlock(op) => op.num_parameters(),
            Operation::DualSeparableConvBlock(op) => op.num_parameters(),
            Operation::FactorizedReduce(op) => op.num_parameters(),
            Operation::PartAwareBlock(op) => op.num_parameters(),
            Operation::ResidualBlock(op) => op.num_parameters(),
        }
    }
}
