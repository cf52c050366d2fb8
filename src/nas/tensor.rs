//! NCHW Tensor Kernels
//!
//! Minimal ndarray kernels backing the candidate operations: convolution,
//! batch normalization, pooling, linear projection and softmax. Tensors are
//! `Array4<f64>` laid out as `[batch, channels, height, width]`.

use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use parking_lot::Mutex;
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use crate::error::{KolosalError, Result};

/// 4-D feature map in NCHW layout
pub type Tensor = Array4<f64>;

/// Shape of a tensor as `[batch, channels, height, width]`
pub fn shape_of(x: &Tensor) -> [usize; 4] {
    let (b, c, h, w) = x.dim();
    [b, c, h, w]
}

/// Output size of a sliding window along one spatial axis (floor mode)
pub fn window_out_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Result<usize> {
    let span = dilation * (kernel - 1) + 1;
    let padded = input + 2 * padding;
    if stride == 0 || padded < span {
        return Err(KolosalError::PreconditionViolation(format!(
            "window of span {} (stride {}) does not fit input of size {} with padding {}",
            span, stride, input, padding
        )));
    }
    Ok((padded - span) / stride + 1)
}

/// Output size of a sliding window in ceil mode; the last window must start
/// inside the input or the left padding.
fn window_out_dim_ceil(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    let numer = input as isize + 2 * padding as isize - kernel as isize;
    let mut out = ((numer as f64 / stride as f64).ceil() as isize + 1).max(1) as usize;
    if (out - 1) * stride >= input + padding {
        out -= 1;
    }
    out.max(1)
}

/// Kaiming-uniform style init with bound `1 / sqrt(fan_in)`
fn uniform_init(shape: (usize, usize, usize, usize), fan_in: usize, rng: &mut Xoshiro256PlusPlus) -> Array4<f64> {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    Array4::from_shape_fn(shape, |_| rng.gen_range(-bound..=bound))
}

fn stack_batch(samples: Vec<Array3<f64>>, empty: (usize, usize, usize)) -> Result<Tensor> {
    if samples.is_empty() {
        return Ok(Tensor::zeros((0, empty.0, empty.1, empty.2)));
    }
    let views: Vec<_> = samples.iter().map(|a| a.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

// ─── Convolution ──────────────────────────────────────────────────────────────

/// 2-D convolution with stride, zero padding, dilation and channel groups
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Weights, shape `[c_out, c_in / groups, k, k]`
    weight: Array4<f64>,
    bias: Option<Array1<f64>>,
    stride: usize,
    padding: usize,
    dilation: usize,
    groups: usize,
}

impl Conv2d {
    /// Create a square-kernel convolution
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        groups: usize,
        bias: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Self> {
        if groups == 0 || c_in % groups != 0 || c_out % groups != 0 {
            return Err(KolosalError::InvalidParameter {
                name: "groups".to_string(),
                value: groups.to_string(),
                reason: format!("must divide c_in={} and c_out={}", c_in, c_out),
            });
        }
        if kernel == 0 || dilation == 0 {
            return Err(KolosalError::InvalidParameter {
                name: "kernel".to_string(),
                value: format!("{}x{} (dilation {})", kernel, kernel, dilation),
                reason: "kernel size and dilation must be positive".to_string(),
            });
        }
        if stride == 0 {
            return Err(KolosalError::InvalidStride { op: "Conv2d".to_string(), stride });
        }

        let fan_in = (c_in / groups) * kernel * kernel;
        let weight = uniform_init((c_out, c_in / groups, kernel, kernel), fan_in, rng);
        let bias = if bias {
            let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
            Some(Array1::from_shape_fn(c_out, |_| rng.gen_range(-bound..=bound)))
        } else {
            None
        };

        Ok(Self { weight, bias, stride, padding, dilation, groups })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1 * self.groups
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    /// Output shape for an input shape
    pub fn output_shape(&self, input: [usize; 4]) -> Result<[usize; 4]> {
        let k = self.weight.dim().2;
        let oh = window_out_dim(input[2], k, self.stride, self.padding, self.dilation)?;
        let ow = window_out_dim(input[3], k, self.stride, self.padding, self.dilation)?;
        Ok([input[0], self.out_channels(), oh, ow])
    }

    /// Forward pass, parallel over the batch
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, h, w) = x.dim();
        if channels != self.in_channels() {
            return Err(KolosalError::shape(
                format!("{} input channels", self.in_channels()),
                shape_of(x),
            ));
        }
        let [_, c_out, oh, ow] = self.output_shape(shape_of(x))?;
        let (_, cin_g, kh, kw) = self.weight.dim();
        let cout_g = c_out / self.groups;
        let (stride, dilation, pad) = (self.stride, self.dilation, self.padding as isize);

        let samples: Vec<Array3<f64>> = (0..batch)
            .into_par_iter()
            .map(|n| {
                let input = x.index_axis(Axis(0), n);
                let mut out = Array3::<f64>::zeros((c_out, oh, ow));
                for oc in 0..c_out {
                    let group = oc / cout_g;
                    let bias = self.bias.as_ref().map_or(0.0, |b| b[oc]);
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let mut acc = bias;
                            for ic in 0..cin_g {
                                let channel = group * cin_g + ic;
                                for ky in 0..kh {
                                    let iy = (oy * stride + ky * dilation) as isize - pad;
                                    if iy < 0 || iy >= h as isize {
                                        continue;
                                    }
                                    for kx in 0..kw {
                                        let ix = (ox * stride + kx * dilation) as isize - pad;
                                        if ix < 0 || ix >= w as isize {
                                            continue;
                                        }
                                        acc += self.weight[[oc, ic, ky, kx]]
                                            * input[[channel, iy as usize, ix as usize]];
                                    }
                                }
                            }
                            out[[oc, oy, ox]] = acc;
                        }
                    }
                }
                out
            })
            .collect();

        stack_batch(samples, (c_out, oh, ow))
    }
}

// ─── Normalization ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RunningStats {
    mean: Array1<f64>,
    var: Array1<f64>,
}

/// Batch normalization over the channel axis.
///
/// Normalizes with batch statistics. When `track_running_stats` is set the
/// running mean/variance are updated on every forward pass.
#[derive(Debug)]
pub struct BatchNorm2d {
    num_features: usize,
    eps: f64,
    momentum: f64,
    /// Learnable scale and shift, present when affine
    affine: Option<(Array1<f64>, Array1<f64>)>,
    running: Option<Mutex<RunningStats>>,
}

impl Clone for BatchNorm2d {
    fn clone(&self) -> Self {
        Self {
            num_features: self.num_features,
            eps: self.eps,
            momentum: self.momentum,
            affine: self.affine.clone(),
            running: self.running.as_ref().map(|r| Mutex::new(r.lock().clone())),
        }
    }
}

impl BatchNorm2d {
    pub fn new(num_features: usize, affine: bool, track_running_stats: bool) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            affine: affine.then(|| (Array1::ones(num_features), Array1::zeros(num_features))),
            running: track_running_stats.then(|| {
                Mutex::new(RunningStats {
                    mean: Array1::zeros(num_features),
                    var: Array1::ones(num_features),
                })
            }),
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_parameters(&self) -> usize {
        if self.affine.is_some() {
            2 * self.num_features
        } else {
            0
        }
    }

    /// Current running mean, if tracked
    pub fn running_mean(&self) -> Option<Array1<f64>> {
        self.running.as_ref().map(|r| r.lock().mean.clone())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = x.dim();
        if channels != self.num_features {
            return Err(KolosalError::shape(
                format!("{} channels", self.num_features),
                shape_of(x),
            ));
        }

        let mut out = x.clone();
        let mut batch_mean = Array1::zeros(channels);
        let mut batch_var = Array1::zeros(channels);
        let mut count = 0usize;

        for ch in 0..channels {
            let plane = x.index_axis(Axis(1), ch);
            count = plane.len();
            if count == 0 {
                continue;
            }
            let mean = plane.sum() / count as f64;
            let var = plane.fold(0.0, |acc, v| acc + (v - mean) * (v - mean)) / count as f64;
            batch_mean[ch] = mean;
            batch_var[ch] = var;

            let std = (var + self.eps).sqrt();
            let (gamma, beta) = match &self.affine {
                Some((g, b)) => (g[ch], b[ch]),
                None => (1.0, 0.0),
            };
            out.index_axis_mut(Axis(1), ch)
                .mapv_inplace(|v| (v - mean) / std * gamma + beta);
        }

        if let (Some(running), true) = (&self.running, count > 0) {
            let unbiased = if count > 1 {
                &batch_var * (count as f64 / (count - 1) as f64)
            } else {
                batch_var
            };
            let mut stats = running.lock();
            stats.mean = &stats.mean * (1.0 - self.momentum) + &batch_mean * self.momentum;
            stats.var = &stats.var * (1.0 - self.momentum) + &unbiased * self.momentum;
        }

        Ok(out)
    }
}

// ─── Pooling ──────────────────────────────────────────────────────────────────

/// Pooling reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Average; padding never counts towards the divisor
    Avg,
    Max,
}

/// 2-D pooling with a square window
pub fn pool2d(
    x: &Tensor,
    mode: PoolMode,
    kernel: usize,
    stride: usize,
    padding: usize,
    ceil_mode: bool,
) -> Result<Tensor> {
    let (batch, channels, h, w) = x.dim();
    let (oh, ow) = if ceil_mode {
        (
            window_out_dim_ceil(h, kernel, stride, padding),
            window_out_dim_ceil(w, kernel, stride, padding),
        )
    } else {
        (
            window_out_dim(h, kernel, stride, padding, 1)?,
            window_out_dim(w, kernel, stride, padding, 1)?,
        )
    };

    let mut out = Tensor::zeros((batch, channels, oh, ow));
    let pad = padding as isize;
    for n in 0..batch {
        for c in 0..channels {
            for oy in 0..oh {
                let y0 = (oy * stride) as isize - pad;
                let ys = y0.max(0) as usize..((y0 + kernel as isize).min(h as isize)).max(0) as usize;
                for ox in 0..ow {
                    let x0 = (ox * stride) as isize - pad;
                    let xs = x0.max(0) as usize..((x0 + kernel as isize).min(w as isize)).max(0) as usize;
                    let window = x.slice(s![n, c, ys.clone(), xs]);
                    if window.is_empty() {
                        continue;
                    }
                    out[[n, c, oy, ox]] = match mode {
                        PoolMode::Avg => window.sum() / window.len() as f64,
                        PoolMode::Max => window.fold(f64::NEG_INFINITY, |m, &v| m.max(v)),
                    };
                }
            }
        }
    }
    Ok(out)
}

/// Global average pooling, `[B, C, H, W] -> [B, C]`
pub fn global_avg_pool(x: &Tensor) -> Array2<f64> {
    let (batch, channels, h, w) = x.dim();
    let area = (h * w).max(1) as f64;
    Array2::from_shape_fn((batch, channels), |(n, c)| {
        x.slice(s![n, c, .., ..]).sum() / area
    })
}

// ─── Dense helpers ────────────────────────────────────────────────────────────

/// Fully connected projection `y = x W^T + b`
#[derive(Debug, Clone)]
pub struct Linear {
    /// Shape `[out, in]`
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut Xoshiro256PlusPlus) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        Self {
            weight: Array2::from_shape_fn((out_features, in_features), |_| rng.gen_range(-bound..=bound)),
            bias: Array1::from_shape_fn(out_features, |_| rng.gen_range(-bound..=bound)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Apply to each row of `x`
    pub fn forward(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.in_features() {
            return Err(KolosalError::shape(
                format!("[_, {}]", self.in_features()),
                x.dim(),
            ));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

/// Rectified linear unit
pub fn relu(x: &Tensor) -> Tensor {
    x.mapv(|v| v.max(0.0))
}

/// Softmax function
pub fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    if logits.is_empty() {
        return Array1::zeros(0);
    }
    let max_val = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Array1<f64> = logits.mapv(|x| (x - max_val).exp());
    let sum: f64 = exp.sum();
    if sum > 0.0 && sum.is_finite() {
        exp / sum
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len() as f64)
    }
}

/// Row-wise softmax of a matrix
pub fn softmax_rows(x: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(x.raw_dim());
    for (i, row) in x.rows().into_iter().enumerate() {
        out.row_mut(i).assign(&softmax(&row.to_owned()));
    }
    out
}

/// Concatenate feature maps along the channel axis
pub fn concat_channels(parts: &[Tensor]) -> Result<Tensor> {
    let views: Vec<_> = parts.iter().map(|t| t.view()).collect();
    Ok(ndarray::concatenate(Axis(1), &views)?)
}

/// `pad(x, right=1, bottom=1)[:, :, 1:, 1:]`: every pixel takes the value of
/// its lower-right neighbour, zero past the border.
pub fn shift_down_right(x: &Tensor) -> Tensor {
    let (_, _, h, w) = x.dim();
    let mut out = Tensor::zeros(x.raw_dim());
    if h > 1 && w > 1 {
        out.slice_mut(s![.., .., ..h - 1, ..w - 1])
            .assign(&x.slice(s![.., .., 1.., 1..]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(7)
    }

    #[test]
    fn test_window_out_dim() {
        assert_eq!(window_out_dim(32, 3, 1, 1, 1).unwrap(), 32);
        assert_eq!(window_out_dim(7, 3, 2, 1, 1).unwrap(), 4);
        assert_eq!(window_out_dim(8, 5, 1, 4, 2).unwrap(), 8);
        assert!(window_out_dim(1, 3, 1, 0, 1).is_err());
    }

    #[test]
    fn test_conv_identity_kernel() {
        let mut conv = Conv2d::new(1, 1, 1, 1, 0, 1, 1, false, &mut rng()).unwrap();
        conv.weight.fill(1.0);
        let x = Tensor::from_shape_fn((2, 1, 3, 3), |(n, _, i, j)| (n * 9 + i * 3 + j) as f64);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv_groups_and_stride() {
        let conv = Conv2d::new(4, 8, 3, 2, 1, 1, 4, false, &mut rng()).unwrap();
        let x = Tensor::ones((1, 4, 7, 7));
        let y = conv.forward(&x).unwrap();
        assert_eq!(shape_of(&y), [1, 8, 4, 4]);
        assert_eq!(conv.num_parameters(), 8 * 1 * 9);
    }

    #[test]
    fn test_conv_rejects_bad_groups() {
        assert!(Conv2d::new(3, 8, 3, 1, 1, 1, 2, false, &mut rng()).is_err());
    }

    #[test]
    fn test_batch_norm_normalizes() {
        let bn = BatchNorm2d::new(2, true, true);
        let x = Tensor::from_shape_fn((2, 2, 2, 2), |(n, c, i, j)| (n + c * 10 + i + j) as f64);
        let y = bn.forward(&x).unwrap();
        for c in 0..2 {
            let plane = y.index_axis(Axis(1), c);
            assert!((plane.sum() / plane.len() as f64).abs() < 1e-9);
        }
        let running = bn.running_mean().unwrap();
        assert!(running[1] > running[0]);
    }

    #[test]
    fn test_avg_pool_excludes_padding() {
        let x = Tensor::ones((1, 1, 4, 4));
        let y = pool2d(&x, PoolMode::Avg, 3, 1, 1, false).unwrap();
        assert!(y.iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_ceil_mode_pool() {
        let x = Tensor::ones((1, 1, 5, 5));
        let y = pool2d(&x, PoolMode::Avg, 2, 2, 0, true).unwrap();
        assert_eq!(shape_of(&y), [1, 1, 3, 3]);
        assert!((y[[0, 0, 2, 2]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_pool() {
        let x = Tensor::from_shape_fn((1, 1, 4, 4), |(_, _, i, j)| (i * 4 + j) as f64);
        let y = pool2d(&x, PoolMode::Max, 3, 2, 1, false).unwrap();
        assert_eq!(shape_of(&y), [1, 1, 2, 2]);
        assert_eq!(y[[0, 0, 1, 1]], 15.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&Array1::from(vec![1.0, 2.0, 3.0]));
        assert!((p.sum() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_shift_down_right() {
        let x = Tensor::from_shape_fn((1, 1, 2, 2), |(_, _, i, j)| (i * 2 + j + 1) as f64);
        let y = shift_down_right(&x);
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 1, 1]], 0.0);
    }
}
