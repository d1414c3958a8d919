// src/neural/stem.rs
// Convolutional front end: depthwise-separable convolution, per-channel affine, ReLU.
// Samples are flattened channel-major (c, h, w), one row per sample.

use nalgebra::DMatrix;
use rand::Rng;

use super::params::{Gradients, ParamId, ParamRole, ParamStore};
use super::{ArchitectureConfig, uniform_init};

/// Depthwise-separable convolution stem feeding the spike encoder
#[derive(Debug, Clone)]
pub struct ConvStem {
    in_channels: usize,
    channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    in_h: usize,
    in_w: usize,
    out_h: usize,
    out_w: usize,
    depthwise_weight: ParamId,
    depthwise_bias: ParamId,
    pointwise_weight: ParamId,
    pointwise_bias: ParamId,
    norm_scale: ParamId,
    norm_shift: ParamId,
}

/// Intermediate activations kept for the backward pass
#[derive(Debug, Clone)]
pub(crate) struct StemTrace {
    input: DMatrix<f32>,
    depthwise: DMatrix<f32>,
    pointwise: DMatrix<f32>,
    normalized: DMatrix<f32>,
    pub(crate) output: DMatrix<f32>,
}

impl ConvStem {
    /// Stride of the depthwise convolution
    pub const STRIDE: usize = 2;

    /// Build the stem and register its parameters
    pub fn new<R: Rng + ?Sized>(arch: &ArchitectureConfig, params: &mut ParamStore, rng: &mut R) -> Self {
        let kernel = arch.conv_kernel_size;
        let padding = (kernel - 1) / 2;
        let stride = Self::STRIDE;
        let out_h = (arch.input_height + 2 * padding - kernel) / stride + 1;
        let out_w = (arch.input_width + 2 * padding - kernel) / stride + 1;
        let in_channels = arch.input_channels;
        let channels = arch.stem_channels;

        let dw_bound = 1.0 / ((kernel * kernel) as f32).sqrt();
        let pw_bound = 1.0 / (in_channels as f32).sqrt();

        let depthwise_weight = params.register(
            "stem.depthwise.weight",
            ParamRole::Weight,
            uniform_init(in_channels, kernel * kernel, dw_bound, rng),
        );
        let depthwise_bias = params.register(
            "stem.depthwise.bias",
            ParamRole::Bias,
            uniform_init(1, in_channels, dw_bound, rng),
        );
        let pointwise_weight = params.register(
            "stem.pointwise.weight",
            ParamRole::Weight,
            uniform_init(channels, in_channels, pw_bound, rng),
        );
        let pointwise_bias = params.register(
            "stem.pointwise.bias",
            ParamRole::Bias,
            uniform_init(1, channels, pw_bound, rng),
        );
        let norm_scale = params.register("stem.norm.scale", ParamRole::Affine, DMatrix::from_element(1, channels, 1.0));
        let norm_shift = params.register("stem.norm.shift", ParamRole::Affine, DMatrix::zeros(1, channels));

        ConvStem {
            in_channels,
            channels,
            kernel,
            stride,
            padding,
            in_h: arch.input_height,
            in_w: arch.input_width,
            out_h,
            out_w,
            depthwise_weight,
            depthwise_bias,
            pointwise_weight,
            pointwise_bias,
            norm_scale,
            norm_shift,
        }
    }

    /// Flattened length of one input sample
    pub fn input_len(&self) -> usize {
        self.in_channels * self.in_h * self.in_w
    }

    /// Flattened length of one output sample
    pub fn output_len(&self) -> usize {
        self.channels * self.out_h * self.out_w
    }

    /// Output spatial size `(height, width)`
    pub fn output_hw(&self) -> (usize, usize) {
        (self.out_h, self.out_w)
    }

    // Input coordinate read by output coordinate `out` through kernel tap `tap`.
    fn source(&self, out: usize, tap: usize, extent: usize) -> Option<usize> {
        (out * self.stride + tap).checked_sub(self.padding).filter(|&i| i < extent)
    }

    pub(crate) fn forward(&self, params: &ParamStore, input: &DMatrix<f32>) -> StemTrace {
        let batch = input.nrows();
        let in_plane = self.in_h * self.in_w;
        let plane = self.out_h * self.out_w;
        let dw_w = params.value(self.depthwise_weight);
        let dw_b = params.value(self.depthwise_bias);
        let pw_w = params.value(self.pointwise_weight);
        let pw_b = params.value(self.pointwise_bias);
        let scale = params.value(self.norm_scale);
        let shift = params.value(self.norm_shift);

        let mut depthwise: DMatrix<f32> = DMatrix::zeros(batch, self.in_channels * plane);
        for b in 0..batch {
            for c in 0..self.in_channels {
                for oh in 0..self.out_h {
                    for ow in 0..self.out_w {
                        let mut acc = dw_b[(0, c)];
                        for kh in 0..self.kernel {
                            let Some(ih) = self.source(oh, kh, self.in_h) else { continue };
                            for kw in 0..self.kernel {
                                let Some(iw) = self.source(ow, kw, self.in_w) else { continue };
                                acc += dw_w[(c, kh * self.kernel + kw)] * input[(b, c * in_plane + ih * self.in_w + iw)];
                            }
                        }
                        depthwise[(b, c * plane + oh * self.out_w + ow)] = acc;
                    }
                }
            }
        }

        let mut pointwise: DMatrix<f32> = DMatrix::zeros(batch, self.channels * plane);
        for b in 0..batch {
            for o in 0..self.channels {
                for pos in 0..plane {
                    let mut acc = pw_b[(0, o)];
                    for c in 0..self.in_channels {
                        acc += pw_w[(o, c)] * depthwise[(b, c * plane + pos)];
                    }
                    pointwise[(b, o * plane + pos)] = acc;
                }
            }
        }

        let normalized = DMatrix::from_fn(batch, self.channels * plane, |b, j| {
            let o = j / plane;
            scale[(0, o)] * pointwise[(b, j)] + shift[(0, o)]
        });
        let output = normalized.map(|v| v.max(0.0));

        StemTrace { input: input.clone(), depthwise, pointwise, normalized, output }
    }

    pub(crate) fn backward(&self, params: &ParamStore, trace: &StemTrace, grad_out: &DMatrix<f32>, grads: &mut Gradients) {
        let batch = grad_out.nrows();
        let in_plane = self.in_h * self.in_w;
        let plane = self.out_h * self.out_w;
        let pw_w = params.value(self.pointwise_weight);
        let scale = params.value(self.norm_scale);

        // ReLU
        let grad_norm = grad_out.zip_map(&trace.normalized, |g, n| if n > 0.0 { g } else { 0.0 });

        // Affine
        let mut d_scale: DMatrix<f32> = DMatrix::zeros(1, self.channels);
        let mut d_shift: DMatrix<f32> = DMatrix::zeros(1, self.channels);
        let mut grad_pw: DMatrix<f32> = DMatrix::zeros(batch, self.channels * plane);
        for b in 0..batch {
            for j in 0..self.channels * plane {
                let o = j / plane;
                let g = grad_norm[(b, j)];
                d_scale[(0, o)] += g * trace.pointwise[(b, j)];
                d_shift[(0, o)] += g;
                grad_pw[(b, j)] = g * scale[(0, o)];
            }
        }

        // Pointwise
        let mut d_pw_w: DMatrix<f32> = DMatrix::zeros(self.channels, self.in_channels);
        let mut d_pw_b: DMatrix<f32> = DMatrix::zeros(1, self.channels);
        let mut grad_dw: DMatrix<f32> = DMatrix::zeros(batch, self.in_channels * plane);
        for b in 0..batch {
            for o in 0..self.channels {
                for pos in 0..plane {
                    let g = grad_pw[(b, o * plane + pos)];
                    d_pw_b[(0, o)] += g;
                    for c in 0..self.in_channels {
                        d_pw_w[(o, c)] += g * trace.depthwise[(b, c * plane + pos)];
                        grad_dw[(b, c * plane + pos)] += g * pw_w[(o, c)];
                    }
                }
            }
        }

        // Depthwise
        let mut d_dw_w: DMatrix<f32> = DMatrix::zeros(self.in_channels, self.kernel * self.kernel);
        let mut d_dw_b: DMatrix<f32> = DMatrix::zeros(1, self.in_channels);
        for b in 0..batch {
            for c in 0..self.in_channels {
                for oh in 0..self.out_h {
                    for ow in 0..self.out_w {
                        let g = grad_dw[(b, c * plane + oh * self.out_w + ow)];
                        d_dw_b[(0, c)] += g;
                        for kh in 0..self.kernel {
                            let Some(ih) = self.source(oh, kh, self.in_h) else { continue };
                            for kw in 0..self.kernel {
                                let Some(iw) = self.source(ow, kw, self.in_w) else { continue };
                                d_dw_w[(c, kh * self.kernel + kw)] += g * trace.input[(b, c * in_plane + ih * self.in_w + iw)];
                            }
                        }
                    }
                }
            }
        }

        grads.accumulate(self.norm_scale, d_scale);
        grads.accumulate(self.norm_shift, d_shift);
        grads.accumulate(self.pointwise_weight, d_pw_w);
        grads.accumulate(self.pointwise_bias, d_pw_b);
        grads.accumulate(self.depthwise_weight, d_dw_w);
        grads.accumulate(self.depthwise_bias, d_dw_b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn stem() -> (ConvStem, ParamStore) {
        let arch = ArchitectureConfig::default();
        let mut params = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(11);
        (ConvStem::new(&arch, &mut params, &mut rng), params)
    }

    #[test]
    fn output_shape_follows_stride_two() {
        let (stem, params) = stem();
        assert_eq!(stem.input_len(), 4 * 8 * 9);
        assert_eq!(stem.output_hw(), (4, 5));
        assert_eq!(stem.output_len(), 8 * 4 * 5);
        assert_eq!(params.len(), 6);

        let input = DMatrix::from_fn(3, stem.input_len(), |b, j| ((b + j) % 7) as f32 * 0.1);
        let trace = stem.forward(&params, &input);
        assert_eq!(trace.output.shape(), (3, stem.output_len()));
        assert!(trace.output.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn depthwise_gradient_matches_finite_difference() {
        let (stem, mut params) = stem();
        let input = DMatrix::from_fn(2, stem.input_len(), |b, j| ((3 * b + j) % 11) as f32 * 0.05 - 0.2);
        // keep every unit on the linear side of the ReLU
        params.get_mut(stem.norm_shift).value_mut().fill(10.0);

        // Loss = sum of stem outputs, so upstream gradient is all ones
        let trace = stem.forward(&params, &input);
        let ones = DMatrix::from_element(2, stem.output_len(), 1.0);
        let mut grads = Gradients::empty_for(&params);
        stem.backward(&params, &trace, &ones, &mut grads);
        let analytic = grads.get(stem.depthwise_weight).unwrap()[(1, 4)];

        let eps = 1e-2;
        params.get_mut(stem.depthwise_weight).value_mut()[(1, 4)] += eps;
        let plus: f32 = stem.forward(&params, &input).output.sum();
        params.get_mut(stem.depthwise_weight).value_mut()[(1, 4)] -= 2.0 * eps;
        let minus: f32 = stem.forward(&params, &input).output.sum();

        assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * eps), epsilon = 5e-2);
    }

    #[test]
    fn pointwise_and_depthwise_bias_gradients_count_active_units() {
        let (stem, mut params) = stem();
        let input = DMatrix::from_fn(2, stem.input_len(), |b, j| ((b + 2 * j) % 5) as f32 * 0.1);
        params.get_mut(stem.norm_shift).value_mut().fill(10.0);

        let trace = stem.forward(&params, &input);
        let ones = DMatrix::from_element(2, stem.output_len(), 1.0);
        let mut grads = Gradients::empty_for(&params);
        stem.backward(&params, &trace, &ones, &mut grads);

        // every unit is active with unit scale: batch 2 times 4 * 5 positions per channel
        let d_pw_b = grads.get(stem.pointwise_bias).unwrap();
        assert!(d_pw_b.iter().all(|&g| g == 40.0));

        // each depthwise bias reaches the output through every pointwise channel
        let d_dw_b = grads.get(stem.depthwise_bias).unwrap();
        let pw_w = params.value(stem.pointwise_weight);
        for c in 0..4 {
            let expected = 40.0 * pw_w.column(c).sum();
            assert_abs_diff_eq!(d_dw_b[(0, c)], expected, epsilon = 1e-3);
        }
    }
}
