// src/neural/snn.rs
// Time-to-first-spike layers: the ANN->SNN input encoder and the spiking dense layer.
//
// A spike at time t inside a window [t_min, t_max] encodes the activation t_max - t, so
// earlier spikes carry larger values. A time equal to t_max means the neuron stayed silent.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use super::params::{Gradients, ParamId, ParamRole, ParamStore};
use super::uniform_init;
use crate::temporal::TemporalWindow;

/// Converts non-negative activations into spike times inside `[t_min, t_max]`
/// without normalizing by the window length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivisionFreeEncoder {
    t_min: f32,
    t_max: f32,
}

impl DivisionFreeEncoder {
    /// Encoder for the input window `[t_min, t_max]`
    pub fn new(t_min: f32, t_max: f32) -> Self {
        DivisionFreeEncoder { t_min, t_max }
    }

    /// Start of the input window
    pub fn t_min(&self) -> f32 {
        self.t_min
    }

    /// End of the input window; the first spiking layer starts here
    pub fn t_max(&self) -> f32 {
        self.t_max
    }

    /// `t = t_max - clamp(a, 0, t_max - t_min)`
    pub fn encode(&self, activations: &DMatrix<f32>) -> DMatrix<f32> {
        let range = self.t_max - self.t_min;
        activations.map(|a| self.t_max - a.max(0.0).min(range))
    }

    pub(crate) fn backward(&self, activations: &DMatrix<f32>, grad_times: &DMatrix<f32>) -> DMatrix<f32> {
        let range = self.t_max - self.t_min;
        activations.zip_map(grad_times, |a, g| if a > 0.0 && a < range { -g } else { 0.0 })
    }
}

/// Fully connected spiking layer.
///
/// Hidden layers emit spike times `clamp(t_max - (x·W + D), t_min, t_max)` where
/// `x = t_min - t_in` is the activation carried by the incoming spikes. The output layer
/// emits the membrane value `x·W + D` directly as class logits.
#[derive(Debug, Clone)]
pub struct SpikingDense {
    name: String,
    output_layer: bool,
    kernel: ParamId,
    bias: ParamId,
    window: TemporalWindow,
}

#[derive(Debug, Clone)]
pub(crate) struct DenseTrace {
    x: DMatrix<f32>,
    z: DMatrix<f32>,
    pub(crate) output: DMatrix<f32>,
}

impl SpikingDense {
    /// Build a layer and register `<name>.kernel` and `<name>.bias`
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        input_dim: usize,
        units: usize,
        output_layer: bool,
        params: &mut ParamStore,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (input_dim as f32).sqrt();
        let kernel = params.register(format!("{name}.kernel"), ParamRole::Weight, uniform_init(input_dim, units, bound, rng));
        let bias = params.register(format!("{name}.bias"), ParamRole::Bias, uniform_init(1, units, bound, rng));
        SpikingDense {
            name: name.to_string(),
            output_layer,
            kernel,
            bias,
            // replaced by the schedule before first use
            window: TemporalWindow { t_min_prev: 0.0, t_min: 0.0, t_max: 1.0 },
        }
    }

    /// Layer name used as parameter prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the terminal classification layer
    pub fn is_output_layer(&self) -> bool {
        self.output_layer
    }

    /// Current temporal bounds
    pub fn window(&self) -> TemporalWindow {
        self.window
    }

    pub(crate) fn set_window(&mut self, window: TemporalWindow) {
        self.window = window;
    }

    /// Kernel parameter id
    pub fn kernel(&self) -> ParamId {
        self.kernel
    }

    /// Bias parameter id
    pub fn bias(&self) -> ParamId {
        self.bias
    }

    pub(crate) fn forward(&self, params: &ParamStore, t_in: &DMatrix<f32>) -> DenseTrace {
        let TemporalWindow { t_min, t_max, .. } = self.window;
        let kernel = params.value(self.kernel);
        let bias = params.value(self.bias);

        let x = t_in.map(|t| t_min - t);
        let xw = &x * kernel;
        let z = DMatrix::from_fn(xw.nrows(), xw.ncols(), |i, j| xw[(i, j)] + bias[(0, j)]);
        let output = if self.output_layer {
            z.clone()
        } else {
            z.map(|v| (t_max - v).max(t_min).min(t_max))
        };
        DenseTrace { x, z, output }
    }

    pub(crate) fn backward(
        &self,
        params: &ParamStore,
        trace: &DenseTrace,
        grad_out: &DMatrix<f32>,
        grads: &mut Gradients,
    ) -> DMatrix<f32> {
        let dz = if self.output_layer {
            grad_out.clone()
        } else {
            let width = self.window.t_max - self.window.t_min;
            trace.z.zip_map(grad_out, |z, g| if z > 0.0 && z < width { -g } else { 0.0 })
        };

        let d_kernel = trace.x.transpose() * &dz;
        let d_bias = DMatrix::from_fn(1, dz.ncols(), |_, j| dz.column(j).sum());
        let dx = &dz * params.value(self.kernel).transpose();

        grads.accumulate(self.kernel, d_kernel);
        grads.accumulate(self.bias, d_bias);
        -dx
    }

    /// Per-neuron earliest spike time over the batch
    pub fn earliest_spikes(output: &DMatrix<f32>) -> DVector<f32> {
        DVector::from_fn(output.ncols(), |j, _| {
            output.column(j).iter().copied().fold(f32::INFINITY, f32::min)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn layer(output_layer: bool) -> (SpikingDense, ParamStore) {
        let mut params = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = SpikingDense::new("dense_1", 2, 2, output_layer, &mut params, &mut rng);
        *params.get_mut(layer.kernel()).value_mut() = DMatrix::from_row_slice(2, 2, &[0.5, -1.0, 0.25, 2.0]);
        *params.get_mut(layer.bias()).value_mut() = DMatrix::from_row_slice(1, 2, &[0.1, 0.0]);
        layer.set_window(TemporalWindow { t_min_prev: 0.0, t_min: 1.0, t_max: 3.0 });
        (layer, params)
    }

    #[test]
    fn encoder_maps_activation_to_spike_time() {
        let encoder = DivisionFreeEncoder::new(0.0, 1.0);
        let a = DMatrix::from_row_slice(1, 4, &[0.0, 0.25, 1.0, 3.0]);
        let t = encoder.encode(&a);
        assert_eq!(t.as_slice(), &[1.0, 0.75, 0.0, 0.0]);

        let g = encoder.backward(&a, &DMatrix::from_element(1, 4, 2.0));
        assert_eq!(g.as_slice(), &[0.0, -2.0, 0.0, 0.0]);
    }

    #[test]
    fn hidden_layer_spikes_earlier_for_stronger_drive() {
        let (layer, params) = layer(false);
        // x = t_min - t_in = [0.8, 0.4]
        let t_in = DMatrix::from_row_slice(1, 2, &[0.2, 0.6]);
        let trace = layer.forward(&params, &t_in);

        // z0 = 0.8*0.5 + 0.4*0.25 + 0.1 = 0.6, z1 = -0.8 + 0.8 = 0.0
        assert_abs_diff_eq!(trace.output[(0, 0)], 2.4, epsilon = 1e-6);
        assert_eq!(trace.output[(0, 1)], 3.0);

        let earliest = SpikingDense::earliest_spikes(&trace.output);
        assert_abs_diff_eq!(earliest[0], 2.4, epsilon = 1e-6);
        assert_eq!(earliest[1], 3.0);
    }

    #[test]
    fn hidden_layer_saturates_at_window_start() {
        let (layer, params) = layer(false);
        let t_in = DMatrix::from_row_slice(1, 2, &[-10.0, 1.0]);
        let trace = layer.forward(&params, &t_in);
        assert_eq!(trace.output[(0, 0)], 1.0);

        let mut grads = Gradients::empty_for(&params);
        layer.backward(&params, &trace, &DMatrix::from_element(1, 2, 1.0), &mut grads);
        // saturated and silent neurons pass no gradient
        assert!(grads.get(layer.kernel()).unwrap().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn output_layer_gradients_match_linear_map() {
        let (layer, params) = layer(true);
        let t_in = DMatrix::from_row_slice(1, 2, &[0.2, 0.6]);
        let trace = layer.forward(&params, &t_in);
        assert_abs_diff_eq!(trace.output[(0, 0)], 0.6, epsilon = 1e-6);

        let mut grads = Gradients::empty_for(&params);
        let grad_in = layer.backward(&params, &trace, &DMatrix::from_row_slice(1, 2, &[1.0, 0.0]), &mut grads);

        let d_kernel = grads.get(layer.kernel()).unwrap();
        assert_abs_diff_eq!(d_kernel[(0, 0)], 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(d_kernel[(1, 0)], 0.4, epsilon = 1e-6);
        assert_eq!(grads.get(layer.bias()).unwrap().as_slice(), &[1.0, 0.0]);
        // d logit0 / d t_in = -W[:, 0]
        assert_abs_diff_eq!(grad_in[(0, 0)], -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(grad_in[(0, 1)], -0.25, epsilon = 1e-6);
    }
}
