//! Spiking network used for fine-tuning
//!
//! The network is a convolutional stem followed by a division-free ANN→SNN encoder, a stack
//! of hidden spiking dense layers and a spiking output layer that produces class logits.
//! Parameters live in a single [`ParamStore`]; layers refer to them by [`ParamId`] so that the
//! optimizer, the quantization projector and checkpointing can walk one flat list.

/// YAML checkpoints
pub mod checkpoint;
/// Architecture constants
pub mod config;
/// Parameter store and gradients
pub mod params;
/// Spike encoder and spiking dense layers
pub mod snn;
/// Convolutional front end
pub mod stem;

pub use checkpoint::{Checkpoint, TensorRecord, finetuned_path};
pub use config::ArchitectureConfig;
pub use params::{Gradients, ParamId, ParamRole, ParamStore, Parameter};
pub use snn::{DivisionFreeEncoder, SpikingDense};
pub use stem::ConvStem;

use log::info;
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::temporal::{TemporalSchedule, TemporalWindow};
use crate::{QatError, QatResult};
use snn::DenseTrace;
use stem::StemTrace;

/// Uniform `[-bound, bound)` initialization
pub(crate) fn uniform_init<R: Rng + ?Sized>(rows: usize, cols: usize, bound: f32, rng: &mut R) -> DMatrix<f32> {
    DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-bound..bound))
}

/// Per-neuron earliest spike times of every hidden spiking layer for one batch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpikeRecord {
    times: Vec<DVector<f32>>,
}

impl SpikeRecord {
    /// Record from per-layer vectors, in network order
    pub fn new(times: Vec<DVector<f32>>) -> Self {
        SpikeRecord { times }
    }

    /// Earliest spike times of the `index`-th hidden layer
    pub fn layer(&self, index: usize) -> Option<&DVector<f32>> {
        self.times.get(index)
    }

    /// Number of hidden layers recorded
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[derive(Debug, Clone)]
struct NetworkTrace {
    stem: StemTrace,
    dropout_mask: Option<DMatrix<f32>>,
    dense: Vec<DenseTrace>,
}

/// Result of one forward pass
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Class logits, one row per sample
    pub logits: DMatrix<f32>,
    /// Earliest spike times of the hidden layers
    pub spikes: SpikeRecord,
    trace: NetworkTrace,
}

impl ForwardPass {
    /// Top-1 class per sample
    pub fn predictions(&self) -> Vec<usize> {
        self.logits.row_iter().map(|row| row.transpose().argmax().0).collect()
    }
}

/// Deep copy of every parameter value and every layer window
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    values: Vec<DMatrix<f32>>,
    windows: Vec<TemporalWindow>,
}

impl ModelState {
    /// Parameter values in store order
    pub fn values(&self) -> &[DMatrix<f32>] {
        &self.values
    }

    /// Layer windows in network order
    pub fn windows(&self) -> &[TemporalWindow] {
        &self.windows
    }
}

/// Time-to-first-spike classification network
#[derive(Debug, Clone)]
pub struct SnnModel {
    architecture: ArchitectureConfig,
    params: ParamStore,
    stem: ConvStem,
    encoder: DivisionFreeEncoder,
    layers: Vec<SpikingDense>,
}

impl SnnModel {
    /// Build the network with freshly initialized parameters and the initial unit schedule
    pub fn new<R: Rng + ?Sized>(architecture: &ArchitectureConfig, schedule: &TemporalSchedule, rng: &mut R) -> QatResult<Self> {
        architecture.validate()?;
        let mut params = ParamStore::new();
        let stem = ConvStem::new(architecture, &mut params, rng);
        let encoder = DivisionFreeEncoder::new(architecture.t_min_input, architecture.t_max_input);

        let mut layers = Vec::with_capacity(architecture.hidden_units.len() + 1);
        let mut input_dim = stem.output_len();
        for (i, &units) in architecture.hidden_units.iter().enumerate() {
            let name = format!("dense_{}", i + 1);
            layers.push(SpikingDense::new(&name, input_dim, units, false, &mut params, rng));
            input_dim = units;
        }
        layers.push(SpikingDense::new("dense_output", input_dim, architecture.output_size, true, &mut params, rng));

        schedule.apply_to_layers(&encoder, &mut layers, None);
        info!(
            "Model created. Flattened dimension before SNN: {}, {} parameter tensors",
            stem.output_len(),
            params.len()
        );

        Ok(SnnModel { architecture: architecture.clone(), params, stem, encoder, layers })
    }

    /// Architecture the model was built from
    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.architecture
    }

    /// All parameters
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// All parameters, mutable
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Spiking layers in network order; the last one is the output layer
    pub fn layers(&self) -> &[SpikingDense] {
        &self.layers
    }

    /// Input encoder
    pub fn encoder(&self) -> &DivisionFreeEncoder {
        &self.encoder
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.architecture.output_size
    }

    /// Current window of every spiking layer
    pub fn windows(&self) -> Vec<TemporalWindow> {
        self.layers.iter().map(SpikingDense::window).collect()
    }

    /// Replace every layer window, checking ordering and chaining
    pub fn set_windows(&mut self, windows: &[TemporalWindow]) -> QatResult<()> {
        if windows.len() != self.layers.len() {
            return Err(QatError::Config(format!(
                "expected {} layer windows, got {}",
                self.layers.len(),
                windows.len()
            )));
        }
        let mut expected_t_min = self.encoder.t_max();
        for (layer, window) in self.layers.iter().zip(windows) {
            if !window.is_ordered() || window.t_min != expected_t_min {
                return Err(QatError::Config(format!("{}: window {:?} is not ordered or chained", layer.name(), window)));
            }
            expected_t_min = window.t_max;
        }
        for (layer, window) in self.layers.iter_mut().zip(windows) {
            layer.set_window(*window);
        }
        Ok(())
    }

    pub(crate) fn schedule_parts_mut(&mut self) -> (&DivisionFreeEncoder, &mut [SpikingDense]) {
        (&self.encoder, &mut self.layers)
    }

    /// Inference forward pass
    pub fn forward(&self, features: &DMatrix<f32>) -> QatResult<ForwardPass> {
        self.run(features, None)
    }

    /// Training forward pass; applies inverted dropout to the encoded spike times when configured
    pub fn forward_train<R: Rng + ?Sized>(&self, features: &DMatrix<f32>, rng: &mut R) -> QatResult<ForwardPass> {
        let rate = self.architecture.dropout_rate;
        let mask = (rate > 0.0).then(|| {
            let keep = 1.0 / (1.0 - rate);
            DMatrix::from_fn(features.nrows(), self.stem.output_len(), |_, _| {
                if rng.r#gen::<f32>() >= rate { keep } else { 0.0 }
            })
        });
        self.run(features, mask)
    }

    fn run(&self, features: &DMatrix<f32>, dropout_mask: Option<DMatrix<f32>>) -> QatResult<ForwardPass> {
        if features.ncols() != self.stem.input_len() {
            return Err(QatError::InvalidBatch(format!(
                "expected {} features per sample, got {}",
                self.stem.input_len(),
                features.ncols()
            )));
        }

        let stem = self.stem.forward(&self.params, features);
        let mut times = self.encoder.encode(&stem.output);
        if let Some(mask) = &dropout_mask {
            times.component_mul_assign(mask);
        }

        let mut dense = Vec::with_capacity(self.layers.len());
        let mut spikes = Vec::with_capacity(self.layers.len() - 1);
        for layer in &self.layers {
            let trace = layer.forward(&self.params, &times);
            if !layer.is_output_layer() {
                spikes.push(SpikingDense::earliest_spikes(&trace.output));
            }
            times = trace.output.clone();
            dense.push(trace);
        }

        Ok(ForwardPass {
            logits: times,
            spikes: SpikeRecord::new(spikes),
            trace: NetworkTrace { stem, dropout_mask, dense },
        })
    }

    /// Gradients of the loss with respect to every parameter, given `d loss / d logits`
    pub fn backward(&self, pass: &ForwardPass, grad_logits: &DMatrix<f32>) -> Gradients {
        let mut grads = Gradients::empty_for(&self.params);
        let trace = &pass.trace;

        let mut grad = grad_logits.clone();
        for (layer, layer_trace) in self.layers.iter().zip(&trace.dense).rev() {
            grad = layer.backward(&self.params, layer_trace, &grad, &mut grads);
        }

        if let Some(mask) = &trace.dropout_mask {
            grad.component_mul_assign(mask);
        }
        let grad_act = self.encoder.backward(&trace.stem.output, &grad);
        self.stem.backward(&self.params, &trace.stem, &grad_act, &mut grads);
        grads
    }

    /// Independent copy of parameters and windows
    pub fn state(&self) -> ModelState {
        ModelState {
            values: self.params.iter().map(|p| p.value().clone()).collect(),
            windows: self.windows(),
        }
    }

    /// Overwrite parameters and windows from a snapshot of this architecture
    pub fn restore(&mut self, state: &ModelState) -> QatResult<()> {
        if state.values.len() != self.params.len() {
            return Err(QatError::Config(format!(
                "snapshot holds {} tensors, model has {}",
                state.values.len(),
                self.params.len()
            )));
        }
        for (param, value) in self.params.iter().zip(&state.values) {
            if param.shape() != value.shape() {
                return Err(QatError::Config(format!(
                    "snapshot shape {:?} does not match {} {:?}",
                    value.shape(),
                    param.name(),
                    param.shape()
                )));
            }
        }
        self.set_windows(&state.windows)?;
        for (param, value) in self.params.iter_mut().zip(&state.values) {
            param.value_mut().copy_from(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model(seed: u64) -> SnnModel {
        let mut rng = StdRng::seed_from_u64(seed);
        SnnModel::new(&ArchitectureConfig::default(), &TemporalSchedule::default(), &mut rng).unwrap()
    }

    fn features(batch: usize) -> DMatrix<f32> {
        DMatrix::from_fn(batch, 288, |b, j| ((b * 7 + j) % 13) as f32 * 0.08)
    }

    #[test]
    fn forward_produces_logits_and_hidden_spike_records() {
        let model = model(0);
        let pass = model.forward(&features(4)).unwrap();
        assert_eq!(pass.logits.shape(), (4, 3));
        assert_eq!(pass.spikes.len(), 2);
        assert_eq!(pass.spikes.layer(0).unwrap().len(), 64);
        assert_eq!(pass.spikes.layer(1).unwrap().len(), 32);
        assert_eq!(pass.predictions().len(), 4);

        let windows = model.windows();
        for (k, window) in windows.iter().take(2).enumerate() {
            let times = pass.spikes.layer(k).unwrap();
            assert!(times.iter().all(|&t| t >= window.t_min && t <= window.t_max));
        }
    }

    #[test]
    fn rejects_wrong_feature_width() {
        let model = model(0);
        let err = model.forward(&DMatrix::zeros(2, 10)).unwrap_err();
        assert!(matches!(err, QatError::InvalidBatch(_)));
    }

    #[test]
    fn output_bias_gradient_matches_finite_difference() {
        let mut model = model(9);
        let x = features(3);
        let pass = model.forward(&x).unwrap();
        let ones = DMatrix::from_element(3, 3, 1.0);
        let grads = model.backward(&pass, &ones);

        let bias = model.layers().last().unwrap().bias();
        // d(sum logits)/d bias_j = batch size
        assert!(grads.get(bias).unwrap().iter().all(|&g| (g - 3.0).abs() < 1e-6));

        let eps = 1e-2;
        let kernel = model.layers().last().unwrap().kernel();
        let analytic = grads.get(kernel).unwrap()[(0, 0)];
        model.params_mut().get_mut(kernel).value_mut()[(0, 0)] += eps;
        let plus = model.forward(&x).unwrap().logits.sum();
        model.params_mut().get_mut(kernel).value_mut()[(0, 0)] -= 2.0 * eps;
        let minus = model.forward(&x).unwrap().logits.sum();
        assert_abs_diff_eq!(analytic, (plus - minus) / (2.0 * eps), epsilon = 1e-2);
    }

    #[test]
    fn snapshot_is_independent_of_live_parameters() {
        let mut model = model(2);
        let snapshot = model.state();
        for param in model.params_mut().iter_mut() {
            param.value_mut().fill(0.5);
        }
        assert_ne!(model.state(), snapshot);

        model.restore(&snapshot).unwrap();
        assert_eq!(model.state(), snapshot);
    }

    #[test]
    fn restore_rejects_foreign_snapshot() {
        let mut model = model(2);
        let mut arch = ArchitectureConfig::default();
        arch.hidden_units = vec![16];
        let mut rng = StdRng::seed_from_u64(0);
        let other = SnnModel::new(&arch, &TemporalSchedule::default(), &mut rng).unwrap();
        assert!(model.restore(&other.state()).is_err());
    }

    #[test]
    fn dropout_only_applies_in_training() {
        let mut arch = ArchitectureConfig::default();
        arch.dropout_rate = 0.5;
        let mut rng = StdRng::seed_from_u64(4);
        let model = SnnModel::new(&arch, &TemporalSchedule::default(), &mut rng).unwrap();
        let x = features(2);

        let a = model.forward(&x).unwrap();
        let b = model.forward(&x).unwrap();
        assert_eq!(a.logits, b.logits);

        let train = model.forward_train(&x, &mut rng).unwrap();
        assert!(train.trace.dropout_mask.is_some());
    }

    #[test]
    fn dropout_masks_encoded_spike_times() {
        let mut arch = ArchitectureConfig::default();
        arch.dropout_rate = 0.5;
        let mut rng = StdRng::seed_from_u64(6);
        let model = SnnModel::new(&arch, &TemporalSchedule::default(), &mut rng).unwrap();

        let train = model.forward_train(&features(3), &mut rng).unwrap();
        let mask = train.trace.dropout_mask.as_ref().unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || m == 2.0));

        // the first spiking layer sees the encoder's times after masking, not masked activations
        let times = model.encoder().encode(&train.trace.stem.output).component_mul(mask);
        let first = model.layers()[0].forward(model.params(), &times);
        assert_eq!(first.output, train.trace.dense[0].output);
    }
}
