//! Adaptive temporal schedule for the spiking layers
//!
//! Every spiking layer fires inside its own window `[t_min, t_max]`, and windows are chained:
//! a layer's `t_min` is the previous layer's `t_max`. After each training batch the windows
//! are rebuilt front to back from the earliest spike each layer produced during that batch,
//! so a layer whose neurons fire far ahead of its deadline gets proportionally more room in
//! the next batch.

use log::trace;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::neural::{DivisionFreeEncoder, SnnModel, SpikeRecord, SpikingDense};

/// Width of the terminal layer's window
pub const OUTPUT_WINDOW: f32 = 1.0;

/// Temporal bounds of one spiking layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalWindow {
    /// `t_min` of the previous layer
    pub t_min_prev: f32,
    /// Earliest time this layer may fire (previous layer's `t_max`)
    pub t_min: f32,
    /// Deadline; a spike time equal to this means "no spike"
    pub t_max: f32,
}

impl TemporalWindow {
    /// `t_max - t_min`
    pub fn width(&self) -> f32 {
        self.t_max - self.t_min
    }

    /// `t_min_prev <= t_min < t_max`
    pub fn is_ordered(&self) -> bool {
        self.t_min_prev <= self.t_min && self.t_min < self.t_max
    }
}

/// Window update rule and its constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalSchedule {
    /// Expansion coefficient applied to the observed spike latency
    pub gamma: f32,
    /// Default window width
    pub base_interval: f32,
    /// Hard ceiling on any hidden window width
    pub max_window: f32,
}

impl Default for TemporalSchedule {
    fn default() -> Self {
        TemporalSchedule { gamma: 10.0, base_interval: 1.0, max_window: 100.0 }
    }
}

impl TemporalSchedule {
    /// Default constants with a custom `gamma`
    pub fn with_gamma(gamma: f32) -> Self {
        TemporalSchedule { gamma, ..Self::default() }
    }

    /// Next `t_max` of a hidden layer starting at `t_min`.
    ///
    /// `observed` holds the layer's per-neuron earliest spike times from the last batch;
    /// entries at or beyond `current_t_max` are silent neurons and are ignored. Without any
    /// real spike the window falls back to `base_interval`.
    pub fn next_t_max(&self, t_min: f32, current_t_max: f32, observed: Option<&DVector<f32>>) -> f32 {
        let mut new_t_max = t_min + self.base_interval;
        let earliest = observed
            .and_then(|times| times.iter().copied().filter(|&t| t < current_t_max).reduce(f32::min));
        if let Some(earliest) = earliest.filter(|&e| current_t_max > e) {
            let dynamic_term = self.gamma * (current_t_max - earliest);
            new_t_max = (t_min + self.base_interval.max(dynamic_term)).min(t_min + self.max_window);
        }
        new_t_max
    }

    /// Rebuild every window of `model` from this batch's spike record.
    pub fn apply(&self, model: &mut SnnModel, record: Option<&SpikeRecord>) {
        let (encoder, layers) = model.schedule_parts_mut();
        self.apply_to_layers(encoder, layers, record);
    }

    /// Rebuild the windows of `layers`, which follow `encoder` in network order.
    ///
    /// `record` is indexed by hidden layer position; the terminal layer never has one.
    pub fn apply_to_layers(&self, encoder: &DivisionFreeEncoder, layers: &mut [SpikingDense], record: Option<&SpikeRecord>) {
        let mut t_min_prev = encoder.t_min();
        let mut cursor = encoder.t_max();
        let mut hidden = 0;

        for layer in layers.iter_mut() {
            let new_t_max = if layer.is_output_layer() {
                cursor + OUTPUT_WINDOW
            } else {
                let observed = record.and_then(|r| r.layer(hidden));
                hidden += 1;
                self.next_t_max(cursor, layer.window().t_max, observed)
            };

            let window = TemporalWindow { t_min_prev, t_min: cursor, t_max: new_t_max };
            trace!("{}: window [{:.4}, {:.4}]", layer.name(), window.t_min, window.t_max);
            layer.set_window(window);

            t_min_prev = cursor;
            cursor = new_t_max;
        }
    }
}
