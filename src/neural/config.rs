// src/neural/config.rs
// Architecture constants for the spiking network: stem shape, hidden widths, input window.

use serde::{Deserialize, Serialize};

use crate::{QatError, QatResult};

/// Network architecture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Feature planes per sample (frequency bands)
    pub input_channels: usize,
    /// Height of each feature plane
    pub input_height: usize,
    /// Width of each feature plane
    pub input_width: usize,
    /// Output channels of the convolutional stem
    pub stem_channels: usize,
    /// Square kernel size of the depthwise convolution (odd)
    pub conv_kernel_size: usize,
    /// Widths of the hidden spiking layers, in order
    pub hidden_units: Vec<usize>,
    /// Dropout applied to the encoded input during training
    pub dropout_rate: f32,
    /// Number of output classes
    pub output_size: usize,
    /// Start of the encoder's input time window
    pub t_min_input: f32,
    /// End of the encoder's input time window
    pub t_max_input: f32,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        ArchitectureConfig {
            input_channels: 4,
            input_height: 8,
            input_width: 9,
            stem_channels: 8,
            conv_kernel_size: 3,
            hidden_units: vec![64, 32],
            dropout_rate: 0.0,
            output_size: 3,
            t_min_input: 0.0,
            t_max_input: 1.0,
        }
    }
}

impl ArchitectureConfig {
    /// Flattened length of one input sample
    pub fn input_len(&self) -> usize {
        self.input_channels * self.input_height * self.input_width
    }

    /// Reject shapes the network cannot be built from
    pub fn validate(&self) -> QatResult<()> {
        if self.input_channels == 0 || self.input_height == 0 || self.input_width == 0 {
            return Err(QatError::Config("input dimensions must be non-zero".into()));
        }
        if self.stem_channels == 0 {
            return Err(QatError::Config("stem_channels must be non-zero".into()));
        }
        if self.conv_kernel_size == 0 || self.conv_kernel_size % 2 == 0 {
            return Err(QatError::Config(format!(
                "conv_kernel_size must be odd, got {}",
                self.conv_kernel_size
            )));
        }
        if self.hidden_units.iter().any(|&units| units == 0) {
            return Err(QatError::Config("hidden layer widths must be non-zero".into()));
        }
        if self.output_size < 2 {
            return Err(QatError::Config("output_size must be at least 2".into()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(QatError::Config(format!("dropout_rate {} outside [0, 1)", self.dropout_rate)));
        }
        if !(self.t_min_input < self.t_max_input) {
            return Err(QatError::Config(format!(
                "input window [{}, {}] is empty",
                self.t_min_input, self.t_max_input
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_matches_eeg_feature_layout() {
        let arch = ArchitectureConfig::default();
        arch.validate().unwrap();
        assert_eq!(arch.input_len(), 288);
    }

    #[rstest]
    #[case::even_kernel(|a: &mut ArchitectureConfig| a.conv_kernel_size = 4)]
    #[case::zero_hidden(|a: &mut ArchitectureConfig| a.hidden_units = vec![64, 0])]
    #[case::single_class(|a: &mut ArchitectureConfig| a.output_size = 1)]
    #[case::full_dropout(|a: &mut ArchitectureConfig| a.dropout_rate = 1.0)]
    #[case::inverted_window(|a: &mut ArchitectureConfig| a.t_max_input = -1.0)]
    fn rejects_broken_architectures(#[case] tweak: fn(&mut ArchitectureConfig)) {
        let mut arch = ArchitectureConfig::default();
        tweak(&mut arch);
        assert!(matches!(arch.validate(), Err(QatError::Config(_))));
    }
}
