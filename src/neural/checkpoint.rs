// src/neural/checkpoint.rs
// YAML checkpoints: parameter name -> row-major tensor, plus the layer windows.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::SnnModel;
use crate::temporal::TemporalWindow;
use crate::{QatError, QatResult};

/// Suffix appended to the stem of the input checkpoint name
pub const FINETUNED_SUFFIX: &str = "_Q1.7_finetuned";

/// One tensor, stored row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// `[rows, cols]`
    pub shape: [usize; 2],
    /// `rows * cols` values, row by row
    pub data: Vec<f32>,
}

impl TensorRecord {
    /// Capture a matrix
    pub fn from_matrix(m: &DMatrix<f32>) -> Self {
        TensorRecord {
            shape: [m.nrows(), m.ncols()],
            data: m.transpose().as_slice().to_vec(),
        }
    }

    /// Rebuild the matrix, or `None` when `data` does not fill `shape`
    pub fn to_matrix(&self) -> Option<DMatrix<f32>> {
        let [rows, cols] = self.shape;
        (rows * cols == self.data.len()).then(|| DMatrix::from_row_slice(rows, cols, &self.data))
    }
}

/// Serialized model state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Every parameter by fully qualified name
    pub parameters: BTreeMap<String, TensorRecord>,
    /// Layer windows in network order; absent in checkpoints that never recorded them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Vec<TemporalWindow>>,
}

impl Checkpoint {
    /// Snapshot `model` into a checkpoint
    pub fn from_model(model: &SnnModel) -> Self {
        let parameters = model
            .params()
            .iter()
            .map(|p| (p.name().to_string(), TensorRecord::from_matrix(p.value())))
            .collect();
        Checkpoint { parameters, schedule: Some(model.windows()) }
    }

    /// Read a checkpoint file
    pub fn read(path: &Path) -> QatResult<Self> {
        let file = File::open(path).map_err(|e| checkpoint_error(path, e.to_string()))?;
        serde_yaml::from_reader(BufReader::new(file)).map_err(|e| checkpoint_error(path, e.to_string()))
    }

    /// Write this checkpoint to `path`
    pub fn write(&self, path: &Path) -> QatResult<()> {
        let file = File::create(path).map_err(|e| checkpoint_error(path, e.to_string()))?;
        let mut writer = BufWriter::new(file);
        serde_yaml::to_writer(&mut writer, self).map_err(|e| checkpoint_error(path, e.to_string()))?;
        writer.flush().map_err(|e| checkpoint_error(path, e.to_string()))
    }

    /// Copy every tensor into `model`. Names and shapes must match exactly.
    pub fn apply_to(&self, model: &mut SnnModel) -> Result<(), String> {
        let mut problems = Vec::new();
        let mut values = Vec::with_capacity(model.params().len());

        for param in model.params().iter() {
            match self.parameters.get(param.name()) {
                None => problems.push(format!("missing parameter '{}'", param.name())),
                Some(record) => match record.to_matrix() {
                    Some(m) if m.shape() == param.shape() => values.push(m),
                    Some(m) => problems.push(format!(
                        "shape mismatch for '{}': checkpoint {:?}, model {:?}",
                        param.name(),
                        m.shape(),
                        param.shape()
                    )),
                    None => problems.push(format!("'{}' has {} values for shape {:?}", param.name(), record.data.len(), record.shape)),
                },
            }
        }
        for name in self.parameters.keys() {
            if model.params().find(name).is_none() {
                problems.push(format!("unexpected parameter '{name}'"));
            }
        }
        if !problems.is_empty() {
            return Err(problems.join("; "));
        }

        if let Some(schedule) = &self.schedule {
            model.set_windows(schedule).map_err(|e| e.to_string())?;
        }
        for (param, value) in model.params_mut().iter_mut().zip(values) {
            *param.value_mut() = value;
        }
        Ok(())
    }
}

fn checkpoint_error(path: &Path, message: String) -> QatError {
    QatError::Checkpoint { path: path.to_path_buf(), message }
}

/// Load the checkpoint at `path` into `model`
pub fn load_into(path: &Path, model: &mut SnnModel) -> QatResult<()> {
    let checkpoint = Checkpoint::read(path)?;
    checkpoint.apply_to(model).map_err(|message| checkpoint_error(path, message))?;
    info!("Successfully loaded weights from: {}", path.display());
    Ok(())
}

/// Persist `model` to `path`
pub fn save_model(path: &Path, model: &SnnModel) -> QatResult<()> {
    Checkpoint::from_model(model).write(path)?;
    info!("Model saved to: {}", path.display());
    Ok(())
}

/// `dir/name.ext` -> `dir/name_Q1.7_finetuned.ext`
pub fn finetuned_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{stem}{FINETUNED_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{FINETUNED_SUFFIX}"),
    };
    input.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::ArchitectureConfig;
    use crate::temporal::TemporalSchedule;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn model(seed: u64, hidden: Vec<usize>) -> SnnModel {
        let arch = ArchitectureConfig { hidden_units: hidden, ..ArchitectureConfig::default() };
        let mut rng = StdRng::seed_from_u64(seed);
        SnnModel::new(&arch, &TemporalSchedule::default(), &mut rng).unwrap()
    }

    #[test]
    fn tensor_record_is_row_major() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let record = TensorRecord::from_matrix(&m);
        assert_eq!(record.shape, [2, 3]);
        assert_eq!(record.data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(record.to_matrix(), Some(m));
    }

    #[test]
    fn save_then_load_restores_parameters_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.yaml");
        let source = model(1, vec![64, 32]);
        save_model(&path, &source).unwrap();

        let mut target = model(2, vec![64, 32]);
        assert_ne!(target.state(), source.state());
        load_into(&path, &mut target).unwrap();
        assert_eq!(target.state(), source.state());
    }

    #[test]
    fn architecture_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.yaml");
        save_model(&path, &model(1, vec![64, 32])).unwrap();

        let mut target = model(1, vec![48, 32]);
        let err = load_into(&path, &mut target).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("shape mismatch for 'dense_1.kernel'"), "{text}");
        assert!(text.contains("architecture configuration"));
    }

    #[test]
    fn unknown_and_missing_names_are_reported() {
        let source = model(1, vec![64, 32]);
        let mut checkpoint = Checkpoint::from_model(&source);
        let record = checkpoint.parameters.remove("dense_2.bias").unwrap();
        checkpoint.parameters.insert("dense_3.bias".into(), record);

        let mut target = model(1, vec![64, 32]);
        let message = checkpoint.apply_to(&mut target).unwrap_err();
        assert!(message.contains("missing parameter 'dense_2.bias'"));
        assert!(message.contains("unexpected parameter 'dense_3.bias'"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_flush_is_reported() {
        let mut parameters = BTreeMap::new();
        parameters.insert("w".to_string(), TensorRecord { shape: [1, 2], data: vec![0.5, -0.25] });
        let checkpoint = Checkpoint { parameters, schedule: None };

        // the whole document fits in the buffer, so only the flush hits the full device
        let err = checkpoint.write(Path::new("/dev/full")).unwrap_err();
        assert!(matches!(err, QatError::Checkpoint { .. }));
    }

    #[test]
    fn missing_file_is_a_checkpoint_error() {
        let mut target = model(1, vec![64, 32]);
        let err = load_into(Path::new("/nonexistent/model.yaml"), &mut target).unwrap_err();
        assert!(matches!(err, QatError::Checkpoint { .. }));
    }

    #[test]
    fn checkpoint_without_schedule_keeps_current_windows() {
        let source = model(1, vec![64, 32]);
        let mut checkpoint = Checkpoint::from_model(&source);
        checkpoint.schedule = None;
        let yaml = serde_yaml::to_string(&checkpoint).unwrap();
        assert!(!yaml.contains("schedule"));

        let mut target = model(3, vec![64, 32]);
        let windows = target.windows();
        checkpoint.apply_to(&mut target).unwrap();
        assert_eq!(target.windows(), windows);
    }

    #[rstest]
    #[case("runs/model.yaml", "runs/model_Q1.7_finetuned.yaml")]
    #[case("model.pth", "model_Q1.7_finetuned.pth")]
    #[case("runs/model", "runs/model_Q1.7_finetuned")]
    fn finetuned_name_sits_next_to_input(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(finetuned_path(Path::new(input)), PathBuf::from(expected));
    }
}
