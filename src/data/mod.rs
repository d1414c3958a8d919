//! Feature store loading, label remapping, splits and batching
//!
//! Features are precomputed per EEG segment and stored as one YAML document holding a
//! feature matrix (one row per segment) and the ternary emotion label of each segment.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{info, warn};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{QatError, QatResult};

/// Feature store location and split settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Name of the feature file inside the feature directory
    pub feature_file: String,
    /// Fraction of every class held out for validation
    pub validation_fraction: f32,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            feature_file: "all_features_lds_smoothed.yaml".to_string(),
            validation_fraction: 0.2,
        }
    }
}

impl DataConfig {
    /// Reject unusable split settings
    pub fn validate(&self) -> QatResult<()> {
        if self.feature_file.is_empty() {
            return Err(QatError::Config("feature_file must not be empty".into()));
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(QatError::Config(format!(
                "validation_fraction {} outside (0, 1)",
                self.validation_fraction
            )));
        }
        Ok(())
    }

    /// Full path of the feature file inside `dir`
    pub fn feature_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.feature_file)
    }
}

/// Map the ternary label encoding `{-1, 0, 1}` to class indices `{0, 1, 2}`
pub fn map_label(label: i64) -> Option<usize> {
    match label {
        -1 => Some(0),
        0 => Some(1),
        1 => Some(2),
        _ => None,
    }
}

/// Raw content of the feature file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStore {
    /// One row per sample
    pub features: Vec<Vec<f32>>,
    /// Ternary label per sample
    pub labels: Vec<i64>,
}

impl FeatureStore {
    /// Read the feature file from `dir`
    pub fn load(dir: &Path, config: &DataConfig) -> QatResult<Self> {
        let path = config.feature_path(dir);
        if !path.exists() {
            return Err(QatError::MissingFeatureFile(path));
        }
        let file = File::open(&path)?;
        let store: FeatureStore = serde_yaml::from_reader(BufReader::new(file))?;
        info!("Loaded {} samples from {}", store.labels.len(), path.display());
        Ok(store)
    }

    /// Drop samples with labels outside `{-1, 0, 1}` and build a dataset of class indices
    pub fn into_dataset(self, input_len: usize) -> QatResult<Dataset> {
        if self.features.len() != self.labels.len() {
            return Err(QatError::FeatureFormat(format!(
                "{} feature rows but {} labels",
                self.features.len(),
                self.labels.len()
            )));
        }

        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (i, (row, label)) in self.features.iter().zip(&self.labels).enumerate() {
            let Some(class) = map_label(*label) else { continue };
            if row.len() != input_len {
                return Err(QatError::FeatureFormat(format!(
                    "sample {i} has {} features, expected {input_len}",
                    row.len()
                )));
            }
            rows.extend_from_slice(row);
            labels.push(class);
        }

        let dropped = self.labels.len() - labels.len();
        if dropped > 0 {
            warn!("Dropped {} samples with labels outside {{-1, 0, 1}}", dropped);
        }
        Dataset::new(DMatrix::from_row_slice(labels.len(), input_len, &rows), labels)
    }
}

/// Feature matrix with class-index labels
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: DMatrix<f32>,
    labels: Vec<usize>,
}

/// One mini-batch
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// One row per sample
    pub features: DMatrix<f32>,
    /// Class index per sample
    pub labels: Vec<usize>,
}

impl Dataset {
    /// Pair a feature matrix with its labels
    pub fn new(features: DMatrix<f32>, labels: Vec<usize>) -> QatResult<Self> {
        if features.nrows() != labels.len() {
            return Err(QatError::FeatureFormat(format!(
                "{} feature rows but {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        Ok(Dataset { features, labels })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when there are no samples
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Feature matrix
    pub fn features(&self) -> &DMatrix<f32> {
        &self.features
    }

    /// Class indices
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Samples per class
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &label in &self.labels {
            if label < num_classes {
                counts[label] += 1;
            }
        }
        counts
    }

    /// Rows at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select_rows(indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Batches in storage order
    pub fn batches(&self, batch_size: usize) -> Batches<'_> {
        Batches { dataset: self, order: (0..self.len()).collect(), batch_size: batch_size.max(1), pos: 0 }
    }

    /// Batches in a fresh random order drawn from `rng`
    pub fn shuffled_batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        Batches { dataset: self, order, batch_size: batch_size.max(1), pos: 0 }
    }
}

/// Iterator over mini-batches of a [`Dataset`]
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = &self.order[self.pos..end];
        self.pos = end;
        let subset = self.dataset.subset(indices);
        Some(Batch { features: subset.features, labels: subset.labels })
    }
}

/// Split into `(train, validation)` keeping class proportions.
///
/// Each class is shuffled with `seed` and `round(n * fraction)` of its samples go to
/// validation; classes with at least two samples always contribute to both sides.
pub fn stratified_split(dataset: &Dataset, fraction: f32, seed: u64) -> (Dataset, Dataset) {
    let mut rng = StdRng::seed_from_u64(seed);
    let num_classes = dataset.labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut train = Vec::new();
    let mut validation = Vec::new();

    for class in 0..num_classes {
        let mut members: Vec<usize> = (0..dataset.len()).filter(|&i| dataset.labels[i] == class).collect();
        if members.is_empty() {
            continue;
        }
        if members.len() == 1 {
            warn!("Class {} has a single sample; keeping it in the training split", class);
            train.extend(members);
            continue;
        }
        members.shuffle(&mut rng);
        let n_val = ((members.len() as f32 * fraction).round() as usize).clamp(1, members.len() - 1);
        validation.extend_from_slice(&members[..n_val]);
        train.extend_from_slice(&members[n_val..]);
    }

    train.sort_unstable();
    validation.sort_unstable();
    (dataset.subset(&train), dataset.subset(&validation))
}
