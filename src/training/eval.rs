//! Evaluation over a whole split

use nalgebra::DMatrix;

use super::step::{count_correct, cross_entropy, validate_batch};
use crate::data::Dataset;
use crate::neural::SnnModel;
use crate::{QatError, QatResult};

/// Loss, accuracy and per-sample predictions of one split
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    /// Sample-weighted mean cross-entropy
    pub loss: f32,
    /// Top-1 accuracy in `[0, 1]`
    pub accuracy: f32,
    /// True class per sample, in split order
    pub labels: Vec<usize>,
    /// Predicted class per sample, in split order
    pub predictions: Vec<usize>,
}

impl EvalReport {
    /// Rows are true classes, columns predicted classes
    pub fn confusion_matrix(&self, num_classes: usize) -> DMatrix<usize> {
        let mut matrix: DMatrix<usize> = DMatrix::zeros(num_classes, num_classes);
        for (&truth, &pred) in self.labels.iter().zip(&self.predictions) {
            if truth < num_classes && pred < num_classes {
                matrix[(truth, pred)] += 1;
            }
        }
        matrix
    }
}

/// Run the model over `dataset` without touching weights or windows
pub fn evaluate(model: &SnnModel, dataset: &Dataset, batch_size: usize) -> QatResult<EvalReport> {
    if dataset.is_empty() {
        return Err(QatError::InvalidBatch("evaluation split is empty".into()));
    }

    let mut total_loss = 0.0;
    let mut correct = 0;
    let mut labels = Vec::with_capacity(dataset.len());
    let mut predictions = Vec::with_capacity(dataset.len());

    for batch in dataset.batches(batch_size) {
        validate_batch(&batch, model.num_classes())?;
        let pass = model.forward(&batch.features)?;
        let (loss, _) = cross_entropy(&pass.logits, &batch.labels);

        total_loss += loss * batch.labels.len() as f32;
        correct += count_correct(&pass.logits, &batch.labels);
        predictions.extend(pass.predictions());
        labels.extend_from_slice(&batch.labels);
    }

    let n = dataset.len() as f32;
    Ok(EvalReport { loss: total_loss / n, accuracy: correct as f32 / n, labels, predictions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::ArchitectureConfig;
    use crate::temporal::TemporalSchedule;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn setup() -> (SnnModel, Dataset) {
        let mut rng = StdRng::seed_from_u64(3);
        let model = SnnModel::new(&ArchitectureConfig::default(), &TemporalSchedule::default(), &mut rng).unwrap();
        let features = DMatrix::from_fn(7, 288, |b, j| ((b * 3 + j) % 11) as f32 * 0.1);
        let dataset = Dataset::new(features, vec![0, 1, 2, 0, 1, 2, 0]).unwrap();
        (model, dataset)
    }

    #[test]
    fn evaluation_leaves_model_untouched() {
        let (model, dataset) = setup();
        let before = model.state();
        let report = evaluate(&model, &dataset, 3).unwrap();

        assert_eq!(model.state(), before);
        assert_eq!(report.labels, dataset.labels());
        assert_eq!(report.predictions.len(), 7);
        assert!((0.0..=1.0).contains(&report.accuracy));
    }

    #[test]
    fn batch_size_does_not_change_the_result() {
        let (model, dataset) = setup();
        let a = evaluate(&model, &dataset, 2).unwrap();
        let b = evaluate(&model, &dataset, 7).unwrap();
        assert_eq!(a.predictions, b.predictions);
        assert_eq!(a.accuracy, b.accuracy);
        assert!((a.loss - b.loss).abs() < 1e-5);
    }

    #[test]
    fn confusion_matrix_counts_every_sample() {
        let report = EvalReport {
            loss: 0.0,
            accuracy: 0.5,
            labels: vec![0, 1, 2, 2],
            predictions: vec![0, 2, 2, 1],
        };
        let matrix = report.confusion_matrix(3);
        assert_eq!(matrix.sum(), 4);
        assert_eq!(matrix[(2, 2)], 1);
        assert_eq!(matrix[(1, 2)], 1);
        assert_eq!(matrix.diagonal().sum(), 2);
    }

    #[test]
    fn empty_split_is_an_error() {
        let (model, _) = setup();
        let empty = Dataset::new(DMatrix::zeros(0, 288), vec![]).unwrap();
        assert!(matches!(evaluate(&model, &empty, 4), Err(QatError::InvalidBatch(_))));
    }
}
