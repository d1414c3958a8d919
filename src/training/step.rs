//! One quantization-aware optimization step
//!
//! Order per batch: forward → loss → backward → clip → optimizer step → Q1.7 projection →
//! schedule update from this batch's spikes. The projection and the schedule update only
//! touch committed values; neither feeds the gradient of the current batch.

use log::trace;
use nalgebra::DMatrix;
use rand::Rng;

use super::optim::{Optimizer, clip_grad_norm};
use crate::data::Batch;
use crate::neural::SnnModel;
use crate::quant::apply_weight_quantization;
use crate::temporal::TemporalSchedule;
use crate::{QatError, QatResult};

/// Loss and accuracy of one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    /// Mean cross-entropy over the batch
    pub loss: f32,
    /// Correct top-1 predictions
    pub correct: usize,
    /// Batch size
    pub samples: usize,
    /// Global gradient norm before clipping
    pub grad_norm: f32,
}

impl BatchMetrics {
    /// Fraction of correct predictions
    pub fn accuracy(&self) -> f32 {
        self.correct as f32 / self.samples as f32
    }
}

/// Reject empty batches, ragged batches and labels outside `0..num_classes`
pub fn validate_batch(batch: &Batch, num_classes: usize) -> QatResult<()> {
    if batch.labels.is_empty() {
        return Err(QatError::InvalidBatch("batch is empty".into()));
    }
    if batch.features.nrows() != batch.labels.len() {
        return Err(QatError::InvalidBatch(format!(
            "{} feature rows but {} labels",
            batch.features.nrows(),
            batch.labels.len()
        )));
    }
    if let Some(&label) = batch.labels.iter().find(|&&l| l >= num_classes) {
        return Err(QatError::InvalidBatch(format!("label {label} outside 0..{num_classes}")));
    }
    Ok(())
}

/// Mean softmax cross-entropy and its gradient with respect to the logits
pub fn cross_entropy(logits: &DMatrix<f32>, labels: &[usize]) -> (f32, DMatrix<f32>) {
    let batch = logits.nrows();
    let mut grad: DMatrix<f32> = DMatrix::zeros(batch, logits.ncols());
    let mut total = 0.0;

    for (i, &label) in labels.iter().enumerate() {
        let row = logits.row(i);
        let max = row.max();
        let sum_exp: f32 = row.iter().map(|&z| (z - max).exp()).sum();
        let log_sum = max + sum_exp.ln();
        total += log_sum - row[label];

        for j in 0..logits.ncols() {
            let p = (row[j] - log_sum).exp();
            grad[(i, j)] = (p - if j == label { 1.0 } else { 0.0 }) / batch as f32;
        }
    }
    (total / batch as f32, grad)
}

/// Number of rows whose arg-max logit equals the label
pub fn count_correct(logits: &DMatrix<f32>, labels: &[usize]) -> usize {
    logits
        .row_iter()
        .zip(labels)
        .filter(|(row, label)| row.transpose().argmax().0 == **label)
        .count()
}

/// Run one fine-tuning step on `batch`
pub fn finetune_step<O, R>(
    model: &mut SnnModel,
    optimizer: &mut O,
    schedule: &TemporalSchedule,
    batch: &Batch,
    max_grad_norm: f32,
    rng: &mut R,
) -> QatResult<BatchMetrics>
where
    O: Optimizer + ?Sized,
    R: Rng + ?Sized,
{
    validate_batch(batch, model.num_classes())?;

    let pass = model.forward_train(&batch.features, rng)?;
    let (loss, grad_logits) = cross_entropy(&pass.logits, &batch.labels);
    let correct = count_correct(&pass.logits, &batch.labels);

    let mut grads = model.backward(&pass, &grad_logits);
    let grad_norm = clip_grad_norm(&mut grads, max_grad_norm);
    optimizer.step(model.params_mut(), &grads);

    apply_weight_quantization(model);
    schedule.apply(model, Some(&pass.spikes));
    trace!("batch loss {:.4}, grad norm {:.4}", loss, grad_norm);

    Ok(BatchMetrics { loss, correct, samples: batch.labels.len(), grad_norm })
}
