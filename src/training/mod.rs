//! Quantization-aware fine-tuning
//!
//! The loop evaluates the floating-point baseline, projects the loaded weights onto Q1.7,
//! and then alternates fine-tune epochs with validation, keeping the best snapshot.
pub mod eval;
pub mod lr;
pub mod optim;
pub mod step;

pub use eval::{EvalReport, evaluate};
pub use lr::{CosineAnnealingLR, LRScheduler};
pub use optim::{Adam, Optimizer, clip_grad_norm};
pub use step::{BatchMetrics, cross_entropy, finetune_step};

use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::data::{Dataset, FeatureStore, stratified_split};
use crate::neural::checkpoint::{load_into, save_model};
use crate::neural::{SnnModel, finetuned_path};
use crate::quant::apply_weight_quantization;
use crate::temporal::TemporalSchedule;
use crate::{QatConfig, QatError, QatResult};

/// Optimizer, schedule and epoch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneConfig {
    /// Initial Adam learning rate
    pub learning_rate: f32,
    /// Number of epochs, also the cosine period
    pub epochs: usize,
    /// Training and evaluation batch size
    pub batch_size: usize,
    /// Cosine annealing floor
    pub min_learning_rate: f32,
    /// Window expansion coefficient
    pub gamma: f32,
    /// Global gradient norm ceiling
    pub max_grad_norm: f32,
    /// Adam first moment decay
    pub beta1: f32,
    /// Adam second moment decay
    pub beta2: f32,
    /// Adam denominator term
    pub epsilon: f32,
    /// Seed for initialization, splitting and shuffling
    pub seed: u64,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        FinetuneConfig {
            learning_rate: 5e-4,
            epochs: 100,
            batch_size: 8,
            min_learning_rate: 1e-6,
            gamma: 10.0,
            max_grad_norm: 1.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            seed: 42,
        }
    }
}

impl FinetuneConfig {
    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> QatResult<()> {
        if self.epochs == 0 {
            return Err(QatError::Config("epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(QatError::Config("batch_size must be at least 1".into()));
        }
        if !(self.learning_rate > 0.0) || self.min_learning_rate < 0.0 || self.min_learning_rate > self.learning_rate {
            return Err(QatError::Config(format!(
                "learning rate range [{}, {}] is invalid",
                self.min_learning_rate, self.learning_rate
            )));
        }
        if !(self.gamma > 0.0) || !(self.max_grad_norm > 0.0) {
            return Err(QatError::Config("gamma and max_grad_norm must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) || !(self.epsilon > 0.0) {
            return Err(QatError::Config("Adam betas must lie in [0, 1) and epsilon must be positive".into()));
        }
        Ok(())
    }

    /// Window update rule with this config's gamma
    pub fn schedule(&self) -> TemporalSchedule {
        TemporalSchedule::with_gamma(self.gamma)
    }

    /// Adam with this config's hyperparameters
    pub fn optimizer(&self) -> Adam {
        Adam::new(self.learning_rate, self.beta1, self.beta2, self.epsilon)
    }
}

/// Outcome of one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    /// 1-based epoch number
    pub epoch: usize,
    /// Learning rate used during the epoch
    pub learning_rate: f32,
    /// Sample-weighted training loss
    pub train_loss: f32,
    /// Training accuracy
    pub train_accuracy: f32,
    /// Validation loss
    pub val_loss: f32,
    /// Validation accuracy
    pub val_accuracy: f32,
}

/// What a fine-tuning run achieved
#[derive(Debug, Clone, PartialEq)]
pub struct FinetuneSummary {
    /// Validation accuracy of the loaded weights before any projection
    pub fp32_accuracy: f32,
    /// Validation accuracy right after the first projection
    pub initial_quantized_accuracy: f32,
    /// Best validation accuracy, never below `initial_quantized_accuracy`
    pub best_accuracy: f32,
    /// Epoch that reached `best_accuracy`; `None` when no epoch improved on the start
    pub best_epoch: Option<usize>,
    /// Per-epoch metrics
    pub history: Vec<EpochRecord>,
}

/// Fine-tune `model` in place and leave it holding the best snapshot
pub fn run_finetune<O: Optimizer + ?Sized>(
    model: &mut SnnModel,
    optimizer: &mut O,
    train: &Dataset,
    val: &Dataset,
    config: &FinetuneConfig,
) -> QatResult<FinetuneSummary> {
    config.validate()?;
    if train.is_empty() {
        return Err(QatError::InvalidBatch("training split is empty".into()));
    }

    let fp32 = evaluate(model, val, config.batch_size)?;
    info!("FP32 baseline validation accuracy: {:.4}", fp32.accuracy);

    apply_weight_quantization(model);
    let initial = evaluate(model, val, config.batch_size)?;
    info!("Validation accuracy after initial Q1.7 quantization: {:.4}", initial.accuracy);

    let schedule = config.schedule();
    let mut scheduler = CosineAnnealingLR::new(config.learning_rate, config.epochs, config.min_learning_rate);
    scheduler.apply(optimizer);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut best_accuracy = initial.accuracy;
    let mut best_epoch = None;
    let mut best_state = model.state();
    let mut history = Vec::with_capacity(config.epochs);

    info!("Starting QAT fine-tuning for {} epochs", config.epochs);
    for epoch in 1..=config.epochs {
        let learning_rate = optimizer.lr();
        let mut loss_sum = 0.0;
        let mut correct = 0;
        for batch in train.shuffled_batches(config.batch_size, &mut rng) {
            let metrics = finetune_step(model, optimizer, &schedule, &batch, config.max_grad_norm, &mut rng)?;
            loss_sum += metrics.loss * metrics.samples as f32;
            correct += metrics.correct;
        }

        let report = evaluate(model, val, config.batch_size)?;
        scheduler.step();
        scheduler.apply(optimizer);

        let record = EpochRecord {
            epoch,
            learning_rate,
            train_loss: loss_sum / train.len() as f32,
            train_accuracy: correct as f32 / train.len() as f32,
            val_loss: report.loss,
            val_accuracy: report.accuracy,
        };
        info!(
            "Epoch {}/{} | Train Loss: {:.4}, Train Acc: {:.4} | Val Loss: {:.4}, Val Acc: {:.4} | LR: {:.6}",
            epoch, config.epochs, record.train_loss, record.train_accuracy, record.val_loss, record.val_accuracy, learning_rate
        );
        debug!("Windows after epoch {}: {:?}", epoch, model.windows());

        if report.accuracy > best_accuracy {
            best_accuracy = report.accuracy;
            best_epoch = Some(epoch);
            best_state = model.state();
            info!("New best validation accuracy: {:.4}", best_accuracy);
        }
        history.push(record);
    }

    model.restore(&best_state)?;
    info!("Fine-tuning finished. Best validation accuracy: {:.4}", best_accuracy);

    Ok(FinetuneSummary {
        fp32_accuracy: fp32.accuracy,
        initial_quantized_accuracy: initial.accuracy,
        best_accuracy,
        best_epoch,
        history,
    })
}

/// Load features and a pretrained checkpoint, fine-tune, and write `<stem>_Q1.7_finetuned.<ext>`.
///
/// Returns the path of the written checkpoint together with the run summary.
pub fn finetune_checkpoint(config: &QatConfig, model_path: &Path, feature_dir: &Path) -> QatResult<(PathBuf, FinetuneSummary)> {
    config.validate()?;

    let store = FeatureStore::load(feature_dir, &config.data)?;
    let dataset = store.into_dataset(config.architecture.input_len())?;
    let (train, val) = stratified_split(&dataset, config.data.validation_fraction, config.finetune.seed);
    info!("Train samples: {}, validation samples: {}", train.len(), val.len());

    let mut rng = StdRng::seed_from_u64(config.finetune.seed);
    let mut model = SnnModel::new(&config.architecture, &config.finetune.schedule(), &mut rng)?;
    load_into(model_path, &mut model)?;

    let mut optimizer = config.finetune.optimizer();
    let summary = run_finetune(&mut model, &mut optimizer, &train, &val, &config.finetune)?;

    let output = finetuned_path(model_path);
    save_model(&output, &model)?;
    Ok((output, summary))
}
