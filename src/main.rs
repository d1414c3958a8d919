// src/main.rs
// Entry point: fine-tune a pretrained TTFS checkpoint onto Q1.7 weights.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use log::{debug, error, info};
use ttfs_qat::training::finetune_checkpoint;
use ttfs_qat::{QatConfig, QatError, QatResult};

/// Q1.7 quantization-aware fine-tuning for a TTFS spiking EEG classifier
#[derive(Debug, Parser)]
#[command(name = "ttfs-qat", version, about)]
struct Args {
    /// Pretrained FP32 checkpoint (YAML)
    #[arg(long, default_value = "saved_models/snn_dsc_conv8-8_h64-32.yaml")]
    model_path: PathBuf,

    /// Directory holding all_features_lds_smoothed.yaml
    #[arg(long, default_value = "Feature_PowerSpectrumEntropy_LDS_Smoothed_4x8x9_AllData")]
    feature_dir: PathBuf,
}

fn run(args: &Args, config: &QatConfig) -> QatResult<()> {
    debug!("Effective configuration:\n{}", config.to_yaml()?);
    info!("Fine-tuning {} with features from {}", args.model_path.display(), args.feature_dir.display());

    match finetune_checkpoint(config, &args.model_path, &args.feature_dir) {
        Ok((output, summary)) => {
            info!(
                "FP32 accuracy {:.4}, initial Q1.7 accuracy {:.4}, best Q1.7 accuracy {:.4}",
                summary.fp32_accuracy, summary.initial_quantized_accuracy, summary.best_accuracy
            );
            info!("Fine-tuned Q1.7 model written to {}", output.display());
            Ok(())
        }
        Err(QatError::MissingFeatureFile(path)) => {
            info!("Data file not found: {}. Nothing to fine-tune.", path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Display, not Debug: the checkpoint diagnostic lives in the error message
    if let Err(e) = run(&args, &QatConfig::default()) {
        error!("{e}");
        std::process::exit(1);
    }
    Ok(())
}
