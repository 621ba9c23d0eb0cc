//! 手書き数字認識 CLI
//!
//! 使い方:
//!   digit-recognizer train --data data/mnist
//!   digit-recognizer predict digit.png
//!   digit-recognizer info

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};

use digit_recognizer::backend::{CpuDevice, CpuTrainBackend};
use digit_recognizer::model::{self, AppConfig, DeviceType};
use digit_recognizer::{ArtifactState, DigitPipeline};

#[derive(Parser, Debug)]
#[command(name = "digit-recognizer", version, about = "Handwritten digit recognizer")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    /// Use the WGPU backend (requires the `wgpu` feature)
    #[arg(long)]
    gpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a new model and save the artifact
    Train {
        /// Dataset directory (MNIST IDX files or <dir>/<digit>/*.png)
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        /// Output artifact path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Classify one or more images
    Predict {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Model artifact path
        #[arg(long)]
        model: Option<PathBuf>,
        /// Confidence threshold in [0, 1]
        #[arg(long)]
        threshold: Option<f32>,
        /// Disable cropping to the ink bounding box
        #[arg(long)]
        no_crop: bool,
        /// Print each prediction as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Print the metadata stored in a model artifact
    Info {
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration back to the config file
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let Cli {
        config: config_path,
        gpu,
        command,
    } = cli;

    let mut config = AppConfig::load_or_default_from(&config_path);
    if gpu {
        config.set_device_type(DeviceType::Wgpu);
    }

    run_on_device(command, config, &config_path)
}

/// 設定のデバイスでコマンドを実行
fn run_on_device(command: Command, config: AppConfig, config_path: &Path) -> Result<()> {
    log::info!("計算デバイス: {}", config.device_type);

    if config.device_type == DeviceType::Wgpu {
        #[cfg(feature = "wgpu")]
        {
            use digit_recognizer::backend::{GpuDevice, GpuTrainBackend};
            return execute::<GpuTrainBackend>(command, config, config_path, GpuDevice::default());
        }
        #[cfg(not(feature = "wgpu"))]
        log::warn!("wgpu フィーチャが無効のため CPU で実行します");
    }

    execute::<CpuTrainBackend>(command, config, config_path, CpuDevice::default())
}

fn execute<B: AutodiffBackend>(
    command: Command,
    mut config: AppConfig,
    config_path: &Path,
    device: B::Device,
) -> Result<()> {
    match command {
        Command::Config { write } => {
            config.display();
            if write {
                config
                    .save(config_path)
                    .with_context(|| format!("Failed to write {}", config_path.display()))?;
            }
            Ok(())
        }
        Command::Info { model } => {
            let path = model.unwrap_or_else(|| config.model.artifact_path.clone());
            let metadata = model::load_metadata(&path)
                .with_context(|| format!("Failed to read model metadata from {}", path.display()))?;
            model::print_metadata_info(&metadata);
            Ok(())
        }
        Command::Train {
            data,
            epochs,
            batch_size,
            learning_rate,
            output,
        } => {
            let training = &mut config.training;
            if let Some(data) = data {
                training.data_dir = data;
            }
            if let Some(epochs) = epochs {
                training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                training.learning_rate = learning_rate;
            }
            if let Some(output) = output {
                config.set_model_path(output);
            }

            let pipeline = DigitPipeline::<B>::new(config, device)?;
            let (train_set, test_set) = pipeline.load_dataset().with_context(|| {
                format!(
                    "Failed to load dataset from {}",
                    pipeline.config().training.data_dir.display()
                )
            })?;
            let (model, history) = pipeline.train(train_set, test_set).context("Training failed")?;
            pipeline.save(&model, history.clone()).with_context(|| {
                format!("Failed to save model to {}", pipeline.artifact_path().display())
            })?;

            if let Some(last) = history.last() {
                println!(
                    "学習完了: valid loss {:.4}, valid accuracy {:.2}%",
                    last.valid_loss,
                    last.valid_accuracy * 100.0
                );
            }
            println!("モデルを保存しました: {}", pipeline.artifact_path().display());
            Ok(())
        }
        Command::Predict {
            images,
            model,
            threshold,
            no_crop,
            json,
        } => {
            if let Some(model) = model {
                config.set_model_path(model);
            }
            if let Some(threshold) = threshold {
                config.inference.confidence_threshold = threshold;
            }
            if no_crop {
                config.preprocessing = config.preprocessing.with_crop(false);
            }

            let pipeline = DigitPipeline::<B>::new(config, device)?;
            if pipeline.artifact_state() == ArtifactState::Missing {
                bail!(
                    "Model artifact not found: {} (run `digit-recognizer train` first)",
                    pipeline.artifact_path().display()
                );
            }
            let predictor = pipeline.predictor().context("Failed to load model")?;

            for path in &images {
                let prediction = predictor
                    .predict(path)
                    .with_context(|| format!("Failed to classify {}", path.display()))?;

                if json {
                    println!("{}", serde_json::to_string(&prediction)?);
                    continue;
                }

                let candidate = predictor
                    .config()
                    .class_index_to_label(prediction.candidate)
                    .unwrap_or("?");
                if prediction.is_rejected() {
                    println!(
                        "{}: -1 (棄却: 候補 {candidate}, 確率 {:.3})",
                        path.display(),
                        prediction.confidence
                    );
                } else {
                    println!(
                        "{}: {candidate} (確率 {:.3})",
                        path.display(),
                        prediction.confidence
                    );
                }
            }
            Ok(())
        }
    }
}
