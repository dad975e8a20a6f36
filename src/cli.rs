use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

use vie::models::DEFAULT_MODEL_ID;
use vie::{AnomalyService, Config, DetectRequest, EngineError, TrainRequest};

#[derive(Parser)]
#[command(name = "vie")]
#[command(author, version, about = "Per-identifier anomaly model training and scoring")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train (or retrain) a model
    Train {
        /// Model identifier
        #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
        model_id: String,

        /// Expected outlier fraction in (0, 0.5]
        #[arg(short = 'k', long)]
        contamination: Option<f64>,

        /// JSON file holding a list of rows ("-" for stdin)
        data: PathBuf,
    },

    /// Score rows against a trained model
    Detect {
        /// Model identifier
        #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
        model_id: String,

        /// JSON file holding a list of rows ("-" for stdin)
        data: PathBuf,
    },

    /// Show model status
    Status {
        /// Model identifier
        model_id: String,
    },

    /// List stored models
    List,

    /// Delete a model and its artifact
    Delete {
        /// Model identifier
        model_id: String,

        /// Confirm the action
        #[arg(long)]
        yes: bool,
    },

    /// Liveness check
    Health,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::GenConfig { output } => {
            let default = Config::default();
            match output {
                Some(path) => {
                    default.save(&path)?;
                    println!("Configuration written to {}", path.display());
                }
                None => print!("{}", toml::to_string_pretty(&default)?),
            }
            Ok(())
        }

        Commands::Health => {
            // No service needed: liveness must not depend on model state
            print_json(&vie::HealthStatus::operational())
        }

        Commands::Train {
            model_id,
            contamination,
            data,
        } => {
            let request = TrainRequest {
                data: read_matrix(&data)?,
                model_id,
                contamination,
            };
            let service = start(config)?;
            let result = service.train(request).await.map_err(engine_failure)?;
            print_json(&result)?;
            if !result.is_success() {
                bail!("training failed: {}", result.message);
            }
            Ok(())
        }

        Commands::Detect { model_id, data } => {
            let request = DetectRequest {
                data: read_matrix(&data)?,
                model_id,
            };
            let output = start(config)?
                .detect(request)
                .await
                .map_err(engine_failure)?;
            print_json(&output)
        }

        Commands::Status { model_id } => print_json(&start(config)?.status(&model_id)),

        Commands::List => {
            for id in start(config)?.list_models().map_err(engine_failure)? {
                println!("{}", id);
            }
            Ok(())
        }

        Commands::Delete { model_id, yes } => {
            if !yes {
                bail!("refusing to delete '{}' without --yes", model_id);
            }
            if start(config)?.delete(&model_id).map_err(engine_failure)? {
                println!("Deleted model '{}'", model_id);
            } else {
                println!("Model '{}' not found", model_id);
            }
            Ok(())
        }
    }
}

fn start(config: Config) -> Result<AnomalyService> {
    AnomalyService::new(config).map_err(engine_failure)
}

/// Print the structured error body, then hand the error back for the exit code
fn engine_failure(e: EngineError) -> anyhow::Error {
    if let Ok(body) = serde_json::to_string_pretty(&e.to_response()) {
        println!("{}", body);
    }
    anyhow!(e)
}

fn read_matrix(path: &Path) -> Result<Value> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read data from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read data file: {}", path.display()))?
    };

    serde_json::from_str(&content)
        .with_context(|| format!("Data in {} is not valid JSON", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
