use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::commands::{self, CalibrationArgs, QuantizeArgs};

#[derive(Parser)]
#[command(
    name = "ptq",
    version,
    about = "Post-training quantization for ONNX models",
    long_about = "Calibrate an ONNX model on representative data and rewrite it to QOperator or QDQ integer form"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate and quantize a model
    Quantize {
        #[arg(value_name = "MODEL")]
        input: String,

        #[arg(short, long, default_value = "model_quantized.onnx")]
        output: String,

        /// Precomputed range table (YAML) instead of calibrating
        #[arg(long, value_name = "RANGES", conflicts_with = "data")]
        ranges: Option<String>,

        #[command(flatten)]
        calibration: CalibrationArgs,

        #[command(flatten)]
        quantize: QuantizeArgs,
    },

    /// Quantize weights ahead of time and activations at run time
    Dynamic {
        #[arg(value_name = "MODEL")]
        input: String,

        #[arg(short, long, default_value = "model_quantized.onnx")]
        output: String,

        #[command(flatten)]
        quantize: QuantizeArgs,
    },

    /// Calibrate only and write the range table as YAML
    Calibrate {
        #[arg(value_name = "MODEL")]
        input: String,

        #[arg(short, long, default_value = "ranges.yaml")]
        output: String,

        #[command(flatten)]
        calibration: CalibrationArgs,

        #[arg(short, long, value_name = "CONFIG")]
        config: Option<String>,
    },

    /// Print a model summary
    Info {
        #[arg(value_name = "MODEL")]
        input: String,
    },

    /// Check graph connectivity and opset imports
    Validate {
        #[arg(value_name = "MODEL")]
        input: String,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();

    println!("{}", format!("ptq v{}", ptq_rs::VERSION).bold().cyan());
    println!();

    match cli.command {
        Commands::Quantize {
            input,
            output,
            ranges,
            calibration,
            quantize,
        } => {
            commands::quantize(&input, &output, ranges.as_deref(), &calibration, &quantize)?;
        }
        Commands::Dynamic { input, output, quantize } => {
            commands::quantize_dynamic(&input, &output, &quantize)?;
        }
        Commands::Calibrate {
            input,
            output,
            calibration,
            config,
        } => {
            commands::calibrate(&input, &output, &calibration, config.as_deref())?;
        }
        Commands::Info { input } => {
            commands::info(&input)?;
        }
        Commands::Validate { input } => {
            commands::validate(&input)?;
        }
    }

    Ok(())
}
