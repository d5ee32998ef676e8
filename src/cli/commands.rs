//! Command implementations

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use ptq_rs::calibration::DatasetReader;
use ptq_rs::onnx_utils::graph_builder::validate_graph_connectivity;
use ptq_rs::{
    calibrate as run_calibration, load_model, save_model, CalibrationDataset, CalibrationMethod, GraphModel,
    ModelInfo, QuantFormat, QuantType, QuantizationConfig, QuantizationReport, Quantizer, TensorRangeTable,
};
use ptq_rs::dynamic_quant::dynamic_config;

/// Where calibration batches come from.
#[derive(Args, Debug, Clone)]
pub struct CalibrationArgs {
    /// Calibration samples (.npy, first axis indexes samples)
    #[arg(long, value_name = "DATA")]
    pub data: Option<String>,

    /// Model input the samples feed (defaults to the only input)
    #[arg(long, value_name = "NAME")]
    pub input_name: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    /// minmax, entropy or percentile
    #[arg(long)]
    pub method: Option<String>,
}

/// Quantization settings; flags override the config file.
#[derive(Args, Debug, Clone)]
pub struct QuantizeArgs {
    /// YAML or TOML quantization config
    #[arg(short, long, value_name = "CONFIG")]
    pub config: Option<String>,

    /// qdq or qoperator
    #[arg(long)]
    pub format: Option<String>,

    #[arg(long)]
    pub per_channel: bool,

    #[arg(long)]
    pub reduce_range: bool,

    /// qint8, quint8, qint16 or quint16
    #[arg(long)]
    pub activation_type: Option<String>,

    #[arg(long)]
    pub weight_type: Option<String>,

    /// Op types to quantize (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub op_types: Vec<String>,

    /// Node names to leave in float (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Store large initializers in a side file
    #[arg(long)]
    pub external_data: bool,
}

impl QuantizeArgs {
    fn build_config(&self, calibration: Option<&CalibrationArgs>) -> Result<QuantizationConfig> {
        let mut config = load_config(self.config.as_deref())?;

        if let Some(format) = &self.format {
            config.quant_format = format.parse::<QuantFormat>()?;
        }
        if let Some(t) = &self.activation_type {
            config.activation_type = t.parse::<QuantType>()?;
        }
        if let Some(t) = &self.weight_type {
            config.weight_type = t.parse::<QuantType>()?;
        }
        config.per_channel |= self.per_channel;
        config.reduce_range |= self.reduce_range;
        config.use_external_data_format |= self.external_data;
        if !self.op_types.is_empty() {
            config.op_types_to_quantize = self.op_types.clone();
        }
        config.nodes_to_exclude.extend(self.exclude.iter().cloned());
        if let Some(calibration) = calibration {
            apply_method(&mut config, calibration)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn load_config(path: Option<&str>) -> Result<QuantizationConfig> {
    match path {
        Some(path) => {
            let config = QuantizationConfig::from_file(path)?;
            println!("✓ Config loaded: {}", path.bold());
            Ok(config)
        }
        None => Ok(QuantizationConfig::default()),
    }
}

fn apply_method(config: &mut QuantizationConfig, calibration: &CalibrationArgs) -> Result<()> {
    if let Some(method) = &calibration.method {
        config.calibrate_method = method.parse::<CalibrationMethod>()?;
    }
    Ok(())
}

fn calibration_reader(model: &GraphModel, args: &CalibrationArgs) -> Result<DatasetReader> {
    let Some(path) = &args.data else {
        bail!("calibration needs --data <file.npy> (or --ranges with a precomputed table)");
    };

    let input_name = match &args.input_name {
        Some(name) => name.clone(),
        None => {
            let inputs: Vec<&str> = model.graph.runtime_inputs().map(|i| i.name.as_str()).collect();
            match inputs.as_slice() {
                [only] => only.to_string(),
                _ => bail!(
                    "model has {} inputs ({}), pick one with --input-name",
                    inputs.len(),
                    inputs.join(", ")
                ),
            }
        }
    };

    let dataset = CalibrationDataset::from_numpy(path).with_context(|| format!("loading {path}"))?;
    println!(
        "✓ Calibration data: {} samples of shape {:?} → '{}'",
        dataset.len(),
        dataset.sample_shape(),
        input_name
    );
    Ok(dataset.into_reader(input_name, args.batch_size))
}

fn load(input: &str) -> Result<GraphModel> {
    println!("📦 Loading model: {}", input.bold());
    let model = load_model(input)?;
    println!("✓ Model loaded ({} nodes)", model.graph.nodes.len());
    println!();
    Ok(model)
}

fn mb(bytes: usize) -> f32 {
    bytes as f32 / 1_048_576.0
}

pub fn quantize(
    input: &str,
    output: &str,
    ranges: Option<&str>,
    calibration: &CalibrationArgs,
    args: &QuantizeArgs,
) -> Result<()> {
    let model = load(input)?;
    let config = args.build_config(Some(calibration))?;

    let ranges = match ranges {
        Some(path) => {
            let table = TensorRangeTable::load(path)?;
            println!("✓ Loaded {} tensor ranges from {}", table.len(), path);
            table
        }
        None => {
            println!("🔍 Calibrating ({})...", config.calibrate_method);
            let mut reader = calibration_reader(&model, calibration)?;
            let table = run_calibration(&model, &mut reader, &config)?;
            println!("✓ {} tensor ranges computed", table.len());
            table
        }
    };
    println!();

    println!("🔧 Quantizing to {} ({}/{})...", config.quant_format, config.activation_type, config.weight_type);
    let quantizer = Quantizer::new(config.clone(), ranges);
    let (quantized, report) = quantizer.quantize_model_with_report(&model)?;
    write_quantized(&model, &quantized, &report, output, &config)
}

/// Quantize weights ahead of time and activations at run time; no
/// calibration data needed.
pub fn quantize_dynamic(input: &str, output: &str, args: &QuantizeArgs) -> Result<()> {
    let model = load(input)?;
    let config = dynamic_config(&args.build_config(None)?);

    println!("🔧 Quantizing dynamically ({}/{})...", config.activation_type, config.weight_type);
    let quantizer = Quantizer::dynamic(config.clone());
    let (quantized, report) = quantizer.quantize_model_with_report(&model)?;
    write_quantized(&model, &quantized, &report, output, &config)
}

fn write_quantized(
    model: &GraphModel,
    quantized: &GraphModel,
    report: &QuantizationReport,
    output: &str,
    config: &QuantizationConfig,
) -> Result<()> {
    let connectivity = validate_graph_connectivity(&quantized.graph);
    if !connectivity.valid {
        eprint!("{}", connectivity.summary());
        bail!("quantized graph failed validation, nothing written");
    }

    save_model(quantized, output, config.use_external_data_format)?;

    let before = ModelInfo::from_model(model);
    let after = ModelInfo::from_model(quantized);
    println!("✓ Quantization complete");
    println!();
    println!("📊 Results:");
    println!("  Nodes rewritten:   {}", report.nodes_rewritten);
    println!("  Nodes left float:  {}", report.nodes_unchanged);
    println!("  Tensors quantized: {}", report.tensors_quantized);
    println!("  Original size:     {:.2} MB", mb(before.initializer_bytes));
    println!("  Quantized size:    {:.2} MB", mb(after.initializer_bytes));
    println!();
    println!("{} {}", "💾 Saved:".green(), output.bold());

    Ok(())
}

pub fn calibrate(input: &str, output: &str, calibration: &CalibrationArgs, config: Option<&str>) -> Result<()> {
    let model = load(input)?;
    let mut config = load_config(config)?;
    apply_method(&mut config, calibration)?;

    println!("🔍 Calibrating ({})...", config.calibrate_method);
    let mut reader = calibration_reader(&model, calibration)?;
    let ranges = run_calibration(&model, &mut reader, &config)?;
    ranges.save(output)?;

    println!("✓ {} tensor ranges computed", ranges.len());
    for (name, range) in ranges.iter().take(10) {
        println!("    {:<40} [{:>10.4}, {:>10.4}]", name, range.min, range.max);
    }
    if ranges.len() > 10 {
        println!("    ... and {} more", ranges.len() - 10);
    }
    println!();
    println!("{} {}", "💾 Saved:".green(), output.bold());

    Ok(())
}

pub fn info(input: &str) -> Result<()> {
    println!("📊 Model Information: {}", input.bold());
    println!();

    let model = load_model(input)?;
    let info = ModelInfo::from_model(&model);

    println!("  Name:         {}", info.name.cyan());
    println!("  IR version:   {}", info.ir_version);
    if !info.producer.is_empty() {
        println!("  Producer:     {}", info.producer);
    }
    for (domain, version) in &info.opsets {
        let domain = if domain.is_empty() { "ai.onnx" } else { domain.as_str() };
        println!("  Opset:        {domain} v{version}");
    }
    println!("  Nodes:        {}", info.num_nodes);
    println!(
        "  Initializers: {} ({:.2} MB)",
        info.num_initializers,
        mb(info.initializer_bytes)
    );
    println!();

    println!("  Inputs ({}):", info.inputs.len());
    for input in &info.inputs {
        println!("    - {}", input);
    }
    println!();

    println!("  Outputs ({}):", info.outputs.len());
    for output in &info.outputs {
        println!("    - {}", output);
    }
    println!();

    println!("  Op types:");
    for (op, count) in &info.op_counts {
        println!("    {:<24} {}", op, count);
    }

    Ok(())
}

pub fn validate(input: &str) -> Result<()> {
    println!("🔎 Validating: {}", input.bold());
    println!();

    let model = load_model(input)?;
    let report = validate_graph_connectivity(&model.graph);
    print!("{}", report.summary());

    let info = ModelInfo::from_model(&model);
    let quant_ops: usize = info
        .op_counts
        .iter()
        .filter(|(op, _)| op.starts_with("QLinear") || op.ends_with("QuantizeLinear"))
        .map(|(_, count)| count)
        .sum();
    println!("  Quantization nodes: {}", quant_ops);
    println!();

    if report.valid {
        println!("{}", "✓ Model is valid".green());
        Ok(())
    } else {
        bail!("model failed validation")
    }
}
