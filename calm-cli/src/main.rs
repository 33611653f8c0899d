use std::path::Path;

use anyhow::Result;
use calm_export::{ExportOptions, export_model};
use calm_inference::{InferenceConfigBuilder, WeightEncoding, inspect_checkpoint, run_inference};
use clap::{Arg, ArgMatches, Command};
use log::{error, info};

/// Define the export subcommand.
fn export_subcommand() -> Command {
    Command::new("export")
        .about("Convert a HuggingFace model into a calm checkpoint")
        .arg(
            Arg::new("MODEL_PATH")
                .help("Path to the HuggingFace model directory (containing config.json, *.safetensors, tokenizer.json)")
                .required(true)
                .index(1),
        )
        .arg(Arg::new("OUTPUT_PATH").help("Output checkpoint file").required(true).index(2))
        .arg(
            Arg::new("dtype")
                .short('d')
                .long("dtype")
                .value_name("DTYPE")
                .help("Weight encoding")
                .value_parser(["fp16", "fp8", "gf4"])
                .default_value("fp8"),
        )
        .arg(
            Arg::new("context")
                .long("context")
                .value_name("INT")
                .help("Caps the context length stored in the checkpoint")
                .value_parser(clap::value_parser!(usize)),
        )
}

/// Define the run subcommand.
fn run_subcommand() -> Command {
    Command::new("run")
        .about("Run a calm checkpoint")
        .arg(Arg::new("checkpoint").help("Model checkpoint file").required(true).index(1))
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], default 1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("min-p")
                .short('p')
                .long("min-p")
                .value_name("FLOAT")
                .help("Min-p sampling cutoff in [0, 1], default 0.1")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed, default time(NULL)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, default max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of steps to run for, default 256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: generate|chat|study")
                .value_parser(["generate", "chat", "study"])
                .default_value("generate"),
        )
        .arg(Arg::new("input").short('i').long("input").value_name("STRING").help("Input prompt"))
        .arg(Arg::new("system").short('y').long("system").value_name("STRING").help("System prompt in chat mode"))
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("PATH")
                .help("Read the prompt from a file")
                .conflicts_with("input"),
        )
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    Command::new("inspect")
        .about("Print the metadata and tensor table of a checkpoint")
        .arg(Arg::new("checkpoint").help("Model checkpoint file").required(true).index(1))
}

/// Run the export command with the provided arguments
fn run_export_command(matches: &ArgMatches) -> Result<()> {
    let model_path =
        matches.get_one::<String>("MODEL_PATH").map(Path::new).ok_or_else(|| anyhow::anyhow!("Missing model path"))?;
    let output_path =
        matches.get_one::<String>("OUTPUT_PATH").map(Path::new).ok_or_else(|| anyhow::anyhow!("Missing output path"))?;
    let encoding = WeightEncoding::from_name(matches.get_one::<String>("dtype").map_or("fp8", String::as_str))?;
    let context = matches.get_one::<usize>("context").copied();

    if !model_path.is_dir() {
        anyhow::bail!("Model directory does not exist: {}", model_path.display());
    }
    for file in ["config.json", "tokenizer.json"] {
        if !model_path.join(file).exists() {
            anyhow::bail!("{file} not found in model directory");
        }
    }

    info!("");
    info!("🚀 calm model exporter");
    info!("📁 Model path: {}", model_path.display());
    info!("💾 Output path: {}", output_path.display());
    info!("🔢 Weights: {}", encoding.name());
    if let Some(context) = context {
        info!("📐 Context: {context}");
    }
    info!("");

    export_model(model_path, output_path, ExportOptions { encoding, context })
}

/// Run the inference command with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .min_p(matches.get_one::<f32>("min-p").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .mode(matches.get_one::<String>("mode"))
        .prompt(matches.get_one::<String>("input"))
        .prompt_file(matches.get_one::<String>("file"))
        .system_prompt(matches.get_one::<String>("system"))
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))
}

fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    let checkpoint = matches.get_one::<String>("checkpoint").ok_or_else(|| anyhow::anyhow!("Missing checkpoint"))?;
    inspect_checkpoint(checkpoint, &mut std::io::stdout().lock())
}

fn execute_commands() -> Result<()> {
    // Plain messages, no timestamp or module prefix
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("calm")
        .about("calm: converts and runs quantized decoder-only transformer models")
        .subcommand(run_subcommand())
        .subcommand(export_subcommand())
        .subcommand(inspect_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("run", matches)) => run_inference_command(matches),
        Some(("export", matches)) => run_export_command(matches),
        Some(("inspect", matches)) => run_inspect_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
