//! Command-line front end for the Polyrun execution engine
//!
//! Runs a single function invocation from a manifest file and prints the
//! `ExecutionResult` as JSON. Also exposes the generated harness for a handler
//! and a `doctor` check of the sandbox engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use polyrun_core::config::{ConfigLoader, EngineConfig};
use polyrun_core::harness::{HandlerPath, HarnessGenerator};
use polyrun_core::sandbox::{DockerEngine, HardenedBackend};
use polyrun_core::{
    ExecutionEngine, InvocationOptions, LogFacade, Runtime, VirtualizationTechnology,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

mod manifest;

#[derive(Parser, Debug)]
#[clap(name = "polyrun", author, version, about = "Polyrun - run functions in isolated sandboxes")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "Engine configuration file (YAML)")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Invoke a function once and print the result
    Run {
        #[clap(long, short, help = "Function manifest (YAML or JSON)")]
        function: PathBuf,

        #[clap(long, short, help = "Input payload as a JSON string", conflicts_with = "input_file")]
        input: Option<String>,

        #[clap(long, help = "Read the input payload from a JSON file")]
        input_file: Option<PathBuf>,

        #[clap(long, short = 't', default_value = "standard", help = "Virtualization technology: standard (docker) or hardened (gvisor)")]
        technology: String,

        #[clap(long, help = "Override the function timeout in seconds")]
        timeout: Option<u32>,

        #[clap(long, help = "Override the function memory limit in MB")]
        memory: Option<u32>,
    },
    /// Print the harness generated for a handler
    Harness {
        #[clap(long, short)]
        runtime: String,

        #[clap(long)]
        handler: Option<String>,
    },
    /// Check that the sandbox engine and hardened runtime are available
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    match cli.command {
        Commands::Run {
            function,
            input,
            input_file,
            technology,
            timeout,
            memory,
        } => {
            let config = load_config(cli.config).await?;
            let options = invocation_options(&technology, timeout, memory)?;
            let input = read_input(input, input_file).await?;
            run_function(config, function, input, options).await
        }
        Commands::Harness { runtime, handler } => print_harness(&runtime, handler),
        Commands::Doctor => {
            let config = load_config(cli.config).await?;
            doctor(config).await
        }
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let path = path.or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("polyrun").join("config.yaml"))
            .filter(|candidate| candidate.exists())
    });

    let config = match path {
        Some(path) => {
            log::info!("Loading configuration from file: {}", path.display());
            ConfigLoader::from_file(&path).await?
        }
        None => {
            log::info!("No configuration file found, using defaults and environment");
            ConfigLoader::from_env()?
        }
    };
    Ok(config)
}

fn invocation_options(
    technology: &str,
    timeout: Option<u32>,
    memory: Option<u32>,
) -> Result<InvocationOptions> {
    let technology: VirtualizationTechnology = technology.parse()?;
    let mut options = InvocationOptions::new(technology);
    options.timeout_seconds = timeout;
    options.memory_mb = memory;
    Ok(options)
}

async fn read_input(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(inline), _) => inline,
        (None, Some(file)) => tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read input file {}", file.display()))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    serde_json::from_str(&raw).context("Input payload is not valid JSON")
}

async fn run_function(
    config: EngineConfig,
    function: PathBuf,
    input: Value,
    options: InvocationOptions,
) -> Result<()> {
    let spec = manifest::load_function(&function).await?;
    log::info!(
        "Invoking function '{}' ({}) with handler {}",
        spec.name,
        spec.runtime,
        spec.handler
    );

    let engine = ExecutionEngine::connect(config, Arc::new(LogFacade))?;
    let result = engine.execute(&spec, &input, &options).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_harness(runtime: &str, handler: Option<String>) -> Result<()> {
    let runtime: Runtime = runtime.parse()?;
    let handler = handler.unwrap_or_else(|| format!("{}.handler", runtime.entry_stem()));
    let handler = HandlerPath::parse(runtime, &handler)?;

    let generator = HarnessGenerator::new();
    let harness = generator.generate(runtime, &handler);
    println!("# {}", harness.file_name);
    println!("{}", harness.source);
    Ok(())
}

async fn doctor(config: EngineConfig) -> Result<()> {
    let docker = DockerEngine::connect(config.sandbox.clone(), Arc::new(LogFacade))?;

    if !docker.ping().await {
        println!("docker: unreachable");
        std::process::exit(1);
    }
    println!("docker: ok");

    let hardened = HardenedBackend::new(Arc::new(docker), config.docker.hardened_runtime.clone());
    match hardened.runtime_available().await {
        Ok(true) => println!("hardened runtime '{}': installed", hardened.runtime()),
        Ok(false) => println!(
            "hardened runtime '{}': not installed (hardened invocations run degraded)",
            hardened.runtime()
        ),
        Err(e) => println!("hardened runtime '{}': unknown ({})", hardened.runtime(), e),
    }

    println!("workspace root: {}", config.workspace_root.display());
    println!("images: {} / {}", config.images.javascript, config.images.python);
    Ok(())
}
