use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use common::utils::{format_duration, truncate_string};
use compiler::read_manifest;
use device_runtime::Device;
use fastpath::cli::{Cli, Command, OptimizeArgs};
use fastpath::{measure_calls, optimize_reference};
use pipeline_config::{ConfigManager, LogFormat, Settings};

const TIMED_CALLS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigManager::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.json_logs {
        config.settings_mut().log.format = LogFormat::Json;
    }
    let _logging = logging::init(&config.settings().log).context("failed to initialize logging")?;

    match cli.command {
        Command::Optimize(args) => optimize(config.settings().clone(), &args).await,
        Command::Inspect { artifact } => inspect(&artifact),
    }
}

async fn optimize(mut settings: Settings, args: &OptimizeArgs) -> Result<()> {
    args.apply(&mut settings);
    info!("Using cache directory {}", settings.cache_dir.display());

    let device = Device::host();
    let stream = device.new_stream();
    let optimized = optimize_reference(&settings, &device, &stream).await?;

    if args.json {
        println!("{}", optimized.report().to_json()?);
        return Ok(());
    }

    println!("{}", optimized.report());
    println!();
    println!(
        "{:<12} {:>12} {:>12} {:>12}",
        "stage", "eager first", "eager", "optimized"
    );
    for timing in measure_calls(&device, &stream, settings.variant, &optimized, TIMED_CALLS)? {
        println!(
            "{:<12} {:>12} {:>12} {:>12}",
            truncate_string(&timing.stage, 12),
            format_duration(timing.eager_first),
            format_duration(timing.eager_steady),
            format_duration(timing.optimized_steady),
        );
    }
    Ok(())
}

fn inspect(path: &std::path::Path) -> Result<()> {
    let manifest = read_manifest(path).with_context(|| format!("failed to read {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}
