use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tuxboot::adapters::{
    FixedPrompt, LinuxCredentialProvider, LsblkEnumerator, ProcTables, SimulatedCredentials,
    SimulatedEnumerator, SimulatedExecutor, StaticTables, TerminalPrompt,
};
use tuxboot::config::AppConfig;
use tuxboot::context::{Collaborators, RunContext};
use tuxboot::core::{DeviceEnumerator, Orchestrator, PipelineEvent, TargetDevice};
use tuxboot::logging::{self, LogConfig};

#[derive(Parser)]
#[command(name = "tuxboot")]
#[command(about = "Make a bootable USB drive from a Windows installation image", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Alternative config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Interpret privileged commands in-process instead of running them
    #[arg(long, global = true)]
    simulation: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached USB block devices
    Devices,
    /// Partition, format and populate a USB device
    Burn(BurnArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct BurnArgs {
    /// Whole-disk device path, e.g. /dev/sdb
    #[serde(skip)]
    #[arg(long)]
    device: Option<PathBuf>,

    /// Image file to copy onto the device
    #[serde(skip)]
    #[arg(long)]
    image: Option<PathBuf>,

    /// Unmount conflicting mounts without asking
    #[serde(skip)]
    #[arg(long, short)]
    yes: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    tmp_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    partition_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    volume_label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mbr_image: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    syslinux_modules: Option<PathBuf>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    sync_files: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Burn(args) => AppConfig::new(Some(args), cli.config.as_deref()),
        _ => AppConfig::new(None::<&BurnArgs>, cli.config.as_deref()),
    }
    .context("Failed to load configuration")?;

    logging::init(LogConfig::from(&config));

    match &cli.command {
        Commands::Devices => run_devices(cli.simulation).context("Failed to list devices")?,
        Commands::Burn(args) => run_burn(config, args, cli.simulation).await?,
        Commands::Config => {
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
    }

    Ok(())
}

fn enumerator(simulation: bool) -> Box<dyn DeviceEnumerator> {
    if simulation {
        Box::new(SimulatedEnumerator::with_usb_device("/tmp/tuxboot-sim-device", "8G"))
    } else {
        Box::new(LsblkEnumerator)
    }
}

fn run_devices(simulation: bool) -> Result<()> {
    let devices = enumerator(simulation).usb_devices()?;
    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }
    for device in devices {
        println!("{:<16} {}", device.name, device.label());
    }
    Ok(())
}

/// Match `--device` against the enumerated USB devices.
fn resolve_device(path: Option<&PathBuf>, simulation: bool) -> Result<Option<TargetDevice>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if simulation {
        return Ok(Some(TargetDevice {
            path: path.clone(),
            model: "Simulated Flash".to_string(),
            size: "8G".to_string(),
            transport: "usb".to_string(),
        }));
    }

    let devices = enumerator(simulation).usb_devices()?;
    match devices.into_iter().find(|d| PathBuf::from(&d.name) == *path) {
        Some(device) => Ok(Some(device.into_target())),
        None => bail!("{} is not an attached USB device", path.display()),
    }
}

fn collaborators(simulation: bool, assume_yes: bool) -> Collaborators {
    if simulation {
        let executor = Arc::new(SimulatedExecutor::new());
        return Collaborators {
            credentials: Arc::new(SimulatedCredentials::new(executor)),
            prompt: Arc::new(FixedPrompt::new(assume_yes)),
            tables: Arc::new(StaticTables::default()),
        };
    }

    Collaborators {
        credentials: Arc::new(LinuxCredentialProvider),
        prompt: Arc::new(TerminalPrompt { assume_yes }),
        tables: Arc::new(ProcTables),
    }
}

async fn run_burn(config: AppConfig, args: &BurnArgs, simulation: bool) -> Result<()> {
    let device = resolve_device(args.device.as_ref(), simulation)?;
    let ctx = RunContext::new(config, device, args.image.clone());
    let (orchestrator, mut events) = Orchestrator::new(ctx, collaborators(simulation, args.yes));

    let cancel = orchestrator.cancellation_token();
    let handle = orchestrator.spawn();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => render(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                eprintln!("Interrupt received, stopping after the current stage...");
                cancel.cancel();
            }
        }
    }

    let summary = handle.await.context("Pipeline task panicked")??;
    println!(
        "Copied {} files ({} bytes) in {}s",
        summary.files_copied, summary.bytes_copied, summary.elapsed_secs
    );
    Ok(())
}

fn render(event: &PipelineEvent) {
    match event {
        PipelineEvent::Status(text) => println!("{}", text),
        PipelineEvent::Percent(percent) => println!("[{:>3}%]", percent),
        PipelineEvent::Degraded(reason) => eprintln!("warning: {}", reason),
        PipelineEvent::Failed { message, .. } => eprintln!("error: {}", message),
        PipelineEvent::State(state) => tracing::debug!(%state, "Pipeline state"),
        PipelineEvent::Step(_) | PipelineEvent::Controls { .. } | PipelineEvent::Completed => {}
    }
}
