use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod dispatcher;
mod inference;
mod overlay;
mod pipeline;
mod render;
mod shutdown;
mod uplink;
mod verifier;

use config::Config;
use render::RenderExit;
use shutdown::Shutdown;

#[derive(Parser)]
#[command(name = "gatewatchd", about = "Edge face-verification camera daemon")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true, env = "GATEWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, verify and stream until interrupted (default)
    Run {
        /// Also write the latest annotated frame to this JPEG file
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Print the effective configuration as TOML
    Config,
    /// Load the models, open the camera and grab one frame, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run { preview: None });

    match command {
        Commands::Devices => {
            let devices = gatewatch_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
        Commands::Config => {
            let config = Config::load(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Check => {
            let config = Config::load(cli.config.as_deref())?;
            tokio::task::spawn_blocking(move || check(&config)).await?
        }
        Commands::Run { preview } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if preview.is_some() {
                config.preview_path = preview;
            }
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        camera = %config.camera_device,
        source_id = %config.source_id,
        "gatewatchd starting"
    );

    let shutdown = Shutdown::new();
    let runtime = tokio::runtime::Handle::current();
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();

    let pipeline_shutdown = shutdown.clone();
    std::thread::Builder::new()
        .name("gatewatch-render".into())
        .spawn(move || {
            let result = pipeline::run(&config, &runtime, pipeline_shutdown);
            let _ = done_tx.send(result);
        })
        .context("failed to spawn pipeline thread")?;

    let result = tokio::select! {
        result = &mut done_rx => result,
        _ = wait_for_signal() => {
            tracing::info!("shutdown requested");
            shutdown.trigger();
            done_rx.await
        }
    };

    match result.context("pipeline thread exited without reporting")?? {
        RenderExit::Shutdown => {
            tracing::info!("gatewatchd stopped");
            Ok(())
        }
        RenderExit::SourceFailed => bail!("camera stopped delivering frames"),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
}

fn check(config: &Config) -> Result<()> {
    gatewatch_core::OnnxFaceAnalyzer::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("model check failed")?;
    println!("models: ok ({})", config.model_dir.display());

    let source = pipeline::probe_camera(config)
        .with_context(|| format!("camera check failed for {}", config.camera_device))?;
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(frame) = source.read() {
            println!(
                "camera: ok ({}x{}, mean brightness {:.1})",
                frame.width,
                frame.height,
                frame.mean_luminance()
            );
            return Ok(());
        }
        if source.has_failed() || Instant::now() >= deadline {
            bail!("camera opened but delivered no frames");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
