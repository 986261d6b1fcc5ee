use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hyvid_core::{select_best_device, Orchestrator};
use hyvid_server::{Args, FfmpegWriter, SubprocessFactory};
use tokio::{self, net::TcpListener};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Startup check only: generators open their own device from LOCAL_RANK,
    // so this fails fast on an ordinal the host cannot serve.
    let device = select_best_device(args.device_map()).context("failed to set up device")?;
    log::info!("generation device: {device:?}");

    let factory = SubprocessFactory::new(args.generator.clone(), args.generator_args.clone());
    let writer = FfmpegWriter::new(args.ffmpeg.clone(), args.fps);
    let orchestrator = Orchestrator::new(args.service_config(), Arc::new(factory), Arc::new(writer));

    let health = orchestrator.health();
    if !health.ready {
        log::warn!(
            "model root {} is missing: {}",
            args.model_path.display(),
            health.missing_artifacts.join(", ")
        );
    }

    // --- Build axum router with shared state ---
    let app = hyvid_server::app(Arc::new(orchestrator));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    log::info!("started server on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("shutting down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
