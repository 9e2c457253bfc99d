use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use eipflow::{
    logger::{init_tracing, LogSettings},
    FlowConfig, HandlerRegistry,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Flow file (`.yaml`, `.yml` or `.json`)
    pub file: PathBuf,

    /// Log filter (e.g. error, warn, info, debug, trace or `eipflow=debug`)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write daily rolling log files into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// OTLP/HTTP collector for logs and metrics (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Log JSON lines to stdout
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = LogSettings {
        log_level: args.log_level,
        log_dir: args.log_dir,
        otel_endpoint: args.otel_endpoint,
        json: args.json_logs,
    };
    let telemetry = init_tracing(&settings).context("could not initialise logging")?;

    let result = run_flow(&args.file, context).await;
    if let Err(e) = &result {
        error!("flow failed: {:#}", e);
    }
    telemetry.shutdown();
    result
}

async fn run_flow(file: &Path, context: &CliContext) -> anyhow::Result<()> {
    let config = FlowConfig::load(file, &context.config_manager).await?;
    let flow = config.build(&HandlerRegistry::new())?;

    flow.start().await?;
    info!(flow = %flow.name(), "running, press Ctrl-C to stop");
    println!("Flow `{}` running. Press Ctrl-C to stop.", flow.name());

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!(flow = %flow.name(), "interrupt received, stopping");
    flow.stop().await?;

    let metrics = flow.metrics();
    info!(
        flow = %flow.name(),
        received = metrics.received,
        delivered = metrics.delivered,
        discarded = metrics.discarded,
        failed = metrics.failed,
        "flow stopped"
    );
    Ok(())
}
