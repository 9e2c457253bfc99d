use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use eipflow::{FlowConfig, HandlerRegistry};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Flow file (`.yaml`, `.yml` or `.json`)
    pub file: PathBuf,
}

pub async fn execute(args: ValidateArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = FlowConfig::load(&args.file, &context.config_manager).await?;
    let flow = config.build(&HandlerRegistry::new())?;
    println!("✅ Flow `{}` is valid.", flow.name());
    for stage in flow.stage_names() {
        println!("  stage   {}", stage);
    }
    for channel in flow.channel_names() {
        println!("  channel {}", channel);
    }
    Ok(())
}
