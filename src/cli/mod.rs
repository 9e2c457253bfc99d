use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod run;
pub mod schema;
pub mod validate;

use run::RunArgs;
use schema::SchemaArgs;
use validate::ValidateArgs;

use eipflow::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "eipflow",
    about = "Message flow pipelines: poll, transform, filter, split, aggregate, deliver",
    version
)]
pub struct Cli {
    /// `.env` file used to resolve `${KEY}` placeholders in flow files
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a flow until interrupted
    Run(RunArgs),

    /// Check that a flow file loads and assembles
    Validate(ValidateArgs),

    /// Emit the flow file JSON-Schema
    Schema(SchemaArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }
}
