use clap::Parser;
use eipflow::config::ConfigManager;

mod cli;

use cli::{Cli, CliContext, Commands};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let context = CliContext::new(ConfigManager::env(Some(cli.env_file)));

    match cli.command {
        Commands::Run(args) => cli::run::execute(args, &context).await,
        Commands::Validate(args) => cli::validate::execute(args, &context).await,
        Commands::Schema(args) => cli::schema::execute(args).await,
    }
}
