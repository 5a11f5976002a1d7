use anyhow::Result;
use clap::Parser;
use discord_bridge::cli::{self, Command};
use discord_bridge::config::ConfigStore;
use discord_bridge::Args;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args);

    let store = ConfigStore::open(args.config_path())?;

    match args.command {
        Command::Run => cli::run_bridge(store).await,
        command => {
            let output = cli::execute(command, store).await?;
            print!("{}", output);
            Ok(())
        }
    }
}
