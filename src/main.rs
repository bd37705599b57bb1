// src/main.rs - studytrack entry point

use clap::Parser;

use studytrack::cli::{self, Cli, Commands, Context};
use studytrack::gateway::cache::DashboardCache;
use studytrack::infra::config::Config;
use studytrack::infra::{logger, paths};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Respects RUST_LOG / STUDYTRACK_LOG; -v raises the default level
    logger::init_logging(logger::level_for_verbosity(cli.verbose));

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(std::path::Path::new(path))?,
        None => Config::load()?,
    };
    paths::ensure_dirs().await?;
    tracing::debug!(base_url = %config.api.base_url, "Configuration loaded");

    let ctx = Context::new(config, DashboardCache::default());

    match &cli.command {
        Commands::Status { offline } => cli::status::show_status(&ctx, *offline).await,
        Commands::ClockIn { location, lat, lon } => {
            let coords = lat.zip(*lon);
            cli::clock::clock_in(&ctx, *location, coords).await
        }
        Commands::ClockOut => cli::clock::clock_out(&ctx).await,
        Commands::Watch { ticks } => cli::watch::run_watch(&ctx, *ticks).await,
        Commands::Sessions { action } => cli::sessions::run_sessions(&ctx, action).await,
        Commands::Login { email, password } => cli::auth::login(&ctx, email, password).await,
        Commands::Logout => cli::auth::logout(&ctx).await,
    }
}
