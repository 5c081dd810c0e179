//! ficsync entry point.

use clap::Parser;
use ficsync::{
    AppState, BatchScheduler, Calibre, UpdateProcessor,
    config::{CalibreArgs, Cli, Command, Config, ServeArgs},
    process::{CommandRunner, ProcessRunner},
    scheduler, server,
    updater::{FanFicFare, SiteRegistry},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = format!(
        "ficsync={},tower_http=info",
        cli.log_level().as_str().to_lowercase()
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        tracing::debug!(path = %path.display(), "Loading config");
        Config::load(path)?
    } else {
        Config::default()
    };

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Sites(args)) => cmd_sites(config, args).await,
        Some(Command::List(args)) => cmd_list(config, args).await,
        Some(Command::Serve(args)) => cmd_serve(config, args).await,
        None => cmd_serve(config, ServeArgs::default()).await,
    }
}

/// Write a default config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());
    println!("\nEdit config.toml to point at your Calibre library.");
    println!("Then run: ficsync serve");

    Ok(())
}

/// Build a Calibre handle with every path known.
async fn open_calibre(config: &Config) -> anyhow::Result<Calibre> {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let mut calibre = Calibre::from_config(&config.calibre, runner);
    calibre.find_paths().await?;

    tracing::info!(
        settings = ?calibre.settings,
        library = ?calibre.library,
        "Using Calibre"
    );
    Ok(calibre)
}

/// Print every site the updater supports.
async fn cmd_sites(mut config: Config, args: CalibreArgs) -> anyhow::Result<()> {
    args.apply(&mut config.calibre);
    let calibre = Arc::new(open_calibre(&config).await?);
    let sites = SiteRegistry::discover(&FanFicFare::new(calibre)).await?;

    for domain in sites.sorted() {
        println!("{}", domain);
    }
    Ok(())
}

/// Print the books in the library.
async fn cmd_list(mut config: Config, args: CalibreArgs) -> anyhow::Result<()> {
    args.apply(&mut config.calibre);
    let calibre = open_calibre(&config).await?;
    let books = calibre.list_books().await?;

    if books.is_empty() {
        println!("No books found.");
        return Ok(());
    }

    println!("{:<6} {:<40} {:<24} URL", "ID", "TITLE", "AUTHORS");
    println!("{}", "-".repeat(100));
    for book in books {
        let url = book
            .source_url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<40} {:<24} {}",
            book.id,
            book.title,
            book.authors_display(),
            url
        );
    }
    Ok(())
}

/// Serve the catalog and run update cycles until interrupted.
async fn cmd_serve(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    args.apply(&mut config);

    let calibre = Arc::new(open_calibre(&config).await?);
    let state = AppState::new(config.clone(), Arc::clone(&calibre));

    // Nothing to serve without a first snapshot.
    state.refresh().await?;
    tracing::info!(books = state.book_count(), "Loaded library");

    let fanficfare = FanFicFare::new(Arc::clone(&calibre));
    let sites = SiteRegistry::discover(&fanficfare).await?;
    let processor = Arc::new(UpdateProcessor::new(fanficfare, Arc::new(sites)));

    let batches = BatchScheduler::new(config.update.batch_size, config.update.interval);
    tracing::info!(
        bind = %config.server.bind,
        batch_size = batches.batch_size,
        interval = %humantime::format_duration(batches.interval),
        "Starting ficsync"
    );

    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let source = Arc::new(state.clone());
        let token = token.clone();
        tasks.spawn(async move { batches.run(source, processor, token).await });
    }

    tasks.spawn(server::serve(state, config.server.bind, token.clone()));

    {
        let token = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("Shutting down...");
                        token.cancel();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not listen for interrupt");
                        token.cancelled().await;
                    }
                },
                _ = token.cancelled() => {}
            }
            Ok(())
        });
    }

    scheduler::supervise(tasks, token).await?;
    tracing::info!("Stopped");
    Ok(())
}
