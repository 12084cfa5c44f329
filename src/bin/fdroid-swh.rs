use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use fdroid_swh::config::ConfigArgs;
use fdroid_swh::database::Database;
use fdroid_swh::index::{read_index, source_urls, IndexLoader, IndexUpdater};
use fdroid_swh::logging::LoggingArgs;
use fdroid_swh::service::{http_client, run_service};
use fdroid_swh::vcs::{GitValidator, ValidationPolicy};
use fdroid_swh::Result;

#[derive(Parser)]
#[command(version, about = "Archive F-Droid source repositories in Software Heritage")]
struct Args {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the archival service (default).
    Serve,

    /// Download the index and ingest it once.
    RefreshIndex,

    /// Print the distinct source URLs of the local index.
    ListSources {
        /// Write to this file instead of standard output.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Check whether a URL is a reachable git remote.
    Validate {
        url: String,
    },
}

async fn refresh_index(config: &ConfigArgs) -> Result<ExitCode> {
    let index = config.index_config()?;
    let notify = Arc::new(Notify::new());
    let updater = IndexUpdater::new(http_client()?, index.clone(), notify.clone());
    updater.download().await?;

    let db = Database::connect(&config.database_path).await?;
    let count = IndexLoader::new(db.clone(), index.path, notify).load().await?;
    db.close().await;
    tracing::info!(count, "packages ingested");
    Ok(ExitCode::SUCCESS)
}

async fn list_sources(config: &ConfigArgs, output: Option<PathBuf>) -> Result<ExitCode> {
    let packages = read_index(&config.index_path).await?;
    let text: String = source_urls(&packages)
        .into_iter()
        .map(|url| url + "\n")
        .collect();
    match output {
        Some(path) => tokio::fs::write(&path, text).await?,
        None => std::io::stdout().write_all(text.as_bytes())?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn validate(url: &str) -> Result<ExitCode> {
    let validator = GitValidator::new(http_client()?, ValidationPolicy::default());
    match validator.validate(url, &CancellationToken::new()).await {
        Ok(()) => {
            println!("{}: ok", url);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}: {}", url, e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = args.config.into_config()?;
            run_service(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::RefreshIndex => refresh_index(&args.config).await,
        Command::ListSources { output } => list_sources(&args.config, output).await,
        Command::Validate { url } => validate(&url).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    args.logging.init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(err = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
