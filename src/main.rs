use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use media_downloader_lib::cli::{Args, Commands};
use media_downloader_lib::config::ServiceConfig;
use media_downloader_lib::downloader::job::JobOptions;
use media_downloader_lib::http;
use media_downloader_lib::service::{DownloadService, JobResult};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_logging(args.verbose)?;

    let (config, source) = ServiceConfig::discover(args.config.as_deref())?;
    match &source {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    match args.command {
        None => serve(config.for_serving(None)?).await,
        Some(Commands::Serve { bind }) => serve(config.for_serving(bind)?).await,
        Some(Commands::Run { url, mode, options }) => {
            let service = DownloadService::from_config(&config);
            let options = JobOptions::from_pairs(options);
            match service.submit_job(&url, &mode, &options).await? {
                JobResult::Metadata(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                JobResult::Filtered { reason } => println!("Skipped: {}", reason),
                JobResult::Artifact(artifact) => {
                    println!("{}", artifact.path().display());
                    artifact.finish();
                }
            }
            Ok(())
        }
    }
}

async fn serve(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.bind_addr()?;
    let service = Arc::new(DownloadService::from_config(&config));
    info!(
        output_dir = %config.output_dir.display(),
        retention = ?config.retention,
        "listening on http://{}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http::router(service)).await?;
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}
