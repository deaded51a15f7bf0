use anyhow::{Context, Error};
use clap::Parser;

use imgq::archive::ARCHIVE_NAME;
use imgq::formats::format_file_size;
use imgq::{telemetry, ImageCodec, ItemView, OutputFormat, QueueConfig, QueueEvent, QueueHandle};
use imgq::{Settings, SourceFile, Status};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, instrument, warn};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(required = true, help = "Images to optimize (jpeg, png or webp)")]
    inputs: Vec<PathBuf>,

    #[arg(
        short = 'f',
        long = "format",
        help = "Output format: webp, avif, jpeg or png",
        default_value = "webp"
    )]
    format: OutputFormat,

    #[arg(
        short = 'q',
        long = "quality",
        help = "Encoder quality (1-100), used by jpeg and avif",
        default_value = "80",
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    quality: u8,

    #[arg(
        short = 'o',
        long = "output",
        help = "Archive of all optimized images",
        default_value = ARCHIVE_NAME
    )]
    output: PathBuf,

    #[arg(
        long = "resize",
        help = "Also export every image at a device width (mobile, tablet, laptop, desktop)"
    )]
    resize: Option<String>,

    #[arg(long = "timeout_secs", help = "Give up on a single image after this many seconds")]
    timeout_secs: Option<u64>,

    #[arg(long = "jaeger_endpoint", help = "Jaeger collector URL for trace export")]
    jaeger_endpoint: Option<String>,

    #[arg(long = "json", help = "Print the item summary as JSON")]
    json: bool,

    #[arg(short = 'v', long = "verbose", help = "Debug logging")]
    verbose: bool,
}

#[instrument(skip(cancel_token, config))]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let queue_config = QueueConfig {
        initial_settings: Settings::new(config.format, config.quality),
        transform_timeout: config.timeout_secs.map(Duration::from_secs),
        ..QueueConfig::default()
    };

    let (handle, mut recv_from_server, server_spawn) =
        QueueHandle::spawn(cancel_token.clone(), queue_config, Arc::new(ImageCodec));

    let mut files = Vec::with_capacity(config.inputs.len());
    for path in &config.inputs {
        match SourceFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(err) => warn!("Skipping input: {}", err),
        }
    }

    let report = handle.upload(files)?;
    for rejected in &report.rejected {
        warn!("Skipping input: {}", rejected);
    }
    info!(accepted = report.accepted.len(), rejected = report.rejected.len(), "Uploaded");

    if !report.accepted.is_empty() {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Setup Cancelled");
                    break;
                },
                server_event = recv_from_server.recv() => {
                    match server_event {
                        Some(QueueEvent::Idle) => break,
                        Some(QueueEvent::Failed(id, message)) => warn!(event = "Failed", item_id = %id, error = %message),
                        Some(event) => debug!(event = "Message", msg = ?event),
                        None => {
                            debug!("Coordinator connection closed unexpectedly, exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    if !cancel_token.is_cancelled() {
        let items = handle.items().await?;
        print_summary(&items, config.json)?;

        match handle.download_all().await? {
            Some(archive) => {
                tokio::fs::write(&config.output, &archive)
                    .await
                    .with_context(|| format!("Failed to write {}", config.output.display()))?;
                info!("Wrote {} ({})", config.output.display(), format_file_size(archive.len() as u64));
            }
            None => warn!("No optimized images to archive"),
        }

        if let Some(device) = &config.resize {
            let out_dir = config
                .output
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            for item in items.iter().filter(|item| item.status == Status::Done) {
                let export = handle.export_resized(item.id, device).await?;
                let path = out_dir.join(&export.file_name);
                tokio::fs::write(&path, &export.bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Wrote {} ({}px wide)", path.display(), export.width);
            }
        }
    }

    cancel_token.cancel();
    server_spawn.await??;

    Ok(())
}

fn print_summary(items: &[ItemView], json: bool) -> Result<(), Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }

    for item in items {
        match item.status {
            Status::Done => {
                let format = item.result_format.map(|f| f.to_string()).unwrap_or_default();
                let quality = match item.result_quality {
                    Some(quality) if item.quality_applies => format!(" q{}", quality),
                    _ => String::new(),
                };
                println!(
                    "{:<32} {:>10} -> {:>10}  {}x{} {}{}",
                    item.name,
                    format_file_size(item.original_size),
                    format_file_size(item.result_size.unwrap_or_default()),
                    item.width,
                    item.height,
                    format,
                    quality,
                )
            }
            Status::Error => println!(
                "{:<32} {:>10}  error: {}",
                item.name,
                format_file_size(item.original_size),
                item.error.as_deref().unwrap_or("Processing failed"),
            ),
            status => println!("{:<32} {:?}", item.name, status),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    let level = if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    telemetry::init(level, config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!("Failed to install signal handlers: {}", err);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    telemetry::shutdown();

    Ok(())
}
