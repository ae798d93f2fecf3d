mod cli;

use castrec::{
    config,
    lifecycle::Shutdown,
    resolver::HttpStreamResolver,
    scheduler::{CronDriver, CronEntry, Jitter, RetryDriver, RetryOutcome},
    session::{RecordJob, Recorder, RecorderSettings},
    sink::Finalizer,
    title::PageTitleLookup,
    transport::{WsTransport, CONNECT_TIMEOUT},
    upload::{R2Uploader, Uploader},
};
use castrec_av::FfmpegTranscoder;
use castrec_common::BroadcasterId;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "castrec=trace,castrec_av=trace,castrec_common=debug".to_string()
        } else {
            "castrec=info,castrec_av=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command.unwrap_or(Commands::Croned) {
        Commands::Croned => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_croned(cli.config.as_deref()))
        }
        Commands::Direct {
            streamer,
            retries,
            retry_backoff,
            encode_option,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_direct(
                cli.config.as_deref(),
                &streamer,
                retries,
                retry_backoff,
                encode_option,
            ))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("castrec {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Everything a recording run needs, built from config.
struct Engine {
    shutdown: Shutdown,
    finalizer: Finalizer,
    recorder: Arc<Recorder>,
}

fn build_engine(config: &config::Config) -> Engine {
    let shutdown = Shutdown::new(Duration::from_secs(config.scheduler.grace_period_secs));

    let transcoder = FfmpegTranscoder::discover(config.tools.ffmpeg_path.as_deref())
        .with_timeout(Duration::from_secs(config.tools.transcode_timeout_secs));
    tracing::debug!(ffmpeg = %transcoder.program().display(), "Using transcoder");

    let uploader: Option<Arc<dyn Uploader>> = match config.active_r2() {
        Some(r2) => match R2Uploader::new(r2) {
            Ok(uploader) => {
                tracing::info!(bucket = %r2.bucket, "Upload to R2 enabled");
                Some(Arc::new(uploader))
            }
            Err(e) => {
                tracing::warn!("Invalid R2 configuration: {}. Upload will be disabled.", e);
                None
            }
        },
        None => None,
    };

    let finalizer = Finalizer::new(Arc::new(transcoder), uploader, shutdown.clone());

    let settings = RecorderSettings {
        base_dir: config.recording.base_dir.clone(),
        max_stem_chars: config.recording.filename_max_chars,
        min_viable_bytes: config.recording.min_viable_bytes,
        connect_timeout: CONNECT_TIMEOUT,
    };

    let recorder = Recorder::new(
        Arc::new(HttpStreamResolver::new(config.origin.api_endpoint.clone())),
        Arc::new(PageTitleLookup::new(&config.origin.page_base_url)),
        Arc::new(WsTransport::new(config.origin.page_base_url.clone())),
        finalizer.clone(),
        shutdown.clone(),
    )
    .with_credential(config.credential())
    .with_settings(settings);

    Engine {
        shutdown,
        finalizer,
        recorder: Arc::new(recorder),
    }
}

async fn run_croned(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    tracing::info!(pid = std::process::id(), "Starting in recording mode [croned]");

    if config.streamers.is_empty() {
        tracing::info!("No streamers configured for croned mode. Exiting.");
        return Ok(());
    }

    let entries = config
        .streamers
        .iter()
        .map(|streamer| {
            let schedule = streamer
                .schedule
                .as_deref()
                .with_context(|| format!("Streamer {:?} has no schedule", streamer.screen_id))?;
            let job = RecordJob::new(
                BroadcasterId::parse(&streamer.screen_id)?,
                streamer.encode_option.clone(),
            );
            CronEntry::new(job, schedule)
                .with_context(|| format!("Failed adding record schedule for {:?}", streamer.screen_id))
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = build_engine(&config);
    let jitter = Jitter::new(
        Duration::from_secs(config.scheduler.jitter_min_secs),
        Duration::from_secs(config.scheduler.jitter_max_secs),
    );
    let driver = Arc::new(CronDriver::new(
        engine.recorder.clone(),
        entries,
        jitter,
        engine.shutdown.clone(),
    ));

    let watcher = engine.shutdown.spawn_signal_watcher();

    // interrupt => stop firing and drain running jobs => wait out the grace period
    driver.run().await;
    engine.shutdown.grace_complete().await;
    let _ = watcher.await;

    anyhow::bail!("Terminated on user interrupt")
}

async fn run_direct(
    config_path: Option<&Path>,
    streamer: &str,
    retries: u32,
    retry_backoff: Duration,
    encode_option: Option<String>,
) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    tracing::info!(pid = std::process::id(), "Starting in recording mode [direct]");

    let broadcaster = BroadcasterId::parse(streamer).context("Please provide a valid streamer")?;
    // Fall back to the configured encode option for this streamer, if any.
    let encode_option = encode_option.or_else(|| {
        config
            .streamers
            .iter()
            .find(|s| s.screen_id.trim() == broadcaster.as_str())
            .and_then(|s| s.encode_option.clone())
    });
    let job = RecordJob::new(broadcaster, encode_option);

    let engine = build_engine(&config);
    let watcher = engine.shutdown.spawn_signal_watcher();

    let outcome = RetryDriver::new(engine.recorder.clone(), engine.shutdown.clone())
        .with_retries(retries)
        .with_backoff(retry_backoff)
        .run(&job)
        .await;

    if let RetryOutcome::Interrupted { .. } = outcome {
        let _ = watcher.await;
        anyhow::bail!("Terminated on user interrupt");
    }

    tokio::select! {
        _ = engine.finalizer.wait_idle() => {}
        _ = engine.shutdown.grace_complete() => {
            anyhow::bail!("Terminated on user interrupt");
        }
    }

    // Release the signal watcher.
    engine.shutdown.root_token().cancel();
    let _ = watcher.await;
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {:#}", e);
        config::Config::default()
    });

    let tools = castrec_av::check_tools(config.tools.ffmpeg_path.as_deref());
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Recordings will be kept as raw .ts files.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            for streamer in &config.streamers {
                if let Some(schedule) = &streamer.schedule {
                    castrec::scheduler::parse_schedule(schedule).with_context(|| {
                        format!("Invalid schedule for streamer {:?}", streamer.screen_id)
                    })?;
                }
            }
            println!("✓ Configuration is valid");
            println!("  Recording dir: {}", config.recording.base_dir.display());
            println!("  Streamers: {}", config.streamers.len());
            println!(
                "    Scheduled: {}",
                config.streamers.iter().filter(|s| s.schedule.is_some()).count()
            );
            println!("  Credential configured: {}", config.credential().is_some());
            println!("  Upload enabled: {}", config.active_r2().is_some());
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Recording dir: {}", config.recording.base_dir.display());
            println!("  Status endpoint: {}", config.origin.api_endpoint);
        }
    }

    Ok(())
}
