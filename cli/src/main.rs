use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use speedtrap_core::{
    config::{DEFAULT_CONFIG_PATH, Settings},
    detection::{DetectionSource, load_detector},
    dispatch::{RunLayout, ViolationDispatcher},
    error::ErrorKind,
    estimation::OnnxSpeedRegressor,
    ledger::Ledger,
    logging::{DailyLog, operational_layer},
    notify::{LogNotifier, Notifier, SmtpNotifier},
    pipeline::{PipelineOptions, PipelineSummary, SpeedPipeline},
    runtime::configure_ort_dylib,
    tracking::{IdentityTracker, TrackedDetector},
    video::{ClipEncoder, FfmpegClipWriter, VideoSource, probe, total_frames},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "speedtrap",
    version,
    about = "Vehicle speed estimation and violation reporting from video",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track vehicles in a video or stream and report speed violations.
    Run {
        /// Input video path or stream URI (rtsp://, http://, ...)
        #[arg(short, long)]
        source: String,

        /// Settings file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Finalize tracks still active when the source ends
        #[arg(long)]
        flush_pending: bool,

        /// Log alerts instead of emailing them
        #[arg(long)]
        no_email: bool,

        /// Do not write the full-run recording
        #[arg(long)]
        no_record: bool,
    },

    /// Print resolution, frame rate and approximate frame count.
    Probe {
        /// Input video path or stream URI
        #[arg(short, long)]
        input: String,
    },

    /// Load, validate and print the resolved settings.
    CheckConfig {
        /// Settings file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

struct RunArgs {
    source: String,
    flush_pending: bool,
    no_email: bool,
    no_record: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            config,
            flush_pending,
            no_email,
            no_record,
        } => {
            let (settings, loaded) = resolve_settings(&config)?;
            init_tracing(Some(&settings.output.log_dir))?;
            report_config_source(&config, loaded);
            let args = RunArgs {
                source,
                flush_pending: flush_pending || settings.pipeline.flush_pending,
                no_email,
                no_record,
            };
            configure_ort_dylib();
            async_runtime()?.block_on(cmd_run(settings, args))
        }
        Commands::Probe { input } => {
            init_tracing(None)?;
            async_runtime()?.block_on(cmd_probe(input))
        }
        Commands::CheckConfig { config } => {
            init_tracing(None)?;
            let (settings, loaded) = resolve_settings(&config)?;
            report_config_source(&config, loaded);
            println!("{}", toml::to_string_pretty(&settings.redacted())?);
            Ok(())
        }
    }
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Stderr honours RUST_LOG (default info); errors also go to the daily log.
fn init_tracing(log_dir: Option<&Path>) -> Result<()> {
    let stderr = fmt::layer().with_writer(std::io::stderr).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let daily = match log_dir {
        Some(dir) => Some(operational_layer(DailyLog::new(dir).with_context(|| {
            format!("failed to create log directory {}", dir.display())
        })?)),
        None => None,
    };
    tracing_subscriber::registry().with(stderr).with(daily).init();
    Ok(())
}

/// Load the file (a missing default file means built-in defaults), overlay
/// the environment and validate.
fn resolve_settings(path: &Path) -> Result<(Settings, bool)> {
    let loaded = path.is_file();
    let mut settings = if loaded {
        Settings::load(path)?
    } else if path == Path::new(DEFAULT_CONFIG_PATH) {
        Settings::default()
    } else {
        anyhow::bail!("config file not found: {}", path.display());
    };
    settings.apply_env()?;
    settings.validate().context("invalid settings")?;
    Ok((settings, loaded))
}

fn report_config_source(path: &Path, loaded: bool) {
    if loaded {
        info!(path = %path.display(), "settings loaded");
    } else {
        warn!(path = %path.display(), "settings file not found; using defaults");
    }
}

// ── run ───────────────────────────────────────────────────────────────────────

async fn cmd_run(settings: Settings, args: RunArgs) -> Result<()> {
    info!("speedtrap run");
    info!("  source : {}", args.source);
    info!("  output : {}", settings.output.footage_dir.display());

    let cancel = Arc::new(AtomicBool::new(false));
    let on_signal = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current frame");
            on_signal.store(true, Ordering::SeqCst);
        }
    });

    let summary = task::spawn_blocking(move || run_pipeline(settings, args, cancel))
        .await
        .context("pipeline task panicked")??;

    println!("frames processed : {}", summary.frames);
    println!("tracks finalized : {}", summary.finalized);
    println!("  too short      : {}", summary.dropped_short);
    println!("  below limit    : {}", summary.below_limit);
    println!("  reported       : {}", summary.dispatched);
    println!("  failed         : {}", summary.failed);
    println!("  dropped (load) : {}", summary.dropped_overload);
    println!("pending discarded: {}", summary.pending_discarded);
    Ok(())
}

fn run_pipeline(settings: Settings, args: RunArgs, cancel: Arc<AtomicBool>) -> Result<PipelineSummary> {
    let det = &settings.detector;
    let detector = load_detector(&det.model_path, det.generation, det.confidence_threshold)?;
    let tracker = IdentityTracker::new(settings.tracker.iou_threshold, settings.tracker.max_missed);
    let mut detections = TrackedDetector::new(detector, tracker);
    let regressor = OnnxSpeedRegressor::load(&settings.estimator.model_path).with_context(|| {
        format!(
            "failed to load speed model: {}",
            settings.estimator.model_path.display()
        )
    })?;

    let mut video = VideoSource::open(&args.source)
        .with_context(|| format!("failed to open source: {}", args.source))?;
    let video_info = video.info();

    let layout = RunLayout::new(&settings.output.footage_dir, Local::now());
    layout
        .create_dir()
        .with_context(|| format!("failed to create run directory {}", layout.dir().display()))?;
    let ledger = Ledger::create(layout.ledger_path())
        .with_context(|| format!("failed to create ledger {}", layout.ledger_path().display()))?;
    info!(dir = %layout.dir().display(), ledger = %ledger.path().display(), "run directory ready");

    let notifier: Box<dyn Notifier> = if settings.email.enabled && !args.no_email {
        Box::new(SmtpNotifier::from_settings(&settings.email)?)
    } else {
        Box::new(LogNotifier)
    };

    let mut recorder = if settings.output.record && !args.no_record {
        let path = layout.recording_path();
        info!(path = %path.display(), "recording full run");
        Some(ClipEncoder::create(
            &path,
            video_info.width,
            video_info.height,
            video_info.frame_rate,
        )?)
    } else {
        None
    };

    let dispatcher = ViolationDispatcher::new(
        Box::new(regressor),
        Box::new(FfmpegClipWriter::new(video_info.frame_rate)),
        notifier,
        ledger,
        layout,
    )
    .with_speed_limit(settings.estimator.speed_limit_kmh);
    let mut pipeline = SpeedPipeline::new(PipelineOptions::from(&settings), dispatcher)?;

    let pb = progress(total_frames(&args.source), "Estimating speeds…")?;
    let ingest = video.for_each_frame(|frame| {
        if cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }
        pb.inc(1);

        let mut stop_recording = false;
        if let Some(rec) = recorder.as_mut() {
            if let Err(e) = rec.push(&frame) {
                error!(error = %format!("{e:#}"), "recording failed; continuing without it");
                stop_recording = true;
            }
        }
        if stop_recording {
            recorder = None;
        }

        let found = match detections.detections(&frame) {
            Ok(found) => found,
            Err(e) => {
                warn!(frame_index = pipeline.frame_index(), "detection error: {e:#}");
                Vec::new()
            }
        };
        pipeline.process_frame(frame, &found);
        Ok(true)
    });

    if let Err(e) = &ingest {
        error!(kind = %ErrorKind::Ingestion, error = %format!("{e:#}"), "frame source failed");
    }
    if cancel.load(Ordering::SeqCst) {
        info!("stopped by interrupt");
    }

    let summary = pipeline.finish(args.flush_pending)?;
    if let Some(rec) = recorder {
        match rec.finish() {
            Ok(written) => info!(written, "recording finalized"),
            Err(e) => error!(error = %format!("{e:#}"), "failed to finalize recording"),
        }
    }
    pb.finish_with_message("Done.");

    ingest.context("frame source failed")?;
    Ok(summary)
}

// ── probe ─────────────────────────────────────────────────────────────────────

async fn cmd_probe(input: String) -> Result<()> {
    let (video_info, frames) = task::spawn_blocking(move || -> Result<_> {
        let video_info = probe(&input).with_context(|| format!("failed to probe {input}"))?;
        Ok((video_info, total_frames(&input)))
    })
    .await
    .context("probe task panicked")??;

    println!("resolution : {}x{}", video_info.width, video_info.height);
    println!("fps        : {:.3}", video_info.fps());
    if frames > 0 {
        println!("frames     : ~{frames}");
    } else {
        println!("frames     : unknown (live stream?)");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress(total: u64, msg: &str) -> Result<ProgressBar> {
    let pb = if total > 0 {
        let pb = ProgressBar::new(total);
        pb.set_style(ProgressStyle::with_template(
            "{spinner:.cyan} {msg} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len}",
        )?);
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}] {pos} frames")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        pb
    };
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}
