use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use wavry_vr::TextureHandle;
use wavry_vr_client::sim::{
    LogPresenter, LoopbackLink, LoopbackOptions, LoopbackReceiver, OrbitPoseSource,
    SyntheticDecoder, TexturePump,
};
use wavry_vr_client::{ClientConfig, Collaborators, JsonSettingsStore, Orchestrator};

/// Runs the headset runtime against an in-process loopback server.
#[derive(Parser, Debug)]
#[command(name = "wavry-vr-client")]
struct Args {
    /// JSON config file
    #[arg(long, env = "WAVRY_VR_CONFIG")]
    config: Option<PathBuf>,
    /// Where the last server endpoint is persisted
    #[arg(long, env = "WAVRY_VR_SETTINGS", default_value = "wavry-vr-settings.json")]
    settings: PathBuf,
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,
    /// Overrides the configured pose sampling rate
    #[arg(long)]
    tracking_hz: Option<u32>,
    /// Simulated server round trip per frame
    #[arg(long, default_value_t = 35)]
    latency_ms: u64,
    /// Delay before the loopback server connects
    #[arg(long, default_value_t = 500)]
    connect_after_ms: u64,
    /// Make receiver initialization fail
    #[arg(long, default_value_t = false)]
    fail_init: bool,
    /// Pause and resume once halfway through the run
    #[arg(long, default_value_t = false)]
    cycle: bool,
}

fn main() -> anyhow::Result<()> {
    if !wavry_vr_client::init_tracing("info") {
        eprintln!("tracing subscriber already installed");
    }
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    config.apply_env();
    if let Some(rate) = args.tracking_hz {
        config.tracking_rate_hz = rate;
    }
    config.validate()?;

    let link = LoopbackLink::new(Duration::from_millis(args.latency_ms));
    let receiver = Arc::new(LoopbackReceiver::new(
        link.clone(),
        LoopbackOptions {
            connect_after: Some(Duration::from_millis(args.connect_after_ms)),
            fail_init: args
                .fail_init
                .then(|| "failed to bind discovery socket".to_string()),
            ..LoopbackOptions::default()
        },
    ));
    let decoder = Arc::new(SyntheticDecoder::new(link.clone(), TextureHandle(1)));
    let presenter = Arc::new(LogPresenter::new(
        config.app_name.clone(),
        Duration::from_micros(1_000_000 / 72),
    ));

    let orchestrator = Orchestrator::spawn(
        config.clone(),
        Collaborators {
            receiver: receiver.clone(),
            decoder: decoder.clone(),
            pose_source: Arc::new(OrbitPoseSource::new(config.eye_height_m)),
            presenter: presenter.clone(),
            settings: Arc::new(JsonSettingsStore::new(&args.settings)),
        },
    )?;
    decoder.attach(orchestrator.texture_signals());
    let _pump = TexturePump::start(orchestrator.texture_signals())?;

    orchestrator.resume()?;
    let run_for = Duration::from_secs(args.duration_secs);
    if args.cycle {
        thread::sleep(run_for / 2);
        orchestrator.pause();
        thread::sleep(Duration::from_millis(200));
        orchestrator.resume()?;
        thread::sleep(run_for / 2);
    } else {
        thread::sleep(run_for);
    }
    orchestrator.shutdown();

    let stats = orchestrator.stats();
    let sampler = orchestrator.sampler_stats();
    info!(
        frames_presented = stats.frames_presented.load(Ordering::Relaxed),
        correlation_misses = stats.correlation_misses.load(Ordering::Relaxed),
        handshake_timeouts = stats.handshake_timeouts.load(Ordering::Relaxed),
        status_renders = stats.status_renders.load(Ordering::Relaxed),
        last_frame_index = stats.last_frame_index.load(Ordering::Relaxed),
        poses_sampled = sampler.samples.load(Ordering::Relaxed),
        sampler_overruns = sampler.overruns.load(Ordering::Relaxed),
        poses_submitted = receiver.submitted(),
        frames_decoded = decoder.decoded(),
        frames_dropped = link.dropped(),
        fallback_frames = presenter.fallback_frames(),
        status = %orchestrator.status(),
        "session finished"
    );
    Ok(())
}
