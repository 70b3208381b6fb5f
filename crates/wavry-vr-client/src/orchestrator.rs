//! Client runtime orchestrator.
//!
//! Owns the display thread and its task queue, starts and stops the workers
//! in dependency order, and multiplexes every display tick between
//! presenting a decoded frame and showing a status banner.
//!
//! Worker order on resume is receiver, decoder, pose sampler; pause stops
//! them as decoder, pose sampler, receiver. Lifecycle commands are executed
//! on the display thread through the task queue, so a tick never overlaps a
//! worker transition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};
use wavry_vr::{
    ConnectionInfo, DecoderShim, FramePresenter, NetworkReceiver, PoseOrigin, PoseSample,
    PoseSource, PresentedFrame, ReceiverCallbacks, ServerEndpoint, StatusBanner, StatusCell,
    StreamSettings, VrError, VrResult,
};

use crate::config::ClientConfig;
use crate::correlation::CorrelationStore;
use crate::handshake::{FrameHandshake, TextureSignals};
use crate::settings::SettingsStore;
use crate::task_queue::TaskQueue;
use crate::tracking::{PoseSampler, PoseSnapshot, SamplerStats};
use crate::worker::{WorkerLifecycleState, WorkerSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestratorState {
    #[default]
    Idle,
    Resumed,
    Paused,
    ShutDown,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Resumed => write!(f, "resumed"),
            Self::Paused => write!(f, "paused"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

/// External collaborators driven by the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub receiver: Arc<dyn NetworkReceiver>,
    pub decoder: Arc<dyn DecoderShim>,
    pub pose_source: Arc<dyn PoseSource>,
    pub presenter: Arc<dyn FramePresenter>,
    pub settings: Arc<dyn SettingsStore>,
}

#[derive(Debug, Default)]
pub struct DisplayStats {
    pub frames_presented: AtomicU64,
    /// Frames presented with the latest pose because no recorded pose matched.
    pub correlation_misses: AtomicU64,
    pub handshake_timeouts: AtomicU64,
    pub status_renders: AtomicU64,
    pub last_frame_index: AtomicU64,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the runtime and spawns the display thread. Nothing starts until
    /// [`Orchestrator::resume`].
    pub fn spawn(config: ClientConfig, collaborators: Collaborators) -> VrResult<Self> {
        config.validate()?;
        let shared = Shared::new(config, collaborators)?;

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("wavry-vr-orchestrator".to_string())
            .spawn(move || run_display_loop(thread_shared))
            .map_err(|e| VrError::Adapter(format!("thread spawn: {e}")))?;

        info!(app = %shared.config.app_name, "orchestrator spawned");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Enters `Resumed` and starts the workers. Returns once the start
    /// sequence has run on the display thread, also for a caller that found
    /// another resume in progress. Calling it while already resumed does
    /// nothing else.
    ///
    /// Each resume is a fresh connection attempt: an initialization error
    /// latched by the previous one is cleared and the workers are retried.
    pub fn resume(&self) -> VrResult<()> {
        // Concurrent callers queue here until the start sequence finished.
        // The display thread cannot wait on itself, so it skips the gate.
        let _gate = (!self.shared.queue.is_owner()).then(|| self.shared.lock_resume_gate());
        {
            let mut state = self.shared.lock_state();
            match *state {
                OrchestratorState::Resumed => return Ok(()),
                OrchestratorState::ShutDown => return Err(VrError::Interrupted),
                OrchestratorState::Idle | OrchestratorState::Paused => {
                    *state = OrchestratorState::Resumed;
                }
            }
        }
        info!("resume");

        let shared = self.shared.clone();
        self.shared.queue.send(move || shared.start_workers())
    }

    /// Leaves `Resumed` and stops the workers in reverse dependency order.
    /// A no-op unless the orchestrator is resumed.
    pub fn pause(&self) {
        self.shared.pause();
    }

    /// Pauses, terminates the task queue and joins the display thread.
    /// Safe to call more than once and from inside a queued action.
    pub fn shutdown(&self) {
        self.shared.pause();
        {
            let mut state = self.shared.lock_state();
            if *state == OrchestratorState::ShutDown {
                return;
            }
            *state = OrchestratorState::ShutDown;
        }
        self.shared.handshake.cancel();
        self.shared.queue.interrupt();

        if self.shared.queue.is_owner() {
            return;
        }
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("orchestrator thread panicked");
            }
        }
        info!("orchestrator shut down");
    }

    pub fn state(&self) -> OrchestratorState {
        *self.shared.lock_state()
    }

    pub fn status(&self) -> StatusBanner {
        self.shared.status.get()
    }

    pub fn stats(&self) -> &DisplayStats {
        &self.shared.stats
    }

    pub fn sampler_stats(&self) -> Arc<SamplerStats> {
        self.shared.lock_sampler().stats()
    }

    /// Producer side of the frame handshake, for the texture source.
    pub fn texture_signals(&self) -> TextureSignals {
        TextureSignals::new(self.shared.handshake.clone())
    }

    pub fn correlation(&self) -> Arc<CorrelationStore> {
        self.shared.correlation.clone()
    }

    pub fn receiver_state(&self) -> WorkerLifecycleState {
        self.shared.receiver.state()
    }

    pub fn decoder_state(&self) -> WorkerLifecycleState {
        self.shared.decoder.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Shared {
    config: ClientConfig,
    state: Mutex<OrchestratorState>,
    /// Serializes worker start and stop sequences.
    lifecycle: Mutex<()>,
    resume_gate: Mutex<()>,
    queue: TaskQueue,
    receiver: WorkerSlot<dyn NetworkReceiver>,
    decoder: WorkerSlot<dyn DecoderShim>,
    sampler: Mutex<PoseSampler>,
    correlation: Arc<CorrelationStore>,
    latest_pose: PoseSnapshot,
    handshake: Arc<FrameHandshake>,
    presenter: Arc<dyn FramePresenter>,
    settings: Arc<dyn SettingsStore>,
    status: StatusCell,
    // Lock order: decoder slot, then connection.
    connection: Mutex<Option<ConnectionInfo>>,
    stream: Mutex<StreamSettings>,
    stats: DisplayStats,
}

impl Shared {
    fn new(config: ClientConfig, collaborators: Collaborators) -> VrResult<Arc<Self>> {
        let Collaborators {
            receiver,
            decoder,
            pose_source,
            presenter,
            settings,
        } = collaborators;

        let mut sampler = PoseSampler::new(config.tracking_rate_hz, pose_source)?;
        let correlation = Arc::new(
            CorrelationStore::with_retention(config.retention_window)
                .with_max_entries(config.max_tracked_frames),
        );
        let handshake = Arc::new(FrameHandshake::new(config.handshake_timeout()));

        Ok(Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            sampler.set_callback(move |pose| forward_pose(&weak, pose));
            Self {
                config,
                state: Mutex::new(OrchestratorState::Idle),
                lifecycle: Mutex::new(()),
                resume_gate: Mutex::new(()),
                queue: TaskQueue::new(),
                receiver: WorkerSlot::new("receiver", receiver),
                decoder: WorkerSlot::new("decoder", decoder),
                sampler: Mutex::new(sampler),
                correlation,
                latest_pose: PoseSnapshot::new(),
                handshake,
                presenter,
                settings,
                status: StatusCell::new(),
                connection: Mutex::new(None),
                stream: Mutex::new(StreamSettings::default()),
                stats: DisplayStats::default(),
            }
        }))
    }

    fn is_resumed(&self) -> bool {
        *self.lock_state() == OrchestratorState::Resumed
    }

    fn pause(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if *state != OrchestratorState::Resumed {
                return;
            }
            *state = OrchestratorState::Paused;
        }
        info!("pause");

        // Release a display tick blocked in the handshake before waiting on it.
        self.handshake.cancel();
        let shared = self.clone();
        if self.queue.send(move || shared.stop_workers()).is_err() {
            self.stop_workers();
        }
    }

    fn start_workers(self: &Arc<Self>) {
        let _lifecycle = self.lock_lifecycle();
        if !self.is_resumed() {
            debug!("start skipped, no longer resumed");
            return;
        }
        if let StatusBanner::Error(reason) = self.status.get() {
            info!(%reason, "retrying workers after previous failure");
        }

        self.handshake.reset();
        self.correlation.clear();
        *self.lock_connection() = None;
        *self.lock_stream() = StreamSettings::default();
        self.status.set(StatusBanner::Disconnected);

        let resume_from = match self.settings.load_endpoint() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(%err, "failed to load saved endpoint");
                None
            }
        };
        if let Err(err) = self.settings.save_endpoint(None) {
            warn!(%err, "failed to clear saved endpoint");
        }
        if let Some(endpoint) = &resume_from {
            info!(address = %endpoint.address, port = endpoint.port, "resuming saved endpoint");
        }

        let callbacks: Arc<dyn ReceiverCallbacks> = Arc::new(ReceiverBridge {
            shared: Arc::downgrade(self),
        });
        if let Err(err) = self
            .receiver
            .start_with(|receiver| receiver.start(callbacks, resume_from))
        {
            self.fail(err);
            return;
        }

        let decoder_started = self.decoder.start_with(|decoder| {
            decoder.start()?;
            if let Some(info) = *self.lock_connection() {
                decoder.on_connect(info.stream, info.frame_queue_size);
            }
            Ok(())
        });
        if let Err(err) = decoder_started {
            self.fail(err);
            return;
        }

        if let Err(err) = self.lock_sampler().start() {
            self.fail(err);
        }
    }

    fn stop_workers(&self) {
        let _lifecycle = self.lock_lifecycle();
        self.handshake.cancel();
        self.decoder.stop_with(|decoder| decoder.stop());
        self.lock_sampler().stop();
        self.receiver.stop_with(|receiver| receiver.stop());
    }

    fn fail(&self, err: VrError) {
        error!(%err, "worker initialization failed");
        let reason = match err {
            VrError::Init(reason) => reason,
            other => other.to_string(),
        };
        self.status.set(StatusBanner::Error(reason));
    }

    fn display_tick(&self) {
        let banner = self.banner();
        if banner == StatusBanner::Connected && self.frame_ready() {
            match self.present_next_frame() {
                Ok(true) => return,
                Ok(false) => {}
                Err(VrError::Interrupted) => return,
                Err(VrError::Timeout(what)) => {
                    self.stats.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(waiting_for = %what, "frame handshake timed out");
                    return;
                }
                Err(err) => {
                    warn!(%err, "frame presentation failed");
                }
            }
        }

        self.presenter.present_status(&banner);
        self.stats.status_renders.fetch_add(1, Ordering::Relaxed);
        self.queue.wait_timeout(self.config.idle_sleep());
    }

    fn frame_ready(&self) -> bool {
        self.decoder.is_live() && self.decoder.worker().is_frame_available()
    }

    /// Runs the handshake and presents one frame. `Ok(false)` when the
    /// decoder had nothing to show.
    fn present_next_frame(&self) -> VrResult<bool> {
        let decoder = self.decoder.worker().clone();
        let Some(frame_index) = self.handshake.acquire(|| decoder.decode_next())? else {
            return Ok(false);
        };

        let (pose, pose_origin) = match self.correlation.take(frame_index) {
            Some(pose) => (pose, PoseOrigin::Correlated),
            None => {
                self.stats.correlation_misses.fetch_add(1, Ordering::Relaxed);
                debug!(frame_index, "no recorded pose for frame, using latest");
                let pose = self
                    .latest_pose
                    .load()
                    .unwrap_or_else(|| PoseSample::identity(0));
                (pose, PoseOrigin::Fallback)
            }
        };
        self.correlation.evict_before(frame_index);

        let frame = PresentedFrame {
            frame_index,
            pose,
            pose_origin,
            texture: decoder.texture(),
        };
        self.presenter.present_frame(&frame);
        self.stats.frames_presented.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_frame_index
            .store(frame_index, Ordering::Relaxed);
        Ok(true)
    }

    /// Banner for the current tick. A latched error wins over everything;
    /// a fatal error reported by the running receiver is latched here.
    fn banner(&self) -> StatusBanner {
        let current = self.status.get();
        if current.is_error() {
            return current;
        }
        if self.receiver.is_live() {
            if let Some(reason) = self.receiver.worker().last_error() {
                error!(%reason, "receiver reported a fatal error");
                let failed = StatusBanner::Error(reason);
                self.status.set(failed.clone());
                return failed;
            }
        }
        let next = if self.lock_stream().suspend {
            StatusBanner::Suspended
        } else if self.receiver.is_live() && self.receiver.worker().is_connected() {
            StatusBanner::Connected
        } else {
            StatusBanner::Disconnected
        };
        self.status.set_unless_error(next.clone());
        next
    }

    fn lock_state(&self) -> MutexGuard<'_, OrchestratorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_resume_gate(&self) -> MutexGuard<'_, ()> {
        match self.resume_gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_sampler(&self) -> MutexGuard<'_, PoseSampler> {
        match self.sampler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<ConnectionInfo>> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_stream(&self) -> MutexGuard<'_, StreamSettings> {
        match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn run_display_loop(shared: Arc<Shared>) {
    if !shared.queue.claim_owner() {
        error!("task queue already owned by another thread");
        return;
    }
    debug!("display loop started");

    while shared.queue.wait_idle() {
        if !shared.is_resumed() {
            if !shared.queue.wait_next() {
                break;
            }
            continue;
        }
        shared.display_tick();
    }
    debug!("display loop exited");
}

/// Sampler callback: keep the latest pose, send it to the server and
/// remember it under the frame index the receiver assigned.
fn forward_pose(shared: &Weak<Shared>, pose: PoseSample) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    shared.latest_pose.store(pose);

    if !shared.receiver.is_live() {
        return;
    }
    let receiver = shared.receiver.worker();
    if !receiver.is_connected() {
        return;
    }
    match receiver.submit_pose(&pose) {
        Ok(frame_index) => shared.correlation.record(frame_index, pose),
        Err(err) => debug!(%err, "pose submission failed"),
    }
}

/// Receiver events. Runs on the receiver's thread.
struct ReceiverBridge {
    shared: Weak<Shared>,
}

impl ReceiverCallbacks for ReceiverBridge {
    fn on_connected(&self, info: ConnectionInfo) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        info!(
            width = info.stream.width,
            height = info.stream.height,
            codec = ?info.stream.codec,
            frame_queue_size = info.frame_queue_size,
            "server connected"
        );
        // Configure under the decoder lock so a decoder start in progress
        // either sees the connection or is configured here afterwards.
        shared.decoder.locked(|state, decoder| {
            *shared.lock_connection() = Some(info);
            if state.is_running() {
                decoder.on_connect(info.stream, info.frame_queue_size);
            }
        });
        shared.status.set_unless_error(StatusBanner::Connected);
    }

    fn on_settings_changed(&self, settings: StreamSettings) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!(
            test_mode = settings.test_mode,
            suspend = settings.suspend,
            frame_queue_size = settings.frame_queue_size,
            "stream settings changed"
        );
        *shared.lock_stream() = settings;
        shared
            .decoder
            .with_running(|decoder| decoder.set_queue_depth(settings.frame_queue_size));
    }

    fn on_disconnected(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        info!("server disconnected");
        shared.decoder.locked(|state, decoder| {
            *shared.lock_connection() = None;
            if state.is_running() {
                decoder.on_disconnect();
            }
        });
        shared.status.set_unless_error(StatusBanner::Disconnected);
    }

    fn on_shutdown(&self, last_server: Option<ServerEndpoint>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Err(err) = shared.settings.save_endpoint(last_server.as_ref()) {
            warn!(%err, "failed to save endpoint");
        }
    }
}
