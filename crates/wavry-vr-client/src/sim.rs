//! In-process stand-ins for the external collaborators.
//!
//! A [`LoopbackReceiver`] and a [`SyntheticDecoder`] share a
//! [`LoopbackLink`]: every submitted pose becomes a frame that is
//! "rendered remotely" and becomes decodable after a fixed latency. Used by
//! the `wavry-vr-client` binary and by tests that need a live pipeline
//! without a server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use glam::{Mat4, Quat, Vec3};
use tracing::{debug, info, warn};
use wavry_vr::{
    ConnectionInfo, DecoderShim, FrameIndex, FramePresenter, NetworkReceiver, PoseSample,
    PoseSource, PresentedFrame, ReceiverCallbacks, ServerEndpoint, StatusBanner, StreamConfig,
    StreamSettings, TextureHandle, VideoCodec, VrError, VrResult,
};

use crate::handshake::TextureSignals;
use crate::worker::StopSignal;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    index: FrameIndex,
    ready_at: Instant,
}

/// Frames requested by the receiver and not yet decoded.
#[derive(Debug)]
pub struct LoopbackLink {
    latency: Duration,
    in_flight: Mutex<VecDeque<InFlight>>,
    capacity: AtomicU32,
    dropped: AtomicU64,
}

impl LoopbackLink {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            in_flight: Mutex::new(VecDeque::new()),
            capacity: AtomicU32::new(8),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn set_capacity(&self, capacity: u32) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    fn push(&self, index: FrameIndex) {
        let capacity = self.capacity.load(Ordering::Relaxed) as usize;
        let mut in_flight = self.lock();
        in_flight.push_back(InFlight {
            index,
            ready_at: Instant::now() + self.latency,
        });
        while in_flight.len() > capacity {
            in_flight.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn has_ready(&self) -> bool {
        let now = Instant::now();
        self.lock().front().is_some_and(|f| f.ready_at <= now)
    }

    /// Takes the newest ready frame, discarding older ready ones.
    fn take_latest_ready(&self) -> Option<FrameIndex> {
        let now = Instant::now();
        let mut in_flight = self.lock();
        let mut latest = None;
        while let Some(front) = in_flight.front().copied() {
            if front.ready_at > now {
                break;
            }
            in_flight.pop_front();
            if latest.is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            latest = Some(front.index);
        }
        latest
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InFlight>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub endpoint: ServerEndpoint,
    /// Delay between start and the connected callback. `None` never connects.
    pub connect_after: Option<Duration>,
    /// Makes `start` fail with this reason.
    pub fail_init: Option<String>,
    pub stream: StreamConfig,
    pub frame_queue_size: u32,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            endpoint: ServerEndpoint {
                address: "127.0.0.1".to_string(),
                port: 9944,
            },
            connect_after: Some(Duration::from_millis(50)),
            fail_init: None,
            stream: StreamConfig {
                codec: VideoCodec::Hevc,
                width: 2880,
                height: 1600,
            },
            frame_queue_size: 4,
        }
    }
}

pub struct LoopbackReceiver {
    link: Arc<LoopbackLink>,
    options: LoopbackOptions,
    connected: Arc<AtomicBool>,
    next_index: AtomicU64,
    stop: Arc<StopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<Option<String>>,
}

impl LoopbackReceiver {
    pub fn new(link: Arc<LoopbackLink>, options: LoopbackOptions) -> Self {
        Self {
            link,
            options,
            connected: Arc::new(AtomicBool::new(false)),
            next_index: AtomicU64::new(0),
            stop: Arc::new(StopSignal::new()),
            thread: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Frames tagged so far.
    pub fn submitted(&self) -> u64 {
        self.next_index.load(Ordering::Relaxed)
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_last_error(&self, reason: Option<String>) {
        let mut guard = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = reason;
    }
}

impl NetworkReceiver for LoopbackReceiver {
    fn start(
        &self,
        callbacks: Arc<dyn ReceiverCallbacks>,
        resume_from: Option<ServerEndpoint>,
    ) -> VrResult<()> {
        if let Some(reason) = &self.options.fail_init {
            self.set_last_error(Some(reason.clone()));
            return Err(VrError::Init(reason.clone()));
        }
        self.set_last_error(None);

        let mut thread_slot = self.lock_thread();
        if thread_slot.is_some() {
            return Ok(());
        }

        self.stop.reset();
        self.link.set_capacity(self.options.frame_queue_size);
        let endpoint = resume_from.unwrap_or_else(|| self.options.endpoint.clone());
        let connect_after = self.options.connect_after;
        let info = ConnectionInfo {
            stream: self.options.stream,
            frame_queue_size: self.options.frame_queue_size,
        };
        let stop = self.stop.clone();
        let connected = self.connected.clone();

        let handle = thread::Builder::new()
            .name("wavry-vr-receiver".to_string())
            .spawn(move || {
                let reached = match connect_after {
                    Some(delay) if !stop.sleep_for(delay) => {
                        connected.store(true, Ordering::Release);
                        info!(address = %endpoint.address, port = endpoint.port, "loopback connected");
                        callbacks.on_connected(info);
                        callbacks.on_settings_changed(StreamSettings {
                            frame_queue_size: info.frame_queue_size,
                            ..StreamSettings::default()
                        });
                        true
                    }
                    _ => false,
                };

                while !stop.sleep_for(Duration::from_millis(50)) {}

                if reached {
                    connected.store(false, Ordering::Release);
                    callbacks.on_disconnected();
                    callbacks.on_shutdown(Some(endpoint));
                } else {
                    callbacks.on_shutdown(None);
                }
            })
            .map_err(|e| VrError::Adapter(format!("thread spawn: {e}")))?;
        *thread_slot = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.stop.set();
        let handle = self.lock_thread().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("loopback receiver thread panicked");
            }
        }
        self.link.clear();
    }

    fn submit_pose(&self, pose: &PoseSample) -> VrResult<FrameIndex> {
        if !self.is_connected() {
            return Err(VrError::Unavailable("not connected".to_string()));
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(index, capture_time_ns = pose.capture_time_ns, "pose submitted");
        self.link.push(index);
        Ok(index)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Decoder that "decodes" whatever frames the link has made ready and
/// reports the image landing through the handshake.
pub struct SyntheticDecoder {
    link: Arc<LoopbackLink>,
    signals: OnceLock<TextureSignals>,
    texture: TextureHandle,
    running: AtomicBool,
    configured: Mutex<Option<StreamConfig>>,
    decoded: AtomicU64,
}

impl SyntheticDecoder {
    pub fn new(link: Arc<LoopbackLink>, texture: TextureHandle) -> Self {
        Self {
            link,
            signals: OnceLock::new(),
            texture,
            running: AtomicBool::new(false),
            configured: Mutex::new(None),
            decoded: AtomicU64::new(0),
        }
    }

    /// Connects the decoder output to the display handshake.
    pub fn attach(&self, signals: TextureSignals) -> bool {
        self.signals.set(signals).is_ok()
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn configured(&self) -> Option<StreamConfig> {
        *self.lock_configured()
    }

    fn lock_configured(&self) -> MutexGuard<'_, Option<StreamConfig>> {
        match self.configured.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DecoderShim for SyntheticDecoder {
    fn start(&self) -> VrResult<()> {
        if self.signals.get().is_none() {
            return Err(VrError::Init("decoder has no texture target".to_string()));
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        *self.lock_configured() = None;
    }

    fn on_connect(&self, config: StreamConfig, queue_depth: u32) {
        info!(codec = ?config.codec, width = config.width, height = config.height, "decoder configured");
        *self.lock_configured() = Some(config);
        self.set_queue_depth(queue_depth);
    }

    fn on_disconnect(&self) {
        *self.lock_configured() = None;
    }

    fn set_queue_depth(&self, depth: u32) {
        self.link.set_capacity(depth);
    }

    fn decode_next(&self) -> Option<FrameIndex> {
        if !self.running.load(Ordering::Acquire) || self.configured().is_none() {
            return None;
        }
        let index = self.link.take_latest_ready()?;
        self.decoded.fetch_add(1, Ordering::Relaxed);
        if let Some(signals) = self.signals.get() {
            signals.image_landed();
        }
        Some(index)
    }

    fn is_frame_available(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.configured().is_some() && self.link.has_ready()
    }

    fn texture(&self) -> TextureHandle {
        self.texture
    }
}

/// Performs texture updates whenever the display is waiting for one, like
/// a render thread that latches the decoder surface every draw.
pub struct TexturePump {
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl TexturePump {
    pub fn start(signals: TextureSignals) -> VrResult<Self> {
        let stop = Arc::new(StopSignal::new());
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("wavry-vr-texture".to_string())
            .spawn(move || {
                while !thread_stop.sleep_for(Duration::from_millis(1)) {
                    if signals.is_waiting_for_update() {
                        signals.update_texture(|| {});
                    }
                }
            })
            .map_err(|e| VrError::Adapter(format!("thread spawn: {e}")))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TexturePump {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Head slowly turning in place at eye level.
#[derive(Debug)]
pub struct OrbitPoseSource {
    epoch: Instant,
    eye_height: f32,
    radians_per_sec: f32,
}

impl OrbitPoseSource {
    pub fn new(eye_height: f32) -> Self {
        Self {
            epoch: Instant::now(),
            eye_height,
            radians_per_sec: 0.5,
        }
    }
}

impl PoseSource for OrbitPoseSource {
    fn sample(&self) -> PoseSample {
        let elapsed = self.epoch.elapsed();
        let yaw = elapsed.as_secs_f32() * self.radians_per_sec;
        let world_from_head =
            Mat4::from_rotation_translation(Quat::from_rotation_y(yaw), Vec3::new(0.0, 0.0, 0.1));
        let capture_time_ns = i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX);
        PoseSample::from_head_transform(world_from_head.inverse(), self.eye_height, capture_time_ns)
    }
}

/// Presenter that logs status changes and paces frames like a display
/// blocking on vsync.
#[derive(Debug)]
pub struct LogPresenter {
    app_name: String,
    vsync: Duration,
    frames: AtomicU64,
    fallback_frames: AtomicU64,
    status_renders: AtomicU64,
    last_status: Mutex<Option<StatusBanner>>,
}

impl LogPresenter {
    pub fn new(app_name: impl Into<String>, vsync: Duration) -> Self {
        Self {
            app_name: app_name.into(),
            vsync,
            frames: AtomicU64::new(0),
            fallback_frames: AtomicU64::new(0),
            status_renders: AtomicU64::new(0),
            last_status: Mutex::new(None),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn fallback_frames(&self) -> u64 {
        self.fallback_frames.load(Ordering::Relaxed)
    }

    pub fn status_renders(&self) -> u64 {
        self.status_renders.load(Ordering::Relaxed)
    }
}

impl FramePresenter for LogPresenter {
    fn present_frame(&self, frame: &PresentedFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if frame.pose_origin == wavry_vr::PoseOrigin::Fallback {
            self.fallback_frames.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            frame_index = frame.frame_index,
            texture = frame.texture.0,
            origin = ?frame.pose_origin,
            "frame presented"
        );
        thread::sleep(self.vsync);
    }

    fn present_status(&self, status: &StatusBanner) {
        self.status_renders.fetch_add(1, Ordering::Relaxed);
        let mut last = match self.last_status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.as_ref() != Some(status) {
            info!(status = %status, "{}", status.message(&self.app_name).replace('\n', " | "));
            *last = Some(status.clone());
        }
    }
}
