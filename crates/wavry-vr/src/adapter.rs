use std::sync::Arc;

use crate::{
    status::StatusBanner,
    types::{
        ConnectionInfo, FrameIndex, PoseSample, PresentedFrame, ServerEndpoint, StreamConfig,
        StreamSettings, TextureHandle,
    },
    VrResult,
};

pub trait ReceiverCallbacks: Send + Sync {
    // Receiver -> client runtime
    fn on_connected(&self, info: ConnectionInfo);
    fn on_settings_changed(&self, settings: StreamSettings);
    fn on_disconnected(&self);
    /// Called once the receiver loop exits; `last_server` is `None` when no
    /// server was ever reached.
    fn on_shutdown(&self, last_server: Option<ServerEndpoint>);
}

/// Connection lifecycle owner. Socket I/O and packet framing live behind it.
pub trait NetworkReceiver: Send + Sync {
    /// Blocks until the receiver is initialized. An error here is fatal for
    /// the session.
    fn start(
        &self,
        callbacks: Arc<dyn ReceiverCallbacks>,
        resume_from: Option<ServerEndpoint>,
    ) -> VrResult<()>;
    fn stop(&self);

    /// Sends a tracking packet and returns the frame index it was tagged with.
    fn submit_pose(&self, pose: &PoseSample) -> VrResult<FrameIndex>;
    fn is_connected(&self) -> bool;
    fn last_error(&self) -> Option<String>;
}

pub trait DecoderShim: Send + Sync {
    fn start(&self) -> VrResult<()>;
    fn stop(&self);

    fn on_connect(&self, config: StreamConfig, queue_depth: u32);
    fn on_disconnect(&self);
    fn set_queue_depth(&self, depth: u32);

    /// Advances one frame into the shared texture. `None` when nothing was
    /// produced.
    fn decode_next(&self) -> Option<FrameIndex>;
    fn is_frame_available(&self) -> bool;
    fn texture(&self) -> TextureHandle;
}

pub trait PoseSource: Send + Sync {
    fn sample(&self) -> PoseSample;
}

pub trait FramePresenter: Send + Sync {
    fn present_frame(&self, frame: &PresentedFrame);
    fn present_status(&self, status: &StatusBanner);
}
