#![forbid(unsafe_code)]

pub mod adapter;
pub mod status;
pub mod types;

pub use adapter::{DecoderShim, FramePresenter, NetworkReceiver, PoseSource, ReceiverCallbacks};
pub use status::{StatusBanner, StatusCell};
pub use types::{
    ConnectionInfo, FrameIndex, PoseOrigin, PoseSample, PresentedFrame, ServerEndpoint,
    StreamConfig, StreamSettings, TextureHandle, VideoCodec,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VrError {
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("initialization failed: {0}")]
    Init(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("interrupted")]
    Interrupted,
}

pub type VrResult<T> = Result<T, VrError>;
