use std::fmt;
use std::sync::Mutex;

/// What the display shows when it is not presenting video.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatusBanner {
    #[default]
    Idle,
    Disconnected,
    Connected,
    Suspended,
    Error(String),
}

impl StatusBanner {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Multi-line text rendered on the loading panel.
    pub fn message(&self, app_name: &str) -> String {
        match self {
            Self::Idle => format!("{app_name}\nLoading..."),
            Self::Disconnected => format!("{app_name}\n \nPress CONNECT button\non the streaming server."),
            Self::Connected => format!("{app_name}\n \nConnected!\nStreaming will begin soon!"),
            Self::Suspended => format!("{app_name}\n \nStream paused by server."),
            Self::Error(reason) => format!("{app_name}\n \n!!! Error on initialization !!!\n{reason}"),
        }
    }
}

impl fmt::Display for StatusBanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Suspended => write!(f, "suspended"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Last status published by the runtime, readable from any thread.
#[derive(Debug, Default)]
pub struct StatusCell {
    inner: Mutex<StatusBanner>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> StatusBanner {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, status: StatusBanner) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = status;
    }

    /// Replaces the status unless an error is already latched.
    pub fn set_unless_error(&self, status: StatusBanner) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.is_error() {
            *guard = status;
        }
    }
}
