pub mod config;
pub mod correlation;
pub mod handshake;
pub mod orchestrator;
pub mod settings;
pub mod sim;
pub mod task_queue;
pub mod tracking;
pub mod worker;

pub use config::ClientConfig;
pub use correlation::{CorrelationStore, RETENTION_WINDOW};
pub use handshake::{FrameHandshake, TextureSignals};
pub use orchestrator::{Collaborators, DisplayStats, Orchestrator, OrchestratorState};
pub use settings::{JsonSettingsStore, MemorySettingsStore, SettingsStore};
pub use task_queue::TaskQueue;
pub use tracking::{PoseSampler, SamplerStats};
pub use worker::{WorkerLifecycleState, WorkerSlot};

/// Installs the fmt subscriber with thread names, since every worker runs on
/// its own named thread. `RUST_LOG` overrides `default_level`. Returns
/// `false` when a global subscriber was already set.
pub fn init_tracing(default_level: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
