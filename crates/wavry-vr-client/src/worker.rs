//! Lifecycle bookkeeping for the workers the orchestrator drives.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};
use wavry_vr::VrResult;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerLifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Start failed; the reason is reported outward and the worker stays down
    /// until the next explicit start.
    Failed(String),
}

impl WorkerLifecycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkerLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// A worker plus the lifecycle state the orchestrator tracks for it.
///
/// Start and stop run under the slot lock, so a callback that also takes the
/// lock (see [`WorkerSlot::locked`]) observes either the old or the new
/// state, never a half-started worker. `live` mirrors `Running` for readers
/// that must not block on a lifecycle transition.
pub struct WorkerSlot<W: ?Sized> {
    name: &'static str,
    worker: Arc<W>,
    state: Mutex<WorkerLifecycleState>,
    live: AtomicBool,
    starts: AtomicU64,
}

impl<W: ?Sized> WorkerSlot<W> {
    pub fn new(name: &'static str, worker: Arc<W>) -> Self {
        Self {
            name,
            worker,
            state: Mutex::new(WorkerLifecycleState::Stopped),
            live: AtomicBool::new(false),
            starts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    pub fn state(&self) -> WorkerLifecycleState {
        self.lock().clone()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Number of successful starts over the slot's lifetime.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    /// Runs `start` unless the worker is already running.
    pub fn start_with<F>(&self, start: F) -> VrResult<()>
    where
        F: FnOnce(&W) -> VrResult<()>,
    {
        let mut state = self.lock();
        if state.is_running() {
            return Ok(());
        }

        *state = WorkerLifecycleState::Starting;
        debug!(worker = self.name, "starting worker");
        match start(&self.worker) {
            Ok(()) => {
                *state = WorkerLifecycleState::Running;
                self.live.store(true, Ordering::Release);
                self.starts.fetch_add(1, Ordering::Relaxed);
                info!(worker = self.name, "worker running");
                Ok(())
            }
            Err(err) => {
                error!(worker = self.name, %err, "worker failed to start");
                *state = WorkerLifecycleState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Runs `stop` for a running or failed worker. Returns `false` when the
    /// worker was already stopped.
    pub fn stop_with<F>(&self, stop: F) -> bool
    where
        F: FnOnce(&W),
    {
        let mut state = self.lock();
        if *state == WorkerLifecycleState::Stopped {
            return false;
        }

        self.live.store(false, Ordering::Release);
        *state = WorkerLifecycleState::Stopping;
        debug!(worker = self.name, "stopping worker");
        stop(&self.worker);
        *state = WorkerLifecycleState::Stopped;
        info!(worker = self.name, "worker stopped");
        true
    }

    /// Runs `f` while holding the lifecycle lock.
    pub fn locked<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&WorkerLifecycleState, &W) -> R,
    {
        let state = self.lock();
        f(&state, &self.worker)
    }

    /// Runs `f` only if the worker is running, holding the lifecycle lock.
    pub fn with_running<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&W) -> R,
    {
        self.locked(|state, worker| state.is_running().then(|| f(worker)))
    }

    fn lock(&self) -> MutexGuard<'_, WorkerLifecycleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Stop flag that also wakes a thread sleeping on it.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.wake.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    /// Sleeps until `deadline` or until the signal is set. Returns `true`
    /// when stopped.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.lock();
        loop {
            if *stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
    }

    pub fn sleep_for(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.stopped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use wavry_vr::VrError;

    #[test]
    fn test_start_failure_is_reported() {
        let slot = WorkerSlot::new("receiver", Arc::new(()));
        let result = slot.start_with(|_| Err(VrError::Init("bind failed".into())));
        assert!(result.is_err());
        assert_eq!(
            slot.state(),
            WorkerLifecycleState::Failed("initialization failed: bind failed".into())
        );
        assert!(!slot.is_live());
        assert_eq!(slot.start_count(), 0);
    }

    #[test]
    fn test_start_is_idempotent_while_running() {
        let slot = WorkerSlot::new("decoder", Arc::new(()));
        let mut calls = 0;
        slot.start_with(|_| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        slot.start_with(|_| {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(slot.start_count(), 1);
        assert!(slot.is_live());
    }

    #[test]
    fn test_stop_only_runs_for_started_workers() {
        let slot = WorkerSlot::new("decoder", Arc::new(()));
        assert!(!slot.stop_with(|_| panic!("never started")));

        slot.start_with(|_| Ok(())).unwrap();
        assert!(slot.stop_with(|_| {}));
        assert_eq!(slot.state(), WorkerLifecycleState::Stopped);
        assert!(slot.with_running(|_| ()).is_none());
    }

    #[test]
    fn test_stop_signal_wakes_sleeper() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = {
            let signal = signal.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = signal.sleep_for(Duration::from_secs(10));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.set();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_signal_times_out() {
        let signal = StopSignal::new();
        assert!(!signal.sleep_for(Duration::from_millis(5)));
    }
}
