//! Head-pose sampling loop.
//!
//! The sampler runs on its own thread at a fixed rate, independent of decode
//! and display pacing. Scheduling is drift-corrected: each tick is due one
//! period after the previous due time, and when the loop falls behind it
//! re-anchors to the current time instead of bursting catch-up samples.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wavry_vr::{PoseSample, PoseSource, VrError, VrResult};

use crate::worker::StopSignal;

pub type PoseCallback = Arc<dyn Fn(PoseSample) + Send + Sync>;

#[derive(Debug, Default)]
pub struct SamplerStats {
    pub samples: AtomicU64,
    /// Ticks where the next due time had already passed.
    pub overruns: AtomicU64,
}

/// Latest pose handed across threads by value.
#[derive(Debug, Default)]
pub struct PoseSnapshot {
    inner: Mutex<Option<PoseSample>>,
}

impl PoseSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, pose: PoseSample) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(pose);
    }

    pub fn load(&self) -> Option<PoseSample> {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub struct PoseSampler {
    rate_hz: u32,
    source: Arc<dyn PoseSource>,
    callback: Option<PoseCallback>,
    stop: Arc<StopSignal>,
    stats: Arc<SamplerStats>,
    thread: Option<JoinHandle<()>>,
}

impl PoseSampler {
    pub fn new(rate_hz: u32, source: Arc<dyn PoseSource>) -> VrResult<Self> {
        if rate_hz == 0 {
            return Err(VrError::Config(
                "pose sampling rate must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            rate_hz,
            source,
            callback: None,
            stop: Arc::new(StopSignal::new()),
            stats: Arc::new(SamplerStats::default()),
            thread: None,
        })
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.rate_hz))
    }

    /// Registers the pose consumer. Takes effect on the next `start`.
    ///
    /// The callback runs on the sampler thread; blocking in it perturbs the
    /// sampling cadence.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(PoseSample) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    pub fn stats(&self) -> Arc<SamplerStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn start(&mut self) -> VrResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        self.stop.reset();
        let period = self.period();
        let source = self.source.clone();
        let callback = self.callback.clone();
        let stop = self.stop.clone();
        let stats = self.stats.clone();

        let handle = thread::Builder::new()
            .name("wavry-vr-tracking".to_string())
            .spawn(move || run_sampler(period, source, callback, stop, stats))
            .map_err(|e| VrError::Adapter(format!("thread spawn: {e}")))?;
        self.thread = Some(handle);

        info!(rate_hz = self.rate_hz, "pose sampler started");
        Ok(())
    }

    /// Stops sampling and joins the thread, waiting out any callback in
    /// progress.
    pub fn stop(&mut self) {
        self.stop.set();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("pose sampler thread panicked");
            }
            info!(
                samples = self.stats.samples.load(Ordering::Relaxed),
                overruns = self.stats.overruns.load(Ordering::Relaxed),
                "pose sampler stopped"
            );
        }
    }
}

impl Drop for PoseSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sampler(
    period: Duration,
    source: Arc<dyn PoseSource>,
    callback: Option<PoseCallback>,
    stop: Arc<StopSignal>,
    stats: Arc<SamplerStats>,
) {
    let mut next_due = Instant::now();

    while !stop.is_set() {
        let pose = source.sample();
        if let Some(callback) = callback.as_ref() {
            callback(pose);
        }
        stats.samples.fetch_add(1, Ordering::Relaxed);

        next_due += period;
        let now = Instant::now();
        if next_due < now {
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            debug!(
                behind_us = now.duration_since(next_due).as_micros() as u64,
                "pose sampler fell behind; re-anchoring"
            );
            next_due = now;
            continue;
        }

        if stop.sleep_until(next_due) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantSource;

    impl PoseSource for ConstantSource {
        fn sample(&self) -> PoseSample {
            PoseSample::identity(0)
        }
    }

    fn sampler(rate_hz: u32) -> PoseSampler {
        PoseSampler::new(rate_hz, Arc::new(ConstantSource)).unwrap()
    }

    fn record_ticks(sampler: &mut PoseSampler, work: Duration) -> Arc<Mutex<Vec<Instant>>> {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();
        sampler.set_callback(move |_| {
            sink.lock().unwrap().push(Instant::now());
            if !work.is_zero() {
                thread::sleep(work);
            }
        });
        ticks
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(matches!(
            PoseSampler::new(0, Arc::new(ConstantSource)),
            Err(VrError::Config(_))
        ));
    }

    #[test]
    fn test_sample_count_tracks_rate() {
        let mut sampler = sampler(100);
        let ticks = record_ticks(&mut sampler, Duration::ZERO);

        let started = Instant::now();
        sampler.start().unwrap();
        thread::sleep(Duration::from_millis(500));
        sampler.stop();
        let elapsed = started.elapsed();

        let expected = (elapsed.as_secs_f64() * 100.0).floor() as i64;
        let count = ticks.lock().unwrap().len() as i64;
        assert!(
            (count - expected).abs() <= 2,
            "got {count} samples, expected about {expected}"
        );
    }

    #[test]
    fn test_samples_are_not_faster_than_period() {
        let mut sampler = sampler(100);
        let ticks = record_ticks(&mut sampler, Duration::ZERO);

        sampler.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        sampler.stop();

        let ticks = ticks.lock().unwrap();
        assert!(ticks.len() > 5);
        let mut total = Duration::ZERO;
        for pair in ticks.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            // Drift correction may shorten one gap after a late wake.
            assert!(gap >= Duration::from_millis(5), "gap {gap:?} too short");
            total += gap;
        }
        let mean = total / (ticks.len() as u32 - 1);
        assert!(mean >= Duration::from_micros(9_500), "mean gap {mean:?}");
    }

    #[test]
    fn test_overrun_reanchors_without_burst() {
        let mut sampler = sampler(100);
        let ticks = record_ticks(&mut sampler, Duration::from_millis(15));
        let stats = sampler.stats();

        sampler.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        sampler.stop();

        assert!(stats.overruns.load(Ordering::Relaxed) > 0);
        let ticks = ticks.lock().unwrap();
        for pair in ticks.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(14));
        }
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let mut sampler = sampler(1);
        sampler.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        sampler.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!sampler.is_running());
    }

    #[test]
    fn test_snapshot_holds_latest_pose() {
        let snapshot = PoseSnapshot::new();
        assert!(snapshot.load().is_none());
        snapshot.store(PoseSample::identity(1));
        snapshot.store(PoseSample::identity(2));
        assert_eq!(snapshot.load().map(|p| p.capture_time_ns), Some(2));
    }
}
