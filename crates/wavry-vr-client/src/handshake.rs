//! Two-stage frame handshake between the display thread and the texture
//! source.
//!
//! The display thread must never read a texture that is still being written,
//! and must never treat a frame as available before decode finished. Two
//! ordered conditions enforce that:
//!
//! 1. **image landed**: the decoder output reached the texture producer.
//! 2. **texture updated**: the producer copied it into the texture object.
//!
//! They are raised by different external events, so each has its own mutex
//! and condition variable. The display side never holds one lock while
//! waiting on the other.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use wavry_vr::{FrameIndex, VrError, VrResult};

#[derive(Debug, Default)]
struct ImageState {
    landed: bool,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct TextureState {
    ready_for_update: bool,
    updated: bool,
    cancelled: bool,
    /// Index handed out by the decoder for the frame in flight.
    current: Option<FrameIndex>,
    /// Index that was current when the last awaited update happened.
    signalled: Option<FrameIndex>,
}

#[derive(Debug)]
pub struct FrameHandshake {
    image: Mutex<ImageState>,
    image_landed: Condvar,
    texture: Mutex<TextureState>,
    texture_updated: Condvar,
    timeout: Duration,
}

impl FrameHandshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            image: Mutex::new(ImageState::default()),
            image_landed: Condvar::new(),
            texture: Mutex::new(TextureState::default()),
            texture_updated: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Display side. Runs `decode` to advance one frame, then waits for the
    /// image to land and for the texture update.
    ///
    /// Returns `Ok(None)` when the decoder produced nothing this tick, the
    /// frame index current at update time otherwise. Waits are bounded by the
    /// handshake timeout ([`VrError::Timeout`]) and end early with
    /// [`VrError::Interrupted`] after [`FrameHandshake::cancel`].
    pub fn acquire<F>(&self, decode: F) -> VrResult<Option<FrameIndex>>
    where
        F: FnOnce() -> Option<FrameIndex>,
    {
        {
            let mut image = self.lock_image();
            if image.cancelled {
                return Err(VrError::Interrupted);
            }
            image.landed = false;
        }

        let Some(index) = decode() else {
            return Ok(None);
        };
        self.lock_texture().current = Some(index);

        self.wait_image_landed()?;
        self.wait_texture_updated()
    }

    /// Producer side: new image data reached the texture source.
    pub fn image_landed(&self) {
        let mut image = self.lock_image();
        image.landed = true;
        self.image_landed.notify_all();
    }

    /// Producer side: performs `update` (the texture copy) under the texture
    /// lock and wakes the display thread if it is waiting for it. Returns the
    /// frame index current at the time of the update.
    pub fn update_texture<F>(&self, update: F) -> Option<FrameIndex>
    where
        F: FnOnce(),
    {
        let mut texture = self.lock_texture();
        let index = texture.current;
        update();
        if texture.ready_for_update {
            texture.ready_for_update = false;
            texture.updated = true;
            texture.signalled = index;
            self.texture_updated.notify_all();
        }
        index
    }

    pub fn is_waiting_for_update(&self) -> bool {
        self.lock_texture().ready_for_update
    }

    /// Wakes both waits with [`VrError::Interrupted`]. Stays cancelled until
    /// [`FrameHandshake::reset`].
    pub fn cancel(&self) {
        {
            let mut image = self.lock_image();
            image.cancelled = true;
            self.image_landed.notify_all();
        }
        let mut texture = self.lock_texture();
        texture.cancelled = true;
        self.texture_updated.notify_all();
    }

    pub fn reset(&self) {
        *self.lock_image() = ImageState::default();
        *self.lock_texture() = TextureState::default();
    }

    fn wait_image_landed(&self) -> VrResult<()> {
        let image = self.lock_image();
        let (image, _) = self
            .image_landed
            .wait_timeout_while(image, self.timeout, |s| !s.landed && !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if image.cancelled {
            return Err(VrError::Interrupted);
        }
        if !image.landed {
            return Err(VrError::Timeout("decoded image".to_string()));
        }
        Ok(())
    }

    fn wait_texture_updated(&self) -> VrResult<Option<FrameIndex>> {
        let mut texture = self.lock_texture();
        if texture.cancelled {
            return Err(VrError::Interrupted);
        }
        texture.updated = false;
        texture.ready_for_update = true;

        let (mut texture, _) = self
            .texture_updated
            .wait_timeout_while(texture, self.timeout, |s| !s.updated && !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if texture.cancelled {
            texture.ready_for_update = false;
            return Err(VrError::Interrupted);
        }
        if !texture.updated {
            texture.ready_for_update = false;
            return Err(VrError::Timeout("texture update".to_string()));
        }
        texture.updated = false;
        Ok(texture.signalled)
    }

    fn lock_image(&self) -> MutexGuard<'_, ImageState> {
        match self.image.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_texture(&self) -> MutexGuard<'_, TextureState> {
        match self.texture.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The texture-source end of a [`FrameHandshake`].
#[derive(Debug, Clone)]
pub struct TextureSignals {
    handshake: Arc<FrameHandshake>,
}

impl TextureSignals {
    pub fn new(handshake: Arc<FrameHandshake>) -> Self {
        Self { handshake }
    }

    pub fn image_landed(&self) {
        self.handshake.image_landed();
    }

    pub fn update_texture<F>(&self, update: F) -> Option<FrameIndex>
    where
        F: FnOnce(),
    {
        self.handshake.update_texture(update)
    }

    pub fn is_waiting_for_update(&self) -> bool {
        self.handshake.is_waiting_for_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn handshake(timeout_ms: u64) -> Arc<FrameHandshake> {
        Arc::new(FrameHandshake::new(Duration::from_millis(timeout_ms)))
    }

    /// Calls `update_texture` until stopped, like a GL thread that updates
    /// its external texture every draw.
    fn spawn_updater(
        handshake: Arc<FrameHandshake>,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                handshake.update_texture(|| {});
                thread::sleep(Duration::from_millis(1));
            }
        })
    }

    #[test]
    fn test_nothing_decoded_returns_early() {
        let hs = handshake(50);
        let started = Instant::now();
        assert_eq!(hs.acquire(|| None).unwrap(), None);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!hs.is_waiting_for_update());
    }

    #[test]
    fn test_full_handshake_returns_decoded_index() {
        let hs = handshake(1_000);
        let stop = Arc::new(AtomicBool::new(false));
        let updater = spawn_updater(hs.clone(), stop.clone());

        let producer = hs.clone();
        let index = hs
            .acquire(move || {
                producer.image_landed();
                Some(42)
            })
            .unwrap();
        assert_eq!(index, Some(42));

        stop.store(true, Ordering::SeqCst);
        updater.join().unwrap();
    }

    #[test]
    fn test_missing_image_times_out() {
        let hs = handshake(30);
        let result = hs.acquire(|| Some(1));
        assert!(matches!(result, Err(VrError::Timeout(_))));
    }

    #[test]
    fn test_missing_texture_update_times_out() {
        let hs = handshake(30);
        let producer = hs.clone();
        let result = hs.acquire(move || {
            producer.image_landed();
            Some(1)
        });
        assert!(matches!(result, Err(VrError::Timeout(_))));
        assert!(!hs.is_waiting_for_update());
    }

    #[test]
    fn test_update_before_ready_is_not_consumed() {
        let hs = handshake(30);
        // An update nobody waits for must not satisfy a later wait.
        hs.update_texture(|| {});
        let producer = hs.clone();
        let result = hs.acquire(move || {
            producer.image_landed();
            producer.update_texture(|| {});
            Some(5)
        });
        assert!(matches!(result, Err(VrError::Timeout(_))));
    }

    #[test]
    fn test_cancel_wakes_blocked_display() {
        let hs = handshake(10_000);
        let waiter = {
            let hs = hs.clone();
            thread::spawn(move || {
                let started = Instant::now();
                (hs.acquire(|| Some(9)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        hs.cancel();

        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(VrError::Interrupted)));
        assert!(elapsed < Duration::from_secs(5));

        assert!(matches!(hs.acquire(|| Some(1)), Err(VrError::Interrupted)));
        hs.reset();
        assert_eq!(hs.acquire(|| None).unwrap(), None);
    }

    #[test]
    fn test_texture_signals_report_current_index() {
        let hs = handshake(1_000);
        let signals = TextureSignals::new(hs.clone());
        assert_eq!(signals.update_texture(|| {}), None);

        let stop = Arc::new(AtomicBool::new(false));
        let updater = {
            let signals = signals.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut last = None;
                while !stop.load(Ordering::SeqCst) {
                    if signals.is_waiting_for_update() {
                        last = signals.update_texture(|| {});
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                last
            })
        };

        let landed = signals.clone();
        let index = hs
            .acquire(move || {
                landed.image_landed();
                Some(77)
            })
            .unwrap();
        stop.store(true, Ordering::SeqCst);
        assert_eq!(index, Some(77));
        assert_eq!(updater.join().unwrap(), Some(77));
    }
}
