//! Reconnecting latest-frame source.
//!
//! A dedicated thread owns the capture handle and publishes only the most
//! recent frame. Open and read failures are absorbed by reopening the device
//! after a backoff, so callers of [`FrameSource::get_frame`] never see a
//! device error, only a frame that stops getting newer.

use crate::device::{CaptureDevice, DeviceOpener};
use crate::frame::Frame;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Anything that can hand out the latest frame without blocking.
pub trait FrameProvider: Send + Sync {
    /// Copy of the newest frame, or `None` if nothing has been captured yet.
    fn get_frame(&self) -> Option<Frame>;
}

/// Wait intervals of the acquisition loop.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay before retrying a failed open.
    pub reopen: Duration,
    /// Delay after a failed read before reopening.
    pub reconnect: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            reopen: Duration::from_secs(1),
            reconnect: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Running,
    Stopped,
}

/// Point-in-time counters of a [`FrameSource`].
#[derive(Debug, Clone)]
pub struct SourceStats {
    pub state: SourceState,
    pub frames_captured: u64,
    /// Successful device opens (the first one included).
    pub opens: u64,
    /// Read failures that dropped the handle.
    pub reconnects: u64,
    pub last_success: Option<Instant>,
}

#[derive(Default)]
struct Published {
    frame: Option<Frame>,
    last_success: Option<Instant>,
    frames_captured: u64,
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Published>,
    opens: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn publish(&self, image: RgbImage) {
        let mut latest = lock(&self.latest);
        latest.frames_captured += 1;
        let frame = Frame::new(image, latest.frames_captured);
        latest.last_success = Some(frame.timestamp);
        latest.frame = Some(frame);
    }
}

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

struct Control {
    state: SourceState,
    worker: Option<Worker>,
}

/// Camera frame buffer fed by a background acquisition thread.
///
/// `start`/`stop`/`get_frame` take `&self`, so the source can be shared
/// behind an `Arc` between the composition root and consumers.
pub struct FrameSource<O: DeviceOpener> {
    opener: Arc<O>,
    backoff: Backoff,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl<O: DeviceOpener> FrameSource<O> {
    pub fn new(opener: O) -> Self {
        Self::with_backoff(opener, Backoff::default())
    }

    pub fn with_backoff(opener: O, backoff: Backoff) -> Self {
        Self {
            opener: Arc::new(opener),
            backoff,
            shared: Arc::new(Shared::default()),
            control: Mutex::new(Control {
                state: SourceState::Idle,
                worker: None,
            }),
        }
    }

    pub fn source_id(&self) -> &str {
        self.opener.source_id()
    }

    /// Spawn the acquisition thread. No-op if already running.
    pub fn start(&self) -> Result<(), SourceError> {
        let mut control = lock(&self.control);
        if control.state == SourceState::Running {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let opener = Arc::clone(&self.opener);
        let shared = Arc::clone(&self.shared);
        let backoff = self.backoff;

        let thread = std::thread::Builder::new()
            .name("sightline-capture".into())
            .spawn(move || acquisition_loop(opener.as_ref(), &shared, &stop_rx, backoff))?;

        control.worker = Some(Worker { stop_tx, thread });
        control.state = SourceState::Running;
        tracing::info!(source = self.source_id(), "frame source started");
        Ok(())
    }

    /// Stop the acquisition thread and wait until it has released the device.
    ///
    /// Idempotent. Returns after at most one in-flight read; backoff waits
    /// are interrupted.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        let Some(Worker { stop_tx, thread }) = control.worker.take() else {
            return;
        };

        // The thread may already be gone; dropping the sender wakes it either way.
        let _ = stop_tx.send(());
        drop(stop_tx);

        if thread.join().is_err() {
            tracing::warn!(source = self.source_id(), "capture thread panicked");
        }
        control.state = SourceState::Stopped;
        tracing::info!(source = self.source_id(), "frame source stopped");
    }

    /// Copy of the latest published frame. Never blocks on device I/O.
    pub fn get_frame(&self) -> Option<Frame> {
        lock(&self.shared.latest).frame.clone()
    }

    pub fn state(&self) -> SourceState {
        lock(&self.control).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SourceState::Running
    }

    pub fn stats(&self) -> SourceStats {
        let state = self.state();
        let latest = lock(&self.shared.latest);
        SourceStats {
            state,
            frames_captured: latest.frames_captured,
            opens: self.shared.opens.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            last_success: latest.last_success,
        }
    }
}

impl<O: DeviceOpener> FrameProvider for FrameSource<O> {
    fn get_frame(&self) -> Option<Frame> {
        FrameSource::get_frame(self)
    }
}

impl<O: DeviceOpener> Drop for FrameSource<O> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop<O: DeviceOpener>(
    opener: &O,
    shared: &Shared,
    stop_rx: &Receiver<()>,
    backoff: Backoff,
) {
    let source = opener.source_id();
    let mut device: Option<O::Device> = None;
    let mut failed_opens = 0u32;

    tracing::debug!(source, "acquisition loop started");

    loop {
        if stop_requested(stop_rx) {
            break;
        }

        if device.is_none() {
            match opener.open() {
                Ok(dev) => {
                    shared.opens.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(source, after_failures = failed_opens, "capture device opened");
                    failed_opens = 0;
                    device = Some(dev);
                }
                Err(e) => {
                    // Only the first failure of a streak is worth a warning
                    if failed_opens == 0 {
                        tracing::warn!(source, error = %e, "failed to open capture device, retrying");
                    } else {
                        tracing::debug!(source, error = %e, attempt = failed_opens + 1, "open retry failed");
                    }
                    failed_opens = failed_opens.saturating_add(1);
                    if wait_for_stop(stop_rx, backoff.reopen) {
                        break;
                    }
                    continue;
                }
            }
        }

        let Some(dev) = device.as_mut() else {
            continue;
        };

        match dev.read_frame() {
            Ok(image) => shared.publish(image),
            Err(e) => {
                tracing::warn!(source, error = %e, "frame read failed, reconnecting");
                device = None;
                shared.reconnects.fetch_add(1, Ordering::Relaxed);
                if wait_for_stop(stop_rx, backoff.reconnect) {
                    break;
                }
            }
        }
    }

    if device.take().is_some() {
        tracing::debug!(source, "capture device released");
    }
    tracing::debug!(source, "acquisition loop exited");
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Sleep for `timeout` unless a stop arrives first. Returns true on stop.
fn wait_for_stop(stop_rx: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(stop_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraError;
    use image::Rgb;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        open_attempts: AtomicUsize,
        opens: AtomicUsize,
        drops: AtomicUsize,
        reads: AtomicUsize,
    }

    /// Opener whose first `open_failures` attempts fail and whose devices
    /// fail after `reads_per_session` successful reads.
    struct ScriptedOpener {
        counters: Arc<Counters>,
        open_failures: usize,
        reads_per_session: Option<usize>,
    }

    struct ScriptedDevice {
        counters: Arc<Counters>,
        reads_left: Option<usize>,
    }

    impl ScriptedOpener {
        fn new(counters: &Arc<Counters>) -> Self {
            Self {
                counters: Arc::clone(counters),
                open_failures: 0,
                reads_per_session: None,
            }
        }
    }

    impl DeviceOpener for ScriptedOpener {
        type Device = ScriptedDevice;

        fn source_id(&self) -> &str {
            "scripted"
        }

        fn open(&self) -> Result<ScriptedDevice, CameraError> {
            let attempt = self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.open_failures {
                return Err(CameraError::DeviceNotFound("scripted".into()));
            }
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedDevice {
                counters: Arc::clone(&self.counters),
                reads_left: self.reads_per_session,
            })
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
            std::thread::sleep(Duration::from_millis(1));
            if let Some(left) = self.reads_left.as_mut() {
                if *left == 0 {
                    return Err(CameraError::CaptureFailed("unplugged".into()));
                }
                *left -= 1;
            }
            let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);
            Ok(RgbImage::from_pixel(4, 4, Rgb([n as u8, 0, 0])))
        }
    }

    impl Drop for ScriptedDevice {
        fn drop(&mut self) {
            self.counters.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast() -> Backoff {
        Backoff {
            reopen: Duration::from_millis(5),
            reconnect: Duration::from_millis(5),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_no_frame_before_start() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        assert!(source.get_frame().is_none());
        assert_eq!(source.state(), SourceState::Idle);
        assert_eq!(counters.open_attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_publishes_frames_after_start() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        source.start().unwrap();
        assert!(source.is_running());

        assert!(wait_until(|| source.get_frame().is_some()));
        let frame = source.get_frame().unwrap();
        assert_eq!(frame.width(), 4);
        assert!(frame.sequence >= 1);

        source.stop();
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(source.stats().last_success.is_some());
    }

    #[test]
    fn test_frame_timestamp_is_publish_time() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        let before = Instant::now();
        source.start().unwrap();
        assert!(wait_until(|| source.get_frame().is_some()));
        source.stop();

        let frame = source.get_frame().unwrap();
        assert!(frame.timestamp >= before);
        assert_eq!(source.stats().last_success, Some(frame.timestamp));
    }

    #[test]
    fn test_frames_never_go_backwards() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        source.start().unwrap();
        assert!(wait_until(|| source.get_frame().is_some()));

        let mut prev = source.get_frame().unwrap();
        for _ in 0..100 {
            let next = source.get_frame().unwrap();
            assert!(next.sequence >= prev.sequence);
            assert!(next.timestamp >= prev.timestamp);
            prev = next;
            std::thread::sleep(Duration::from_micros(200));
        }
        source.stop();
    }

    #[test]
    fn test_stop_releases_device_exactly_once() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        source.start().unwrap();
        assert!(wait_until(|| source.get_frame().is_some()));

        source.stop();
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);

        source.stop();
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        source.stop();
        assert_eq!(source.state(), SourceState::Idle);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        source.start().unwrap();
        source.start().unwrap();
        assert!(wait_until(|| source.get_frame().is_some()));
        source.stop();

        // A second loop would have opened its own handle
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconnects_after_read_failure() {
        let counters = Arc::new(Counters::default());
        let mut opener = ScriptedOpener::new(&counters);
        opener.reads_per_session = Some(3);
        let source = FrameSource::with_backoff(opener, fast());
        source.start().unwrap();

        assert!(wait_until(|| counters.opens.load(Ordering::SeqCst) >= 3));
        source.stop();

        let stats = source.stats();
        assert!(stats.reconnects >= 2);
        assert!(stats.frames_captured >= 6);
        assert_eq!(
            counters.opens.load(Ordering::SeqCst),
            counters.drops.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_retries_failed_opens() {
        let counters = Arc::new(Counters::default());
        let mut opener = ScriptedOpener::new(&counters);
        opener.open_failures = 3;
        let source = FrameSource::with_backoff(opener, fast());
        source.start().unwrap();

        assert!(wait_until(|| source.get_frame().is_some()));
        source.stop();
        assert!(counters.open_attempts.load(Ordering::SeqCst) >= 4);
        assert_eq!(source.stats().opens, 1);
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let counters = Arc::new(Counters::default());
        let mut opener = ScriptedOpener::new(&counters);
        opener.open_failures = usize::MAX;
        let source = FrameSource::with_backoff(
            opener,
            Backoff {
                reopen: Duration::from_secs(30),
                reconnect: Duration::from_secs(30),
            },
        );
        source.start().unwrap();
        assert!(wait_until(|| counters.open_attempts.load(Ordering::SeqCst) >= 1));

        let started = Instant::now();
        source.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(source.get_frame().is_none());
    }

    #[test]
    fn test_get_frame_returns_independent_copy() {
        let counters = Arc::new(Counters::default());
        let mut opener = ScriptedOpener::new(&counters);
        // One frame, then a long reconnect wait keeps that frame published
        opener.reads_per_session = Some(1);
        let source = FrameSource::with_backoff(
            opener,
            Backoff {
                reopen: Duration::from_secs(30),
                reconnect: Duration::from_secs(30),
            },
        );
        source.start().unwrap();
        assert!(wait_until(|| source.stats().reconnects == 1));

        let mut copy = source.get_frame().unwrap();
        copy.image.put_pixel(0, 0, Rgb([255, 255, 255]));

        let fresh = source.get_frame().unwrap();
        assert_eq!(fresh.sequence, copy.sequence);
        assert_eq!(fresh.image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        source.stop();
    }

    #[test]
    fn test_restart_continues_sequence() {
        let counters = Arc::new(Counters::default());
        let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
        source.start().unwrap();
        assert!(wait_until(|| source.get_frame().is_some()));
        source.stop();
        let before = source.get_frame().unwrap().sequence;

        source.start().unwrap();
        assert!(wait_until(|| source
            .get_frame()
            .is_some_and(|f| f.sequence > before)));
        source.stop();
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(counters.drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_stops_thread() {
        let counters = Arc::new(Counters::default());
        {
            let source = FrameSource::with_backoff(ScriptedOpener::new(&counters), fast());
            source.start().unwrap();
            assert!(wait_until(|| source.get_frame().is_some()));
        }
        assert_eq!(counters.drops.load(Ordering::SeqCst), 1);
    }
}
