//! Capture session lifecycle and the completion hot path.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use obscura_core::prelude::{BufferHandle, BufferMap, FrameMetadata, MappedRegion, PixelMatrix};

use crate::driver::{CameraDriver, Completion, CompletionStatus, StreamConfig};
use crate::observer::{FrameObserver, ObserverSlot};
use crate::pool::RequestPool;
use crate::settings::CaptureSettings;

/// How long the worker waits on the completion channel before it checks for
/// a stop signal.
const COMPLETION_POLL: Duration = Duration::from_millis(20);

/// Errors starting a capture session.
///
/// # Example
/// ```rust
/// use obscura::prelude::*;
///
/// let mut session = CaptureSession::new(SimCamera::new().with_cameras(1));
/// let err = session
///     .start(CaptureSettings::new().camera_index(5))
///     .expect_err("index out of range");
/// assert_eq!(err.code(), "no_camera_found");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// No camera is available, or the requested index is out of range.
    #[error("no camera found at index {0}")]
    NoCameraFound(u32),
    /// The stream configuration is unsupported even after driver-side
    /// adjustment.
    #[error("stream configuration rejected: {0}")]
    ConfigurationRejected(String),
    /// Buffer or mapping allocation failed.
    #[error("buffer allocation failed: {0}")]
    AllocationFailure(String),
    /// Driver-reported failure outside the categories above.
    #[error("camera driver error: {0}")]
    Backend(String),
}

impl CaptureError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::NoCameraFound(_) => "no_camera_found",
            CaptureError::ConfigurationRejected(_) => "configuration_rejected",
            CaptureError::AllocationFailure(_) => "allocation_failure",
            CaptureError::Backend(_) => "backend_error",
        }
    }
}

/// Owns a camera end to end: stream negotiation, buffer lifecycle, the
/// request pool, and frame delivery to the registered observer.
///
/// `start` and `stop` are meant to be called from one controlling thread;
/// the observer runs on the session's internal delivery thread. Dropping
/// the session stops it.
///
/// # Example
/// ```rust
/// use obscura::prelude::*;
///
/// let mut session = CaptureSession::new(SimCamera::new());
/// let config = session.start(CaptureSettings::new().size(640, 480))?;
/// assert_eq!(config.resolution.width.get(), 640);
/// session.stop();
/// # Ok::<(), CaptureError>(())
/// ```
pub struct CaptureSession {
    driver: Option<Box<dyn CameraDriver>>,
    observer: ObserverSlot,
    active: Option<ActiveCapture>,
}

struct ActiveCapture {
    config: StreamConfig,
    stop_tx: mpsc::Sender<()>,
    worker: Option<thread::JoinHandle<()>>,
    driver_rx: mpsc::Receiver<Box<dyn CameraDriver>>,
}

impl CaptureSession {
    /// Create a session over the given driver.
    pub fn new<D: CameraDriver + 'static>(driver: D) -> Self {
        Self {
            driver: Some(Box::new(driver)),
            observer: ObserverSlot::default(),
            active: None,
        }
    }

    /// Create a session backed by the libcamera driver.
    #[cfg(feature = "libcamera")]
    pub fn libcamera() -> Self {
        Self::new(crate::driver::LibcameraCamera::new())
    }

    /// Register the frame observer, replacing any prior registration. May be
    /// called before or after `start`; registration survives stop/start
    /// cycles.
    pub fn register_observer<O: FrameObserver + 'static>(&self, observer: O) {
        self.observer.replace(Box::new(observer));
    }

    /// Effective configuration of the running stream, if started.
    pub fn config(&self) -> Option<&StreamConfig> {
        self.active.as_ref().map(|active| &active.config)
    }

    /// Whether a stream is currently running.
    pub fn is_started(&self) -> bool {
        self.active.is_some()
    }

    /// Start capturing with the given settings and return the effective
    /// stream configuration.
    ///
    /// If the session is already started, the previous stream is stopped
    /// first. On error the session is left in its pre-start state with no
    /// buffers or camera claim leaked.
    pub fn start(&mut self, settings: CaptureSettings) -> Result<StreamConfig, CaptureError> {
        if self.active.is_some() {
            self.stop();
        }
        let driver = self
            .driver
            .take()
            .ok_or_else(|| CaptureError::Backend("camera driver unavailable".into()))?;

        let (setup_tx, setup_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let (driver_tx, driver_rx) = mpsc::channel();
        let observer = self.observer.clone();
        let worker = thread::spawn(move || {
            run_capture(driver, settings, observer, setup_tx, stop_rx, driver_tx)
        });

        let setup = setup_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::Backend("capture worker died".into())));
        match setup {
            Ok(config) => {
                self.active = Some(ActiveCapture {
                    config,
                    stop_tx,
                    worker: Some(worker),
                    driver_rx,
                });
                Ok(config)
            }
            Err(err) => {
                // The worker exits right after reporting failure; take the
                // driver back so the next start can retry.
                let _ = worker.join();
                if let Ok(driver) = driver_rx.try_recv() {
                    self.driver = Some(driver);
                }
                Err(err)
            }
        }
    }

    /// Stop capturing. Safe to call repeatedly and from `Drop`; a no-op if
    /// the session was never started. The registered observer is kept.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let _ = active.stop_tx.send(());
        if let Some(worker) = active.worker.take() {
            let _ = worker.join();
        }
        if let Ok(driver) = active.driver_rx.try_recv() {
            self.driver = Some(driver);
        }
        debug!("capture session stopped");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker needs once the stream is established.
type Established = (StreamConfig, BufferMap, RequestPool, mpsc::Receiver<Completion>);

fn run_capture(
    mut driver: Box<dyn CameraDriver>,
    settings: CaptureSettings,
    observer: ObserverSlot,
    setup_tx: mpsc::Sender<Result<StreamConfig, CaptureError>>,
    stop_rx: mpsc::Receiver<()>,
    driver_tx: mpsc::Sender<Box<dyn CameraDriver>>,
) {
    match establish(driver.as_mut(), &settings) {
        Ok((config, buffers, mut pool, completions)) => {
            debug!(
                format = %config.format,
                resolution = %config.resolution,
                stride = config.stride,
                buffers = pool.len(),
                "stream configured"
            );
            let _ = setup_tx.send(Ok(config));
            pump(
                driver.as_mut(),
                &config,
                &buffers,
                &mut pool,
                &completions,
                &observer,
                &stop_rx,
            );
            // The region table must be gone before the driver unmaps and
            // frees the underlying buffers.
            drop(buffers);
            driver.release();
        }
        Err(err) => {
            // Roll back whatever the failed attempt acquired.
            driver.release();
            let _ = setup_tx.send(Err(err));
        }
    }
    let _ = driver_tx.send(driver);
}

fn establish(
    driver: &mut dyn CameraDriver,
    settings: &CaptureSettings,
) -> Result<Established, CaptureError> {
    driver.acquire(settings.camera_index)?;
    let config = driver.negotiate(&settings.stream_request())?;
    let handles = driver.allocate()?;
    let mut buffers = BufferMap::new();
    for handle in &handles {
        let regions = driver.map(*handle)?;
        buffers.insert(*handle, regions);
    }
    let completions = driver.start(&settings.controls())?;
    let mut pool = RequestPool::with_buffers(&handles);
    pool.queue_all(driver)?;
    Ok((config, buffers, pool, completions))
}

/// Serial completion loop; this thread is the only one that talks to the
/// driver while the stream runs, and the observer runs on it too.
fn pump(
    driver: &mut dyn CameraDriver,
    config: &StreamConfig,
    buffers: &BufferMap,
    pool: &mut RequestPool,
    completions: &mpsc::Receiver<Completion>,
    observer: &ObserverSlot,
    stop_rx: &mpsc::Receiver<()>,
) {
    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }
        match completions.recv_timeout(COMPLETION_POLL) {
            Ok(completion) => deliver(driver, config, buffers, pool, observer, completion),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shutdown(driver, pool, completions);
}

/// Shutdown handshake: cancel capture, then account for every in-flight
/// request before the caller tears down buffers and mappings. No frame is
/// delivered past this point.
fn shutdown(
    driver: &mut dyn CameraDriver,
    pool: &mut RequestPool,
    completions: &mpsc::Receiver<Completion>,
) {
    driver.stop();
    while pool.in_flight() > 0 {
        match completions.recv_timeout(COMPLETION_POLL) {
            Ok(_) => pool.note_completed(),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// The hot path: translate one completion into an observer callback and
/// recycle its request. Anomalies are logged and dropped; they must never
/// unwind into the delivery thread or starve the pool.
fn deliver(
    driver: &mut dyn CameraDriver,
    config: &StreamConfig,
    buffers: &BufferMap,
    pool: &mut RequestPool,
    observer: &ObserverSlot,
    completion: Completion,
) {
    let Some(request) = pool.get(completion.cookie) else {
        warn!(cookie = completion.cookie, "completion for unknown request");
        return;
    };
    let buffer = request.buffer();
    pool.note_completed();

    if completion.status == CompletionStatus::Completed {
        present(config, buffers.lookup(buffer), buffer, observer, &completion.metadata);
    }
    // A cancelled completion outside shutdown drops the frame but still
    // recycles the slot, so the pool never shrinks.
    if let Err(err) = pool.requeue(completion.cookie, driver) {
        warn!(cookie = completion.cookie, error = %err, "request requeue failed");
    }
}

fn present(
    config: &StreamConfig,
    regions: &[MappedRegion],
    buffer: BufferHandle,
    observer: &ObserverSlot,
    metadata: &FrameMetadata,
) {
    let mut guard = observer.lock();
    // Without an observer the frame is dropped silently; not an error.
    let Some(observer) = guard.as_mut() else {
        return;
    };
    let Some(region) = regions.first() else {
        warn!(%buffer, "completed buffer has no mapping");
        return;
    };
    // SAFETY: the driver filled this buffer and will not touch it again
    // until its request is requeued, which happens only after this call
    // returns; the mapping itself outlives the pump loop.
    let data = unsafe { region.as_slice() };
    match PixelMatrix::new(
        data,
        config.resolution.width.get(),
        config.resolution.height.get(),
        config.stride,
        config.format,
    ) {
        Some(matrix) => observer.frame_ready(&matrix, metadata),
        None => warn!(%buffer, "mapped region too small for the configured stream"),
    }
}
