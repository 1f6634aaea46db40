//! Simulated camera driver used by tests and examples.
//!
//! The sensor is deterministic: negotiation clamps oversized dimensions,
//! rejects framerates beyond the sensor limit, and frames carry a
//! sequence-derived test pattern. A pacer thread plays the hardware
//! notification source.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use smallvec::smallvec;
use tracing::debug;

use obscura_core::buffer::RegionList;
use obscura_core::prelude::*;

use crate::driver::{CameraDriver, Completion, CompletionStatus, StreamConfig, StreamRequest};
use crate::pool::CaptureRequest;
use crate::session::CaptureError;

/// Packed 24-bit RGB, the only wire format the simulated sensor produces.
const SIM_FORMAT: FourCc = FourCc::new(*b"RG24");
const SIM_BPP: usize = 3;
/// Rows are padded to this alignment, as real ISPs do.
const STRIDE_ALIGN: usize = 64;
/// Exposure reported when the host leaves exposure on auto.
const AUTO_EXPOSURE_US: i64 = 10_000;

#[derive(Debug, Clone, Copy)]
struct SimSensor {
    default_width: u32,
    default_height: u32,
    default_framerate: u32,
    max_width: u32,
    max_height: u32,
    max_framerate: u32,
}

impl Default for SimSensor {
    fn default() -> Self {
        Self {
            default_width: 640,
            default_height: 480,
            default_framerate: 30,
            max_width: 1920,
            max_height: 1080,
            max_framerate: 120,
        }
    }
}

/// Counters the simulated driver shares with tests.
#[derive(Debug, Default)]
pub struct SimStats {
    live_buffers: AtomicUsize,
    frames_completed: AtomicU64,
    frames_cancelled: AtomicU64,
    applied_controls: Mutex<ControlList>,
}

impl SimStats {
    /// Buffers currently allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Acquire)
    }

    /// Requests completed with a frame since the driver was created.
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed.load(Ordering::Acquire)
    }

    /// Requests that finished cancelled.
    pub fn frames_cancelled(&self) -> u64 {
        self.frames_cancelled.load(Ordering::Acquire)
    }

    /// The control list the host applied at the most recent stream start.
    pub fn applied_controls(&self) -> ControlList {
        self.applied_controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct SimBuffer {
    handle: BufferHandle,
    data: Box<[u8]>,
    stats: Arc<SimStats>,
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        self.stats.live_buffers.fetch_sub(1, Ordering::Release);
    }
}

struct SimStream {
    queue_tx: Option<mpsc::Sender<(u64, BufferHandle)>>,
    cancel: Arc<AtomicBool>,
    pacer: Option<thread::JoinHandle<()>>,
}

/// Deterministic in-process camera.
///
/// # Example
/// ```rust
/// use obscura::prelude::*;
///
/// let mut cam = SimCamera::new().with_frame_limit(3);
/// cam.acquire(0).unwrap();
/// let config = cam.negotiate(&StreamRequest::default()).unwrap();
/// assert_eq!(config.resolution.width.get(), 640);
/// ```
pub struct SimCamera {
    cameras: u32,
    sensor: SimSensor,
    buffer_count: usize,
    frame_limit: Option<u64>,
    pacing: Option<Duration>,
    fail_allocation: bool,
    stats: Arc<SimStats>,
    acquired: Option<u32>,
    config: Option<StreamConfig>,
    buffers: Vec<SimBuffer>,
    stream: Option<SimStream>,
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCamera {
    /// One camera with a 640x480 @ 30 fps default mode and four buffer slots.
    pub fn new() -> Self {
        Self {
            cameras: 1,
            sensor: SimSensor::default(),
            buffer_count: 4,
            frame_limit: None,
            pacing: None,
            fail_allocation: false,
            stats: Arc::new(SimStats::default()),
            acquired: None,
            config: None,
            buffers: Vec::new(),
            stream: None,
        }
    }

    /// Number of cameras the driver enumerates.
    pub fn with_cameras(mut self, count: u32) -> Self {
        self.cameras = count;
        self
    }

    /// Override the driver-chosen default mode.
    pub fn with_defaults(mut self, width: u32, height: u32, framerate: u32) -> Self {
        self.sensor.default_width = width.max(1);
        self.sensor.default_height = height.max(1);
        self.sensor.default_framerate = framerate.max(1);
        self
    }

    /// Override the sensor limits used during negotiation.
    pub fn with_limits(mut self, max_width: u32, max_height: u32, max_framerate: u32) -> Self {
        self.sensor.max_width = max_width.max(1);
        self.sensor.max_height = max_height.max(1);
        self.sensor.max_framerate = max_framerate.max(1);
        self
    }

    /// Number of buffer slots the stream cycles through.
    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count.max(1);
        self
    }

    /// Complete at most `frames` requests, then leave further requests
    /// pending until the stream stops.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Delay between completions. Without pacing the sensor completes
    /// requests as fast as they arrive.
    pub fn with_pacing(mut self, interval: Duration) -> Self {
        self.pacing = Some(interval);
        self
    }

    /// Make every buffer allocation fail, for rollback testing.
    pub fn with_failing_allocation(mut self) -> Self {
        self.fail_allocation = true;
        self
    }

    /// Shared counters for assertions; clone before handing the driver to a
    /// session.
    pub fn stats(&self) -> Arc<SimStats> {
        self.stats.clone()
    }
}

impl CameraDriver for SimCamera {
    fn acquire(&mut self, index: u32) -> Result<(), CaptureError> {
        if index >= self.cameras {
            return Err(CaptureError::NoCameraFound(index));
        }
        self.acquired = Some(index);
        Ok(())
    }

    fn negotiate(&mut self, request: &StreamRequest) -> Result<StreamConfig, CaptureError> {
        if self.acquired.is_none() {
            return Err(CaptureError::Backend("camera not acquired".into()));
        }
        let sensor = self.sensor;
        // Zero dimensions defer to the sensor default; oversized ones are
        // adjusted down, but a framerate beyond the sensor is a hard reject.
        let width = if request.width == 0 {
            sensor.default_width
        } else {
            request.width.min(sensor.max_width)
        };
        let height = if request.height == 0 {
            sensor.default_height
        } else {
            request.height.min(sensor.max_height)
        };
        let framerate = if request.framerate == 0 {
            sensor.default_framerate
        } else {
            request.framerate
        };
        if framerate > sensor.max_framerate {
            return Err(CaptureError::ConfigurationRejected(format!(
                "{framerate} fps exceeds the sensor limit of {} fps",
                sensor.max_framerate
            )));
        }
        let resolution = Resolution::new(width, height)
            .ok_or_else(|| CaptureError::ConfigurationRejected("zero-sized stream".into()))?;
        let stride = (width as usize * SIM_BPP).next_multiple_of(STRIDE_ALIGN);
        let config = StreamConfig {
            format: SIM_FORMAT,
            resolution,
            stride,
            framerate,
            buffer_count: self.buffer_count,
        };
        self.config = Some(config);
        Ok(config)
    }

    fn allocate(&mut self) -> Result<Vec<BufferHandle>, CaptureError> {
        let config = self
            .config
            .ok_or_else(|| CaptureError::Backend("stream not negotiated".into()))?;
        if self.fail_allocation {
            return Err(CaptureError::AllocationFailure(
                "simulated allocator exhausted".into(),
            ));
        }
        let size = config.stride * config.resolution.height.get() as usize;
        let mut handles = Vec::with_capacity(config.buffer_count);
        for i in 0..config.buffer_count {
            let handle = BufferHandle::new(i as u64);
            self.stats.live_buffers.fetch_add(1, Ordering::Release);
            self.buffers.push(SimBuffer {
                handle,
                data: vec![0u8; size].into_boxed_slice(),
                stats: self.stats.clone(),
            });
            handles.push(handle);
        }
        Ok(handles)
    }

    fn map(&mut self, buffer: BufferHandle) -> Result<RegionList, CaptureError> {
        let buf = self
            .buffers
            .iter()
            .find(|b| b.handle == buffer)
            .ok_or_else(|| CaptureError::AllocationFailure(format!("no {buffer} to map")))?;
        Ok(smallvec![MappedRegion::new(buf.data.as_ptr(), buf.data.len())])
    }

    fn start(&mut self, controls: &ControlList) -> Result<mpsc::Receiver<Completion>, CaptureError> {
        let config = self
            .config
            .ok_or_else(|| CaptureError::Backend("stream not negotiated".into()))?;
        if self.stream.is_some() {
            return Err(CaptureError::Backend("stream already running".into()));
        }
        *self
            .stats
            .applied_controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = controls.clone();
        let exposure_us = controls
            .get(ids::EXPOSURE_TIME)
            .and_then(|v| v.as_i64())
            .unwrap_or(AUTO_EXPOSURE_US);

        let (queue_tx, queue_rx) = mpsc::channel();
        let (completion_tx, completion_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let pacer = Pacer {
            config,
            // The pacer owns the buffer memory while streaming; mapped
            // regions stay valid because the boxed payloads never move.
            buffers: std::mem::take(&mut self.buffers),
            queue_rx,
            completion_tx,
            cancel: cancel.clone(),
            frame_limit: self.frame_limit,
            pacing: self.pacing,
            exposure_us,
            stats: self.stats.clone(),
        };
        let handle = thread::spawn(move || pacer.run());
        self.stream = Some(SimStream {
            queue_tx: Some(queue_tx),
            cancel,
            pacer: Some(handle),
        });
        debug!(frames = ?self.frame_limit, "simulated sensor streaming");
        Ok(completion_rx)
    }

    fn queue(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| CaptureError::Backend("stream not running".into()))?;
        let tx = stream
            .queue_tx
            .as_ref()
            .ok_or_else(|| CaptureError::Backend("stream stopping".into()))?;
        tx.send((request.cookie(), request.buffer()))
            .map_err(|_| CaptureError::Backend("notification channel closed".into()))
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.cancel.store(true, Ordering::Release);
            // Dropping the queue sender lets the pacer drain what is left,
            // cancel it, and disconnect the completion channel.
            stream.queue_tx = None;
        }
    }

    fn release(&mut self) {
        self.stop();
        if let Some(mut stream) = self.stream.take()
            && let Some(pacer) = stream.pacer.take()
        {
            let _ = pacer.join();
        }
        self.buffers.clear();
        self.config = None;
        self.acquired = None;
    }
}

struct Pacer {
    config: StreamConfig,
    buffers: Vec<SimBuffer>,
    queue_rx: mpsc::Receiver<(u64, BufferHandle)>,
    completion_tx: mpsc::Sender<Completion>,
    cancel: Arc<AtomicBool>,
    frame_limit: Option<u64>,
    pacing: Option<Duration>,
    exposure_us: i64,
    stats: Arc<SimStats>,
}

impl Pacer {
    fn run(mut self) {
        let started = Instant::now();
        let mut sequence: u64 = 0;
        // Requests the sensor will never complete (frame budget exhausted);
        // they are cancelled when the stream stops.
        let mut starved: Vec<(u64, BufferHandle)> = Vec::new();
        loop {
            match self.queue_rx.recv_timeout(Duration::from_millis(5)) {
                Ok(work) => {
                    if self.cancel.load(Ordering::Acquire) {
                        self.cancel_one(work);
                        continue;
                    }
                    if self.frame_limit.is_some_and(|limit| sequence >= limit) {
                        starved.push(work);
                        continue;
                    }
                    if let Some(interval) = self.pacing {
                        thread::sleep(interval);
                    }
                    self.complete_one(work, sequence, started);
                    sequence += 1;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.cancel.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        for work in starved {
            self.cancel_one(work);
        }
        // Dropping self disconnects the completion channel: the shutdown
        // handshake terminator, and the point where the buffers are freed.
    }

    fn complete_one(&mut self, (cookie, handle): (u64, BufferHandle), sequence: u64, started: Instant) {
        if let Some(buf) = self.buffers.iter_mut().find(|b| b.handle == handle) {
            paint(&mut buf.data, &self.config, sequence);
        }
        let mut controls = ControlList::new();
        controls.set(
            ids::SENSOR_TIMESTAMP,
            ControlValue::Int64(started.elapsed().as_nanos() as i64),
        );
        controls.set(ids::SENSOR_SEQUENCE, ControlValue::Int64(sequence as i64));
        controls.set(ids::EXPOSURE_TIME, ControlValue::Int64(self.exposure_us));
        self.stats.frames_completed.fetch_add(1, Ordering::Release);
        let _ = self.completion_tx.send(Completion {
            cookie,
            status: CompletionStatus::Completed,
            metadata: FrameMetadata::from_controls(controls),
        });
    }

    fn cancel_one(&self, (cookie, _): (u64, BufferHandle)) {
        self.stats.frames_cancelled.fetch_add(1, Ordering::Release);
        let _ = self.completion_tx.send(Completion {
            cookie,
            status: CompletionStatus::Cancelled,
            metadata: FrameMetadata::default(),
        });
    }
}

/// Sequence-dependent gradient so consecutive frames are distinguishable.
fn paint(data: &mut [u8], config: &StreamConfig, sequence: u64) {
    let width = config.resolution.width.get() as usize;
    let height = config.resolution.height.get() as usize;
    let seq = (sequence & 0xff) as u8;
    for y in 0..height {
        let row = &mut data[y * config.stride..y * config.stride + width * SIM_BPP];
        for (x, px) in row.chunks_exact_mut(SIM_BPP).enumerate() {
            px[0] = (x as u8).wrapping_add(seq);
            px[1] = y as u8;
            px[2] = seq;
        }
    }
}
