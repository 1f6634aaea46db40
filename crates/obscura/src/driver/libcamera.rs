//! libcamera-backed driver. Compiled with the `libcamera` feature.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use libcamera::camera::{ActiveCamera, CameraConfiguration, CameraConfigurationStatus};
use libcamera::camera_manager::CameraManager;
use libcamera::control::ControlList as LcControlList;
use libcamera::control_value::ControlValue as LcValue;
use libcamera::controls::ControlId as LcId;
use libcamera::framebuffer_allocator::{FrameBuffer, FrameBufferAllocator};
use libcamera::framebuffer_map::MemoryMappedFrameBuffer;
use libcamera::geometry::Size;
use libcamera::pixel_format::PixelFormat;
use libcamera::request::{Request, RequestStatus, ReuseFlag};
use libcamera::stream::{Stream, StreamRole};
use smallvec::SmallVec;
use tracing::{debug, warn};

use obscura_core::buffer::RegionList;
use obscura_core::prelude::*;

use crate::driver::{CameraDriver, Completion, CompletionStatus, StreamConfig, StreamRequest};
use crate::pool::CaptureRequest;
use crate::session::CaptureError;

/// Buffer slots requested from the pipeline handler.
const REQUEST_DEPTH: u32 = 4;

type Slab = Arc<Mutex<HashMap<u64, SlabEntry>>>;

struct SlabEntry {
    request: Request,
    /// Whether the request has been through a completion and needs
    /// `reuse()` before it can be queued again.
    recycled: bool,
}

struct CameraState {
    cam: ActiveCamera<'static>,
    // Configuration and allocator are never read back, but the stream and
    // its buffers stay valid only while they live.
    cfgs: Option<CameraConfiguration>,
    stream: Option<Stream>,
    framerate: u32,
    allocator: Option<FrameBufferAllocator>,
    /// Mapped framebuffers by slot; taken when the slot's request is built.
    mapped: Vec<Option<MemoryMappedFrameBuffer<FrameBuffer>>>,
    slab: Slab,
    relay: Option<thread::JoinHandle<()>>,
    streaming: bool,
}

/// Driver over a real camera via libcamera.
///
/// The camera manager is created in `acquire` and dropped in `release`, so
/// its lifetime is scoped to the session's started span rather than the
/// process.
pub struct LibcameraCamera {
    // `state` borrows from `manager` (see the transmute in `acquire`);
    // field order keeps the borrower dropping first.
    state: Option<CameraState>,
    manager: Option<Box<CameraManager>>,
}

// The raw libcamera handles are not Send on their own; the session confines
// the driver to one thread at a time (construction on the caller, then the
// worker), never sharing it.
unsafe impl Send for LibcameraCamera {}

impl LibcameraCamera {
    pub fn new() -> Self {
        Self {
            state: None,
            manager: None,
        }
    }
}

impl Default for LibcameraCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for LibcameraCamera {
    fn acquire(&mut self, index: u32) -> Result<(), CaptureError> {
        let manager = Box::new(
            CameraManager::new().map_err(|e| CaptureError::Backend(e.to_string()))?,
        );
        let active = {
            let cameras = manager.cameras();
            if index as usize >= cameras.len() {
                return Err(CaptureError::NoCameraFound(index));
            }
            let cam = cameras
                .get(index as usize)
                .ok_or(CaptureError::NoCameraFound(index))?;
            debug!(id = cam.id(), "acquiring camera");
            let active = cam
                .acquire()
                .map_err(|e| CaptureError::Backend(e.to_string()))?;
            // SAFETY: the manager is boxed and stored alongside the camera;
            // `release` drops the camera state before the manager, so the
            // extended lifetime never outlives the allocation it borrows.
            unsafe {
                std::mem::transmute::<ActiveCamera<'_>, ActiveCamera<'static>>(active)
            }
        };
        self.manager = Some(manager);
        self.state = Some(CameraState {
            cam: active,
            cfgs: None,
            stream: None,
            framerate: 0,
            allocator: None,
            mapped: Vec::new(),
            slab: Arc::new(Mutex::new(HashMap::new())),
            relay: None,
            streaming: false,
        });
        Ok(())
    }

    fn negotiate(&mut self, request: &StreamRequest) -> Result<StreamConfig, CaptureError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Backend("camera not acquired".into()))?;
        let mut cfgs = state
            .cam
            .generate_configuration(&[StreamRole::ViewFinder])
            .ok_or_else(|| CaptureError::Backend("generate_configuration failed".into()))?;
        {
            let mut cfg = cfgs
                .get_mut(0)
                .ok_or_else(|| CaptureError::Backend("missing stream config".into()))?;
            cfg.set_pixel_format(PixelFormat::new(lc_fourcc(WIRE_FORMAT).to_u32(), 0));
            if request.width > 0 && request.height > 0 {
                cfg.set_size(Size::new(request.width, request.height));
            }
            cfg.set_buffer_count(REQUEST_DEPTH);
        }
        if matches!(cfgs.validate(), CameraConfigurationStatus::Invalid) {
            return Err(CaptureError::ConfigurationRejected(format!(
                "{}x{} {} not supported",
                request.width, request.height, WIRE_FORMAT
            )));
        }
        state
            .cam
            .configure(&mut cfgs)
            .map_err(|e| CaptureError::ConfigurationRejected(e.to_string()))?;

        let cfg = cfgs
            .get(0)
            .ok_or_else(|| CaptureError::Backend("missing validated config".into()))?;
        let size = cfg.get_size();
        let resolution = Resolution::new(size.width, size.height).ok_or_else(|| {
            CaptureError::ConfigurationRejected("driver produced a zero-sized stream".into())
        })?;
        let stream = cfg
            .stream()
            .ok_or_else(|| CaptureError::Backend("missing stream".into()))?;
        let config = StreamConfig {
            format: friendly_fourcc(FourCc::from(cfg.get_pixel_format().fourcc())),
            resolution,
            stride: cfg.get_stride() as usize,
            framerate: request.framerate,
            buffer_count: REQUEST_DEPTH as usize,
        };
        state.cfgs = Some(cfgs);
        state.stream = Some(stream);
        state.framerate = request.framerate;
        Ok(config)
    }

    fn allocate(&mut self) -> Result<Vec<BufferHandle>, CaptureError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Backend("camera not acquired".into()))?;
        let stream = state
            .stream
            .as_ref()
            .ok_or_else(|| CaptureError::Backend("stream not negotiated".into()))?;
        let mut allocator = FrameBufferAllocator::new(&state.cam);
        let buffers = allocator
            .alloc(stream)
            .map_err(|e| CaptureError::AllocationFailure(e.to_string()))?;
        let mut handles = Vec::with_capacity(buffers.len());
        for (i, buffer) in buffers.into_iter().enumerate() {
            let mapped = MemoryMappedFrameBuffer::new(buffer)
                .map_err(|e| CaptureError::AllocationFailure(e.to_string()))?;
            state.mapped.push(Some(mapped));
            handles.push(BufferHandle::new(i as u64));
        }
        state.allocator = Some(allocator);
        Ok(handles)
    }

    fn map(&mut self, buffer: BufferHandle) -> Result<RegionList, CaptureError> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| CaptureError::Backend("camera not acquired".into()))?;
        let mapped = state
            .mapped
            .get(buffer.raw() as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| CaptureError::AllocationFailure(format!("no {buffer} to map")))?;
        let mut regions = SmallVec::new();
        for plane in mapped.data() {
            regions.push(MappedRegion::new(plane.as_ptr(), plane.len()));
        }
        Ok(regions)
    }

    fn start(&mut self, controls: &ControlList) -> Result<mpsc::Receiver<Completion>, CaptureError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Backend("camera not acquired".into()))?;
        let stream = state
            .stream
            .as_ref()
            .ok_or_else(|| CaptureError::Backend("stream not negotiated".into()))?;

        let mut list = LcControlList::new();
        for (id, value) in controls.iter() {
            let Some(raw) = lc_control_id(id) else {
                warn!(id = id.0, "control has no libcamera equivalent");
                continue;
            };
            list.set_raw(raw, lc_value(value))
                .map_err(|e| CaptureError::Backend(e.to_string()))?;
        }
        if state.framerate > 0 {
            // libcamera takes frame duration limits in microseconds.
            let duration_us = (1_000_000 / u64::from(state.framerate)).max(1) as i64;
            list.set_raw(
                LcId::FrameDurationLimits as u32,
                LcValue::from([duration_us, duration_us]),
            )
            .map_err(|e| CaptureError::Backend(e.to_string()))?;
        }

        for i in 0..state.mapped.len() {
            let Some(buffer) = state.mapped[i].take() else {
                continue;
            };
            let mut request = state
                .cam
                .create_request(Some(i as u64))
                .ok_or_else(|| CaptureError::Backend("request create failed".into()))?;
            request
                .add_buffer(stream, buffer)
                .map_err(|e| CaptureError::Backend(e.to_string()))?;
            state
                .slab
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    i as u64,
                    SlabEntry {
                        request,
                        recycled: false,
                    },
                );
        }

        let req_rx = state.cam.subscribe_request_completed();
        let start_controls = if list.is_empty() { None } else { Some(list) };
        state
            .cam
            .start(start_controls.as_ref().map(|c| &**c))
            .map_err(|e| CaptureError::Backend(e.to_string()))?;
        state.streaming = true;

        let (completion_tx, completion_rx) = mpsc::channel();
        let slab = state.slab.clone();
        state.relay = Some(thread::spawn(move || {
            // Requests come back owned; park them in the slab for requeue and
            // forward a completion event.
            let mut sequence: u64 = 0;
            while let Ok(request) = req_rx.recv() {
                let cookie = request.cookie();
                let status = match request.status() {
                    RequestStatus::Cancelled => CompletionStatus::Cancelled,
                    _ => CompletionStatus::Completed,
                };
                let metadata = if status == CompletionStatus::Completed {
                    let metadata = translate_metadata(&request, sequence);
                    sequence += 1;
                    metadata
                } else {
                    FrameMetadata::default()
                };
                slab.lock().unwrap_or_else(PoisonError::into_inner).insert(
                    cookie,
                    SlabEntry {
                        request,
                        recycled: true,
                    },
                );
                if completion_tx
                    .send(Completion {
                        cookie,
                        status,
                        metadata,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));
        Ok(completion_rx)
    }

    fn queue(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Backend("camera not acquired".into()))?;
        let entry = state
            .slab
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request.cookie())
            .ok_or_else(|| {
                CaptureError::Backend(format!("request {} not available", request.cookie()))
            })?;
        let mut lc_request = entry.request;
        if entry.recycled {
            lc_request.reuse(ReuseFlag::REUSE_BUFFERS);
        }
        {
            let controls = lc_request.controls_mut();
            for (id, value) in request.controls().iter() {
                if let Some(raw) = lc_control_id(id) {
                    let _ = controls.set_raw(raw, lc_value(value));
                }
            }
        }
        state
            .cam
            .queue_request(lc_request)
            .map_err(|(_, e)| CaptureError::Backend(e.to_string()))
    }

    fn stop(&mut self) {
        if let Some(state) = self.state.as_mut()
            && state.streaming
        {
            state.streaming = false;
            // Cancels in-flight requests; they drain through the relay.
            if let Err(e) = state.cam.stop() {
                warn!(error = %e, "camera stop failed");
            }
        }
    }

    fn release(&mut self) {
        self.stop();
        if let Some(mut state) = self.state.take() {
            let relay = state.relay.take();
            state
                .slab
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            // Dropping the camera ends the completion subscription, which
            // lets the relay exit before the manager goes away.
            drop(state);
            if let Some(relay) = relay {
                let _ = relay.join();
            }
        }
        self.manager = None;
    }
}

/// Wire format requested from the ISP: packed 24-bit RGB.
const WIRE_FORMAT: FourCc = FourCc::new(*b"RG24");

/// libcamera spells packed RGB24 as `RGB3`; the rest of the pipeline uses
/// the `RG24` alias.
fn lc_fourcc(code: FourCc) -> FourCc {
    match &code.to_u32().to_le_bytes() {
        b"RG24" => FourCc::new(*b"RGB3"),
        b"BG24" => FourCc::new(*b"BGR3"),
        _ => code,
    }
}

fn friendly_fourcc(code: FourCc) -> FourCc {
    match &code.to_u32().to_le_bytes() {
        b"RGB3" => FourCc::new(*b"RG24"),
        b"BGR3" => FourCc::new(*b"BG24"),
        _ => code,
    }
}

fn lc_control_id(id: ControlId) -> Option<u32> {
    let lc = match id {
        ids::BRIGHTNESS => LcId::Brightness,
        ids::CONTRAST => LcId::Contrast,
        ids::EXPOSURE_TIME => LcId::ExposureTime,
        ids::EXPOSURE_VALUE => LcId::ExposureValue,
        ids::SATURATION => LcId::Saturation,
        ids::AF_MODE => LcId::AfMode,
        ids::LENS_POSITION => LcId::LensPosition,
        _ => return None,
    };
    Some(lc as u32)
}

fn lc_value(value: &ControlValue) -> LcValue {
    match value {
        ControlValue::None => LcValue::None,
        ControlValue::Bool(v) => LcValue::from(*v),
        ControlValue::Int(v) => LcValue::from(*v),
        ControlValue::Int64(v) => LcValue::from(*v),
        ControlValue::Uint(v) => LcValue::from(*v),
        ControlValue::Float(v) => LcValue::from(*v),
    }
}

/// Snapshot the request metadata entries this pipeline understands.
fn translate_metadata(request: &Request, sequence: u64) -> FrameMetadata {
    let mut controls = ControlList::new();
    controls.set(ids::SENSOR_SEQUENCE, ControlValue::Int64(sequence as i64));
    for (id, value) in request.metadata() {
        let target = match LcId::try_from(id) {
            Ok(LcId::SensorTimestamp) => ids::SENSOR_TIMESTAMP,
            Ok(LcId::ExposureTime) => ids::EXPOSURE_TIME,
            _ => continue,
        };
        if let Some(value) = from_lc_value(&value) {
            controls.set(target, value);
        }
    }
    FrameMetadata::from_controls(controls)
}

fn from_lc_value(value: &LcValue) -> Option<ControlValue> {
    match value {
        LcValue::None => Some(ControlValue::None),
        LcValue::Bool(v) if v.len() == 1 => v.get(0).copied().map(ControlValue::Bool),
        LcValue::Int32(v) if v.len() == 1 => v.get(0).copied().map(ControlValue::Int),
        LcValue::Int64(v) if v.len() == 1 => v.get(0).copied().map(ControlValue::Int64),
        LcValue::Uint32(v) if v.len() == 1 => v.get(0).copied().map(ControlValue::Uint),
        LcValue::Float(v) if v.len() == 1 => v.get(0).copied().map(ControlValue::Float),
        _ => None,
    }
}
