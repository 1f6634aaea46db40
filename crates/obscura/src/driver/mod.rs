//! Driver seam between the capture session and camera hardware.

use std::sync::mpsc;

use obscura_core::prelude::{BufferHandle, ControlList, FourCc, FrameMetadata, Resolution};
use obscura_core::buffer::RegionList;

use crate::pool::CaptureRequest;
use crate::session::CaptureError;

#[cfg(feature = "libcamera")]
mod libcamera;
mod sim;

#[cfg(feature = "libcamera")]
pub use self::libcamera::LibcameraCamera;
pub use self::sim::{SimCamera, SimStats};

/// Requested stream parameters. Zero fields defer to the driver's default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

/// Effective stream configuration after driver-side validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamConfig {
    /// Pixel format of the primary plane.
    pub format: FourCc,
    /// Frame geometry the camera will actually produce.
    pub resolution: Resolution,
    /// Bytes per row of the primary plane, including driver padding.
    pub stride: usize,
    /// Effective framerate in frames per second.
    pub framerate: u32,
    /// Number of buffer slots the driver cycles through.
    pub buffer_count: usize,
}

/// Terminal state of a capture request, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The buffer holds a new frame.
    Completed,
    /// The request was cancelled; the buffer content is undefined.
    Cancelled,
}

/// One notification on the driver's completion channel.
#[derive(Debug)]
pub struct Completion {
    /// Cookie of the finished request (its pool slot).
    pub cookie: u64,
    pub status: CompletionStatus,
    /// Read-only properties the driver attached to this frame.
    pub metadata: FrameMetadata,
}

/// Hardware operations behind the capture session.
///
/// The session worker calls these in lifecycle order: `acquire`,
/// `negotiate`, `allocate`, `map` once per buffer, `start`, then `queue`
/// for every request and again on each recycle; `stop` and `release` tear
/// the stream down. `release` must be safe after any prefix of that
/// sequence and frees everything acquired so far, which is what makes a
/// failed `start` roll back cleanly.
pub trait CameraDriver: Send {
    /// Claim the camera at `index` for exclusive use.
    fn acquire(&mut self, index: u32) -> Result<(), CaptureError>;

    /// Validate the requested stream against hardware limits, adjusting
    /// where the hardware allows it, and return the effective configuration.
    fn negotiate(&mut self, request: &StreamRequest) -> Result<StreamConfig, CaptureError>;

    /// Allocate the negotiated number of frame buffers.
    fn allocate(&mut self) -> Result<Vec<BufferHandle>, CaptureError>;

    /// Map one allocated buffer into process memory, one region per plane.
    /// The mapping stays valid until `release`.
    fn map(&mut self, buffer: BufferHandle) -> Result<RegionList, CaptureError>;

    /// Start streaming with the given controls applied and hand back the
    /// completion channel. The driver owns the sending side and disconnects
    /// it once every in-flight request has been accounted for after `stop`.
    fn start(&mut self, controls: &ControlList) -> Result<mpsc::Receiver<Completion>, CaptureError>;

    /// Submit a request to be filled with the next frame.
    fn queue(&mut self, request: &CaptureRequest) -> Result<(), CaptureError>;

    /// Halt capture and cancel in-flight requests. Idempotent.
    fn stop(&mut self);

    /// Free mappings, buffers and the camera claim. Idempotent; called
    /// after the session has dropped its region table.
    fn release(&mut self);
}
