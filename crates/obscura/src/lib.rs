#![doc = include_str!("../README.md")]

pub use obscura_core as core;

pub mod driver;
pub mod observer;
pub mod pool;
pub mod session;
pub mod settings;

pub mod prelude {
    #[cfg(feature = "libcamera")]
    pub use crate::driver::LibcameraCamera;
    pub use crate::driver::{
        CameraDriver, Completion, CompletionStatus, SimCamera, SimStats, StreamConfig,
        StreamRequest,
    };
    pub use crate::observer::FrameObserver;
    pub use crate::pool::{CaptureRequest, RequestPool};
    pub use crate::session::{CaptureError, CaptureSession};
    pub use crate::settings::CaptureSettings;
    pub use obscura_core::prelude::*;
}
