#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod controls;
pub mod format;

pub mod prelude {
    pub use crate::{
        buffer::{BufferHandle, BufferMap, MappedRegion, PixelMatrix},
        controls::{ControlId, ControlList, ControlValue, FrameMetadata, ids},
        format::{FourCc, Resolution, packed_bytes_per_pixel},
    };
}
