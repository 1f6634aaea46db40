//! Capture settings with documented "auto" sentinels.

use obscura_core::prelude::{ControlList, ControlValue, ids};

use crate::driver::StreamRequest;

/// Value record describing a capture stream and its control setpoints.
///
/// Each field has a sentinel meaning "let the driver decide"; sentinel
/// values are never sent to the hardware as literals. The record is copied
/// into the session at `start` and immutable afterwards.
///
/// # Example
/// ```rust
/// use obscura::prelude::CaptureSettings;
///
/// let settings = CaptureSettings::new()
///     .size(1280, 720)
///     .framerate(60)
///     .contrast(1.2);
/// assert_eq!(settings.width, 1280);
/// assert_eq!(settings.controls().len(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CaptureSettings {
    /// Index of the camera to open. Default is 0, the first enumerated camera.
    pub camera_index: u32,
    /// Requested capture width in pixels. Zero lets the driver decide.
    pub width: u32,
    /// Requested capture height in pixels. Zero lets the driver decide.
    pub height: u32,
    /// Requested framerate in frames per second. Zero lets the driver decide.
    pub framerate: u32,
    /// Brightness adjustment. 0.0 is neutral and is omitted.
    pub brightness: f32,
    /// Contrast multiplier. 1.0 is neutral and is omitted.
    pub contrast: f32,
    /// Exposure time in microseconds. Zero keeps auto-exposure.
    pub exposure_time_us: i64,
    /// Exposure value adjustment as a log2 scale factor; EV 1.0 doubles the
    /// exposure, EV -1.0 halves it. 0.0 is neutral and is omitted.
    pub exposure_value: f32,
    /// Saturation multiplier. 1.0 is neutral and is omitted; 0.0 is greyscale.
    pub saturation: f32,
    /// Lens position for manual focus, 0.0 closest, 1.0 furthest. Keep
    /// negative for auto-focus.
    pub lens_position: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 0,
            height: 0,
            framerate: 0,
            brightness: 0.0,
            contrast: 1.0,
            exposure_time_us: 0,
            exposure_value: 0.0,
            saturation: 1.0,
            lens_position: -1.0,
        }
    }
}

impl CaptureSettings {
    /// Defaults: first camera, driver-chosen stream, every control on auto.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the camera by enumeration index.
    pub fn camera_index(mut self, index: u32) -> Self {
        self.camera_index = index;
        self
    }

    /// Request a capture resolution.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Request a framerate in frames per second.
    pub fn framerate(mut self, fps: u32) -> Self {
        self.framerate = fps;
        self
    }

    /// Adjust brightness; 0.0 is neutral.
    pub fn brightness(mut self, value: f32) -> Self {
        self.brightness = value;
        self
    }

    /// Adjust contrast; 1.0 is neutral.
    pub fn contrast(mut self, value: f32) -> Self {
        self.contrast = value;
        self
    }

    /// Fix the exposure time in microseconds; zero restores auto-exposure.
    pub fn exposure_time_us(mut self, micros: i64) -> Self {
        self.exposure_time_us = micros;
        self
    }

    /// Adjust the exposure value on a log2 scale; 0.0 is neutral.
    pub fn exposure_value(mut self, ev: f32) -> Self {
        self.exposure_value = ev;
        self
    }

    /// Adjust saturation; 1.0 is neutral.
    pub fn saturation(mut self, value: f32) -> Self {
        self.saturation = value;
        self
    }

    /// Fix the lens position for manual focus; negative restores auto-focus.
    pub fn lens_position(mut self, position: f32) -> Self {
        self.lens_position = position;
        self
    }

    /// Stream negotiation request derived from the dimension fields.
    pub(crate) fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            width: self.width,
            height: self.height,
            framerate: self.framerate,
        }
    }

    /// Control list applied at stream start.
    ///
    /// Fields left at their sentinel are omitted rather than sent as
    /// literals, so the driver keeps its own defaults for them. A
    /// non-negative lens position also switches the driver to manual focus.
    pub fn controls(&self) -> ControlList {
        let mut list = ControlList::new();
        if self.brightness != 0.0 {
            list.set(ids::BRIGHTNESS, ControlValue::Float(self.brightness));
        }
        if self.contrast != 1.0 {
            list.set(ids::CONTRAST, ControlValue::Float(self.contrast));
        }
        if self.exposure_time_us != 0 {
            list.set(ids::EXPOSURE_TIME, ControlValue::Int64(self.exposure_time_us));
        }
        if self.exposure_value != 0.0 {
            list.set(ids::EXPOSURE_VALUE, ControlValue::Float(self.exposure_value));
        }
        if self.saturation != 1.0 {
            list.set(ids::SATURATION, ControlValue::Float(self.saturation));
        }
        if self.lens_position >= 0.0 {
            list.set(ids::AF_MODE, ControlValue::Int(ids::AF_MODE_MANUAL));
            list.set(ids::LENS_POSITION, ControlValue::Float(self.lens_position));
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_send_no_controls() {
        assert!(CaptureSettings::new().controls().is_empty());
    }

    #[test]
    fn non_sentinel_fields_become_controls() {
        let controls = CaptureSettings::new()
            .brightness(0.25)
            .exposure_time_us(20_000)
            .saturation(0.0)
            .controls();
        assert_eq!(controls.len(), 3);
        assert_eq!(
            controls.get(ids::EXPOSURE_TIME),
            Some(&ControlValue::Int64(20_000))
        );
        assert_eq!(controls.get(ids::SATURATION), Some(&ControlValue::Float(0.0)));
        assert_eq!(controls.get(ids::CONTRAST), None);
    }

    #[test]
    fn manual_focus_pairs_mode_with_position() {
        let controls = CaptureSettings::new().lens_position(0.5).controls();
        assert_eq!(
            controls.get(ids::AF_MODE),
            Some(&ControlValue::Int(ids::AF_MODE_MANUAL))
        );
        assert_eq!(
            controls.get(ids::LENS_POSITION),
            Some(&ControlValue::Float(0.5))
        );
    }

    #[test]
    fn negative_lens_position_stays_on_auto_focus() {
        let controls = CaptureSettings::new().lens_position(-1.0).controls();
        assert_eq!(controls.get(ids::AF_MODE), None);
        assert_eq!(controls.get(ids::LENS_POSITION), None);
    }

    #[test]
    fn stream_request_mirrors_dimensions() {
        let settings = CaptureSettings::new().size(640, 480).framerate(30);
        let request = settings.stream_request();
        assert_eq!((request.width, request.height, request.framerate), (640, 480, 30));
    }
}
