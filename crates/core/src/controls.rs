/// Strongly typed control identifier.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::ControlId;
///
/// let id = ControlId(42);
/// assert_eq!(id.0, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlId(pub u32);

/// Well-known control identifiers understood by the drivers.
pub mod ids {
    use super::ControlId;

    /// Brightness adjustment, neutral at 0.0.
    pub const BRIGHTNESS: ControlId = ControlId(1);
    /// Contrast multiplier, neutral at 1.0.
    pub const CONTRAST: ControlId = ControlId(2);
    /// Exposure time in microseconds.
    pub const EXPOSURE_TIME: ControlId = ControlId(3);
    /// Exposure value adjustment on a log2 scale.
    pub const EXPOSURE_VALUE: ControlId = ControlId(4);
    /// Saturation multiplier, 0.0 is greyscale.
    pub const SATURATION: ControlId = ControlId(5);
    /// Auto-focus mode selector.
    pub const AF_MODE: ControlId = ControlId(6);
    /// Lens position for manual focus, 0.0 closest.
    pub const LENS_POSITION: ControlId = ControlId(7);
    /// Frame timestamp in nanoseconds, reported per frame.
    pub const SENSOR_TIMESTAMP: ControlId = ControlId(8);
    /// Monotonic frame sequence number, reported per frame.
    pub const SENSOR_SEQUENCE: ControlId = ControlId(9);

    /// `AF_MODE` value selecting manual focus driven by `LENS_POSITION`.
    pub const AF_MODE_MANUAL: i32 = 0;
    /// `AF_MODE` value selecting continuous auto-focus.
    pub const AF_MODE_CONTINUOUS: i32 = 2;
}

/// Control value variants with minimal footprint.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::ControlValue;
///
/// let v = ControlValue::Float(0.5);
/// assert_eq!(v.as_f32(), Some(0.5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlValue {
    /// No value.
    None,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i32),
    /// Wide signed integer (timestamps, exposure durations).
    Int64(i64),
    /// Unsigned integer.
    Uint(u32),
    /// Floating-point value.
    Float(f32),
}

impl ControlValue {
    /// Widen any integer variant to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ControlValue::Int(v) => Some(i64::from(*v)),
            ControlValue::Int64(v) => Some(*v),
            ControlValue::Uint(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Floating-point view, `None` for non-float variants.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ControlValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Ordered list of control assignments.
///
/// Setting an id that is already present replaces the previous value, so a
/// list never carries duplicate ids.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::{ControlList, ControlValue, ids};
///
/// let mut list = ControlList::new();
/// list.set(ids::BRIGHTNESS, ControlValue::Float(0.25));
/// list.set(ids::BRIGHTNESS, ControlValue::Float(0.5));
/// assert_eq!(list.len(), 1);
/// assert_eq!(list.get(ids::BRIGHTNESS), Some(&ControlValue::Float(0.5)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlList {
    entries: Vec<(ControlId, ControlValue)>,
}

impl ControlList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a value, replacing any previous assignment of the same id.
    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        if let Some(entry) = self.entries.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = value;
        } else {
            self.entries.push((id, value));
        }
    }

    /// Look up the value assigned to `id`.
    pub fn get(&self, id: ControlId) -> Option<&ControlValue> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, v)| v)
    }

    /// Remove every assignment.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of assignments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list holds no assignments.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate assignments in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ControlId, &ControlValue)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }
}

impl FromIterator<(ControlId, ControlValue)> for ControlList {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlValue)>>(iter: T) -> Self {
        let mut list = ControlList::new();
        for (id, value) in iter {
            list.set(id, value);
        }
        list
    }
}

/// Read-only control/property set the driver attaches to a completed frame.
///
/// Passed to the observer by reference; copy out anything that must survive
/// past the callback.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::{ControlList, ControlValue, FrameMetadata, ids};
///
/// let mut controls = ControlList::new();
/// controls.set(ids::SENSOR_TIMESTAMP, ControlValue::Int64(1_000));
/// let meta = FrameMetadata::from_controls(controls);
/// assert_eq!(meta.timestamp(), Some(1_000));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    controls: ControlList,
}

impl FrameMetadata {
    /// Wrap a driver-produced control list.
    pub fn from_controls(controls: ControlList) -> Self {
        Self { controls }
    }

    /// Look up an arbitrary entry.
    pub fn get(&self, id: ControlId) -> Option<&ControlValue> {
        self.controls.get(id)
    }

    /// Frame timestamp in nanoseconds, when the driver reported one.
    pub fn timestamp(&self) -> Option<i64> {
        self.controls.get(ids::SENSOR_TIMESTAMP)?.as_i64()
    }

    /// Monotonic frame sequence number, when the driver reported one.
    pub fn sequence(&self) -> Option<u64> {
        self.controls
            .get(ids::SENSOR_SEQUENCE)?
            .as_i64()
            .and_then(|v| u64::try_from(v).ok())
    }

    /// Exposure time actually used for this frame, in microseconds.
    pub fn exposure_time(&self) -> Option<i64> {
        self.controls.get(ids::EXPOSURE_TIME)?.as_i64()
    }

    /// The full property set.
    pub fn controls(&self) -> &ControlList {
        &self.controls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_existing_assignment() {
        let mut list = ControlList::new();
        list.set(ids::CONTRAST, ControlValue::Float(1.5));
        list.set(ids::SATURATION, ControlValue::Float(0.0));
        list.set(ids::CONTRAST, ControlValue::Float(2.0));
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(ids::CONTRAST), Some(&ControlValue::Float(2.0)));
    }

    #[test]
    fn clear_empties_the_list() {
        let mut list = ControlList::new();
        list.set(ids::BRIGHTNESS, ControlValue::Float(0.1));
        assert!(!list.is_empty());
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn metadata_accessors_read_well_known_ids() {
        let mut controls = ControlList::new();
        controls.set(ids::SENSOR_TIMESTAMP, ControlValue::Int64(123_456));
        controls.set(ids::SENSOR_SEQUENCE, ControlValue::Int64(7));
        controls.set(ids::EXPOSURE_TIME, ControlValue::Int64(10_000));
        let meta = FrameMetadata::from_controls(controls);
        assert_eq!(meta.timestamp(), Some(123_456));
        assert_eq!(meta.sequence(), Some(7));
        assert_eq!(meta.exposure_time(), Some(10_000));
    }

    #[test]
    fn metadata_missing_entries_are_none() {
        let meta = FrameMetadata::default();
        assert_eq!(meta.timestamp(), None);
        assert_eq!(meta.sequence(), None);
        assert_eq!(meta.get(ids::BRIGHTNESS), None);
    }

    #[test]
    fn value_widening() {
        assert_eq!(ControlValue::Int(-3).as_i64(), Some(-3));
        assert_eq!(ControlValue::Uint(9).as_i64(), Some(9));
        assert_eq!(ControlValue::Float(1.0).as_i64(), None);
    }
}
