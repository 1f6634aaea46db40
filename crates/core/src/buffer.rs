use std::{collections::HashMap, fmt};

use smallvec::SmallVec;

use crate::format::{FourCc, packed_bytes_per_pixel};

/// Opaque identifier for one hardware-backed frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    /// Wrap a driver-assigned raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id, for logging.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// One memory region (address + length) a buffer plane was mapped to.
///
/// A region is only a descriptor; the mapping itself is owned by the driver
/// and outlives every region handed out for it. Dereferencing is therefore
/// `unsafe` and confined to the completion path, which holds the buffer
/// between its completion event and the requeue of its request.
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    addr: *const u8,
    len: usize,
}

impl MappedRegion {
    /// Describe a mapped plane.
    pub fn new(addr: *const u8, len: usize) -> Self {
        Self { addr, len }
    }

    /// Base address of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.addr
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the mapped bytes.
    ///
    /// # Safety
    /// The caller must guarantee the underlying mapping is still alive and
    /// that nothing writes to the buffer for the lifetime of the returned
    /// slice. The capture pipeline upholds this by only reading between a
    /// request's completion and its requeue.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }
}

// Regions are plain descriptors into driver-owned mappings; the pipeline
// moves them across the worker-thread boundary but never aliases writes.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Region list for one buffer, one entry per plane.
pub type RegionList = SmallVec<[MappedRegion; 3]>;

/// Table translating buffer handles to their mapped memory regions.
///
/// Populated once per buffer right after allocation and torn down as a whole
/// when the stream stops.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::{BufferHandle, BufferMap, MappedRegion};
///
/// let backing = [0u8; 16];
/// let mut map = BufferMap::new();
/// map.insert(
///     BufferHandle::new(0),
///     [MappedRegion::new(backing.as_ptr(), backing.len())].into_iter().collect(),
/// );
/// assert_eq!(map.lookup(BufferHandle::new(0)).len(), 1);
/// assert!(map.lookup(BufferHandle::new(9)).is_empty());
/// ```
#[derive(Debug, Default)]
pub struct BufferMap {
    entries: HashMap<BufferHandle, RegionList>,
}

impl BufferMap {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the regions for a freshly mapped buffer.
    ///
    /// A handle is mapped at most once per stream; remapping indicates a
    /// driver defect.
    pub fn insert(&mut self, handle: BufferHandle, regions: RegionList) {
        let previous = self.entries.insert(handle, regions);
        debug_assert!(previous.is_none(), "{handle} mapped twice");
    }

    /// Regions for `handle`, or an empty slice for an unknown handle.
    ///
    /// Unknown handles never occur in correct operation but must not crash
    /// the completion path.
    pub fn lookup(&self, handle: BufferHandle) -> &[MappedRegion] {
        self.entries.get(&handle).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Number of mapped buffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no buffers are mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Non-owning view over one frame's primary plane.
///
/// The view borrows driver-owned memory and is only valid for the duration
/// of the observer callback it is passed to; copy the bytes out to retain
/// them longer.
///
/// # Example
/// ```rust
/// use obscura_core::prelude::{FourCc, PixelMatrix};
///
/// let data = vec![0u8; 8 * 4];
/// let m = PixelMatrix::new(&data, 2, 4, 8, FourCc::new(*b"RG24")).unwrap();
/// assert_eq!(m.row(3).unwrap().len(), 6);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PixelMatrix<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    stride: usize,
    format: FourCc,
}

impl<'a> PixelMatrix<'a> {
    /// Build a view over `data`, rejecting slices too small for the claimed
    /// geometry.
    pub fn new(
        data: &'a [u8],
        width: u32,
        height: u32,
        stride: usize,
        format: FourCc,
    ) -> Option<Self> {
        let needed = stride.checked_mul(height as usize)?;
        if needed > data.len() {
            return None;
        }
        if let Some(bpp) = packed_bytes_per_pixel(format)
            && stride < width as usize * bpp
        {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            stride,
            format,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row, including any driver padding.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Pixel format of the plane.
    pub fn format(&self) -> FourCc {
        self.format
    }

    /// The raw plane bytes, `stride * height` long.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// One row of pixel data, trimmed of stride padding when the format's
    /// pixel depth is known.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        let row_bytes = packed_bytes_per_pixel(self.format)
            .map(|bpp| self.width as usize * bpp)
            .unwrap_or(self.stride)
            .min(self.stride);
        self.data.get(start..start + row_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn lookup_unknown_handle_is_empty_not_fatal() {
        let map = BufferMap::new();
        assert!(map.lookup(BufferHandle::new(42)).is_empty());
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let backing = vec![0u8; 64];
        let mut map = BufferMap::new();
        let handle = BufferHandle::new(1);
        map.insert(
            handle,
            smallvec![MappedRegion::new(backing.as_ptr(), backing.len())],
        );
        let regions = map.lookup(handle);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].len(), 64);
    }

    #[test]
    fn matrix_rejects_undersized_slice() {
        let data = vec![0u8; 10];
        assert!(PixelMatrix::new(&data, 4, 4, 12, FourCc::new(*b"RG24")).is_none());
    }

    #[test]
    fn matrix_rejects_stride_below_pixel_width() {
        let data = vec![0u8; 1024];
        assert!(PixelMatrix::new(&data, 16, 4, 16, FourCc::new(*b"RG24")).is_none());
    }

    #[test]
    fn matrix_rows_trim_stride_padding() {
        let stride = 64;
        let data = vec![0u8; stride * 4];
        let m = PixelMatrix::new(&data, 16, 4, stride, FourCc::new(*b"RG24")).expect("view");
        assert_eq!(m.row(0).unwrap().len(), 48);
        assert!(m.row(4).is_none());
    }
}
