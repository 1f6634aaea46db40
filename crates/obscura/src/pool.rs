//! Fixed pool of reusable capture requests, one per frame buffer.

use obscura_core::prelude::{BufferHandle, ControlList};

use crate::driver::CameraDriver;
use crate::session::CaptureError;

/// A unit of work asking the driver to fill one buffer with the next frame.
///
/// Requests are created once when the stream starts and recycled in place
/// for its whole lifetime, so the hot path never allocates. The cookie is
/// the request's slot index and round-trips through the driver's completion
/// events.
#[derive(Debug)]
pub struct CaptureRequest {
    cookie: u64,
    buffer: BufferHandle,
    controls: ControlList,
}

impl CaptureRequest {
    fn new(cookie: u64, buffer: BufferHandle) -> Self {
        Self {
            cookie,
            buffer,
            controls: ControlList::new(),
        }
    }

    /// Slot index identifying this request in completion events.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// The buffer this request fills.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Per-frame control overrides submitted with the request.
    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    /// Reset per-frame state so the request can be resubmitted. The buffer
    /// association is kept.
    fn reuse(&mut self) {
        self.controls.clear();
    }
}

/// Owns every capture request of the active stream and tracks how many are
/// currently with the driver.
///
/// The pool's size is fixed at one request per allocated buffer; nothing is
/// created or destroyed between start and stop.
#[derive(Debug, Default)]
pub struct RequestPool {
    slots: Vec<CaptureRequest>,
    in_flight: usize,
}

impl RequestPool {
    /// Build one request per buffer; cookies are the slot indices.
    pub fn with_buffers(buffers: &[BufferHandle]) -> Self {
        Self {
            slots: buffers
                .iter()
                .enumerate()
                .map(|(i, buffer)| CaptureRequest::new(i as u64, *buffer))
                .collect(),
            in_flight: 0,
        }
    }

    /// Number of requests in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no requests.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Requests currently submitted to the driver.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Look up a request by its completion cookie.
    pub fn get(&self, cookie: u64) -> Option<&CaptureRequest> {
        self.slots.get(usize::try_from(cookie).ok()?)
    }

    /// Record that the driver reported one outstanding request finished.
    pub fn note_completed(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Submit every request once, right after stream start.
    pub fn queue_all(&mut self, driver: &mut dyn CameraDriver) -> Result<(), CaptureError> {
        for slot in &self.slots {
            driver.queue(slot)?;
            self.in_flight += 1;
        }
        Ok(())
    }

    /// Reset a request's per-frame controls and resubmit it.
    pub fn requeue(&mut self, cookie: u64, driver: &mut dyn CameraDriver) -> Result<(), CaptureError> {
        let slot = usize::try_from(cookie)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .ok_or_else(|| CaptureError::Backend(format!("unknown request cookie {cookie}")))?;
        slot.reuse();
        driver.queue(slot)?;
        self.in_flight += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use obscura_core::buffer::RegionList;

    use crate::driver::{Completion, StreamConfig, StreamRequest};

    /// Driver stub that records queued cookies.
    #[derive(Default)]
    struct RecordingDriver {
        queued: Vec<u64>,
    }

    impl CameraDriver for RecordingDriver {
        fn acquire(&mut self, _index: u32) -> Result<(), CaptureError> {
            Ok(())
        }

        fn negotiate(&mut self, _request: &StreamRequest) -> Result<StreamConfig, CaptureError> {
            Err(CaptureError::Backend("not under test".into()))
        }

        fn allocate(&mut self) -> Result<Vec<BufferHandle>, CaptureError> {
            Ok(Vec::new())
        }

        fn map(&mut self, _buffer: BufferHandle) -> Result<RegionList, CaptureError> {
            Ok(RegionList::new())
        }

        fn start(
            &mut self,
            _controls: &ControlList,
        ) -> Result<mpsc::Receiver<Completion>, CaptureError> {
            let (_tx, rx) = mpsc::channel();
            Ok(rx)
        }

        fn queue(&mut self, request: &CaptureRequest) -> Result<(), CaptureError> {
            self.queued.push(request.cookie());
            Ok(())
        }

        fn stop(&mut self) {}

        fn release(&mut self) {}
    }

    fn handles(n: u64) -> Vec<BufferHandle> {
        (0..n).map(BufferHandle::new).collect()
    }

    #[test]
    fn one_request_per_buffer_with_slot_cookies() {
        let pool = RequestPool::with_buffers(&handles(4));
        assert_eq!(pool.len(), 4);
        for cookie in 0..4 {
            assert_eq!(pool.get(cookie).map(|r| r.cookie()), Some(cookie));
        }
        assert!(pool.get(4).is_none());
    }

    #[test]
    fn queue_all_puts_every_request_in_flight() {
        let mut driver = RecordingDriver::default();
        let mut pool = RequestPool::with_buffers(&handles(3));
        pool.queue_all(&mut driver).expect("queue all");
        assert_eq!(pool.in_flight(), 3);
        assert_eq!(driver.queued, vec![0, 1, 2]);
    }

    #[test]
    fn completion_and_requeue_keep_the_count_invariant() {
        let mut driver = RecordingDriver::default();
        let mut pool = RequestPool::with_buffers(&handles(2));
        pool.queue_all(&mut driver).expect("queue all");

        pool.note_completed();
        assert_eq!(pool.in_flight(), 1);
        pool.requeue(0, &mut driver).expect("requeue");
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn requeue_unknown_cookie_is_an_error() {
        let mut driver = RecordingDriver::default();
        let mut pool = RequestPool::with_buffers(&handles(1));
        assert!(pool.requeue(7, &mut driver).is_err());
    }
}
