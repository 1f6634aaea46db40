//! Observer contract for frame delivery.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use obscura_core::prelude::{FrameMetadata, PixelMatrix};

/// Receives completed frames from a running capture session.
///
/// The method runs synchronously on the session's delivery thread, which
/// also drains further completions — it must not block indefinitely, or the
/// whole stream stalls. Both arguments are borrowed and only valid for the
/// duration of the call; copy out anything that must be retained.
///
/// A blanket implementation lets closures be registered directly:
///
/// ```rust
/// use obscura::prelude::*;
///
/// let session = CaptureSession::new(SimCamera::new());
/// session.register_observer(|frame: &PixelMatrix<'_>, _meta: &FrameMetadata| {
///     let _first_row = frame.row(0);
/// });
/// ```
pub trait FrameObserver: Send {
    /// Called once per completed frame.
    fn frame_ready(&mut self, frame: &PixelMatrix<'_>, metadata: &FrameMetadata);
}

impl<F> FrameObserver for F
where
    F: FnMut(&PixelMatrix<'_>, &FrameMetadata) + Send,
{
    fn frame_ready(&mut self, frame: &PixelMatrix<'_>, metadata: &FrameMetadata) {
        self(frame, metadata)
    }
}

/// Registration slot shared between the session handle and the delivery
/// thread. At most one observer; last write wins. Registration is
/// independent of stream lifetime, so it survives stop/start cycles.
#[derive(Clone, Default)]
pub(crate) struct ObserverSlot {
    inner: Arc<Mutex<Option<Box<dyn FrameObserver>>>>,
}

impl ObserverSlot {
    pub(crate) fn replace(&self, observer: Box<dyn FrameObserver>) {
        *self.lock() = Some(observer);
    }

    /// Lock the slot for delivery. An observer that panicked mid-callback
    /// must not wedge every later frame, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<Box<dyn FrameObserver>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_core::prelude::FourCc;

    #[test]
    fn closure_observers_satisfy_the_contract() {
        let mut seen = 0u32;
        {
            let mut observer = |frame: &PixelMatrix<'_>, _meta: &FrameMetadata| {
                seen += frame.width();
            };
            let data = vec![0u8; 4 * 2 * 3];
            let frame = PixelMatrix::new(&data, 4, 2, 12, FourCc::new(*b"RG24")).expect("view");
            observer.frame_ready(&frame, &FrameMetadata::default());
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn slot_replacement_drops_the_previous_observer() {
        let slot = ObserverSlot::default();
        slot.replace(Box::new(|_: &PixelMatrix<'_>, _: &FrameMetadata| {}));
        slot.replace(Box::new(|_: &PixelMatrix<'_>, _: &FrameMetadata| {}));
        assert!(slot.lock().is_some());
    }
}
