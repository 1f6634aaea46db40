//! Session scenarios against the simulated driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use obscura::prelude::*;

const DEADLINE: Duration = Duration::from_secs(5);

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn counting_observer(counter: Arc<AtomicU64>) -> impl FrameObserver {
    move |_frame: &PixelMatrix<'_>, _meta: &FrameMetadata| {
        counter.fetch_add(1, Ordering::Release);
    }
}

#[test]
fn driver_defaults_fill_zero_dimensions() {
    let mut session = CaptureSession::new(SimCamera::new());
    let config = session
        .start(CaptureSettings::new())
        .expect("start with driver defaults");
    assert!(config.resolution.width.get() > 0);
    assert!(config.resolution.height.get() > 0);
    assert!(config.framerate > 0);
    assert!(config.buffer_count > 0);
    session.stop();
}

#[test]
fn end_to_end_delivers_exactly_the_completed_frames() {
    const FRAMES: u64 = 16;
    let camera = SimCamera::new().with_frame_limit(FRAMES);
    let delivered = Arc::new(AtomicU64::new(0));
    let bad = Arc::new(AtomicU64::new(0));

    let mut session = CaptureSession::new(camera);
    {
        let delivered = delivered.clone();
        let bad = bad.clone();
        session.register_observer(move |frame: &PixelMatrix<'_>, meta: &FrameMetadata| {
            let ok = frame.width() == 640
                && frame.height() == 480
                && frame.stride() >= 640 * 3
                && frame.format() == FourCc::new(*b"RG24")
                && frame.data().len() == frame.stride() * 480
                && meta.timestamp().is_some()
                && meta.exposure_time().is_some();
            if !ok {
                bad.fetch_add(1, Ordering::Release);
            }
            delivered.fetch_add(1, Ordering::Release);
        });
    }

    session
        .start(CaptureSettings::new().size(640, 480).framerate(30))
        .expect("start");
    assert!(wait_for(|| delivered.load(Ordering::Acquire) == FRAMES));
    // The sensor budget is exhausted; nothing further may arrive.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(delivered.load(Ordering::Acquire), FRAMES);
    assert_eq!(bad.load(Ordering::Acquire), 0);
    session.stop();
    assert_eq!(delivered.load(Ordering::Acquire), FRAMES);
}

#[test]
fn buffers_recycle_through_a_small_pool() {
    let camera = SimCamera::new().with_buffer_count(2);
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);
    let config = session.start(CaptureSettings::new()).expect("start");
    assert_eq!(config.buffer_count, 2);
    // Far more frames than buffers proves each completion requeues its slot.
    assert!(wait_for(|| stats.frames_completed() >= 20));
    session.stop();
}

#[test]
fn stop_is_idempotent_and_restart_is_fresh() {
    let camera = SimCamera::new();
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);

    let first = session
        .start(CaptureSettings::new().size(640, 480))
        .expect("first start");
    assert_eq!(first.resolution.width.get(), 640);
    session.stop();
    session.stop();
    assert_eq!(stats.live_buffers(), 0);

    let second = session
        .start(CaptureSettings::new().size(320, 240).framerate(15))
        .expect("second start");
    assert_eq!(second.resolution.width.get(), 320);
    assert_eq!(second.resolution.height.get(), 240);
    assert_eq!(second.framerate, 15);
    session.stop();
    assert_eq!(stats.live_buffers(), 0);
}

#[test]
fn start_while_started_stops_the_previous_stream() {
    let camera = SimCamera::new();
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);

    session
        .start(CaptureSettings::new().size(640, 480))
        .expect("first start");
    let replaced = session
        .start(CaptureSettings::new().size(320, 240))
        .expect("second start without stop");
    assert_eq!(replaced.resolution.width.get(), 320);
    // Only the second stream's buffers are alive.
    assert_eq!(stats.live_buffers(), replaced.buffer_count);
    session.stop();
    assert_eq!(stats.live_buffers(), 0);
}

#[test]
fn frames_without_an_observer_are_dropped_but_recycled() {
    let camera = SimCamera::new();
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);
    session.start(CaptureSettings::new()).expect("start");

    // More completions than buffer slots without any observer: the pool
    // keeps cycling and nothing crashes.
    assert!(wait_for(|| stats.frames_completed() >= 8));

    let delivered = Arc::new(AtomicU64::new(0));
    session.register_observer(counting_observer(delivered.clone()));
    assert!(wait_for(|| delivered.load(Ordering::Acquire) > 0));
    session.stop();
}

#[test]
fn observer_substitution_redirects_all_subsequent_frames() {
    let mut session = CaptureSession::new(SimCamera::new());
    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));

    session.register_observer(counting_observer(first.clone()));
    session.start(CaptureSettings::new()).expect("start");
    assert!(wait_for(|| first.load(Ordering::Acquire) >= 3));

    session.register_observer(counting_observer(second.clone()));
    let frozen = first.load(Ordering::Acquire);
    assert!(wait_for(|| second.load(Ordering::Acquire) >= 3));
    assert_eq!(first.load(Ordering::Acquire), frozen);
    session.stop();
}

#[test]
fn nothing_is_delivered_after_stop_returns() {
    let camera = SimCamera::new().with_pacing(Duration::from_millis(1));
    let stats = camera.stats();
    let delivered = Arc::new(AtomicU64::new(0));

    let mut session = CaptureSession::new(camera);
    session.register_observer(counting_observer(delivered.clone()));
    session.start(CaptureSettings::new()).expect("start");
    assert!(wait_for(|| delivered.load(Ordering::Acquire) > 0));

    session.stop();
    let frozen = delivered.load(Ordering::Acquire);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(delivered.load(Ordering::Acquire), frozen);
    // Shutdown released every buffer and mapping.
    assert_eq!(stats.live_buffers(), 0);
}

#[test]
fn rejected_framerate_leaves_no_allocations_behind() {
    let camera = SimCamera::new().with_limits(1920, 1080, 120);
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);

    let err = session
        .start(CaptureSettings::new().size(640, 480).framerate(100_000))
        .expect_err("framerate beyond the sensor");
    assert!(matches!(err, CaptureError::ConfigurationRejected(_)));
    assert_eq!(stats.live_buffers(), 0);

    // The session is back in its pre-start state and can start normally.
    let config = session
        .start(CaptureSettings::new().framerate(30))
        .expect("valid retry");
    assert_eq!(config.framerate, 30);
    session.stop();
}

#[test]
fn allocation_failure_rolls_back_the_attempt() {
    let camera = SimCamera::new().with_failing_allocation();
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);

    let err = session
        .start(CaptureSettings::new())
        .expect_err("allocation must fail");
    assert!(matches!(err, CaptureError::AllocationFailure(_)));
    assert_eq!(stats.live_buffers(), 0);
    assert!(session.config().is_none());
}

#[test]
fn out_of_range_camera_index_is_no_camera_found() {
    let mut session = CaptureSession::new(SimCamera::new().with_cameras(1));
    let err = session
        .start(CaptureSettings::new().camera_index(3))
        .expect_err("index out of range");
    assert!(matches!(err, CaptureError::NoCameraFound(3)));
    assert_eq!(err.code(), "no_camera_found");
}

#[test]
fn sentinel_settings_are_not_sent_to_the_driver() {
    let camera = SimCamera::new();
    let stats = camera.stats();
    let mut session = CaptureSession::new(camera);
    session
        .start(CaptureSettings::new().brightness(0.2))
        .expect("start");

    let applied = stats.applied_controls();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied.get(ids::BRIGHTNESS), Some(&ControlValue::Float(0.2)));
    assert_eq!(applied.get(ids::CONTRAST), None);
    session.stop();
}

#[test]
fn effective_configuration_is_visible_while_started() {
    let mut session = CaptureSession::new(SimCamera::new());
    assert!(session.config().is_none());
    let config = session.start(CaptureSettings::new().size(640, 480)).expect("start");
    assert_eq!(session.config(), Some(&config));
    assert!(session.is_started());
    session.stop();
    assert!(session.config().is_none());
    assert!(!session.is_started());
}
