use std::time::Duration;

use obscura::prelude::*;

fn main() -> Result<(), CaptureError> {
    tracing_subscriber::fmt::init();

    let camera = SimCamera::new()
        .with_frame_limit(12)
        .with_pacing(Duration::from_millis(33));
    let stats = camera.stats();

    let mut session = CaptureSession::new(camera);
    session.register_observer(|frame: &PixelMatrix<'_>, meta: &FrameMetadata| {
        let first = frame.row(0).and_then(|row| row.first()).copied().unwrap_or(0);
        let seq = meta.sequence().unwrap_or(0);
        println!(
            "#{seq:02} {}x{} stride={} ts={:?} first_byte={first}",
            frame.width(),
            frame.height(),
            frame.stride(),
            meta.timestamp(),
        );
    });

    let config = session.start(
        CaptureSettings::new()
            .size(640, 480)
            .framerate(30)
            .contrast(1.1),
    )?;
    println!(
        "streaming {} {} at {} fps with {} buffers",
        config.format, config.resolution, config.framerate, config.buffer_count
    );

    while stats.frames_completed() < 12 {
        std::thread::sleep(Duration::from_millis(10));
    }
    session.stop();
    println!(
        "done: {} completed, {} cancelled",
        stats.frames_completed(),
        stats.frames_cancelled()
    );
    Ok(())
}
