use std::time::Duration;

use obscura::prelude::*;

fn main() -> Result<(), CaptureError> {
    tracing_subscriber::fmt::init();

    let mut session = CaptureSession::libcamera();
    session.register_observer(|frame: &PixelMatrix<'_>, meta: &FrameMetadata| {
        println!(
            "frame {:?}: {}x{} {} stride={} exposure={:?}us",
            meta.sequence(),
            frame.width(),
            frame.height(),
            frame.format(),
            frame.stride(),
            meta.exposure_time(),
        );
    });

    let config = session.start(CaptureSettings::new().size(640, 480).framerate(30))?;
    println!("streaming {} {}", config.format, config.resolution);

    std::thread::sleep(Duration::from_secs(2));
    session.stop();
    Ok(())
}
