//! 不需要 GPU 和窗口，使用 headless 后端运行若干帧，用于 CI 以及检查帧节奏

use std::rc::Rc;

use prism_app::{config::PrismConfig, render_app::RenderApp};
use prism_gfx::backend::headless::HeadlessDevice;

fn main() -> anyhow::Result<()> {
    RenderApp::init_env();

    let config = PrismConfig::load_default()?;
    let frames = config.headless.frames;
    log::info!("headless run: scene {:?}, {} frames", config.scene.name, frames);

    // 提交之后立即完成，帧节奏只由 FIF 决定
    let device = Rc::new(HeadlessDevice::new().with_auto_complete(true));
    let mut app = RenderApp::new(device.clone(), config, None)?;

    let mut waited_frames = 0;
    for _ in 0..frames {
        let report = app.run_frame()?;
        if report.waited {
            waited_frames += 1;
        }
        log::debug!("{:?}", report);
    }
    log::info!("{} of {} frames waited for gpu", waited_frames, frames);

    app.destroy();
    log::info!("live objects after destroy: {}", device.live_object_count());
    Ok(())
}
