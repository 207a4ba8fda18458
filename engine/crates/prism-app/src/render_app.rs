use std::{rc::Rc, time::Duration};

use anyhow::Context;
use ash::vk;
use prism_crate_tools::init_log::init_log;
use prism_gfx::device::{GfxDevice, GfxSwapchainDesc};
use prism_render_interface::{
    frame_pipeline::describe_slots,
    render_context::{RenderContext, RenderContextDesc},
};

use crate::{
    config::PrismConfig,
    scene::{Scene, create_scene},
    shader_watcher::ShaderWatcher,
};

pub fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

/// 一帧的结果
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_id: u64,
    /// CPU 是否等待了 GPU
    pub waited: bool,
    /// swapchain 需要重建
    pub need_recreate: bool,
    pub reloaded_shaders: usize,
}

pub struct RenderApp {
    config: PrismConfig,
    context: RenderContext,
    scene: Option<Box<dyn Scene>>,
    shader_watcher: Option<ShaderWatcher>,
}
// new & init
impl RenderApp {
    pub fn init_env() {
        std::panic::set_hook(Box::new(panic_handler));

        init_log();

        #[cfg(feature = "profiling")]
        {
            tracy_client::Client::start();
            tracy_client::set_thread_name!("RenderThread");
        }
    }

    pub fn new(
        device: Rc<dyn GfxDevice>,
        config: PrismConfig,
        swapchain: Option<GfxSwapchainDesc>,
    ) -> anyhow::Result<Self> {
        let scene = create_scene(&config);
        Self::with_scene(device, config, swapchain, scene)
    }

    /// 使用外部创建的场景，而不是根据配置选择
    pub fn with_scene(
        device: Rc<dyn GfxDevice>,
        config: PrismConfig,
        swapchain: Option<GfxSwapchainDesc>,
        mut scene: Box<dyn Scene>,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("RenderApp::new");
        log::info!("device: {}", device.limits().device_name);

        let mut context = RenderContext::new(
            device,
            RenderContextDesc {
                descriptor_capacities: config.descriptors.capacities(),
                shader_build_dir: config.shader.build_dir.clone(),
                swapchain,
                render_extent: vk::Extent2D {
                    width: config.window.width,
                    height: config.window.height,
                },
            },
        )
        .context("failed to create render context")?;

        scene.init_resources(&mut context).with_context(|| format!("failed to init scene {}", scene.name()))?;
        let mip_dispatches = context.flush_uploads()?;
        log::info!("scene {} initialized, {} mip dispatches", scene.name(), mip_dispatches);

        let shader_watcher = if config.shader.watch {
            match ShaderWatcher::new(&config.shader.source_dir, Duration::from_millis(config.shader.poll_interval_ms)) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("shader hot reload disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config,
            context,
            scene: Some(scene),
            shader_watcher,
        })
    }

    pub fn destroy(mut self) {
        let _span = tracy_client::span!("RenderApp::destroy");
        if let Some(mut watcher) = self.shader_watcher.take() {
            watcher.stop();
        }
        if let Some(scene) = self.scene.take() {
            scene.destroy(&mut self.context);
        }
        log::info!("{}", self.summary());
        self.context.destroy();
    }
}
// getters
impl RenderApp {
    #[inline]
    pub fn config(&self) -> &PrismConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    #[inline]
    pub fn scene(&self) -> Option<&dyn Scene> {
        self.scene.as_deref()
    }

    pub fn summary(&self) -> String {
        let frame_pipeline = self.context.frame_pipeline();
        format!(
            "{} frames, fence {}, slots [{}], {} objects waiting for release",
            frame_pipeline.frame_id(),
            frame_pipeline.last_signaled_value(),
            describe_slots(frame_pipeline),
            frame_pipeline.pending_release_count()
        )
    }
}
// update
impl RenderApp {
    /// begin -> 处理 shader 变化 -> 场景渲染 -> 纹理 flush -> end
    ///
    /// 场景渲染失败时仍然结束这一帧，保证 timeline 和 command buffer 的状态一致，然后返回错误
    pub fn run_frame(&mut self) -> anyhow::Result<FrameReport> {
        let _span = tracy_client::span!("RenderApp::run_frame");

        let begin = self.context.begin_frame()?;

        let mut reloaded_shaders = 0;
        if let Some(watcher) = &self.shader_watcher {
            for event in watcher.drain() {
                if self.context.reload_shader(&event.path) {
                    reloaded_shaders += 1;
                }
            }
        }

        let render_result = match self.scene.as_mut() {
            Some(scene) => {
                let _span = tracy_client::span!("Scene::render");
                scene.render(&mut self.context).with_context(|| format!("scene {} failed to render", scene.name()))
            }
            None => Ok(()),
        };

        let end_result = self.context.end_frame();
        if let Err(e) = render_result {
            if let Err(end_error) = end_result {
                log::error!("failed to end frame after render error: {}", end_error);
            }
            return Err(e);
        }
        let end_need_recreate = end_result?;
        Ok(FrameReport {
            frame_id: begin.frame_id,
            waited: begin.waited,
            need_recreate: begin.need_recreate || end_need_recreate,
            reloaded_shaders,
        })
    }

    pub fn resize(&mut self, extent: vk::Extent2D) -> anyhow::Result<()> {
        if extent.width == 0 || extent.height == 0 {
            log::debug!("skip resize to zero extent");
            return Ok(());
        }
        log::info!("resize to {}x{}", extent.width, extent.height);
        self.context.resize(extent)?;
        if let Some(scene) = self.scene.as_mut() {
            scene.on_resize(&mut self.context)?;
        }
        self.context.flush_uploads()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::backend::headless::{HeadlessCommand, HeadlessDevice};

    use super::*;
    use crate::config::SceneKind;

    fn headless_config(shader_dir: &std::path::Path, scene: SceneKind) -> PrismConfig {
        let mut config = PrismConfig::default();
        config.shader.build_dir = shader_dir.to_path_buf();
        config.shader.source_dir = shader_dir.to_path_buf();
        config.scene.name = scene;
        config.window.width = 320;
        config.window.height = 180;
        config
    }

    /// 只有 header 的 SPIR-V，headless 后端只检查 magic number
    fn write_minimal_spirv(dir: &std::path::Path, name: &str) {
        let words: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
        std::fs::write(dir.join(format!("{}.spv", name)), bytemuck::cast_slice::<u32, u8>(&words)).unwrap();
    }

    fn swapchain_desc() -> GfxSwapchainDesc {
        GfxSwapchainDesc {
            extent: vk::Extent2D {
                width: 320,
                height: 180,
            },
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }

    fn count(commands: &[HeadlessCommand], pred: impl Fn(&HeadlessCommand) -> bool) -> usize {
        commands.iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn test_shadow_scene_builds_acceleration_structures_once() {
        let shader_dir = tempfile::tempdir().unwrap();
        let headless = Rc::new(HeadlessDevice::new());
        let config = headless_config(shader_dir.path(), SceneKind::Shadows);
        let mut app = RenderApp::new(headless.clone(), config, Some(swapchain_desc())).unwrap();

        let reports = (0..5).map(|_| app.run_frame().unwrap()).collect::<Vec<_>>();
        assert_eq!(reports.iter().map(|r| r.frame_id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(reports.iter().all(|r| !r.need_recreate));

        let commands = headless.submitted_commands();
        let builds = count(&commands, |c| matches!(c, HeadlessCommand::BuildAccelerationStructure { .. }));
        assert_eq!(builds, 3);
        let tlas_builds = count(&commands, |c| {
            matches!(c, HeadlessCommand::BuildAccelerationStructure { ty, .. } if *ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        });
        assert_eq!(tlas_builds, 1);
        assert_eq!(count(&commands, |c| matches!(c, HeadlessCommand::BlitImage { .. })), 5);
        assert_eq!(headless.present_count(), 5);

        app.destroy();
        assert_eq!(headless.live_object_count(), 0);
    }

    #[test]
    fn test_shadow_scene_survives_resize() {
        let shader_dir = tempfile::tempdir().unwrap();
        let headless = Rc::new(HeadlessDevice::new());
        let config = headless_config(shader_dir.path(), SceneKind::Shadows);
        let mut app = RenderApp::new(headless.clone(), config, Some(swapchain_desc())).unwrap();

        app.run_frame().unwrap();
        headless.mark_swapchain_out_of_date();
        let report = app.run_frame().unwrap();
        assert!(report.need_recreate);

        app.resize(vk::Extent2D {
            width: 640,
            height: 360,
        })
        .unwrap();
        assert_eq!(app.context().render_extent().width, 640);
        assert!(!app.run_frame().unwrap().need_recreate);

        app.destroy();
        assert_eq!(headless.live_object_count(), 0);
    }

    #[test]
    fn test_gallery_scene_generates_mips_for_loaded_images() {
        let shader_dir = tempfile::tempdir().unwrap();
        write_minimal_spirv(shader_dir.path(), "mip_gen");

        let texture_dir = tempfile::tempdir().unwrap();
        image::RgbaImage::from_pixel(64, 64, image::Rgba([255, 0, 0, 255]))
            .save(texture_dir.path().join("red.png"))
            .unwrap();
        image::RgbaImage::from_pixel(40, 20, image::Rgba([0, 0, 255, 255]))
            .save(texture_dir.path().join("blue.png"))
            .unwrap();
        std::fs::write(texture_dir.path().join("broken.png"), b"not a png").unwrap();

        let headless = Rc::new(HeadlessDevice::new());
        let mut config = headless_config(shader_dir.path(), SceneKind::Gallery);
        config.scene.texture_dir = texture_dir.path().to_path_buf();
        let mut app = RenderApp::new(headless.clone(), config, None).unwrap();

        assert_eq!(app.scene().map(|s| s.name()), Some("gallery"));
        let dispatches = headless
            .submitted_commands()
            .into_iter()
            .filter_map(|c| match c {
                HeadlessCommand::Dispatch { group_count } => Some(group_count),
                _ => None,
            })
            .collect::<Vec<_>>();
        // blue.png, red.png 按文件名排序；broken.png 使用默认纹理
        // red.png 有 7 级 mip，最后一级由第二个 pass 从 mip 5 生成
        assert_eq!(
            dispatches,
            vec![glam::uvec3(2, 1, 1), glam::uvec3(2, 2, 1), glam::uvec3(1, 1, 1)]
        );
        assert_eq!(app.context().textures().pending_mip_requests(), 0);

        for _ in 0..3 {
            app.run_frame().unwrap();
        }
        app.destroy();
    }

    /// 第一次 render 失败的场景
    struct FlakyScene {
        failures_left: u32,
    }
    impl Scene for FlakyScene {
        fn name(&self) -> &str {
            "flaky"
        }

        fn init_resources(&mut self, _ctx: &mut RenderContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn render(&mut self, _ctx: &mut RenderContext) -> anyhow::Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                anyhow::bail!("lost the render target");
            }
            Ok(())
        }

        fn destroy(self: Box<Self>, _ctx: &mut RenderContext) {}
    }

    #[test]
    fn test_render_error_still_ends_frame() {
        let shader_dir = tempfile::tempdir().unwrap();
        let headless = Rc::new(HeadlessDevice::new().with_auto_complete(true));
        let config = headless_config(shader_dir.path(), SceneKind::Shadows);
        let scene = Box::new(FlakyScene { failures_left: 1 });
        let mut app = RenderApp::with_scene(headless.clone(), config, None, scene).unwrap();

        let err = app.run_frame().unwrap_err();
        assert!(format!("{:#}", err).contains("lost the render target"));
        assert_eq!(app.context().frame_pipeline().last_signaled_value(), 1);
        assert!(!app.context().frame_pipeline().is_in_frame());

        let report = app.run_frame().unwrap();
        assert_eq!(report.frame_id, 1);
        assert_eq!(app.context().frame_pipeline().last_signaled_value(), 2);

        app.destroy();
        assert_eq!(headless.live_object_count(), 0);
    }

    #[test]
    fn test_shader_change_invalidates_cached_pipeline() {
        let build_dir = tempfile::tempdir().unwrap();
        write_minimal_spirv(build_dir.path(), "mip_gen");
        let source_dir = tempfile::tempdir().unwrap();
        let texture_dir = tempfile::tempdir().unwrap();
        image::RgbaImage::from_pixel(16, 16, image::Rgba([0, 255, 0, 255]))
            .save(texture_dir.path().join("green.png"))
            .unwrap();

        let headless = Rc::new(HeadlessDevice::new());
        let mut config = headless_config(build_dir.path(), SceneKind::Gallery);
        config.shader.source_dir = source_dir.path().to_path_buf();
        config.shader.watch = true;
        config.shader.poll_interval_ms = 10;
        config.scene.texture_dir = texture_dir.path().to_path_buf();
        let mut app = RenderApp::new(headless.clone(), config, None).unwrap();
        assert!(app.context().pipelines().contains("mip_gen"));

        std::fs::write(source_dir.path().join("mip_gen.comp"), "#version 460").unwrap();
        let start = std::time::Instant::now();
        let mut reloaded = 0;
        while reloaded == 0 && start.elapsed() < Duration::from_secs(5) {
            reloaded += app.run_frame().unwrap().reloaded_shaders;
            headless.complete_all();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reloaded, 1);
        assert!(!app.context().pipelines().contains("mip_gen"));

        app.destroy();
    }
}
