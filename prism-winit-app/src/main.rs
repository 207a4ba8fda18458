use std::rc::Rc;

use ash::vk;
use prism_app::{config::PrismConfig, render_app::RenderApp};
use prism_gfx::{backend::vulkan::VulkanDevice, device::GfxSwapchainDesc};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowId},
};

struct WinitApp {
    config: PrismConfig,
    // render_app 必须在 window 之前销毁
    render_app: Option<RenderApp>,
    window: Option<Window>,
    /// 初始化或者运行中出现的错误，退出事件循环之后返回
    error: Option<anyhow::Error>,
}
// new & init
impl WinitApp {
    fn new(config: PrismConfig) -> Self {
        Self {
            config,
            render_app: None,
            window: None,
            error: None,
        }
    }

    fn swapchain_desc(config: &PrismConfig, extent: vk::Extent2D) -> GfxSwapchainDesc {
        GfxSwapchainDesc {
            extent,
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: if config.window.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                vk::PresentModeKHR::MAILBOX
            },
        }
    }

    /// window 创建之后才能创建 surface，因此 device 和 RenderApp 都在这里初始化
    fn init_after_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let window_attr = Window::default_attributes()
            .with_title(self.config.window.title.clone())
            .with_inner_size(winit::dpi::PhysicalSize::new(self.config.window.width, self.config.window.height));
        let window = event_loop.create_window(window_attr)?;

        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();
        let device = VulkanDevice::new(&self.config.window.title, Some((display_handle, window_handle)))?;

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let render_app = RenderApp::new(
            Rc::new(device),
            self.config.clone(),
            Some(Self::swapchain_desc(&self.config, extent)),
        )?;

        self.render_app = Some(render_app);
        self.window = Some(window);
        Ok(())
    }

    fn resize_to_window(&mut self) -> anyhow::Result<()> {
        let (Some(window), Some(render_app)) = (&self.window, self.render_app.as_mut()) else {
            return Ok(());
        };
        let size = window.inner_size();
        render_app.resize(vk::Extent2D {
            width: size.width,
            height: size.height,
        })
    }

    fn redraw(&mut self) -> anyhow::Result<()> {
        let _span = tracy_client::span!("WinitApp::redraw");
        let Some(render_app) = self.render_app.as_mut() else {
            return Ok(());
        };
        let report = render_app.run_frame()?;
        if report.need_recreate {
            self.resize_to_window()?;
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.error = Some(error);
        event_loop.exit();
    }
}
// destroy
impl WinitApp {
    fn destroy(&mut self) {
        if let Some(render_app) = self.render_app.take() {
            render_app.destroy();
        }
        self.window = None;
    }
}
impl ApplicationHandler for WinitApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        log::info!("winit event: resumed");
        if let Err(e) = self.init_after_window(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        let result = match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
                Ok(())
            }
            WindowEvent::Resized(_) => self.resize_to_window(),
            WindowEvent::RedrawRequested => self.redraw(),
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        log::warn!("winit event: suspended");
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("loop exiting");
        self.destroy();
    }
}

fn main() -> anyhow::Result<()> {
    RenderApp::init_env();

    let config = PrismConfig::load_default()?;
    let event_loop = EventLoop::new()?;
    let mut app = WinitApp::new(config);
    event_loop.run_app(&mut app)?;

    log::info!("end run.");
    app.destroy();
    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
