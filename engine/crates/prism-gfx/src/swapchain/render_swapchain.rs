use ash::vk;
use itertools::Itertools;

use crate::{
    commands::semaphore::GfxSemaphore,
    device::{GfxAcquireResult, GfxDevice, GfxSwapchainDesc},
    error::GfxResult,
    resources::image::GfxImage,
};

/// 交换链
///
/// surface 由后端持有；这里只记录 swapchain handle 和它的 image
pub struct GfxRenderSwapchain {
    handle: vk::SwapchainKHR,

    /// 外部 image，不需要 destroy
    images: Vec<GfxImage>,
    image_index: usize,

    desc: GfxSwapchainDesc,
}
// new & init
impl GfxRenderSwapchain {
    pub fn new(device: &dyn GfxDevice, desc: GfxSwapchainDesc) -> GfxResult<Self> {
        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            images: vec![],
            image_index: 0,
            desc,
        };
        swapchain.create(device, vk::SwapchainKHR::null())?;
        Ok(swapchain)
    }

    fn create(&mut self, device: &dyn GfxDevice, old_swapchain: vk::SwapchainKHR) -> GfxResult<()> {
        let raw = device.create_swapchain(&self.desc, old_swapchain)?;
        log::info!(
            "create swapchain: requested extent {}x{}, final extent {}x{}, {} images",
            self.desc.extent.width,
            self.desc.extent.height,
            raw.extent.width,
            raw.extent.height,
            raw.images.len()
        );

        self.handle = raw.handle;
        self.desc.extent = raw.extent;
        self.images = raw
            .images
            .iter()
            .enumerate()
            .map(|(idx, image)| {
                GfxImage::from_external(
                    *image,
                    raw.extent,
                    raw.format,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                    &format!("swapchain-{}", idx),
                )
            })
            .collect_vec();
        self.image_index = 0;
        Ok(())
    }

    /// 窗口大小变化后重建，调用前需要确保 GPU 不再使用旧的 image
    pub fn recreate(&mut self, device: &dyn GfxDevice, extent: vk::Extent2D) -> GfxResult<()> {
        let old_swapchain = self.handle;
        self.desc.extent = extent;
        self.create(device, old_swapchain)?;
        device.destroy_swapchain(old_swapchain);
        Ok(())
    }

    pub fn destroy(mut self, device: &dyn GfxDevice) {
        self.images.clear();
        device.destroy_swapchain(self.handle);
        self.handle = vk::SwapchainKHR::null();
    }
}
impl Drop for GfxRenderSwapchain {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.handle == vk::SwapchainKHR::null(), "swapchain is dropped without destroy");
        }
    }
}
// getters
impl GfxRenderSwapchain {
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub fn images(&self) -> &[GfxImage] {
        &self.images
    }

    #[inline]
    pub fn current_image_index(&self) -> usize {
        self.image_index
    }

    #[inline]
    pub fn current_image(&self) -> &GfxImage {
        &self.images[self.image_index]
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.surface_format.format
    }
}
// update
impl GfxRenderSwapchain {
    /// timeout: nano seconds
    /// return: need recreate
    pub fn acquire_next_image(
        &mut self,
        device: &dyn GfxDevice,
        semaphore: &GfxSemaphore,
        timeout: u64,
    ) -> GfxResult<bool> {
        match device.acquire_next_image(self.handle, semaphore.handle(), timeout)? {
            GfxAcquireResult::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    log::warn!("swapchain acquire image index {} is not optimal", image_index);
                }
                self.image_index = image_index as usize;
                Ok(suboptimal)
            }
            GfxAcquireResult::OutOfDate => {
                log::warn!("swapchain is out of date when acquire next image");
                Ok(true)
            }
        }
    }

    /// return: need recreate
    pub fn present_image(&self, device: &dyn GfxDevice, wait_semaphores: &[&GfxSemaphore]) -> GfxResult<bool> {
        let wait_semaphores = wait_semaphores.iter().map(|s| s.handle()).collect_vec();
        let need_recreate = device.queue_present(self.handle, self.image_index as u32, &wait_semaphores)?;
        if need_recreate {
            log::warn!("swapchain present image index {} needs recreate", self.image_index);
        }
        Ok(need_recreate)
    }
}

/// 确定 swapchain 的 extent 尺寸
///
/// 如果 surface_capabilities.current_extent 包含特殊值 0xFFFFFFFF，则表示可以自己设置交换链的 extent
pub fn calculate_swapchain_extent(
    surface_capabilities: &vk::SurfaceCapabilitiesKHR,
    window_physical_extent: vk::Extent2D,
) -> vk::Extent2D {
    let surface_extent = surface_capabilities.current_extent;
    if surface_extent.width == 0xFFFFFFFF || surface_extent.height == 0xFFFFFFFF {
        let width = window_physical_extent
            .width
            .clamp(surface_capabilities.min_image_extent.width, surface_capabilities.max_image_extent.width);
        let height = window_physical_extent
            .height
            .clamp(surface_capabilities.min_image_extent.height, surface_capabilities.max_image_extent.height);
        vk::Extent2D { width, height }
    } else {
        surface_extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;

    fn desc(width: u32, height: u32) -> GfxSwapchainDesc {
        GfxSwapchainDesc {
            extent: vk::Extent2D { width, height },
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }

    #[test]
    fn test_calculate_extent_clamps_when_surface_is_flexible() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 0xFFFFFFFF,
                height: 0xFFFFFFFF,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = calculate_swapchain_extent(&caps, vk::Extent2D { width: 2000, height: 600 });
        assert_eq!(extent, vk::Extent2D { width: 1024, height: 600 });

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..caps
        };
        assert_eq!(
            calculate_swapchain_extent(&fixed, vk::Extent2D { width: 1, height: 1 }),
            vk::Extent2D { width: 800, height: 600 }
        );
    }

    #[test]
    fn test_acquire_present_and_recreate() {
        let device = HeadlessDevice::new();
        let semaphore = GfxSemaphore::new(&device, "image-available").unwrap();
        let mut swapchain = GfxRenderSwapchain::new(&device, desc(640, 480)).unwrap();
        assert_eq!(swapchain.images().len(), 3);

        assert!(!swapchain.acquire_next_image(&device, &semaphore, u64::MAX).unwrap());
        let first = swapchain.current_image_index();
        assert!(!swapchain.present_image(&device, &[&semaphore]).unwrap());
        assert!(!swapchain.acquire_next_image(&device, &semaphore, u64::MAX).unwrap());
        assert_eq!(swapchain.current_image_index(), (first + 1) % 3);

        swapchain.recreate(&device, vk::Extent2D { width: 320, height: 240 }).unwrap();
        assert_eq!(swapchain.extent(), vk::Extent2D { width: 320, height: 240 });
        assert_eq!(swapchain.current_image().extent_2d(), vk::Extent2D { width: 320, height: 240 });

        swapchain.destroy(&device);
        semaphore.destroy(&device);
    }
}
