use ash::vk;

use crate::{device::GfxDevice, error::GfxResult};

/// Vulkan 格式相关的工具类
pub struct VulkanFormatUtils;
impl VulkanFormatUtils {
    /// 计算指定 Vulkan 格式下每个像素需要的字节数
    ///
    /// # Panic
    /// 当遇到不支持的格式时会 panic
    pub fn pixel_size_in_bytes(format: vk::Format) -> usize {
        match format {
            vk::Format::R8_UNORM => 1,
            vk::Format::R8G8_UNORM => 2,
            vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::A2B10G10R10_UNORM_PACK32
            | vk::Format::R32_SFLOAT
            | vk::Format::D32_SFLOAT => 4,
            vk::Format::R16G16B16A16_SFLOAT | vk::Format::R16G16B16A16_UNORM | vk::Format::R32G32_SFLOAT => 8,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            _ => panic!("unsupported format: {:?}", format),
        }
    }

    #[inline]
    pub fn is_depth_format(format: vk::Format) -> bool {
        matches!(
            format,
            vk::Format::D16_UNORM
                | vk::Format::D32_SFLOAT
                | vk::Format::D24_UNORM_S8_UINT
                | vk::Format::D32_SFLOAT_S8_UINT
        )
    }

    #[inline]
    pub fn aspect_of(format: vk::Format) -> vk::ImageAspectFlags {
        if Self::is_depth_format(format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }
}

/// Image 来源枚举
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// 由后端分配的 Image
    Allocated,
    /// 外部 Image（例如 Swapchain Image），不管理其内存生命周期
    External,
}

pub struct GfxImage {
    handle: vk::Image,
    source: ImageSource,

    extent: vk::Extent3D,
    format: vk::Format,
    mip_levels: u32,
    array_layers: u32,

    usage: vk::ImageUsageFlags,

    name: String,
}
// new & init
impl GfxImage {
    pub fn new(device: &dyn GfxDevice, image_info: &GfxImageCreateInfo, debug_name: &str) -> GfxResult<Self> {
        let handle = device.create_image(&image_info.as_info(), debug_name)?;
        Ok(Self {
            handle,
            source: ImageSource::Allocated,
            extent: image_info.inner.extent,
            format: image_info.inner.format,
            mip_levels: image_info.inner.mip_levels,
            array_layers: image_info.inner.array_layers,
            usage: image_info.inner.usage,
            name: debug_name.to_string(),
        })
    }

    /// 包装外部创建的 image，例如 swapchain image
    pub fn from_external(
        handle: vk::Image,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        debug_name: &str,
    ) -> Self {
        Self {
            handle,
            source: ImageSource::External,
            extent: extent.into(),
            format,
            mip_levels: 1,
            array_layers: 1,
            usage,
            name: debug_name.to_string(),
        }
    }

    /// 完整 mip 链的层数：`floor(log2(min(w, h))) + 1`
    #[inline]
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        let min_edge = width.min(height).max(1);
        u32::BITS - min_edge.leading_zeros()
    }
}
// getter
impl GfxImage {
    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        VulkanFormatUtils::aspect_of(self.format)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn full_subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }
}
// destroy
impl GfxImage {
    pub fn destroy(mut self, device: &dyn GfxDevice) {
        log::debug!("Destroying GfxImage: {}", self.name);
        if self.source == ImageSource::Allocated {
            device.destroy_image(self.handle);
        }
        self.handle = vk::Image::null();
    }
}
impl Drop for GfxImage {
    fn drop(&mut self) {
        if self.source == ImageSource::Allocated && self.handle != vk::Image::null() {
            log::warn!("GfxImage {} is dropped without destroy, memory leaks", self.name);
        }
    }
}

pub struct GfxImageCreateInfo {
    inner: vk::ImageCreateInfo<'static>,
}
impl GfxImageCreateInfo {
    #[inline]
    pub fn new_image_2d_info(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            inner: vk::ImageCreateInfo {
                image_type: vk::ImageType::TYPE_2D,
                format,
                extent: extent.into(),
                mip_levels: 1,
                array_layers: 1,
                samples: vk::SampleCountFlags::TYPE_1,
                tiling: vk::ImageTiling::OPTIMAL,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                // 这里只能是 UNDEFINED 或者 PREINITIALIZED
                initial_layout: vk::ImageLayout::UNDEFINED,
                ..Default::default()
            },
        }
    }

    /// 6 个 layer 的 cube 兼容 image
    #[inline]
    pub fn new_cube_info(size: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        let mut info = Self::new_image_2d_info(
            vk::Extent2D {
                width: size,
                height: size,
            },
            format,
            usage,
        );
        info.inner.array_layers = 6;
        info.inner.flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        info
    }

    #[inline]
    pub fn as_info(&self) -> vk::ImageCreateInfo<'_> {
        self.inner
    }

    // builder
    #[inline]
    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.inner.mip_levels = mip_levels;
        self
    }
}
