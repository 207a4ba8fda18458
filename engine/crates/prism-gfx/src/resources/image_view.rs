use ash::vk;

use crate::{device::GfxDevice, error::GfxResult, resources::image::GfxImage};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxImageViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
    /// (base mip, mip count)
    pub mip: (u32, u32),
    /// (base layer, layer count)
    pub layer: (u32, u32),
}
impl GfxImageViewDesc {
    /// 覆盖所有 mip 的 2D view
    #[inline]
    pub fn new_2d(image: &GfxImage) -> Self {
        Self {
            view_type: vk::ImageViewType::TYPE_2D,
            format: image.format(),
            aspect_mask: image.aspect(),
            mip: (0, image.mip_levels()),
            layer: (0, 1),
        }
    }

    /// 只覆盖单个 mip 的 2D view，用于 storage image 写入
    #[inline]
    pub fn new_2d_mip(image: &GfxImage, mip_level: u32) -> Self {
        Self {
            mip: (mip_level, 1),
            ..Self::new_2d(image)
        }
    }

    #[inline]
    pub fn new_cube(image: &GfxImage) -> Self {
        Self {
            view_type: vk::ImageViewType::CUBE,
            format: image.format(),
            aspect_mask: image.aspect(),
            mip: (0, image.mip_levels()),
            layer: (0, 6),
        }
    }

    /// cube 的 6 个面作为 2D array，用于 storage image 写入
    #[inline]
    pub fn new_2d_array(image: &GfxImage) -> Self {
        Self {
            view_type: vk::ImageViewType::TYPE_2D_ARRAY,
            format: image.format(),
            aspect_mask: image.aspect(),
            mip: (0, 1),
            layer: (0, image.array_layers()),
        }
    }
}

pub struct GfxImageView {
    handle: vk::ImageView,

    desc: GfxImageViewDesc,

    name: String,
}
// new & init
impl GfxImageView {
    pub fn new(
        device: &dyn GfxDevice,
        image: &GfxImage,
        view_desc: GfxImageViewDesc,
        name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let info = vk::ImageViewCreateInfo {
            image: image.handle(),
            view_type: view_desc.view_type,
            format: view_desc.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: view_desc.aspect_mask,
                base_mip_level: view_desc.mip.0,
                level_count: view_desc.mip.1,
                base_array_layer: view_desc.layer.0,
                layer_count: view_desc.layer.1,
            },
            ..Default::default()
        };

        let handle = device.create_image_view(&info, name.as_ref())?;
        Ok(Self {
            handle,
            desc: view_desc,
            name: name.as_ref().to_string(),
        })
    }
}
// destroy
impl GfxImageView {
    pub fn destroy(mut self, device: &dyn GfxDevice) {
        device.destroy_image_view(self.handle);
        self.handle = vk::ImageView::null();
    }
}
impl Drop for GfxImageView {
    fn drop(&mut self) {
        if self.handle != vk::ImageView::null() {
            log::warn!("GfxImageView {} is dropped without destroy", self.name);
        }
    }
}
// getters
impl GfxImageView {
    #[inline]
    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &GfxImageViewDesc {
        &self.desc
    }
}
