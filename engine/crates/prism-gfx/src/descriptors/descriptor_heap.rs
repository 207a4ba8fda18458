//! 描述符堆
//!
//! shader 可见的堆（SRV / UAV / Cubemap）各自对应一个 bindless descriptor set，
//! slot index 就是 shader 中数组的下标；RTV 堆只存在于 CPU 端。

use ash::vk;

use crate::{
    device::{GfxBindlessSetRaw, GfxDevice},
    error::GfxResult,
};

/// view 的种类，每种对应一个独立的堆
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GfxDescriptorKind {
    /// 2D 纹理，shader 只读
    Srv,
    /// render target，只在 CPU 端记录
    Rtv,
    /// cube 纹理，和 2D 纹理分开，shader 中位于不同的 set
    Cubemap,
    /// storage image
    Uav,
}
impl GfxDescriptorKind {
    pub const ALL: [Self; 4] = [Self::Srv, Self::Rtv, Self::Cubemap, Self::Uav];

    /// CPU 端的堆返回 None
    #[inline]
    pub fn descriptor_type(self) -> Option<vk::DescriptorType> {
        match self {
            Self::Srv | Self::Cubemap => Some(vk::DescriptorType::SAMPLED_IMAGE),
            Self::Uav => Some(vk::DescriptorType::STORAGE_IMAGE),
            Self::Rtv => None,
        }
    }

    #[inline]
    pub fn is_shader_visible(self) -> bool {
        self.descriptor_type().is_some()
    }

    /// 写入 descriptor 时 image 所处的 layout
    #[inline]
    pub fn image_layout(self) -> vk::ImageLayout {
        match self {
            Self::Srv | Self::Cubemap => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::Uav => vk::ImageLayout::GENERAL,
            Self::Rtv => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Srv => "srv",
            Self::Rtv => "rtv",
            Self::Cubemap => "cubemap",
            Self::Uav => "uav",
        }
    }
}

/// 堆中的一个位置；一旦分配，在整个会话中不会被其他资源复用
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GfxDescriptorSlot {
    pub kind: GfxDescriptorKind,
    pub index: u32,
}
impl GfxDescriptorSlot {
    /// 相对于当前 slot 偏移 offset 的 slot，用于连续分配的区间
    #[inline]
    pub fn offset(self, offset: u32) -> Self {
        Self {
            kind: self.kind,
            index: self.index + offset,
        }
    }
}

pub struct GfxDescriptorHeap {
    kind: GfxDescriptorKind,
    capacity: u32,

    bindless: Option<GfxBindlessSetRaw>,
    /// 每个 slot 当前写入的 view，RTV 堆只依赖这张表
    views: Vec<vk::ImageView>,

    name: String,
}
// new & init
impl GfxDescriptorHeap {
    pub fn new(device: &dyn GfxDevice, kind: GfxDescriptorKind, capacity: u32, name: &str) -> GfxResult<Self> {
        assert!(capacity > 0, "descriptor heap {} has zero capacity", name);
        let bindless = match kind.descriptor_type() {
            Some(descriptor_type) => Some(device.create_bindless_set(descriptor_type, capacity, name)?),
            None => None,
        };
        log::info!("create descriptor heap {}: kind {:?}, capacity {}", name, kind, capacity);

        Ok(Self {
            kind,
            capacity,
            bindless,
            views: vec![vk::ImageView::null(); capacity as usize],
            name: name.to_string(),
        })
    }

    pub fn destroy(self, device: &dyn GfxDevice) {
        if let Some(bindless) = &self.bindless {
            device.destroy_bindless_set(bindless);
        }
    }
}
// getters
impl GfxDescriptorHeap {
    #[inline]
    pub fn kind(&self) -> GfxDescriptorKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Vulkan 中没有 descriptor increment size 的概念，slot index 本身就是偏移单位
    #[inline]
    pub fn slot_stride(&self) -> u32 {
        1
    }

    #[inline]
    pub fn bindless_set(&self) -> Option<&GfxBindlessSetRaw> {
        self.bindless.as_ref()
    }

    #[inline]
    pub fn view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
// update
impl GfxDescriptorHeap {
    pub fn write(&mut self, device: &dyn GfxDevice, index: u32, view: vk::ImageView) {
        assert!(
            index < self.capacity,
            "descriptor heap {}: slot {} out of capacity {}",
            self.name,
            index,
            self.capacity
        );
        if let (Some(bindless), Some(descriptor_type)) = (&self.bindless, self.kind.descriptor_type()) {
            device.write_image_descriptor(bindless.set, descriptor_type, index, view, self.kind.image_layout());
        }
        self.views[index as usize] = view;
    }
}
