//! 带有状态追踪的资源
//!
//! [`GfxResourceHandle`] 独占一个 buffer 或 image，并记录它在命令流中的当前状态。
//! 状态字段是唯一的事实来源：任何 barrier 都是根据它计算出来的，并且在记录 barrier 的同时更新。

use ash::vk;

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier},
        command_buffer::GfxCommandBuffer,
    },
    device::GfxDevice,
    resources::{buffer::GfxBuffer, image::GfxImage, resource_state::ResourceState},
};

pub enum GfxResource {
    Buffer(GfxBuffer),
    Image(GfxImage),
}

#[derive(Copy, Clone, Debug)]
pub enum GfxResourceBarrier {
    Buffer(GfxBufferBarrier),
    Image(GfxImageBarrier),
}

pub struct GfxResourceHandle {
    resource: GfxResource,
    state: ResourceState,
}
// new & init
impl GfxResourceHandle {
    #[inline]
    pub fn new_buffer(buffer: GfxBuffer, initial_state: ResourceState) -> Self {
        Self {
            resource: GfxResource::Buffer(buffer),
            state: initial_state,
        }
    }

    #[inline]
    pub fn new_image(image: GfxImage, initial_state: ResourceState) -> Self {
        Self {
            resource: GfxResource::Image(image),
            state: initial_state,
        }
    }
}
// getters
impl GfxResourceHandle {
    #[inline]
    pub fn state(&self) -> ResourceState {
        self.state
    }

    #[inline]
    pub fn resource(&self) -> &GfxResource {
        &self.resource
    }

    #[inline]
    pub fn as_buffer(&self) -> Option<&GfxBuffer> {
        match &self.resource {
            GfxResource::Buffer(buffer) => Some(buffer),
            GfxResource::Image(_) => None,
        }
    }

    #[inline]
    pub fn as_image(&self) -> Option<&GfxImage> {
        match &self.resource {
            GfxResource::Image(image) => Some(image),
            GfxResource::Buffer(_) => None,
        }
    }

    #[inline]
    pub fn buffer(&self) -> &GfxBuffer {
        self.as_buffer().unwrap_or_else(|| panic!("resource handle does not hold a buffer"))
    }

    #[inline]
    pub fn image(&self) -> &GfxImage {
        self.as_image().unwrap_or_else(|| panic!("resource handle does not hold an image"))
    }
}
// state tracking
impl GfxResourceHandle {
    /// 计算从当前状态到 target 需要的 barrier，不修改状态
    ///
    /// 状态相同时返回 None
    pub fn get_barrier(&self, target: ResourceState) -> Option<GfxResourceBarrier> {
        if self.state == target {
            return None;
        }

        let src = self.state;
        let barrier = match &self.resource {
            GfxResource::Buffer(buffer) => GfxResourceBarrier::Buffer(
                GfxBufferBarrier::new()
                    .src_mask(src.stage(), src.src_access())
                    .dst_mask(target.stage(), target.access())
                    .buffer(buffer.vk_buffer(), 0, vk::WHOLE_SIZE),
            ),
            GfxResource::Image(image) => GfxResourceBarrier::Image(
                GfxImageBarrier::new()
                    .image(image.handle())
                    .src_mask(src.stage(), src.src_access())
                    .dst_mask(target.stage(), target.access())
                    .layout_transfer(src.layout(), target.layout())
                    .image_aspect_flag(image.aspect()),
            ),
        };
        Some(barrier)
    }

    /// 立即在 cmd 中记录状态转换
    ///
    /// return: 是否真的记录了 barrier
    pub fn transition(&mut self, device: &dyn GfxDevice, cmd: &GfxCommandBuffer, target: ResourceState) -> bool {
        let Some(barrier) = self.get_barrier(target) else {
            return false;
        };
        match barrier {
            GfxResourceBarrier::Buffer(barrier) => cmd.buffer_memory_barrier(device, std::slice::from_ref(&barrier)),
            GfxResourceBarrier::Image(barrier) => cmd.image_memory_barrier(device, std::slice::from_ref(&barrier)),
        }
        self.state = target;
        true
    }

    /// 资源的状态由外部操作改变（例如 render pass 的 final layout）时使用
    #[inline]
    pub fn assume_state(&mut self, state: ResourceState) {
        self.state = state;
    }
}
// destroy
impl GfxResourceHandle {
    pub fn destroy(self, device: &dyn GfxDevice) {
        match self.resource {
            GfxResource::Buffer(buffer) => buffer.destroy(device),
            GfxResource::Image(image) => image.destroy(device),
        }
    }
}

/// 将多个资源的状态转换合并到一次 pipeline barrier 中
#[derive(Default)]
pub struct GfxBarrierBatch {
    buffer_barriers: Vec<GfxBufferBarrier>,
    image_barriers: Vec<GfxImageBarrier>,
}
impl GfxBarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将 handle 的状态转换加入批次，并立刻提交 handle 的新状态
    ///
    /// 批次必须在使用这些资源之前 record
    ///
    /// return: 是否需要 barrier
    pub fn push(&mut self, handle: &mut GfxResourceHandle, target: ResourceState) -> bool {
        let Some(barrier) = handle.get_barrier(target) else {
            return false;
        };
        match barrier {
            GfxResourceBarrier::Buffer(barrier) => self.buffer_barriers.push(barrier),
            GfxResourceBarrier::Image(barrier) => self.image_barriers.push(barrier),
        }
        handle.state = target;
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer_barriers.len() + self.image_barriers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 记录所有 barrier；空批次不会产生命令
    pub fn record(self, device: &dyn GfxDevice, cmd: &GfxCommandBuffer) {
        if self.is_empty() {
            return;
        }
        cmd.pipeline_barrier(device, &self.buffer_barriers, &self.image_barriers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{HeadlessCommand, HeadlessDevice},
        commands::command_pool::GfxCommandPool,
        resources::image::GfxImageCreateInfo,
    };

    fn recording_cmd(device: &HeadlessDevice) -> (GfxCommandPool, GfxCommandBuffer) {
        let pool = GfxCommandPool::new(device, vk::CommandPoolCreateFlags::TRANSIENT, "test-pool").unwrap();
        let cmd = GfxCommandBuffer::new(device, &pool, "test-cmd").unwrap();
        device.begin_command_buffer(cmd.vk_handle(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        (pool, cmd)
    }

    fn barrier_count(device: &HeadlessDevice, cmd: &GfxCommandBuffer) -> usize {
        device
            .recorded_commands(cmd.vk_handle())
            .iter()
            .filter(|c| matches!(c, HeadlessCommand::PipelineBarrier { .. }))
            .count()
    }

    #[test]
    fn test_transition_to_same_state_is_noop() {
        let device = HeadlessDevice::new();
        let (pool, cmd) = recording_cmd(&device);
        let buffer = GfxBuffer::new(&device, 64, vk::BufferUsageFlags::VERTEX_BUFFER, None, false, "vb").unwrap();
        let mut handle = GfxResourceHandle::new_buffer(buffer, ResourceState::VertexAndIndexBuffer);

        assert!(handle.get_barrier(ResourceState::VertexAndIndexBuffer).is_none());
        assert!(!handle.transition(&device, &cmd, ResourceState::VertexAndIndexBuffer));
        assert_eq!(barrier_count(&device, &cmd), 0);
        assert_eq!(handle.state(), ResourceState::VertexAndIndexBuffer);

        handle.destroy(&device);
        pool.destroy(&device);
    }

    #[test]
    fn test_transition_records_barrier_and_updates_state() {
        let device = HeadlessDevice::new();
        let (pool, cmd) = recording_cmd(&device);
        let image = GfxImage::new(
            &device,
            &GfxImageCreateInfo::new_image_2d_info(
                vk::Extent2D { width: 4, height: 4 },
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            ),
            "tex",
        )
        .unwrap();
        let mut handle = GfxResourceHandle::new_image(image, ResourceState::Undefined);

        assert!(handle.transition(&device, &cmd, ResourceState::CopyDest));
        assert!(!handle.transition(&device, &cmd, ResourceState::CopyDest));
        assert!(handle.transition(&device, &cmd, ResourceState::ShaderResource));
        assert_eq!(barrier_count(&device, &cmd), 2);

        let layouts: Vec<_> = device
            .recorded_commands(cmd.vk_handle())
            .into_iter()
            .filter_map(|c| match c {
                HeadlessCommand::PipelineBarrier { images, .. } => Some((images[0].old_layout(), images[0].new_layout())),
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ]
        );

        handle.destroy(&device);
        pool.destroy(&device);
    }

    #[test]
    fn test_get_barrier_does_not_mutate() {
        let device = HeadlessDevice::new();
        let buffer = GfxBuffer::new(&device, 64, vk::BufferUsageFlags::INDEX_BUFFER, None, false, "ib").unwrap();
        let handle = GfxResourceHandle::new_buffer(buffer, ResourceState::VertexAndIndexBuffer);

        assert!(handle.get_barrier(ResourceState::ShaderResource).is_some());
        assert_eq!(handle.state(), ResourceState::VertexAndIndexBuffer);
        handle.destroy(&device);
    }

    #[test]
    fn test_batch_merges_into_one_barrier() {
        let device = HeadlessDevice::new();
        let (pool, cmd) = recording_cmd(&device);
        let mut a = GfxResourceHandle::new_buffer(
            GfxBuffer::new(&device, 64, vk::BufferUsageFlags::VERTEX_BUFFER, None, false, "a").unwrap(),
            ResourceState::VertexAndIndexBuffer,
        );
        let mut b = GfxResourceHandle::new_buffer(
            GfxBuffer::new(&device, 64, vk::BufferUsageFlags::INDEX_BUFFER, None, false, "b").unwrap(),
            ResourceState::ShaderResource,
        );

        let mut batch = GfxBarrierBatch::new();
        assert!(batch.push(&mut a, ResourceState::ShaderResource));
        assert!(!batch.push(&mut b, ResourceState::ShaderResource));
        assert_eq!(batch.len(), 1);
        assert_eq!(a.state(), ResourceState::ShaderResource);
        batch.record(&device, &cmd);
        assert_eq!(barrier_count(&device, &cmd), 1);

        a.destroy(&device);
        b.destroy(&device);
        pool.destroy(&device);
    }
}
