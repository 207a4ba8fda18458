use ash::vk;

use crate::{
    basic::color::LabelColor,
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier, GfxMemoryBarrier},
        command_pool::GfxCommandPool,
    },
    device::{GfxAsGeometryDesc, GfxDevice},
    error::GfxResult,
    resources::{buffer::GfxBuffer, image::GfxImage},
};

/// 命令缓冲封装
///
/// 只保存 handle，所有的录制都显式传入 device。
///
/// # 使用示例
/// ```ignore
/// let cmd = GfxCommandBuffer::new(device, &pool, "my-pass")?;
/// cmd.begin(device, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, "my-pass")?;
/// cmd.cmd_dispatch(device, glam::uvec3(4, 4, 1));
/// cmd.end(device)?;
/// ```
#[derive(Clone, Debug)]
pub struct GfxCommandBuffer {
    vk_handle: vk::CommandBuffer,
    name: String,
}
// new & init
impl GfxCommandBuffer {
    pub fn new(device: &dyn GfxDevice, command_pool: &GfxCommandPool, debug_name: &str) -> GfxResult<Self> {
        let vk_handle = device.allocate_command_buffer(command_pool.handle(), debug_name)?;
        Ok(Self {
            vk_handle,
            name: debug_name.to_string(),
        })
    }
}
// basic 命令
impl GfxCommandBuffer {
    /// 开始录制 command
    ///
    /// 自动设置 debug label
    #[inline]
    pub fn begin(
        &self,
        device: &dyn GfxDevice,
        usage_flag: vk::CommandBufferUsageFlags,
        debug_label_name: &str,
    ) -> GfxResult<()> {
        device.begin_command_buffer(self.vk_handle, usage_flag)?;
        self.begin_label(device, debug_label_name, LabelColor::COLOR_CMD);
        Ok(())
    }

    /// 结束录制 command
    ///
    /// 结束 debug label
    #[inline]
    pub fn end(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        self.end_label(device);
        device.end_command_buffer(self.vk_handle)
    }

    #[inline]
    pub fn begin_label(&self, device: &dyn GfxDevice, label_name: &str, label_color: glam::Vec4) {
        device.cmd_begin_label(self.vk_handle, label_name, label_color);
    }

    #[inline]
    pub fn end_label(&self, device: &dyn GfxDevice) {
        device.cmd_end_label(self.vk_handle);
    }
}
// getters
impl GfxCommandBuffer {
    #[inline]
    pub fn vk_handle(&self) -> vk::CommandBuffer {
        self.vk_handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
// 数据传输类型
impl GfxCommandBuffer {
    /// - command type: action
    /// - 支持的 queue：transfer，graphics，compute
    #[inline]
    pub fn cmd_copy_buffer(&self, device: &dyn GfxDevice, src: &GfxBuffer, dst: &GfxBuffer, regions: &[vk::BufferCopy]) {
        device.cmd_copy_buffer(self.vk_handle, src.vk_buffer(), dst.vk_buffer(), regions);
    }

    /// - command type: action
    /// - 支持的 queue：transfer，graphics，compute
    #[inline]
    pub fn cmd_copy_buffer_to_image(
        &self,
        device: &dyn GfxDevice,
        src: &GfxBuffer,
        dst: &GfxImage,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        device.cmd_copy_buffer_to_image(self.vk_handle, src.vk_buffer(), dst.handle(), dst_layout, regions);
    }

    /// - command type: action
    /// - 支持的 queue：graphics，compute
    #[inline]
    pub fn cmd_clear_color_image(
        &self,
        device: &dyn GfxDevice,
        image: &GfxImage,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
    ) {
        device.cmd_clear_color_image(
            self.vk_handle,
            image.handle(),
            layout,
            color,
            &[image.full_subresource_range()],
        );
    }

    /// - command type: action
    /// - 支持的 queue：graphics
    #[inline]
    pub fn cmd_blit_image(
        &self,
        device: &dyn GfxDevice,
        src: (vk::Image, vk::ImageLayout),
        dst: (vk::Image, vk::ImageLayout),
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        device.cmd_blit_image(self.vk_handle, src.0, src.1, dst.0, dst.1, regions, filter);
    }
}
// 状态与计算命令
impl GfxCommandBuffer {
    /// - command type: state
    /// - 支持的 queue: graphics, compute
    #[inline]
    pub fn cmd_bind_pipeline(&self, device: &dyn GfxDevice, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        device.cmd_bind_pipeline(self.vk_handle, bind_point, pipeline);
    }

    /// - command type: state
    /// - 支持的 queue: graphics, compute
    #[inline]
    pub fn cmd_bind_descriptor_sets(
        &self,
        device: &dyn GfxDevice,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        device.cmd_bind_descriptor_sets(self.vk_handle, bind_point, layout, first_set, sets);
    }

    /// - command type: state
    /// - 支持的 queue: graphics, compute
    #[inline]
    pub fn cmd_push_constants(
        &self,
        device: &dyn GfxDevice,
        pipeline_layout: vk::PipelineLayout,
        stage: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        device.cmd_push_constants(self.vk_handle, pipeline_layout, stage, offset, data);
    }

    /// - command type: action
    /// - 支持的 queue: compute
    #[inline]
    pub fn cmd_dispatch(&self, device: &dyn GfxDevice, group_cnt: glam::UVec3) {
        device.cmd_dispatch(self.vk_handle, group_cnt);
    }
}
// 同步命令
impl GfxCommandBuffer {
    #[inline]
    pub fn memory_barrier(&self, device: &dyn GfxDevice, barriers: &[GfxMemoryBarrier]) {
        device.cmd_pipeline_barrier(self.vk_handle, barriers, &[], &[]);
    }

    #[inline]
    pub fn image_memory_barrier(&self, device: &dyn GfxDevice, barriers: &[GfxImageBarrier]) {
        device.cmd_pipeline_barrier(self.vk_handle, &[], &[], barriers);
    }

    #[inline]
    pub fn buffer_memory_barrier(&self, device: &dyn GfxDevice, barriers: &[GfxBufferBarrier]) {
        device.cmd_pipeline_barrier(self.vk_handle, &[], barriers, &[]);
    }

    /// 将 buffer barrier 和 image barrier 合并到一次 pipeline barrier 中
    #[inline]
    pub fn pipeline_barrier(
        &self,
        device: &dyn GfxDevice,
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    ) {
        device.cmd_pipeline_barrier(self.vk_handle, &[], buffer_barriers, image_barriers);
    }
}
// 光追相关
impl GfxCommandBuffer {
    /// - command type: action
    /// - 支持的 queue: compute
    #[inline]
    pub fn build_acceleration_structure(
        &self,
        device: &dyn GfxDevice,
        desc: &GfxAsGeometryDesc<'_>,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        device.cmd_build_acceleration_structure(self.vk_handle, desc, dst, scratch_address);
    }
}
