//! 设备抽象
//!
//! [`GfxDevice`] 是 ash::Device 中本引擎实际用到的那一部分接口，使用 ash 的 vk 数据类型表达。
//! 所有的 manager 只通过这个 trait 访问 GPU，从而可以在没有 GPU 的环境下使用 headless 后端。

use std::ffi::CStr;

use ash::vk;

use crate::{
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier, GfxMemoryBarrier},
        submit_info::GfxSubmitInfo,
    },
    error::GfxResult,
    raytracing::acceleration::GfxAsPrebuildInfo,
};

/// 设备的基础信息以及会影响资源布局的限制
#[derive(Clone, Debug)]
pub struct GfxDeviceLimits {
    pub device_name: String,
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    pub min_as_scratch_offset_alignment: vk::DeviceSize,
    pub max_push_constants_size: u32,
}

/// 创建 buffer 需要的参数
#[derive(Clone, Debug)]
pub struct GfxBufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// buffer 起始地址的对齐
    pub alignment: vk::DeviceSize,
    /// 是否在创建时进行持久映射
    pub mapped: bool,
    pub name: &'a str,
}

/// 后端返回的 buffer 信息，内存由后端持有
#[derive(Copy, Clone, Debug)]
pub struct GfxBufferAllocation {
    pub handle: vk::Buffer,
    /// 在初始化阶段写死，直到 destroy 之前一直有效
    pub mapped_ptr: Option<*mut u8>,
    /// 只有在 buffer usage 包含 SHADER_DEVICE_ADDRESS 时才有值
    pub device_address: Option<vk::DeviceAddress>,
}

/// 一个 bindless descriptor set 以及它的 layout 和 pool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxBindlessSetRaw {
    pub pool: vk::DescriptorPool,
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

/// 加速结构构建所需的几何信息，同时用于 size 查询和 build 命令
pub struct GfxAsGeometryDesc<'a> {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
    /// 和 geometries 一一对应
    pub primitive_counts: &'a [u32],
}

#[derive(Copy, Clone, Debug)]
pub struct GfxSwapchainDesc {
    pub extent: vk::Extent2D,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Debug)]
pub struct GfxSwapchainRaw {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GfxAcquireResult {
    Acquired { image_index: u32, suboptimal: bool },
    /// 需要重建 swapchain
    OutOfDate,
}

pub trait GfxDevice {
    // info
    fn limits(&self) -> &GfxDeviceLimits;
    fn set_debug_name_raw(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str);

    // buffer
    fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<GfxBufferAllocation>;
    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // image
    fn create_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> GfxResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>, name: &str) -> GfxResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // command pool & command buffer
    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags, name: &str) -> GfxResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer>;
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> GfxResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()>;

    // synchronization
    /// `timeline_initial_value` 为 None 时创建 binary semaphore
    fn create_semaphore(&self, timeline_initial_value: Option<u64>, name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64>;
    /// 阻塞当前线程，直到 timeline semaphore 到达 value
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<()>;
    fn queue_submit(&self, submits: &[GfxSubmitInfo]) -> GfxResult<()>;
    fn queue_wait_idle(&self) -> GfxResult<()>;
    fn device_wait_idle(&self) -> GfxResult<()>;

    // command recording
    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str, color: glam::Vec4);
    fn cmd_end_label(&self, cmd: vk::CommandBuffer);
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        memory_barriers: &[GfxMemoryBarrier],
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    );
    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, group_count: glam::UVec3);

    // pipeline
    fn create_shader_module(&self, code: &[u32], name: &str) -> GfxResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
        name: &str,
    ) -> GfxResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
        name: &str,
    ) -> GfxResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // bindless descriptor
    fn create_bindless_set(
        &self,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
        name: &str,
    ) -> GfxResult<GfxBindlessSetRaw>;
    fn destroy_bindless_set(&self, set: &GfxBindlessSetRaw);
    fn write_image_descriptor(
        &self,
        set: vk::DescriptorSet,
        descriptor_type: vk::DescriptorType,
        index: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    );

    // acceleration structure
    fn acceleration_structure_build_sizes(&self, desc: &GfxAsGeometryDesc<'_>) -> GfxAsPrebuildInfo;
    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        name: &str,
    ) -> GfxResult<vk::AccelerationStructureKHR>;
    fn acceleration_structure_address(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress;
    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR);
    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        desc: &GfxAsGeometryDesc<'_>,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    );

    // swapchain
    fn create_swapchain(&self, desc: &GfxSwapchainDesc, old_swapchain: vk::SwapchainKHR)
    -> GfxResult<GfxSwapchainRaw>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal_semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> GfxResult<GfxAcquireResult>;
    /// return: need recreate
    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: &[vk::Semaphore]) -> GfxResult<bool>;
}

impl dyn GfxDevice + '_ {
    #[inline]
    pub fn set_object_debug_name<T: vk::Handle>(&self, handle: T, name: impl AsRef<str>) {
        self.set_debug_name_raw(T::TYPE, handle.as_raw(), name.as_ref());
    }
}
