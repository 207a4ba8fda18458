//! 不依赖 GPU 的后端
//!
//! 所有 handle 都是伪造的递增整数；映射的 buffer 由 host 内存承载；
//! 每个 command buffer 记录下收到的命令，submit 时追加到提交日志中。
//!
//! timeline semaphore 的模型：submit 中的 signal 先进入 pending 状态，
//! 直到有人等待它、调用 [`HeadlessDevice::complete_all`] 或者 queue idle 时才算完成。
//! 打开 auto complete 后 submit 立即完成。

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    ffi::CStr,
};

use ash::vk::{self, Handle};
use itertools::Itertools;

use crate::{
    basic::bytes::align_up,
    commands::{
        barrier::{GfxBufferBarrier, GfxImageBarrier, GfxMemoryBarrier},
        submit_info::GfxSubmitInfo,
    },
    device::{
        GfxAcquireResult, GfxAsGeometryDesc, GfxBindlessSetRaw, GfxBufferAllocation, GfxBufferDesc, GfxDevice,
        GfxDeviceLimits, GfxSwapchainDesc, GfxSwapchainRaw,
    },
    error::{GfxError, GfxResult},
    raytracing::acceleration::GfxAsPrebuildInfo,
};

/// 伪造的 device address 都按照 256 对齐
const ADDRESS_ALIGNMENT: u64 = 256;
const SWAPCHAIN_IMAGE_COUNT: usize = 3;

/// command buffer 中记录的一条命令
#[derive(Clone, Debug)]
pub enum HeadlessCommand {
    BeginLabel {
        name: String,
    },
    EndLabel,
    PipelineBarrier {
        memory: Vec<GfxMemoryBarrier>,
        buffers: Vec<GfxBufferBarrier>,
        images: Vec<GfxImageBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        filter: vk::Filter,
    },
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        group_count: glam::UVec3,
    },
    BuildAccelerationStructure {
        ty: vk::AccelerationStructureTypeKHR,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
        primitive_counts: Vec<u32>,
        /// 只有 TLAS 才有
        instance_address: Option<vk::DeviceAddress>,
    },
}

/// 一次 queue submit 中的所有命令
#[derive(Clone, Debug)]
pub struct HeadlessSubmission {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub commands: Vec<HeadlessCommand>,
    /// (semaphore, value)
    pub signals: Vec<(vk::Semaphore, u64)>,
}

/// 一次对 timeline semaphore 的等待
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeadlessWait {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    /// 等待时值是否尚未到达
    pub blocked: bool,
}

struct HeadlessBuffer {
    size: vk::DeviceSize,
    device_address: Option<vk::DeviceAddress>,
    /// 只有映射的 buffer 才分配 host 内存
    memory: Option<Box<[u8]>>,
}

struct HeadlessCommandBuffer {
    pool: vk::CommandPool,
    recording: bool,
    commands: Vec<HeadlessCommand>,
}

#[derive(Default)]
struct HeadlessSemaphore {
    timeline: bool,
    completed: u64,
    /// 已经提交但是还未完成的 signal
    pending: Vec<u64>,
}

struct HeadlessSwapchain {
    images: Vec<vk::Image>,
    next_index: usize,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    next_address: u64,

    debug_names: HashMap<u64, String>,

    buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    images: HashMap<vk::Image, vk::Extent3D>,
    image_views: HashSet<vk::ImageView>,

    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, HeadlessCommandBuffer>,
    semaphores: HashMap<vk::Semaphore, HeadlessSemaphore>,

    shader_modules: HashSet<vk::ShaderModule>,
    pipeline_layouts: HashSet<vk::PipelineLayout>,
    pipelines: HashSet<vk::Pipeline>,

    /// descriptor set -> 每个 slot 写入的 view
    bindless_sets: HashMap<vk::DescriptorSet, Vec<vk::ImageView>>,

    acceleration_structures: HashMap<vk::AccelerationStructureKHR, vk::DeviceAddress>,
    swapchains: HashMap<vk::SwapchainKHR, HeadlessSwapchain>,

    submissions: Vec<HeadlessSubmission>,
    waits: Vec<HeadlessWait>,
    queue_idle_count: usize,
    present_count: usize,
}
impl HeadlessState {
    fn new_raw_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn new_handle<T: Handle>(&mut self) -> T {
        T::from_raw(self.new_raw_handle())
    }

    fn new_address(&mut self, size: vk::DeviceSize) -> vk::DeviceAddress {
        // 0 不是合法地址
        if self.next_address == 0 {
            self.next_address = ADDRESS_ALIGNMENT;
        }
        let address = self.next_address;
        self.next_address = align_up(address + size.max(1), ADDRESS_ALIGNMENT);
        address
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: HeadlessCommand) {
        match self.command_buffers.get_mut(&cmd) {
            Some(command_buffer) => {
                if !command_buffer.recording {
                    log::error!("headless: command recorded into cmd {:#x} outside begin/end", cmd.as_raw());
                }
                command_buffer.commands.push(command);
            }
            None => log::error!("headless: command recorded into unknown cmd {:#x}", cmd.as_raw()),
        }
    }

    fn complete_semaphore(&mut self, semaphore: vk::Semaphore, value: u64) {
        if let Some(sem) = self.semaphores.get_mut(&semaphore) {
            sem.completed = sem.completed.max(value);
            let completed = sem.completed;
            sem.pending.retain(|v| *v > completed);
        }
    }

    fn complete_all(&mut self) {
        for sem in self.semaphores.values_mut() {
            if let Some(max) = sem.pending.iter().max() {
                sem.completed = sem.completed.max(*max);
            }
            sem.pending.clear();
        }
    }
}

pub struct HeadlessDevice {
    limits: GfxDeviceLimits,
    auto_complete: Cell<bool>,
    swapchain_out_of_date: Cell<bool>,
    state: RefCell<HeadlessState>,
}
// new & init
impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}
impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            limits: GfxDeviceLimits {
                device_name: "headless".to_string(),
                min_storage_buffer_offset_alignment: 64,
                min_as_scratch_offset_alignment: 128,
                max_push_constants_size: 128,
            },
            auto_complete: Cell::new(false),
            swapchain_out_of_date: Cell::new(false),
            state: RefCell::new(HeadlessState::default()),
        }
    }

    /// submit 之后立即完成所有 signal
    pub fn with_auto_complete(self, auto_complete: bool) -> Self {
        self.auto_complete.set(auto_complete);
        self
    }
}
// inspection
impl HeadlessDevice {
    /// command buffer 当前录制的命令
    pub fn recorded_commands(&self, cmd: vk::CommandBuffer) -> Vec<HeadlessCommand> {
        self.state.borrow().command_buffers.get(&cmd).map(|c| c.commands.clone()).unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<HeadlessSubmission> {
        self.state.borrow().submissions.clone()
    }

    /// 所有提交过的命令，按照提交顺序展开
    pub fn submitted_commands(&self) -> Vec<HeadlessCommand> {
        self.state.borrow().submissions.iter().flat_map(|s| s.commands.iter().cloned()).collect_vec()
    }

    pub fn wait_log(&self) -> Vec<HeadlessWait> {
        self.state.borrow().waits.clone()
    }

    /// 模拟 GPU 执行到 value
    pub fn complete_until(&self, semaphore: vk::Semaphore, value: u64) {
        self.state.borrow_mut().complete_semaphore(semaphore, value);
    }

    /// 模拟 GPU 执行完所有已提交的工作
    pub fn complete_all(&self) {
        self.state.borrow_mut().complete_all();
    }

    /// 下一次 acquire 返回 out of date
    pub fn mark_swapchain_out_of_date(&self) {
        self.swapchain_out_of_date.set(true);
    }

    pub fn queue_idle_count(&self) -> usize {
        self.state.borrow().queue_idle_count
    }

    pub fn present_count(&self) -> usize {
        self.state.borrow().present_count
    }

    /// bindless set 中某个 slot 写入的 view
    pub fn descriptor_view(&self, set: vk::DescriptorSet, index: u32) -> Option<vk::ImageView> {
        self.state.borrow().bindless_sets.get(&set).and_then(|views| views.get(index as usize).copied())
    }

    pub fn object_name(&self, raw_handle: u64) -> Option<String> {
        self.state.borrow().debug_names.get(&raw_handle).cloned()
    }

    /// 通过 device address 读取映射 buffer 的内容，相当于 shader 看到的数据
    pub fn read_device_address(&self, address: vk::DeviceAddress, size: vk::DeviceSize) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        state.buffers.values().find_map(|buffer| {
            let base = buffer.device_address?;
            let memory = buffer.memory.as_ref()?;
            if address < base || address + size > base + buffer.size {
                return None;
            }
            let offset = (address - base) as usize;
            Some(memory[offset..offset + size as usize].to_vec())
        })
    }

    /// 尚未销毁的对象数量，command buffer 跟随 pool，不单独计数
    pub fn live_object_count(&self) -> usize {
        let state = self.state.borrow();
        state.buffers.len()
            + state.images.len()
            + state.image_views.len()
            + state.command_pools.len()
            + state.semaphores.len()
            + state.shader_modules.len()
            + state.pipeline_layouts.len()
            + state.pipelines.len()
            + state.bindless_sets.len()
            + state.acceleration_structures.len()
            + state.swapchains.len()
    }
}
impl HeadlessDevice {
    fn synthetic_build_sizes(desc: &GfxAsGeometryDesc<'_>) -> GfxAsPrebuildInfo {
        let primitive_count: u64 = desc.primitive_counts.iter().map(|c| *c as u64).sum();
        if primitive_count == 0 {
            return GfxAsPrebuildInfo::default();
        }
        match desc.ty {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL => GfxAsPrebuildInfo {
                result_size: align_up(primitive_count * 64 + 512, 256),
                scratch_size: align_up(primitive_count * 16 + 128, 256),
                update_scratch_size: align_up(primitive_count * 16, 256),
            },
            _ => GfxAsPrebuildInfo {
                result_size: align_up(primitive_count * 64 + 256, 256),
                scratch_size: align_up(primitive_count * 32 + 128, 256),
                update_scratch_size: align_up(primitive_count * 32, 256),
            },
        }
    }
}

impl GfxDevice for HeadlessDevice {
    fn limits(&self) -> &GfxDeviceLimits {
        &self.limits
    }

    fn set_debug_name_raw(&self, _object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        self.state.borrow_mut().debug_names.insert(raw_handle, name.to_string());
    }

    fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<GfxBufferAllocation> {
        let mut state = self.state.borrow_mut();
        let handle: vk::Buffer = state.new_handle();
        let device_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| state.new_address(desc.size));
        debug_assert!(device_address.is_none_or(|addr| addr % desc.alignment.max(1) == 0));

        let mut memory = desc.mapped.then(|| vec![0u8; desc.size as usize].into_boxed_slice());
        let mapped_ptr = memory.as_mut().map(|m| m.as_mut_ptr());
        state.buffers.insert(
            handle,
            HeadlessBuffer {
                size: desc.size,
                device_address,
                memory,
            },
        );
        state.debug_names.insert(handle.as_raw(), desc.name.to_string());

        Ok(GfxBufferAllocation {
            handle,
            mapped_ptr,
            device_address,
        })
    }

    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let state = self.state.borrow();
        let Some(buffer) = state.buffers.get(&buffer) else {
            return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        if buffer.memory.is_none() || offset + size > buffer.size {
            return Err(GfxError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if self.state.borrow_mut().buffers.remove(&buffer).is_none() {
            log::error!("headless: destroy unknown buffer {:#x}", buffer.as_raw());
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> GfxResult<vk::Image> {
        let mut state = self.state.borrow_mut();
        let handle: vk::Image = state.new_handle();
        state.images.insert(handle, info.extent);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn destroy_image(&self, image: vk::Image) {
        if self.state.borrow_mut().images.remove(&image).is_none() {
            log::error!("headless: destroy unknown image {:#x}", image.as_raw());
        }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>, name: &str) -> GfxResult<vk::ImageView> {
        let mut state = self.state.borrow_mut();
        let is_swapchain_image = state.swapchains.values().any(|s| s.images.contains(&info.image));
        if !state.images.contains_key(&info.image) && !is_swapchain_image {
            return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let handle: vk::ImageView = state.new_handle();
        state.image_views.insert(handle);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.borrow_mut().image_views.remove(&view);
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags, name: &str) -> GfxResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        let handle: vk::CommandPool = state.new_handle();
        state.command_pools.insert(handle);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        for command_buffer in state.command_buffers.values_mut().filter(|c| c.pool == pool) {
            command_buffer.commands.clear();
            command_buffer.recording = false;
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        state.command_pools.remove(&pool);
        state.command_buffers.retain(|_, c| c.pool != pool);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        if !state.command_pools.contains(&pool) {
            return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let handle: vk::CommandBuffer = state.new_handle();
        state.command_buffers.insert(
            handle,
            HeadlessCommandBuffer {
                pool,
                recording: false,
                commands: vec![],
            },
        );
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for cmd in command_buffers {
            state.command_buffers.remove(cmd);
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let command_buffer = state.command_buffers.get_mut(&cmd).ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        // begin 隐式 reset
        command_buffer.commands.clear();
        command_buffer.recording = true;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let command_buffer = state.command_buffers.get_mut(&cmd).ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        command_buffer.recording = false;
        Ok(())
    }

    fn create_semaphore(&self, timeline_initial_value: Option<u64>, name: &str) -> GfxResult<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        let handle: vk::Semaphore = state.new_handle();
        state.semaphores.insert(
            handle,
            HeadlessSemaphore {
                timeline: timeline_initial_value.is_some(),
                completed: timeline_initial_value.unwrap_or_default(),
                pending: vec![],
            },
        );
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.borrow_mut().semaphores.remove(&semaphore);
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        let state = self.state.borrow();
        let sem = state.semaphores.get(&semaphore).ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        Ok(sem.completed)
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, _timeout_ns: u64) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let sem = state.semaphores.get(&semaphore).ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        debug_assert!(sem.timeline);

        let blocked = sem.completed < value;
        if blocked && !sem.pending.iter().any(|v| *v >= value) {
            // 没有任何已提交的工作会 signal 到这个值，真实设备上会一直等到超时
            return Err(GfxError::Timeout { value });
        }
        state.waits.push(HeadlessWait {
            semaphore,
            value,
            blocked,
        });
        if blocked {
            state.complete_semaphore(semaphore, value);
        }
        Ok(())
    }

    fn queue_submit(&self, submits: &[GfxSubmitInfo]) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        for submit in submits {
            let mut commands = vec![];
            for cmd in &submit.command_buffers {
                let command_buffer = state.command_buffers.get(cmd).ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
                if command_buffer.recording {
                    log::error!("headless: submit cmd {:#x} which is still recording", cmd.as_raw());
                }
                commands.extend(command_buffer.commands.iter().cloned());
            }

            let mut signals = vec![];
            for signal in &submit.signal_infos {
                let Some(sem) = state.semaphores.get_mut(&signal.semaphore) else {
                    return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
                };
                if sem.timeline {
                    sem.pending.push(signal.value);
                    signals.push((signal.semaphore, signal.value));
                }
            }

            state.submissions.push(HeadlessSubmission {
                command_buffers: submit.command_buffers.clone(),
                commands,
                signals,
            });
        }

        if self.auto_complete.get() {
            state.complete_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        state.complete_all();
        state.queue_idle_count += 1;
        Ok(())
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        self.state.borrow_mut().complete_all();
        Ok(())
    }

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str, _color: glam::Vec4) {
        self.state.borrow_mut().record(cmd, HeadlessCommand::BeginLabel { name: name.to_string() });
    }

    fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        self.state.borrow_mut().record(cmd, HeadlessCommand::EndLabel);
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        memory_barriers: &[GfxMemoryBarrier],
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    ) {
        self.state.borrow_mut().record(
            cmd,
            HeadlessCommand::PipelineBarrier {
                memory: memory_barriers.to_vec(),
                buffers: buffer_barriers.to_vec(),
                images: image_barriers.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let mut state = self.state.borrow_mut();
        // 两端都映射时直接在 host 内存上完成拷贝
        for region in regions {
            let src_bytes = state
                .buffers
                .get(&src)
                .and_then(|b| b.memory.as_ref())
                .map(|m| m[region.src_offset as usize..(region.src_offset + region.size) as usize].to_vec());
            if let (Some(bytes), Some(dst_memory)) =
                (src_bytes, state.buffers.get_mut(&dst).and_then(|b| b.memory.as_mut()))
            {
                let dst_offset = region.dst_offset as usize;
                dst_memory[dst_offset..dst_offset + bytes.len()].copy_from_slice(&bytes);
            }
        }
        state.record(
            cmd,
            HeadlessCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.state.borrow_mut().record(
            cmd,
            HeadlessCommand::CopyBufferToImage {
                src,
                dst,
                layout: dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        _ranges: &[vk::ImageSubresourceRange],
    ) {
        self.state.borrow_mut().record(cmd, HeadlessCommand::ClearColorImage { image, layout });
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.state.borrow_mut().record(cmd, HeadlessCommand::BlitImage { src, dst, filter });
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.state.borrow_mut().record(cmd, HeadlessCommand::BindPipeline { bind_point, pipeline });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.borrow_mut().record(
            cmd,
            HeadlessCommand::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state.borrow_mut().record(
            cmd,
            HeadlessCommand::PushConstants {
                layout,
                offset,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, group_count: glam::UVec3) {
        self.state.borrow_mut().record(cmd, HeadlessCommand::Dispatch { group_count });
    }

    fn create_shader_module(&self, code: &[u32], name: &str) -> GfxResult<vk::ShaderModule> {
        // SPIR-V magic number
        if code.first() != Some(&0x0723_0203) {
            return Err(GfxError::Vulkan(vk::Result::ERROR_INVALID_SHADER_NV));
        }
        let mut state = self.state.borrow_mut();
        let handle: vk::ShaderModule = state.new_handle();
        state.shader_modules.insert(handle);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.borrow_mut().shader_modules.remove(&module);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
        name: &str,
    ) -> GfxResult<vk::PipelineLayout> {
        let mut state = self.state.borrow_mut();
        let handle: vk::PipelineLayout = state.new_handle();
        state.pipeline_layouts.insert(handle);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.borrow_mut().pipeline_layouts.remove(&layout);
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        _entry_point: &CStr,
        name: &str,
    ) -> GfxResult<vk::Pipeline> {
        let mut state = self.state.borrow_mut();
        if !state.pipeline_layouts.contains(&layout) || !state.shader_modules.contains(&module) {
            return Err(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let handle: vk::Pipeline = state.new_handle();
        state.pipelines.insert(handle);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.borrow_mut().pipelines.remove(&pipeline);
    }

    fn create_bindless_set(
        &self,
        _descriptor_type: vk::DescriptorType,
        capacity: u32,
        name: &str,
    ) -> GfxResult<GfxBindlessSetRaw> {
        let mut state = self.state.borrow_mut();
        let raw = GfxBindlessSetRaw {
            pool: state.new_handle(),
            layout: state.new_handle(),
            set: state.new_handle(),
        };
        state.bindless_sets.insert(raw.set, vec![vk::ImageView::null(); capacity as usize]);
        state.debug_names.insert(raw.set.as_raw(), name.to_string());
        Ok(raw)
    }

    fn destroy_bindless_set(&self, set: &GfxBindlessSetRaw) {
        self.state.borrow_mut().bindless_sets.remove(&set.set);
    }

    fn write_image_descriptor(
        &self,
        set: vk::DescriptorSet,
        _descriptor_type: vk::DescriptorType,
        index: u32,
        view: vk::ImageView,
        _layout: vk::ImageLayout,
    ) {
        let mut state = self.state.borrow_mut();
        match state.bindless_sets.get_mut(&set).and_then(|views| views.get_mut(index as usize)) {
            Some(slot) => *slot = view,
            None => log::error!("headless: write descriptor out of range, set {:#x}, index {}", set.as_raw(), index),
        }
    }

    fn acceleration_structure_build_sizes(&self, desc: &GfxAsGeometryDesc<'_>) -> GfxAsPrebuildInfo {
        Self::synthetic_build_sizes(desc)
    }

    fn create_acceleration_structure(
        &self,
        _ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        name: &str,
    ) -> GfxResult<vk::AccelerationStructureKHR> {
        let mut state = self.state.borrow_mut();
        match state.buffers.get(&buffer) {
            Some(b) if b.size >= size => {}
            _ => return Err(GfxError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)),
        }
        let handle: vk::AccelerationStructureKHR = state.new_handle();
        let address = state.new_address(size);
        state.acceleration_structures.insert(handle, address);
        state.debug_names.insert(handle.as_raw(), name.to_string());
        Ok(handle)
    }

    fn acceleration_structure_address(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        self.state.borrow().acceleration_structures.get(&accel).copied().unwrap_or_default()
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        self.state.borrow_mut().acceleration_structures.remove(&accel);
    }

    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        desc: &GfxAsGeometryDesc<'_>,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        let instance_address = desc
            .geometries
            .iter()
            .find(|g| g.geometry_type == vk::GeometryTypeKHR::INSTANCES)
            .map(|g| unsafe { g.geometry.instances.data.device_address });
        self.state.borrow_mut().record(
            cmd,
            HeadlessCommand::BuildAccelerationStructure {
                ty: desc.ty,
                dst,
                scratch_address,
                primitive_counts: desc.primitive_counts.to_vec(),
                instance_address,
            },
        );
    }

    fn create_swapchain(
        &self,
        desc: &GfxSwapchainDesc,
        _old_swapchain: vk::SwapchainKHR,
    ) -> GfxResult<GfxSwapchainRaw> {
        let mut state = self.state.borrow_mut();
        let handle: vk::SwapchainKHR = state.new_handle();
        let images: Vec<vk::Image> = (0..SWAPCHAIN_IMAGE_COUNT).map(|_| state.new_handle()).collect_vec();
        state.swapchains.insert(
            handle,
            HeadlessSwapchain {
                images: images.clone(),
                next_index: 0,
            },
        );
        self.swapchain_out_of_date.set(false);

        Ok(GfxSwapchainRaw {
            handle,
            images,
            extent: vk::Extent2D {
                width: desc.extent.width.max(1),
                height: desc.extent.height.max(1),
            },
            format: desc.surface_format.format,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.borrow_mut().swapchains.remove(&swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _signal_semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> GfxResult<GfxAcquireResult> {
        if self.swapchain_out_of_date.get() {
            return Ok(GfxAcquireResult::OutOfDate);
        }
        let mut state = self.state.borrow_mut();
        let swapchain = state.swapchains.get_mut(&swapchain).ok_or(GfxError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))?;
        let image_index = swapchain.next_index;
        swapchain.next_index = (swapchain.next_index + 1) % swapchain.images.len();
        Ok(GfxAcquireResult::Acquired {
            image_index: image_index as u32,
            suboptimal: false,
        })
    }

    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, _wait: &[vk::Semaphore]) -> GfxResult<bool> {
        let mut state = self.state.borrow_mut();
        let Some(chain) = state.swapchains.get(&swapchain) else {
            return Err(GfxError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR));
        };
        debug_assert!((image_index as usize) < chain.images.len());
        state.present_count += 1;
        Ok(self.swapchain_out_of_date.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::semaphore::GfxSemaphore;

    #[test]
    fn test_device_addresses_are_aligned_and_distinct() {
        let device = HeadlessDevice::new();
        let desc = |size| GfxBufferDesc {
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            alignment: 256,
            mapped: true,
            name: "buf",
        };
        let a = device.create_buffer(&desc(100)).unwrap();
        let b = device.create_buffer(&desc(300)).unwrap();
        let (a_addr, b_addr) = (a.device_address.unwrap(), b.device_address.unwrap());
        assert_eq!(a_addr % 256, 0);
        assert_eq!(b_addr % 256, 0);
        assert!(b_addr >= a_addr + 100);
        assert!(a.mapped_ptr.is_some());

        device.destroy_buffer(a.handle);
        device.destroy_buffer(b.handle);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_read_device_address_sees_mapped_writes() {
        let device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(&GfxBufferDesc {
                size: 64,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                alignment: 16,
                mapped: true,
                name: "constants",
            })
            .unwrap();
        let address = buffer.device_address.unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), buffer.mapped_ptr.unwrap().add(16), 4) };

        assert_eq!(device.read_device_address(address + 16, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(device.read_device_address(address + 62, 4), None);

        device.destroy_buffer(buffer.handle);
    }

    #[test]
    fn test_timeline_pending_until_waited() {
        let device = HeadlessDevice::new();
        let timeline = GfxSemaphore::new_timeline(&device, 0, "timeline").unwrap();

        device.queue_submit(&[GfxSubmitInfo::default().signal(&timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(1))]).unwrap();
        assert_eq!(timeline.timeline_value(&device).unwrap(), 0);

        timeline.wait_timeline(&device, 1, u64::MAX).unwrap();
        assert_eq!(timeline.timeline_value(&device).unwrap(), 1);
        timeline.wait_timeline(&device, 1, u64::MAX).unwrap();

        let waits = device.wait_log();
        assert_eq!(waits.iter().map(|w| w.blocked).collect_vec(), vec![true, false]);

        // 没有提交会 signal 到 2
        assert!(matches!(timeline.wait_timeline(&device, 2, 0), Err(GfxError::Timeout { value: 2 })));

        timeline.destroy(&device);
    }

    #[test]
    fn test_auto_complete() {
        let device = HeadlessDevice::new().with_auto_complete(true);
        let timeline = GfxSemaphore::new_timeline(&device, 0, "timeline").unwrap();
        device.queue_submit(&[GfxSubmitInfo::default().signal(&timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(5))]).unwrap();
        assert_eq!(timeline.timeline_value(&device).unwrap(), 5);
        timeline.destroy(&device);
    }

    #[test]
    fn test_synthetic_sizes() {
        let desc = GfxAsGeometryDesc {
            ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            geometries: &[],
            primitive_counts: &[2],
        };
        let sizes = HeadlessDevice::synthetic_build_sizes(&desc);
        assert_eq!(sizes.result_size, 512);
        assert_eq!(sizes.scratch_size, 256);

        let empty = GfxAsGeometryDesc {
            ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            primitive_counts: &[0],
            ..desc
        };
        assert_eq!(HeadlessDevice::synthetic_build_sizes(&empty).result_size, 0);
    }
}
