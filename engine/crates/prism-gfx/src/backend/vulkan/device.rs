use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::{CStr, CString},
};

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::{
    backend::vulkan::{debug_messenger::GfxDebugMsger, instance::GfxInstance, physical_device::GfxPhysicalDevice},
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
    swapchain::render_swapchain::calculate_swapchain_extent,
};

struct GfxSurface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

struct BufferAllocation {
    allocation: vk_mem::Allocation,
    mapped: bool,
}

/// Vulkan 设备
///
/// 只使用一个全能 queue。内存通过 VMA 分配，allocation 以 handle 为 key 保存在设备内部，
/// 上层的资源对象只持有 handle。
///
/// # 扩展支持
/// - Acceleration Structure (KHR)
/// - Debug Utils (EXT)
/// - Swapchain (KHR)，只在有窗口时开启
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: Option<GfxInstance>,
    debug_msger: Option<GfxDebugMsger>,
    physical_device: GfxPhysicalDevice,
    surface: Option<GfxSurface>,

    device: ash::Device,
    acceleration_structure: ash::khr::acceleration_structure::Device,
    debug_utils: ash::ext::debug_utils::Device,
    swapchain: Option<ash::khr::swapchain::Device>,
    queue: vk::Queue,

    /// 需要在 device 之前销毁
    allocator: Option<vk_mem::Allocator>,
    buffer_allocations: RefCell<HashMap<vk::Buffer, BufferAllocation>>,
    image_allocations: RefCell<HashMap<vk::Image, vk_mem::Allocation>>,

    limits: GfxDeviceLimits,
}
// 构造与销毁
impl VulkanDevice {
    /// window: 需要 present 时传入窗口的 handle
    pub fn new(
        app_name: &str,
        window: Option<(raw_window_handle::RawDisplayHandle, raw_window_handle::RawWindowHandle)>,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanDevice::new");

        let entry = unsafe { ash::Entry::load()? };

        let surface_exts = match window {
            Some((display, _)) => ash_window::enumerate_required_extensions(display)?.to_vec(),
            None => vec![],
        };
        let instance = GfxInstance::new(&entry, app_name, &surface_exts)?;
        let debug_msger = GfxDebugMsger::new(&entry, &instance.ash_instance)?;

        let surface = match window {
            Some((display, window)) => {
                let handle =
                    unsafe { ash_window::create_surface(&entry, &instance.ash_instance, display, window, None)? };
                Some(GfxSurface {
                    handle,
                    loader: ash::khr::surface::Instance::new(&entry, &instance.ash_instance),
                })
            }
            None => None,
        };

        let device_exts = Self::basic_device_exts(surface.is_some());
        let physical_device = GfxPhysicalDevice::select(
            &instance.ash_instance,
            surface.as_ref().map(|s| (&s.loader, s.handle)),
            &device_exts,
        )?;
        log::info!("select gpu: {}", physical_device.device_name());

        let device = Self::create_device(&instance.ash_instance, &physical_device, &device_exts)?;
        let queue = unsafe { device.get_device_queue(physical_device.queue_family_index, 0) };

        let mut vma_ci =
            vk_mem::AllocatorCreateInfo::new(&instance.ash_instance, &device, physical_device.vk_handle);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let allocator = unsafe { vk_mem::Allocator::new(vma_ci)? };

        let limits = GfxDeviceLimits {
            device_name: physical_device.device_name(),
            min_storage_buffer_offset_alignment: physical_device.basic_props.limits.min_storage_buffer_offset_alignment,
            min_as_scratch_offset_alignment: physical_device.acc_struct_props.min_acceleration_structure_scratch_offset_alignment
                as vk::DeviceSize,
            max_push_constants_size: physical_device.basic_props.limits.max_push_constants_size,
        };

        Ok(Self {
            acceleration_structure: ash::khr::acceleration_structure::Device::new(&instance.ash_instance, &device),
            debug_utils: ash::ext::debug_utils::Device::new(&instance.ash_instance, &device),
            swapchain: surface.as_ref().map(|_| ash::khr::swapchain::Device::new(&instance.ash_instance, &device)),
            _entry: entry,
            instance: Some(instance),
            debug_msger: Some(debug_msger),
            physical_device,
            surface,
            device,
            queue,
            allocator: Some(allocator),
            buffer_allocations: RefCell::new(HashMap::new()),
            image_allocations: RefCell::new(HashMap::new()),
            limits,
        })
    }

    fn create_device(
        instance: &ash::Instance,
        physical_device: &GfxPhysicalDevice,
        device_exts: &[&CStr],
    ) -> GfxResult<ash::Device> {
        let device_exts_ptr = device_exts.iter().map(|e| e.as_ptr()).collect_vec();
        log::info!("device exts: {}", device_exts.iter().map(|e| format!("\n\t{:?}", e)).join(""));

        let queue_priorities = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical_device.queue_family_index)
            .queue_priorities(&queue_priorities)];

        // device 所需的所有 features
        let mut features_12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true) // 即使一些 descriptor 是 invalid
            .runtime_descriptor_array(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true);
        let mut features_13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut acc_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut all_features = vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default().shader_int64(true)) // 用于 buffer device address
            .push_next(&mut features_12)
            .push_next(&mut features_13)
            .push_next(&mut acc_features);

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_exts_ptr)
            .push_next(&mut all_features);

        Ok(unsafe { instance.create_device(physical_device.vk_handle, &device_ci, None)? })
    }

    /// 必要的 device extensions
    fn basic_device_exts(with_swapchain: bool) -> Vec<&'static CStr> {
        let mut exts = vec![
            ash::khr::acceleration_structure::NAME,
            // acceleration structure 依赖
            ash::khr::deferred_host_operations::NAME,
        ];
        if with_swapchain {
            exts.push(ash::khr::swapchain::NAME);
        }
        exts
    }

    #[inline]
    fn allocator(&self) -> &vk_mem::Allocator {
        // 只有在 Drop 中才会被取走
        self.allocator.as_ref().unwrap_or_else(|| unreachable!("allocator is taken"))
    }

    #[inline]
    fn swapchain_loader(&self) -> GfxResult<&ash::khr::swapchain::Device> {
        self.swapchain.as_ref().ok_or(GfxError::NoSurface)
    }
}
impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("destroying vulkan device");
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        let leaked_buffers = self.buffer_allocations.borrow().len();
        let leaked_images = self.image_allocations.borrow().len();
        if leaked_buffers + leaked_images > 0 {
            log::warn!("vulkan device destroyed with {} buffers and {} images alive", leaked_buffers, leaked_images);
        }

        // 销毁顺序：allocator -> device -> surface -> debug messenger -> instance
        drop(self.allocator.take());
        unsafe {
            self.device.destroy_device(None);
        }
        if let Some(surface) = self.surface.take() {
            unsafe {
                surface.loader.destroy_surface(surface.handle, None);
            }
        }
        if let Some(debug_msger) = self.debug_msger.take() {
            debug_msger.destroy();
        }
        if let Some(instance) = self.instance.take() {
            instance.destroy();
        }
    }
}

impl GfxDevice for VulkanDevice {
    fn limits(&self) -> &GfxDeviceLimits {
        &self.limits
    }

    fn set_debug_name_raw(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: raw_handle,
            ..Default::default()
        }
        .object_name(name.as_c_str());
        if let Err(e) = unsafe { self.debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    fn create_buffer(&self, desc: &GfxBufferDesc<'_>) -> GfxResult<GfxBufferAllocation> {
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size).usage(desc.usage);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: if desc.mapped {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let allocator = self.allocator();
        let (buffer, mut allocation) =
            unsafe { allocator.create_buffer_with_alignment(&buffer_ci, &alloc_ci, desc.alignment)? };

        let mapped_ptr = if desc.mapped {
            match unsafe { allocator.map_memory(&mut allocation) } {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    unsafe { allocator.destroy_buffer(buffer, &mut allocation) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let device_address = desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            self.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        });

        self.buffer_allocations.borrow_mut().insert(
            buffer,
            BufferAllocation {
                allocation,
                mapped: desc.mapped,
            },
        );
        self.set_debug_name_raw(vk::ObjectType::BUFFER, vk::Handle::as_raw(buffer), &format!("Buffer::{}", desc.name));

        Ok(GfxBufferAllocation {
            handle: buffer,
            mapped_ptr,
            device_address,
        })
    }

    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let allocations = self.buffer_allocations.borrow();
        let allocation = allocations.get(&buffer).ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        self.allocator().flush_allocation(&allocation.allocation, offset, size)?;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(mut allocation) = self.buffer_allocations.borrow_mut().remove(&buffer) else {
            log::error!("destroy unknown buffer {:?}", buffer);
            return;
        };
        let allocator = self.allocator();
        unsafe {
            if allocation.mapped {
                allocator.unmap_memory(&mut allocation.allocation);
            }
            allocator.destroy_buffer(buffer, &mut allocation.allocation);
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>, name: &str) -> GfxResult<vk::Image> {
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, allocation) = unsafe { self.allocator().create_image(info, &alloc_ci)? };
        self.image_allocations.borrow_mut().insert(image, allocation);
        self.set_debug_name_raw(vk::ObjectType::IMAGE, vk::Handle::as_raw(image), &format!("Image::{}", name));
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let Some(mut allocation) = self.image_allocations.borrow_mut().remove(&image) else {
            log::error!("destroy unknown image {:?}", image);
            return;
        };
        unsafe { self.allocator().destroy_image(image, &mut allocation) };
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>, name: &str) -> GfxResult<vk::ImageView> {
        let view = unsafe { self.device.create_image_view(info, None)? };
        self.set_debug_name_raw(vk::ObjectType::IMAGE_VIEW, vk::Handle::as_raw(view), &format!("ImageView::{}", name));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags, name: &str) -> GfxResult<vk::CommandPool> {
        let pool = unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(self.physical_device.queue_family_index)
                    .flags(flags),
                None,
            )?
        };
        self.set_debug_name_raw(vk::ObjectType::COMMAND_POOL, vk::Handle::as_raw(pool), name);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)? };
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&info)? }[0];
        self.set_debug_name_raw(vk::ObjectType::COMMAND_BUFFER, vk::Handle::as_raw(cmd), name);
        Ok(cmd)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe { self.device.free_command_buffers(pool, command_buffers) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> GfxResult<()> {
        unsafe { self.device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default().flags(flags))? };
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn create_semaphore(&self, timeline_initial_value: Option<u64>, name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = match timeline_initial_value {
            Some(initial_value) => {
                let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                unsafe {
                    self.device
                        .create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci), None)?
                }
            }
            None => unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? },
        };
        self.set_debug_name_raw(vk::ObjectType::SEMAPHORE, vk::Handle::as_raw(semaphore), name);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<()> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GfxError::Timeout { value }),
            Err(e) => Err(e.into()),
        }
    }

    fn queue_submit(&self, submits: &[GfxSubmitInfo]) -> GfxResult<()> {
        let _span = tracy_client::span!("queue_submit");

        let to_semaphore_infos = |infos: &[crate::commands::submit_info::GfxSemaphoreSubmit]| {
            infos
                .iter()
                .map(|info| {
                    vk::SemaphoreSubmitInfo::default().semaphore(info.semaphore).stage_mask(info.stage).value(info.value)
                })
                .collect_vec()
        };
        let command_buffer_infos = submits
            .iter()
            .map(|s| {
                s.command_buffers.iter().map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd)).collect_vec()
            })
            .collect_vec();
        let wait_infos = submits.iter().map(|s| to_semaphore_infos(&s.wait_infos)).collect_vec();
        let signal_infos = submits.iter().map(|s| to_semaphore_infos(&s.signal_infos)).collect_vec();

        let submit_infos = (0..submits.len())
            .map(|i| {
                vk::SubmitInfo2::default()
                    .command_buffer_infos(&command_buffer_infos[i])
                    .wait_semaphore_infos(&wait_infos[i])
                    .signal_semaphore_infos(&signal_infos[i])
            })
            .collect_vec();

        unsafe { self.device.queue_submit2(self.queue, &submit_infos, vk::Fence::null())? };
        Ok(())
    }

    fn queue_wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.queue_wait_idle(self.queue)? };
        Ok(())
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str, color: glam::Vec4) {
        let Ok(name) = CString::new(name) else {
            return;
        };
        unsafe {
            self.debug_utils.cmd_begin_debug_utils_label(
                cmd,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(color.into()),
            );
        }
    }

    fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        unsafe { self.debug_utils.cmd_end_debug_utils_label(cmd) };
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        memory_barriers: &[GfxMemoryBarrier],
        buffer_barriers: &[GfxBufferBarrier],
        image_barriers: &[GfxImageBarrier],
    ) {
        let memory_barriers = memory_barriers.iter().map(|b| *b.inner()).collect_vec();
        let buffer_barriers = buffer_barriers.iter().map(|b| *b.inner()).collect_vec();
        let image_barriers = image_barriers.iter().map(|b| *b.inner()).collect_vec();
        let dependency_info = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(cmd, src, dst, dst_layout, regions) };
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe { self.device.cmd_clear_color_image(cmd, image, layout, color, ranges) };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe { self.device.cmd_blit_image(cmd, src, src_layout, dst, dst_layout, regions, filter) };
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe { self.device.cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, sets, &[]) };
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe { self.device.cmd_push_constants(cmd, layout, stages, offset, data) };
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, group_count: glam::UVec3) {
        unsafe { self.device.cmd_dispatch(cmd, group_count.x, group_count.y, group_count.z) };
    }

    fn create_shader_module(&self, code: &[u32], name: &str) -> GfxResult<vk::ShaderModule> {
        let module = unsafe { self.device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)? };
        self.set_debug_name_raw(vk::ObjectType::SHADER_MODULE, vk::Handle::as_raw(module), name);
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
        name: &str,
    ) -> GfxResult<vk::PipelineLayout> {
        let layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_ci, None)? };
        self.set_debug_name_raw(vk::ObjectType::PIPELINE_LAYOUT, vk::Handle::as_raw(layout), name);
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
        entry_point: &CStr,
        name: &str,
    ) -> GfxResult<vk::Pipeline> {
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point);
        let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage_info).layout(layout);
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
                .map_err(|(_, e)| e)?
        };
        let pipeline = pipelines[0];
        self.set_debug_name_raw(vk::ObjectType::PIPELINE, vk::Handle::as_raw(pipeline), name);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_bindless_set(
        &self,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
        name: &str,
    ) -> GfxResult<GfxBindlessSetRaw> {
        // 单个 binding，数组长度即为容量；允许部分绑定以及绑定后更新
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(descriptor_type)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_ci);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_ci, None)? };

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: descriptor_type,
            descriptor_count: capacity,
        }];
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { self.device.create_descriptor_pool(&pool_ci, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&set_layouts);
        let set = match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    self.device.destroy_descriptor_pool(pool, None);
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e.into());
            }
        };

        self.set_debug_name_raw(vk::ObjectType::DESCRIPTOR_SET, vk::Handle::as_raw(set), name);
        self.set_debug_name_raw(vk::ObjectType::DESCRIPTOR_SET_LAYOUT, vk::Handle::as_raw(layout), name);
        Ok(GfxBindlessSetRaw { pool, layout, set })
    }

    fn destroy_bindless_set(&self, set: &GfxBindlessSetRaw) {
        unsafe {
            // set 跟随 pool 一起释放
            self.device.destroy_descriptor_pool(set.pool, None);
            self.device.destroy_descriptor_set_layout(set.layout, None);
        }
    }

    fn write_image_descriptor(
        &self,
        set: vk::DescriptorSet,
        descriptor_type: vk::DescriptorType,
        index: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) {
        let image_infos = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: layout,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(index)
            .descriptor_type(descriptor_type)
            .image_info(&image_infos);
        unsafe { self.device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
    }

    fn acceleration_structure_build_sizes(&self, desc: &GfxAsGeometryDesc<'_>) -> GfxAsPrebuildInfo {
        let build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(desc.ty)
            .flags(desc.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(desc.geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_geometry_info,
                desc.primitive_counts,
                &mut size_info,
            );
        }

        GfxAsPrebuildInfo {
            result_size: size_info.acceleration_structure_size,
            scratch_size: size_info.build_scratch_size,
            update_scratch_size: size_info.update_scratch_size,
        }
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        name: &str,
    ) -> GfxResult<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default().ty(ty).size(size).buffer(buffer);
        let accel = unsafe { self.acceleration_structure.create_acceleration_structure(&create_info, None)? };
        self.set_debug_name_raw(vk::ObjectType::ACCELERATION_STRUCTURE_KHR, vk::Handle::as_raw(accel), name);
        Ok(accel)
    }

    fn acceleration_structure_address(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        unsafe {
            self.acceleration_structure.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel),
            )
        }
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        unsafe { self.acceleration_structure.destroy_acceleration_structure(accel, None) };
    }

    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        desc: &GfxAsGeometryDesc<'_>,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        let build_geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(desc.ty)
            .flags(desc.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(desc.geometries)
            .dst_acceleration_structure(dst)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        let range_infos = desc
            .primitive_counts
            .iter()
            .map(|count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(*count))
            .collect_vec();

        unsafe {
            self.acceleration_structure.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_geometry_info),
                &[&range_infos],
            );
        }
    }

    fn create_swapchain(&self, desc: &GfxSwapchainDesc, old_swapchain: vk::SwapchainKHR) -> GfxResult<GfxSwapchainRaw> {
        let surface = self.surface.as_ref().ok_or(GfxError::NoSurface)?;
        let loader = self.swapchain_loader()?;
        let surface_capabilities = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(self.physical_device.vk_handle, surface.handle)?
        };
        let extent = calculate_swapchain_extent(&surface_capabilities, desc.extent);

        // max_image_count == 0，表示不限制 image 数量
        let image_count = if surface_capabilities.max_image_count == 0 {
            surface_capabilities.min_image_count + 1
        } else {
            u32::min(surface_capabilities.max_image_count, surface_capabilities.min_image_count + 1)
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            // TRANSFER_DST 用于 blit 到 swapchain
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { loader.create_swapchain(&create_info, None)? };
        let images = unsafe { loader.get_swapchain_images(handle)? };
        self.set_debug_name_raw(vk::ObjectType::SWAPCHAIN_KHR, vk::Handle::as_raw(handle), "main");

        Ok(GfxSwapchainRaw {
            handle,
            images,
            extent,
            format: desc.surface_format.format,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = &self.swapchain {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal_semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> GfxResult<GfxAcquireResult> {
        let loader = self.swapchain_loader()?;
        match unsafe { loader.acquire_next_image(swapchain, timeout_ns, signal_semaphore, vk::Fence::null()) } {
            Ok((image_index, suboptimal)) => Ok(GfxAcquireResult::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(GfxAcquireResult::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: &[vk::Semaphore]) -> GfxResult<bool> {
        let loader = self.swapchain_loader()?;
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait)
            .image_indices(&image_indices)
            .swapchains(std::slice::from_ref(&swapchain));

        match unsafe { loader.queue_present(self.queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
