use std::ptr;

use ash::vk;

use crate::{
    device::{GfxBufferDesc, GfxDevice},
    error::GfxResult,
};

/// buffer 封装，内存由后端持有
///
/// # Destroy
/// 需要通过 [`GfxBuffer::destroy`] 手动销毁；仍可能被 GPU 使用时应交给 deferred release
pub struct GfxBuffer {
    handle: vk::Buffer,

    size: vk::DeviceSize,

    /// 在初始化阶段写死
    map_ptr: Option<*mut u8>,
    /// 只有在 buffer usage 包含 SHADER_DEVICE_ADDRESS 时才有值
    device_addr: Option<vk::DeviceAddress>,

    usage: vk::BufferUsageFlags,

    debug_name: String,
}
// init & destroy
impl GfxBuffer {
    /// - align: buffer 起始地址的对齐，默认对齐到 8 字节
    /// - mem_map: 是否持久映射，映射在整个生命周期内有效
    pub fn new(
        device: &dyn GfxDevice,
        buffer_size: vk::DeviceSize,
        buffer_usage: vk::BufferUsageFlags,
        align: Option<vk::DeviceSize>,
        mem_map: bool,
        name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        // 不允许 UNIFORM + DBA 的组合，会有隐患
        if buffer_usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
            && buffer_usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            panic!("GfxBuffer::new: UNIFORM_BUFFER + SHADER_DEVICE_ADDRESS is not allowed!");
        }
        assert!(buffer_size > 0, "GfxBuffer::new: buffer {} has zero size", name.as_ref());

        let allocation = device.create_buffer(&GfxBufferDesc {
            size: buffer_size,
            usage: buffer_usage,
            alignment: align.unwrap_or(8),
            mapped: mem_map,
            name: name.as_ref(),
        })?;

        Ok(Self {
            handle: allocation.handle,
            size: buffer_size,
            map_ptr: allocation.mapped_ptr,
            device_addr: allocation.device_address,
            usage: buffer_usage,
            debug_name: name.as_ref().to_string(),
        })
    }

    #[inline]
    pub fn new_stage_buffer(
        device: &dyn GfxDevice,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(device, size, vk::BufferUsageFlags::TRANSFER_SRC, None, true, debug_name)
    }

    /// CPU 写、GPU 通过 device address 读取的 buffer
    #[inline]
    pub fn new_upload_buffer(
        device: &dyn GfxDevice,
        size: vk::DeviceSize,
        extra_usage: vk::BufferUsageFlags,
        align: Option<vk::DeviceSize>,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(
            device,
            size,
            extra_usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            align,
            true,
            debug_name,
        )
    }

    /// 用于存放加速结构本体的 buffer
    #[inline]
    pub fn new_acceleration_buffer(
        device: &dyn GfxDevice,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(
            device,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Some(256),
            false,
            debug_name,
        )
    }

    /// 加速结构构建时使用的 scratch buffer
    #[inline]
    pub fn new_scratch_buffer(
        device: &dyn GfxDevice,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let align = device.limits().min_as_scratch_offset_alignment;
        Self::new(
            device,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Some(align),
            false,
            debug_name,
        )
    }

    /// 作为加速结构构建输入的只读数据（instance / aabb / vertex / index）
    #[inline]
    pub fn new_build_input_buffer(
        device: &dyn GfxDevice,
        size: vk::DeviceSize,
        extra_usage: vk::BufferUsageFlags,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(
            device,
            size,
            extra_usage
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            Some(16),
            true,
            debug_name,
        )
    }

    pub fn destroy(mut self, device: &dyn GfxDevice) {
        log::debug!("Destroying GfxBuffer: {}", self.debug_name);
        device.destroy_buffer(self.handle);
        self.handle = vk::Buffer::null();
        self.map_ptr = None;
    }
}
impl Drop for GfxBuffer {
    fn drop(&mut self) {
        if self.handle != vk::Buffer::null() {
            log::warn!("GfxBuffer {} is dropped without destroy, memory leaks", self.debug_name);
        }
    }
}
// getter
impl GfxBuffer {
    #[inline]
    pub fn vk_buffer(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        match self.device_addr {
            Some(addr) => addr,
            None => panic!(
                "Buffer {} does not have device address, please make sure the buffer usage contains SHADER_DEVICE_ADDRESS",
                self.debug_name
            ),
        }
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map_ptr.is_some()
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}
// tools
impl GfxBuffer {
    #[inline]
    pub fn mapped_ptr(&self) -> *mut u8 {
        match self.map_ptr {
            Some(ptr) => ptr,
            None => panic!("Buffer {} is not mapped", self.debug_name),
        }
    }

    /// 映射区域的只读视图
    #[inline]
    pub fn mapped_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mapped_ptr(), self.size as usize) }
    }

    #[inline]
    pub fn flush(&self, device: &dyn GfxDevice, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        device.flush_buffer(self.handle, offset, size)
    }

    /// 通过 mem map 的方式将 data 传入到 buffer 的起始位置
    pub fn transfer_data_by_mmap<T>(&self, device: &dyn GfxDevice, data: &[T]) -> GfxResult<()>
    where
        T: Sized + Copy,
    {
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, size_of_val(data)) };
        self.write_bytes(device, 0, bytes)
    }

    /// 将 bytes 写入映射区域的 offset 处，并 flush 这段范围
    pub fn write_bytes(&self, device: &dyn GfxDevice, offset: vk::DeviceSize, bytes: &[u8]) -> GfxResult<()> {
        assert!(
            offset + bytes.len() as vk::DeviceSize <= self.size,
            "GfxBuffer::write_bytes: {} out of range, offset {} + len {} > size {}",
            self.debug_name,
            offset,
            bytes.len(),
            self.size
        );
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped_ptr().add(offset as usize), bytes.len());
        }
        self.flush(device, offset, bytes.len() as vk::DeviceSize)
    }
}
