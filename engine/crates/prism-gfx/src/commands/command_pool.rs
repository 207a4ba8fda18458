use ash::vk;

use crate::{commands::command_buffer::GfxCommandBuffer, device::GfxDevice, error::GfxResult};

/// command pool 是和 queue family 绑定的，而不是和 queue 绑定的
///
/// 本引擎只使用一个全能 queue，因此不再记录 queue family
pub struct GfxCommandPool {
    handle: vk::CommandPool,
    debug_name: String,
}
// init & destroy
impl GfxCommandPool {
    pub fn new(device: &dyn GfxDevice, flags: vk::CommandPoolCreateFlags, debug_name: &str) -> GfxResult<Self> {
        let handle = device.create_command_pool(flags, debug_name)?;
        Ok(Self {
            handle,
            debug_name: debug_name.to_string(),
        })
    }

    pub fn destroy(mut self, device: &dyn GfxDevice) {
        device.destroy_command_pool(self.handle);
        self.handle = vk::CommandPool::null();
    }
}
// getters
impl GfxCommandPool {
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }
}
// tools
impl GfxCommandPool {
    /// 这个调用并不会释放资源，而是将 pool 内的 command buffer 设置到初始状态
    ///
    /// reset 之后，pool 内的 command buffer 又可以重新录制命令
    pub fn reset_all_buffers(&self, device: &dyn GfxDevice) -> GfxResult<()> {
        device.reset_command_pool(self.handle)
    }

    /// 释放 command buffer
    ///
    /// 释放之后，command buffer 不能再被使用
    pub fn free_command_buffers(&self, device: &dyn GfxDevice, command_buffers: Vec<GfxCommandBuffer>) {
        let handles: Vec<vk::CommandBuffer> = command_buffers.iter().map(|cmd| cmd.vk_handle()).collect();
        device.free_command_buffers(self.handle, &handles);
    }
}

impl Drop for GfxCommandPool {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.handle == vk::CommandPool::null(), "CommandPool must be destroyed manually.");
        }
        log::debug!("Dropping CommandPool: {}", self.debug_name);
    }
}
