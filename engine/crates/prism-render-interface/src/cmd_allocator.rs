use ash::vk;
use prism_gfx::{
    commands::{command_buffer::GfxCommandBuffer, command_pool::GfxCommandPool},
    device::GfxDevice,
    error::GfxResult,
};

use crate::frame_counter::{FIF_COUNT, FrameLabel};

pub struct CmdAllocator {
    /// 为每个 frame 分配一个 command pool
    command_pools: Vec<GfxCommandPool>,

    /// 每个 command pool 已经分配出去的 command buffer，用于集中 free
    allocated_command_buffers: Vec<Vec<GfxCommandBuffer>>,
}
// init & destroy
impl CmdAllocator {
    pub fn new(device: &dyn GfxDevice) -> GfxResult<Self> {
        let command_pools = (0..FIF_COUNT)
            .map(|i| {
                GfxCommandPool::new(device, vk::CommandPoolCreateFlags::TRANSIENT, &format!("frame-command-pool-{}", i))
            })
            .collect::<GfxResult<Vec<_>>>()?;

        Ok(Self {
            command_pools,
            allocated_command_buffers: vec![Vec::new(); FIF_COUNT],
        })
    }

    pub fn destroy(mut self, device: &dyn GfxDevice) {
        log::info!("destroying CmdAllocator");
        for label in FrameLabel::all() {
            self.free_frame_commands(device, label);
        }
        for pool in self.command_pools.drain(..) {
            pool.destroy(device);
        }
    }
}
// tools
impl CmdAllocator {
    /// 分配 command buffer，只在 frame_label 对应的帧中使用
    pub fn alloc_command_buffer(
        &mut self,
        device: &dyn GfxDevice,
        frame_label: FrameLabel,
        debug_name: &str,
    ) -> GfxResult<GfxCommandBuffer> {
        let cmd = GfxCommandBuffer::new(device, &self.command_pools[*frame_label], debug_name)?;
        self.allocated_command_buffers[*frame_label].push(cmd.clone());
        Ok(cmd)
    }

    /// 调用前需要保证这一帧的命令已经执行完毕
    pub fn free_frame_commands(&mut self, device: &dyn GfxDevice, frame_label: FrameLabel) {
        let gc_cmds = std::mem::take(&mut self.allocated_command_buffers[*frame_label]);
        if !gc_cmds.is_empty() {
            self.command_pools[*frame_label].free_command_buffers(device, gc_cmds);
        }

        // 这个调用并不会释放资源，而是将 pool 内的 command buffer 设置到初始状态
        if let Err(e) = self.command_pools[*frame_label].reset_all_buffers(device) {
            log::error!("failed to reset command pool of frame {}: {}", frame_label, e);
        }
    }

    #[inline]
    pub fn allocated_count(&self, frame_label: FrameLabel) -> usize {
        self.allocated_command_buffers[*frame_label].len()
    }
}
