use ash::vk;

use crate::commands::{command_buffer::GfxCommandBuffer, semaphore::GfxSemaphore};

#[derive(Copy, Clone, Debug)]
pub struct GfxSemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
    /// binary semaphore 时忽略
    pub value: u64,
}

/// 一次 queue submit 的描述，由后端转换为 `vk::SubmitInfo2`
#[derive(Default, Clone, Debug)]
pub struct GfxSubmitInfo {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_infos: Vec<GfxSemaphoreSubmit>,
    pub signal_infos: Vec<GfxSemaphoreSubmit>,
}

impl GfxSubmitInfo {
    pub fn new(commands: &[&GfxCommandBuffer]) -> Self {
        Self {
            command_buffers: commands.iter().map(|cmd| cmd.vk_handle()).collect(),
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    #[inline]
    pub fn wait(mut self, semaphore: &GfxSemaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.wait_infos.push(GfxSemaphoreSubmit {
            semaphore: semaphore.handle(),
            stage,
            value: value.unwrap_or_default(),
        });
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: &GfxSemaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.signal_infos.push(GfxSemaphoreSubmit {
            semaphore: semaphore.handle(),
            stage,
            value: value.unwrap_or_default(),
        });
        self
    }
}
