use ash::vk;

use crate::{device::GfxDevice, error::GfxResult};

/// # Destroy
/// 不实现 Drop，因为可以 Clone，需要手动 destroy
#[derive(Clone, Debug)]
pub struct GfxSemaphore {
    semaphore: vk::Semaphore,
    timeline: bool,
}

// new & destroy
impl GfxSemaphore {
    pub fn new(device: &dyn GfxDevice, debug_name: &str) -> GfxResult<Self> {
        let semaphore = device.create_semaphore(None, debug_name)?;
        Ok(Self {
            semaphore,
            timeline: false,
        })
    }

    pub fn new_timeline(device: &dyn GfxDevice, initial_value: u64, debug_name: &str) -> GfxResult<Self> {
        let semaphore = device.create_semaphore(Some(initial_value), debug_name)?;
        Ok(Self {
            semaphore,
            timeline: true,
        })
    }

    #[inline]
    pub fn destroy(self, device: &dyn GfxDevice) {
        device.destroy_semaphore(self.semaphore);
    }
}

// getters
impl GfxSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    #[inline]
    pub fn is_timeline(&self) -> bool {
        self.timeline
    }
}

// tools
impl GfxSemaphore {
    /// timeline semaphore 当前被 GPU signal 到的值
    #[inline]
    pub fn timeline_value(&self, device: &dyn GfxDevice) -> GfxResult<u64> {
        debug_assert!(self.timeline);
        device.semaphore_counter_value(self.semaphore)
    }

    /// 阻塞等待 timeline 到达指定的值
    #[inline]
    pub fn wait_timeline(&self, device: &dyn GfxDevice, timeline_value: u64, timeout_ns: u64) -> GfxResult<()> {
        debug_assert!(self.timeline);
        device.wait_semaphore(self.semaphore, timeline_value, timeout_ns)
    }
}
