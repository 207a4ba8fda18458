use std::collections::VecDeque;

use prism_gfx::{device::GfxDevice, resources::releasable::GfxReleasable};

/// 延迟释放队列
///
/// 每个对象记录一个 fence value：只有 timeline 到达这个值之后，GPU 才不会再使用它。
/// 入队的 fence value 单调不减，因此只需要检查队首。
#[derive(Default)]
pub struct DeferredReleaseQueue {
    /// (fence value, object)
    pending: VecDeque<(u64, Box<dyn GfxReleasable>)>,
}
impl DeferredReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fence_value: u64, object: Box<dyn GfxReleasable>) {
        debug_assert!(
            self.pending.back().is_none_or(|(last, _)| *last <= fence_value),
            "fence value must be monotonic"
        );
        log::debug!("defer release {} until fence {}", object.release_name(), fence_value);
        self.pending.push_back((fence_value, object));
    }

    /// 释放所有 fence value <= completed_value 的对象
    ///
    /// return: 释放的数量
    pub fn collect(&mut self, device: &dyn GfxDevice, completed_value: u64) -> usize {
        let _span = tracy_client::span!("DeferredReleaseQueue::collect");

        let mut released = 0;
        while self.pending.front().is_some_and(|(value, _)| *value <= completed_value) {
            if let Some((_, object)) = self.pending.pop_front() {
                object.release(device);
                released += 1;
            }
        }
        released
    }

    /// 调用前需要保证 GPU 已经空闲
    pub fn release_all(&mut self, device: &dyn GfxDevice) -> usize {
        let count = self.pending.len();
        for (_, object) in self.pending.drain(..) {
            object.release(device);
        }
        count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
impl Drop for DeferredReleaseQueue {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!("DeferredReleaseQueue dropped with {} pending objects", self.pending.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use prism_gfx::{backend::headless::HeadlessDevice, resources::buffer::GfxBuffer};

    use super::*;

    fn new_buffer(device: &HeadlessDevice, name: &str) -> Box<GfxBuffer> {
        Box::new(GfxBuffer::new(device, 64, vk::BufferUsageFlags::STORAGE_BUFFER, None, false, name).unwrap())
    }

    #[test]
    fn test_collect_releases_only_completed() {
        let device = HeadlessDevice::new();
        let mut queue = DeferredReleaseQueue::new();
        queue.push(1, new_buffer(&device, "a"));
        queue.push(2, new_buffer(&device, "b"));
        queue.push(4, new_buffer(&device, "c"));
        assert_eq!(device.live_object_count(), 3);

        assert_eq!(queue.collect(&device, 0), 0);
        assert_eq!(queue.collect(&device, 2), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(device.live_object_count(), 1);

        assert_eq!(queue.release_all(&device), 1);
        assert!(queue.is_empty());
        assert_eq!(device.live_object_count(), 0);
    }
}
