//! N 帧并行的帧流水线
//!
//! 一个 timeline semaphore 记录单调递增的 fence value，每一帧的提交 signal 一个新值。
//! 复用 slot `i` 之前，只有当 slot `i` 记录的值尚未到达时 CPU 才会阻塞等待。

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use prism_gfx::{
    commands::{command_buffer::GfxCommandBuffer, semaphore::GfxSemaphore, submit_info::GfxSubmitInfo},
    device::{GfxDevice, GfxSwapchainDesc},
    error::GfxResult,
    resources::{image::GfxImage, releasable::GfxReleasable},
    swapchain::render_swapchain::GfxRenderSwapchain,
};

use crate::{
    cmd_allocator::CmdAllocator,
    deferred_release::DeferredReleaseQueue,
    frame_counter::{FIF_COUNT, FrameCounter, FrameLabel},
};

/// 等待 timeline 的超时时间
const FRAME_TIMEOUT_NS: u64 = 30 * 1000 * 1000 * 1000;

/// begin_frame 的结果
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameBegin {
    pub frame_id: u64,
    pub label: FrameLabel,
    /// 这一帧的 slot 仍在被 GPU 使用，CPU 阻塞等待过
    pub waited: bool,
    /// swapchain 需要重建
    pub need_recreate: bool,
}

struct PresentSync {
    swapchain: GfxRenderSwapchain,
    /// 每个 slot 一个，acquire 时 signal
    image_available: Vec<GfxSemaphore>,
    /// 每个 slot 一个，present 时 wait
    render_complete: Vec<GfxSemaphore>,
    /// 当前帧是否成功 acquire 了 image
    acquired: bool,
}
impl PresentSync {
    fn new(device: &dyn GfxDevice, desc: GfxSwapchainDesc) -> GfxResult<Self> {
        Ok(Self {
            swapchain: GfxRenderSwapchain::new(device, desc)?,
            image_available: Self::new_semaphores(device, "image-available")?,
            render_complete: Self::new_semaphores(device, "render-complete")?,
            acquired: false,
        })
    }

    fn new_semaphores(device: &dyn GfxDevice, name: &str) -> GfxResult<Vec<GfxSemaphore>> {
        FrameLabel::all()
            .iter()
            .map(|label| GfxSemaphore::new(device, &format!("{}-{}", name, label)))
            .collect()
    }

    fn destroy(self, device: &dyn GfxDevice) {
        self.image_available.into_iter().chain(self.render_complete).for_each(|s| s.destroy(device));
        self.swapchain.destroy(device);
    }
}

pub struct FramePipeline {
    device: Rc<dyn GfxDevice>,
    counter: FrameCounter,

    timeline: GfxSemaphore,
    /// 每个 slot 最近一次提交 signal 的值，0 表示从未提交
    slot_fence_values: [u64; FIF_COUNT],
    last_signaled: u64,

    cmd_allocator: Option<CmdAllocator>,
    deferred: DeferredReleaseQueue,
    present: Option<PresentSync>,

    in_frame: bool,
    destroyed: bool,
}
// new & init
impl FramePipeline {
    /// swapchain_desc 为 None 时不进行 present
    pub fn new(device: Rc<dyn GfxDevice>, swapchain_desc: Option<GfxSwapchainDesc>) -> GfxResult<Self> {
        let timeline = GfxSemaphore::new_timeline(device.as_ref(), 0, "frame-timeline")?;
        let cmd_allocator = CmdAllocator::new(device.as_ref())?;
        let present = match swapchain_desc {
            Some(desc) => Some(PresentSync::new(device.as_ref(), desc)?),
            None => None,
        };

        Ok(Self {
            device,
            counter: FrameCounter::new(0),
            timeline,
            slot_fence_values: [0; FIF_COUNT],
            last_signaled: 0,
            cmd_allocator: Some(cmd_allocator),
            deferred: DeferredReleaseQueue::new(),
            present,
            in_frame: false,
            destroyed: false,
        })
    }
}
// getters
impl FramePipeline {
    #[inline]
    pub fn device(&self) -> &Rc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.counter.frame_id()
    }

    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        self.counter.frame_label()
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        self.counter.frame_name()
    }

    #[inline]
    pub fn timeline_semaphore(&self) -> &GfxSemaphore {
        &self.timeline
    }

    #[inline]
    pub fn last_signaled_value(&self) -> u64 {
        self.last_signaled
    }

    #[inline]
    pub fn slot_fence_value(&self, label: FrameLabel) -> u64 {
        self.slot_fence_values[*label]
    }

    #[inline]
    pub fn pending_release_count(&self) -> usize {
        self.deferred.len()
    }

    #[inline]
    pub fn swapchain(&self) -> Option<&GfxRenderSwapchain> {
        self.present.as_ref().map(|p| &p.swapchain)
    }

    /// 当前帧 acquire 到的 swapchain image
    #[inline]
    pub fn current_swapchain_image(&self) -> Option<&GfxImage> {
        self.present.as_ref().filter(|p| p.acquired).map(|p| p.swapchain.current_image())
    }

    #[inline]
    pub fn is_in_frame(&self) -> bool {
        self.in_frame
    }
}
// phase call
impl FramePipeline {
    pub fn begin_frame(&mut self) -> GfxResult<FrameBegin> {
        let _span = tracy_client::span!("FramePipeline::begin_frame");
        assert!(!self.in_frame, "begin_frame called twice without end_frame");

        let device = self.device.clone();
        let label = self.counter.frame_label();

        // 等待 fif 的同一帧渲染完成
        let required = self.slot_fence_values[*label];
        let mut waited = false;
        if required > 0 && self.timeline.timeline_value(device.as_ref())? < required {
            let _span = tracy_client::span!("wait fif timeline");
            self.timeline.wait_timeline(device.as_ref(), required, FRAME_TIMEOUT_NS)?;
            waited = true;
        }

        let completed = self.timeline.timeline_value(device.as_ref())?;
        self.deferred.collect(device.as_ref(), completed);
        if let Some(cmd_allocator) = self.cmd_allocator.as_mut() {
            cmd_allocator.free_frame_commands(device.as_ref(), label);
        }

        let mut need_recreate = false;
        if let Some(present) = self.present.as_mut() {
            need_recreate = present.swapchain.acquire_next_image(
                device.as_ref(),
                &present.image_available[*label],
                FRAME_TIMEOUT_NS,
            )?;
            present.acquired = !need_recreate;
        }

        self.in_frame = true;
        Ok(FrameBegin {
            frame_id: self.counter.frame_id(),
            label,
            waited,
            need_recreate,
        })
    }

    /// 分配只在当前帧使用的 command buffer
    pub fn alloc_command_buffer(&mut self, debug_name: &str) -> GfxResult<GfxCommandBuffer> {
        let name = format!("{}{}", self.counter.frame_name(), debug_name);
        let label = self.counter.frame_label();
        match self.cmd_allocator.as_mut() {
            Some(cmd_allocator) => cmd_allocator.alloc_command_buffer(self.device.as_ref(), label, &name),
            None => panic!("FramePipeline is destroyed"),
        }
    }

    /// 提交当前帧，并 signal 新的 fence value
    ///
    /// return: swapchain 需要重建
    pub fn end_frame(&mut self, commands: &[&GfxCommandBuffer]) -> GfxResult<bool> {
        let _span = tracy_client::span!("FramePipeline::end_frame");
        assert!(self.in_frame, "end_frame called without begin_frame");

        let label = self.counter.frame_label();
        let fence_value = self.last_signaled + 1;

        // 设置当前帧结束的 semaphore，用于保护当前帧的资源
        let mut submit_info =
            GfxSubmitInfo::new(commands).signal(&self.timeline, vk::PipelineStageFlags2::ALL_COMMANDS, Some(fence_value));
        let present = self.present.as_ref().filter(|p| p.acquired);
        if let Some(present) = present {
            submit_info = submit_info
                .wait(
                    &present.image_available[*label],
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    None,
                )
                .signal(&present.render_complete[*label], vk::PipelineStageFlags2::ALL_COMMANDS, None);
        }
        self.device.queue_submit(&[submit_info])?;

        self.slot_fence_values[*label] = fence_value;
        self.last_signaled = fence_value;

        let mut need_recreate = false;
        if let Some(present) = present {
            need_recreate = present.swapchain.present_image(self.device.as_ref(), &[&present.render_complete[*label]])?;
        }
        if let Some(present) = self.present.as_mut() {
            present.acquired = false;
        }

        self.counter.next_frame();
        self.in_frame = false;
        tracy_client::frame_mark();
        Ok(need_recreate)
    }

    /// 等待所有已经提交的帧执行完毕，并释放所有可以释放的对象
    pub fn flush_all(&mut self) -> GfxResult<()> {
        let _span = tracy_client::span!("FramePipeline::flush_all");
        if self.last_signaled > 0 {
            self.timeline.wait_timeline(self.device.as_ref(), self.last_signaled, FRAME_TIMEOUT_NS)?;
        }
        self.deferred.collect(self.device.as_ref(), self.last_signaled);
        Ok(())
    }

    /// 窗口大小变化后重建 swapchain
    pub fn resize(&mut self, extent: vk::Extent2D) -> GfxResult<()> {
        assert!(!self.in_frame, "resize must happen between frames");
        self.flush_all()?;

        let device = self.device.clone();
        if let Some(present) = self.present.as_mut() {
            device.device_wait_idle()?;
            present.swapchain.recreate(device.as_ref(), extent)?;

            // acquire 之后未被等待的 semaphore 可能仍处于 signaled 状态，直接重建
            let old = std::mem::replace(
                &mut present.image_available,
                PresentSync::new_semaphores(device.as_ref(), "image-available")?,
            );
            old.into_iter().for_each(|s| s.destroy(device.as_ref()));
        }
        Ok(())
    }

    /// 在当前帧之后提交的 fence value 到达后释放 object
    pub fn defer_release(&mut self, object: Box<dyn GfxReleasable>) {
        self.deferred.push(self.last_signaled + 1, object);
    }

    pub fn destroy(mut self) {
        self.destroy_mut();
    }

    fn destroy_mut(&mut self) {
        let _span = tracy_client::span!("FramePipeline::destroy");
        if let Err(e) = self.flush_all() {
            log::error!("failed to flush frames before destroy: {}", e);
        }

        let device = self.device.clone();
        if let Err(e) = device.device_wait_idle() {
            log::error!("failed to wait device idle: {}", e);
        }
        let released = self.deferred.release_all(device.as_ref());
        log::info!("FramePipeline destroyed after {} frames, {} deferred objects released", self.frame_id(), released);

        if let Some(cmd_allocator) = self.cmd_allocator.take() {
            cmd_allocator.destroy(device.as_ref());
        }
        if let Some(present) = self.present.take() {
            present.destroy(device.as_ref());
        }
        self.timeline.clone().destroy(device.as_ref());
        self.destroyed = true;
    }
}
impl Drop for FramePipeline {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "FramePipeline must be destroyed manually");
        }
    }
}

/// 每个 slot 记录的 fence value，调试用
pub fn describe_slots(pipeline: &FramePipeline) -> String {
    FrameLabel::all().iter().map(|label| format!("{}={}", label, pipeline.slot_fence_value(*label))).join(", ")
}

#[cfg(test)]
mod tests {
    use prism_gfx::{
        backend::headless::HeadlessDevice,
        resources::buffer::GfxBuffer,
    };

    use super::*;

    fn new_pipeline() -> (Rc<HeadlessDevice>, FramePipeline) {
        let device = Rc::new(HeadlessDevice::new());
        let pipeline = FramePipeline::new(device.clone(), None).unwrap();
        (device, pipeline)
    }

    #[test]
    fn test_fence_values_recorded_per_slot() {
        let (_device, mut pipeline) = new_pipeline();
        for _ in 0..3 {
            pipeline.begin_frame().unwrap();
            pipeline.end_frame(&[]).unwrap();
        }
        assert_eq!(pipeline.last_signaled_value(), 3);
        assert_eq!(describe_slots(&pipeline), "A=1, B=2, C=3");
        pipeline.destroy();
    }

    #[test]
    fn test_deferred_release_waits_for_fence() {
        let (device, mut pipeline) = new_pipeline();
        let buffer = GfxBuffer::new(device.as_ref(), 64, vk::BufferUsageFlags::STORAGE_BUFFER, None, false, "old").unwrap();
        let live_before = device.live_object_count();

        pipeline.begin_frame().unwrap();
        pipeline.defer_release(Box::new(buffer));
        pipeline.end_frame(&[]).unwrap();
        assert_eq!(pipeline.pending_release_count(), 1);

        // fence 1 尚未完成
        pipeline.begin_frame().unwrap();
        assert_eq!(pipeline.pending_release_count(), 1);
        pipeline.end_frame(&[]).unwrap();

        pipeline.flush_all().unwrap();
        assert_eq!(pipeline.pending_release_count(), 0);
        assert_eq!(device.live_object_count(), live_before - 1);
        pipeline.destroy();
    }

    #[test]
    fn test_present_with_swapchain() {
        let device = Rc::new(HeadlessDevice::new());
        let desc = GfxSwapchainDesc {
            extent: vk::Extent2D { width: 64, height: 32 },
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::FIFO,
        };
        let mut pipeline = FramePipeline::new(device.clone(), Some(desc)).unwrap();

        let begin = pipeline.begin_frame().unwrap();
        assert!(!begin.need_recreate);
        assert!(pipeline.current_swapchain_image().is_some());
        assert!(!pipeline.end_frame(&[]).unwrap());
        assert_eq!(device.present_count(), 1);

        device.mark_swapchain_out_of_date();
        let begin = pipeline.begin_frame().unwrap();
        assert!(begin.need_recreate);
        assert!(pipeline.current_swapchain_image().is_none());
        pipeline.end_frame(&[]).unwrap();
        assert_eq!(device.present_count(), 1);

        pipeline.resize(vk::Extent2D { width: 128, height: 64 }).unwrap();
        assert_eq!(pipeline.swapchain().map(|s| s.extent().width), Some(128));
        pipeline.destroy();
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    #[should_panic(expected = "end_frame called without begin_frame")]
    fn test_end_without_begin() {
        let (_device, mut pipeline) = new_pipeline();
        let _ = pipeline.end_frame(&[]);
    }
}
