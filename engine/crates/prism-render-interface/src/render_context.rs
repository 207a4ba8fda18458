//! 显式传递的渲染上下文
//!
//! 持有一帧渲染所需的所有 manager，通过 [`FrameContext`] 借给场景代码。

use std::{path::Path, path::PathBuf, rc::Rc};

use ash::vk;
use prism_gfx::{
    commands::command_buffer::GfxCommandBuffer,
    device::{GfxDevice, GfxSwapchainDesc},
    error::GfxResult,
};

use crate::{
    descriptor_allocator::{DescriptorAllocator, DescriptorCapacities},
    frame_counter::FrameLabel,
    frame_pipeline::{FrameBegin, FramePipeline},
    pipeline_cache::PipelineCache,
    texture_manager::TextureManager,
};

pub struct RenderContextDesc {
    pub descriptor_capacities: DescriptorCapacities,
    pub shader_build_dir: PathBuf,
    /// 没有窗口时为 None，此时使用 `render_extent`
    pub swapchain: Option<GfxSwapchainDesc>,
    pub render_extent: vk::Extent2D,
}

/// 一帧内借给场景的上下文
pub struct FrameContext<'a> {
    pub device: &'a dyn GfxDevice,
    pub cmd: &'a GfxCommandBuffer,
    pub frame_label: FrameLabel,
    pub frame_id: u64,
    pub extent: vk::Extent2D,

    pub frame_pipeline: &'a mut FramePipeline,
    pub descriptors: &'a mut DescriptorAllocator,
    pub textures: &'a mut TextureManager,
    pub pipelines: &'a mut PipelineCache,
}

pub struct RenderContext {
    device: Rc<dyn GfxDevice>,

    frame_pipeline: FramePipeline,
    descriptors: DescriptorAllocator,
    textures: TextureManager,
    pipelines: PipelineCache,

    render_extent: vk::Extent2D,
    /// 当前帧的 command buffer，只在 begin_frame 和 end_frame 之间有值
    frame_cmd: Option<GfxCommandBuffer>,
    frame_begin: Option<FrameBegin>,
}
// new & init
impl RenderContext {
    pub fn new(device: Rc<dyn GfxDevice>, desc: RenderContextDesc) -> GfxResult<Self> {
        let _span = tracy_client::span!("RenderContext::new");

        let render_extent = desc.swapchain.as_ref().map_or(desc.render_extent, |s| s.extent);
        let frame_pipeline = FramePipeline::new(device.clone(), desc.swapchain)?;
        let mut descriptors = DescriptorAllocator::new(device.clone(), desc.descriptor_capacities)?;
        let textures = TextureManager::new(device.clone(), &mut descriptors)?;
        let pipelines = PipelineCache::new(device.clone(), desc.shader_build_dir, descriptors.bindless_layouts());

        log::info!("render context created, extent {}x{}", render_extent.width, render_extent.height);
        Ok(Self {
            device,
            frame_pipeline,
            descriptors,
            textures,
            pipelines,
            render_extent,
            frame_cmd: None,
            frame_begin: None,
        })
    }

    /// 销毁顺序：等待 GPU -> 纹理延迟释放 -> pipeline -> 帧流水线 -> 描述符堆
    pub fn destroy(mut self) {
        let _span = tracy_client::span!("RenderContext::destroy");
        if self.frame_cmd.is_some() {
            log::warn!("RenderContext destroyed inside a frame, the frame is discarded");
        }
        if let Err(e) = self.frame_pipeline.flush_all() {
            log::error!("failed to flush frames: {}", e);
        }

        self.textures.destroy(&mut self.frame_pipeline);
        self.pipelines.destroy();
        self.frame_pipeline.destroy();
        self.descriptors.destroy();
    }
}
// getters
impl RenderContext {
    #[inline]
    pub fn device(&self) -> &Rc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn frame_pipeline(&self) -> &FramePipeline {
        &self.frame_pipeline
    }

    #[inline]
    pub fn frame_pipeline_mut(&mut self) -> &mut FramePipeline {
        &mut self.frame_pipeline
    }

    #[inline]
    pub fn descriptors(&self) -> &DescriptorAllocator {
        &self.descriptors
    }

    #[inline]
    pub fn textures(&self) -> &TextureManager {
        &self.textures
    }

    #[inline]
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    #[inline]
    pub fn render_extent(&self) -> vk::Extent2D {
        self.render_extent
    }

    #[inline]
    pub fn current_frame(&self) -> Option<FrameBegin> {
        self.frame_begin
    }

    /// 不在帧内时也可以使用的 manager 组合，用于场景初始化和 resize
    pub fn managers(&mut self) -> (&mut FramePipeline, &mut DescriptorAllocator, &mut TextureManager, &mut PipelineCache) {
        (&mut self.frame_pipeline, &mut self.descriptors, &mut self.textures, &mut self.pipelines)
    }
}
// phase call
impl RenderContext {
    pub fn begin_frame(&mut self) -> GfxResult<FrameBegin> {
        let frame_begin = self.frame_pipeline.begin_frame()?;
        self.textures.begin_frame(frame_begin.label);

        let cmd = self.frame_pipeline.alloc_command_buffer("frame")?;
        cmd.begin(self.device.as_ref(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, "frame")?;
        self.frame_cmd = Some(cmd);
        self.frame_begin = Some(frame_begin);
        Ok(frame_begin)
    }

    /// 只能在 begin_frame 和 end_frame 之间调用
    pub fn frame_context(&mut self) -> FrameContext<'_> {
        let (Some(cmd), Some(frame_begin)) = (self.frame_cmd.as_ref(), self.frame_begin) else {
            panic!("frame_context called outside of a frame");
        };
        FrameContext {
            device: self.device.as_ref(),
            cmd,
            frame_label: frame_begin.label,
            frame_id: frame_begin.frame_id,
            extent: self.render_extent,
            frame_pipeline: &mut self.frame_pipeline,
            descriptors: &mut self.descriptors,
            textures: &mut self.textures,
            pipelines: &mut self.pipelines,
        }
    }

    /// 先提交这一帧中产生的纹理上传和 mip 生成，再提交帧命令
    ///
    /// return: swapchain 需要重建
    pub fn end_frame(&mut self) -> GfxResult<bool> {
        let Some(cmd) = self.frame_cmd.take() else {
            panic!("end_frame called without begin_frame");
        };
        self.frame_begin = None;

        cmd.end(self.device.as_ref())?;
        self.textures.flush(&self.descriptors, &mut self.pipelines)?;
        self.frame_pipeline.end_frame(&[&cmd])
    }

    /// 在帧外同步提交所有待上传的纹理，用于场景初始化之后
    pub fn flush_uploads(&mut self) -> GfxResult<usize> {
        self.textures.flush(&self.descriptors, &mut self.pipelines)
    }

    pub fn resize(&mut self, extent: vk::Extent2D) -> GfxResult<()> {
        assert!(self.frame_cmd.is_none(), "resize must happen between frames");
        self.frame_pipeline.resize(extent)?;
        self.render_extent = extent;
        Ok(())
    }

    /// 源文件变化时丢弃对应的 pipeline，旧的 pipeline 延迟销毁
    pub fn reload_shader(&mut self, source_path: &Path) -> bool {
        match self.pipelines.invalidate_source(source_path) {
            Some(old) => {
                log::info!("shader {} changed, pipeline will be reloaded", source_path.display());
                self.frame_pipeline.defer_release(Box::new(old));
                true
            }
            None => false,
        }
    }
}
