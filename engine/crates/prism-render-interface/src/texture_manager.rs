//! 纹理的创建、上传以及批量 mip 生成
//!
//! 上传命令在一个专用的 command buffer 中累积，直到 [`TextureManager::flush`]：
//! flush 时先录制所有 mip 生成请求，然后提交并等待队列空闲，最后回收 staging buffer。

use std::{path::Path, rc::Rc};

use ash::vk;
use prism_gfx::{
    commands::{command_buffer::GfxCommandBuffer, command_pool::GfxCommandPool, submit_info::GfxSubmitInfo},
    descriptors::descriptor_heap::{GfxDescriptorKind, GfxDescriptorSlot},
    device::GfxDevice,
    error::GfxResult,
    resources::{
        buffer::GfxBuffer,
        image::{GfxImage, GfxImageCreateInfo, VulkanFormatUtils},
        image_view::{GfxImageView, GfxImageViewDesc},
        releasable::GfxReleasable,
        resource_handle::GfxResourceHandle,
        resource_state::ResourceState,
    },
};
use slotmap::SlotMap;

use crate::{
    descriptor_allocator::DescriptorAllocator,
    frame_counter::FrameLabel,
    frame_pipeline::FramePipeline,
    mip_generator::{MIP_GEN_FORMAT, MIP_GEN_SHADER, MipGenPushConstants, MipGenerator, MipRequest},
    pipeline_cache::PipelineProvider,
};

slotmap::new_key_type! {
    pub struct TextureHandle;
}

/// 纹理在各个描述符堆中的位置
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct GfxTextureBundle {
    pub texture: TextureHandle,
    pub srv: Option<GfxDescriptorSlot>,
    pub rtv: Option<GfxDescriptorSlot>,
    /// 生成 mip 时为连续区间的起点，mip i 位于 `uav.offset(i)`
    pub uav: Option<GfxDescriptorSlot>,
}

pub struct GfxTexture {
    image: GfxResourceHandle,

    srv_view: Option<GfxImageView>,
    rtv_view: Option<GfxImageView>,
    /// 每个 mip 一个 view
    uav_views: Vec<GfxImageView>,

    bundle: GfxTextureBundle,
    clear_value: Option<vk::ClearColorValue>,

    name: String,
}
// getters
impl GfxTexture {
    #[inline]
    pub fn image(&self) -> &GfxImage {
        self.image.image()
    }

    #[inline]
    pub fn image_handle(&self) -> &GfxResourceHandle {
        &self.image
    }

    #[inline]
    pub fn image_mut(&mut self) -> &mut GfxResourceHandle {
        &mut self.image
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        self.image.state()
    }

    #[inline]
    pub fn srv_view(&self) -> Option<vk::ImageView> {
        self.srv_view.as_ref().map(GfxImageView::handle)
    }

    #[inline]
    pub fn rtv_view(&self) -> Option<vk::ImageView> {
        self.rtv_view.as_ref().map(GfxImageView::handle)
    }

    #[inline]
    pub fn uav_views(&self) -> impl Iterator<Item = vk::ImageView> + '_ {
        self.uav_views.iter().map(GfxImageView::handle)
    }

    #[inline]
    pub fn bundle(&self) -> GfxTextureBundle {
        self.bundle
    }

    #[inline]
    pub fn clear_value(&self) -> Option<vk::ClearColorValue> {
        self.clear_value
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
impl GfxReleasable for GfxTexture {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        let texture = *self;
        texture
            .srv_view
            .into_iter()
            .chain(texture.rtv_view)
            .chain(texture.uav_views)
            .for_each(|view| view.destroy(device));
        texture.image.destroy(device);
    }

    fn release_name(&self) -> String {
        format!("GfxTexture::{}", self.name)
    }
}

/// 创建纹理时的描述
struct TextureViews {
    srv: bool,
    rtv: bool,
    /// None 表示不需要 UAV；Some(n) 表示为前 n 级 mip 各创建一个 UAV
    uav_mips: Option<u32>,
}

pub struct TextureManager {
    device: Rc<dyn GfxDevice>,

    textures: SlotMap<TextureHandle, GfxTexture>,
    default_bundle: GfxTextureBundle,

    command_pool: Option<GfxCommandPool>,
    upload_cmd: GfxCommandBuffer,
    /// upload_cmd 是否处于录制状态
    recording: bool,
    /// 等待本次 flush 完成后销毁
    staging_buffers: Vec<GfxBuffer>,

    mip_generator: Option<MipGenerator>,
    frame_label: FrameLabel,

    destroyed: bool,
}
// new & init
impl TextureManager {
    pub fn new(device: Rc<dyn GfxDevice>, descriptors: &mut DescriptorAllocator) -> GfxResult<Self> {
        let command_pool =
            GfxCommandPool::new(device.as_ref(), vk::CommandPoolCreateFlags::TRANSIENT, "texture-upload")?;
        let upload_cmd = GfxCommandBuffer::new(device.as_ref(), &command_pool, "texture-upload")?;
        let mip_generator = MipGenerator::new(device.as_ref())?;

        let mut manager = Self {
            device,
            textures: SlotMap::with_key(),
            default_bundle: GfxTextureBundle::default(),
            command_pool: Some(command_pool),
            upload_cmd,
            recording: false,
            staging_buffers: Vec::new(),
            mip_generator: Some(mip_generator),
            frame_label: FrameLabel::A,
            destroyed: false,
        };

        manager.default_bundle = manager.create_texture_from_image(
            descriptors,
            &Self::checker_pixels(),
            2,
            2,
            vk::Format::R8G8B8A8_UNORM,
            false,
            false,
            "default-checker",
        )?;
        Ok(manager)
    }

    /// 2x2 的品红/黑色棋盘格，作为加载失败时的替代纹理
    fn checker_pixels() -> [u8; 16] {
        const MAGENTA: [u8; 4] = [255, 0, 255, 255];
        const BLACK: [u8; 4] = [0, 0, 0, 255];
        let mut pixels = [0; 16];
        for (idx, pixel) in [MAGENTA, BLACK, BLACK, MAGENTA].iter().enumerate() {
            pixels[idx * 4..idx * 4 + 4].copy_from_slice(pixel);
        }
        pixels
    }

    /// 所有纹理交给 frame pipeline 延迟销毁，其余资源立即销毁
    ///
    /// 调用前需要保证上传命令已经 flush
    pub fn destroy(mut self, frame_pipeline: &mut FramePipeline) {
        if self.recording {
            log::warn!("TextureManager destroyed while recording uploads, the pending uploads are discarded");
            self.recording = false;
        }

        let device = self.device.clone();
        for buffer in self.staging_buffers.drain(..) {
            buffer.destroy(device.as_ref());
        }
        for (_, texture) in self.textures.drain() {
            frame_pipeline.defer_release(Box::new(texture));
        }
        if let Some(mip_generator) = self.mip_generator.take() {
            mip_generator.destroy(device.as_ref());
        }
        if let Some(command_pool) = self.command_pool.take() {
            command_pool.destroy(device.as_ref());
        }
        self.destroyed = true;
    }
}
impl Drop for TextureManager {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "TextureManager must be destroyed explicitly");
        }
    }
}
// getters
impl TextureManager {
    #[inline]
    pub fn texture(&self, handle: TextureHandle) -> Option<&GfxTexture> {
        self.textures.get(handle)
    }

    #[inline]
    pub fn texture_mut(&mut self, handle: TextureHandle) -> Option<&mut GfxTexture> {
        self.textures.get_mut(handle)
    }

    #[inline]
    pub fn default_texture(&self) -> GfxTextureBundle {
        self.default_bundle
    }

    #[inline]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    #[inline]
    pub fn pending_mip_requests(&self) -> usize {
        self.mip_generator.as_ref().map_or(0, MipGenerator::pending_count)
    }

    #[inline]
    pub fn pending_staging_buffers(&self) -> usize {
        self.staging_buffers.len()
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    #[inline]
    pub fn upload_command_buffer(&self) -> &GfxCommandBuffer {
        &self.upload_cmd
    }
}
// create
impl TextureManager {
    /// 从内存中的像素创建纹理，像素需要紧密排列
    ///
    /// - generate_mips: 分配完整 mip 链并在下一次 flush 时生成
    /// - allow_uav: 为 mip 0 创建 UAV
    #[allow(clippy::too_many_arguments)]
    pub fn create_texture_from_image(
        &mut self,
        descriptors: &mut DescriptorAllocator,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
        generate_mips: bool,
        allow_uav: bool,
        name: &str,
    ) -> GfxResult<GfxTextureBundle> {
        let _span = tracy_client::span!("TextureManager::create_texture_from_image");

        let expected_size = width as usize * height as usize * VulkanFormatUtils::pixel_size_in_bytes(format);
        assert_eq!(
            pixels.len(),
            expected_size,
            "texture {} expects {} bytes of pixels, got {}",
            name,
            expected_size,
            pixels.len()
        );

        if generate_mips {
            assert_eq!(format, MIP_GEN_FORMAT, "texture {}: mip generation only supports {:?}", name, MIP_GEN_FORMAT);
        }

        let mip_levels = if generate_mips { GfxImage::full_mip_count(width, height) } else { 1 };
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if generate_mips || allow_uav {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        let extent = vk::Extent2D { width, height };
        let image_info = GfxImageCreateInfo::new_image_2d_info(extent, format, usage).mip_levels(mip_levels);
        let image = GfxImage::new(self.device.as_ref(), &image_info, name)?;

        let staging = self.new_staging(pixels, name)?;
        let copy_region = vk::BufferImageCopy {
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_extent: extent.into(),
            ..Default::default()
        };

        let mut image = GfxResourceHandle::new_image(image, ResourceState::Undefined);
        self.ensure_recording()?;
        let device = self.device.as_ref();
        image.transition(device, &self.upload_cmd, ResourceState::CopyDest);
        self.upload_cmd.cmd_copy_buffer_to_image(
            device,
            &staging,
            image.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&copy_region),
        );
        image.transition(device, &self.upload_cmd, ResourceState::ShaderResource);
        self.staging_buffers.push(staging);

        let uav_mips = match (generate_mips, allow_uav) {
            (true, _) => Some(mip_levels),
            (false, true) => Some(1),
            (false, false) => None,
        };
        let bundle = self.register(
            descriptors,
            image,
            TextureViews {
                srv: true,
                rtv: false,
                uav_mips,
            },
            GfxImageViewDesc::new_2d,
            None,
            name,
        )?;

        if generate_mips && mip_levels > 1 {
            if let (Some(mip_generator), Some(base_uav)) = (self.mip_generator.as_mut(), bundle.uav) {
                mip_generator.enqueue(MipRequest {
                    texture: bundle.texture,
                    base_uav,
                    mip_count: mip_levels,
                    width,
                    height,
                });
            }
        }

        Ok(bundle)
    }

    /// 加载失败时返回默认纹理
    pub fn create_texture_from_file(
        &mut self,
        descriptors: &mut DescriptorAllocator,
        path: &Path,
        generate_mips: bool,
        allow_uav: bool,
    ) -> GfxResult<GfxTextureBundle> {
        let _span = tracy_client::span!("TextureManager::create_texture_from_file");

        let img = match image::open(path) {
            Ok(img) => img.to_rgba8(),
            Err(err) => {
                log::warn!("failed to load texture {}: {}, fallback to default texture", path.display(), err);
                return Ok(self.default_bundle);
            }
        };
        let (width, height) = img.dimensions();
        let name = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        log::info!("load texture {} ({}x{})", name, width, height);

        self.create_texture_from_image(
            descriptors,
            img.as_raw(),
            width,
            height,
            vk::Format::R8G8B8A8_UNORM,
            generate_mips,
            allow_uav,
            &name,
        )
    }

    /// render target 会被清除为 clear_value，最终处于 RenderTarget 状态
    pub fn create_render_target(
        &mut self,
        descriptors: &mut DescriptorAllocator,
        extent: vk::Extent2D,
        format: vk::Format,
        clear_value: vk::ClearColorValue,
        create_srv: bool,
        name: &str,
    ) -> GfxResult<GfxTextureBundle> {
        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        if create_srv {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        let image_info = GfxImageCreateInfo::new_image_2d_info(extent, format, usage);
        let image = GfxImage::new(self.device.as_ref(), &image_info, name)?;

        let mut image = GfxResourceHandle::new_image(image, ResourceState::Undefined);
        self.ensure_recording()?;
        let device = self.device.as_ref();
        image.transition(device, &self.upload_cmd, ResourceState::CopyDest);
        self.upload_cmd.cmd_clear_color_image(
            device,
            image.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_value,
        );
        image.transition(device, &self.upload_cmd, ResourceState::RenderTarget);

        self.register(
            descriptors,
            image,
            TextureViews {
                srv: create_srv,
                rtv: true,
                uav_mips: None,
            },
            GfxImageViewDesc::new_2d,
            Some(clear_value),
            name,
        )
    }

    /// data 为 6 个面依次紧密排列的像素；为 None 时清除为黑色
    pub fn create_cubemap(
        &mut self,
        descriptors: &mut DescriptorAllocator,
        size: u32,
        format: vk::Format,
        allow_uav: bool,
        data: Option<&[u8]>,
        name: &str,
    ) -> GfxResult<GfxTextureBundle> {
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if allow_uav {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        let image_info = GfxImageCreateInfo::new_cube_info(size, format, usage);
        let image = GfxImage::new(self.device.as_ref(), &image_info, name)?;
        let mut image = GfxResourceHandle::new_image(image, ResourceState::Undefined);

        let staging = match data {
            Some(data) => {
                let expected_size = size as usize * size as usize * VulkanFormatUtils::pixel_size_in_bytes(format) * 6;
                assert_eq!(data.len(), expected_size, "cubemap {} expects {} bytes", name, expected_size);
                Some(self.new_staging(data, name)?)
            }
            None => None,
        };

        self.ensure_recording()?;
        let device = self.device.as_ref();
        image.transition(device, &self.upload_cmd, ResourceState::CopyDest);
        match &staging {
            Some(staging) => {
                let copy_region = vk::BufferImageCopy {
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 6,
                    },
                    image_extent: vk::Extent3D {
                        width: size,
                        height: size,
                        depth: 1,
                    },
                    ..Default::default()
                };
                self.upload_cmd.cmd_copy_buffer_to_image(
                    device,
                    staging,
                    image.image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&copy_region),
                );
            }
            None => {
                let black = vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                };
                self.upload_cmd.cmd_clear_color_image(device, image.image(), vk::ImageLayout::TRANSFER_DST_OPTIMAL, &black);
            }
        }
        image.transition(device, &self.upload_cmd, ResourceState::ShaderResource);
        self.staging_buffers.extend(staging);

        self.register(
            descriptors,
            image,
            TextureViews {
                srv: true,
                rtv: false,
                uav_mips: allow_uav.then_some(1),
            },
            GfxImageViewDesc::new_cube,
            None,
            name,
        )
    }

    fn new_staging(&mut self, bytes: &[u8], name: &str) -> GfxResult<GfxBuffer> {
        let staging =
            GfxBuffer::new_stage_buffer(self.device.as_ref(), bytes.len() as vk::DeviceSize, format!("{}-staging", name))?;
        staging.transfer_data_by_mmap(self.device.as_ref(), bytes)?;
        Ok(staging)
    }

    /// 创建 view 并写入描述符堆，然后把纹理加入 slotmap
    ///
    /// cube 纹理的 UAV 为覆盖全部 layer 的 2D array view，其余为单 mip 的 2D view
    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        descriptors: &mut DescriptorAllocator,
        image: GfxResourceHandle,
        views: TextureViews,
        srv_desc: fn(&GfxImage) -> GfxImageViewDesc,
        clear_value: Option<vk::ClearColorValue>,
        name: &str,
    ) -> GfxResult<GfxTextureBundle> {
        let device = self.device.as_ref();
        let raw_image = image.image();
        let is_cube = raw_image.array_layers() == 6;

        let mut bundle = GfxTextureBundle::default();

        let srv_view = if views.srv {
            let desc = srv_desc(raw_image);
            let view = GfxImageView::new(device, raw_image, desc, format!("{}-srv", name))?;
            let kind = if is_cube { GfxDescriptorKind::Cubemap } else { GfxDescriptorKind::Srv };
            let slot = descriptors.allocate(kind);
            if is_cube {
                descriptors.write_cube(slot, view.handle());
            } else {
                descriptors.write_srv(slot, view.handle());
            }
            bundle.srv = Some(slot);
            Some(view)
        } else {
            None
        };

        let rtv_view = if views.rtv {
            let view = GfxImageView::new(device, raw_image, GfxImageViewDesc::new_2d(raw_image), format!("{}-rtv", name))?;
            let slot = descriptors.allocate(GfxDescriptorKind::Rtv);
            descriptors.write_rtv(slot, view.handle());
            bundle.rtv = Some(slot);
            Some(view)
        } else {
            None
        };

        let mut uav_views = Vec::new();
        if let Some(mip_count) = views.uav_mips {
            let base = descriptors.allocate_range(GfxDescriptorKind::Uav, mip_count);
            for mip in 0..mip_count {
                let desc = if is_cube {
                    GfxImageViewDesc::new_2d_array(raw_image)
                } else {
                    GfxImageViewDesc::new_2d_mip(raw_image, mip)
                };
                let view = GfxImageView::new(device, raw_image, desc, format!("{}-uav-mip{}", name, mip))?;
                descriptors.write_uav(base.offset(mip), view.handle());
                uav_views.push(view);
            }
            bundle.uav = Some(base);
        }

        let handle = self.textures.insert_with_key(|key| {
            bundle.texture = key;
            GfxTexture {
                image,
                srv_view,
                rtv_view,
                uav_views,
                bundle,
                clear_value,
                name: name.to_string(),
            }
        });
        log::debug!("texture {} registered: {:?}", name, bundle);
        debug_assert_eq!(handle, bundle.texture);
        Ok(bundle)
    }
}
// frame
impl TextureManager {
    #[inline]
    pub fn begin_frame(&mut self, frame_label: FrameLabel) {
        self.frame_label = frame_label;
    }

    /// 录制所有 mip 请求并提交上传命令，等待 GPU 完成后回收 staging buffer
    ///
    /// 请求数超过单帧上限时分多批提交；找不到 mip 生成 shader 时丢弃请求，纹理只保留 mip 0。
    ///
    /// return: 录制的 mip dispatch 数量
    pub fn flush(
        &mut self,
        descriptors: &DescriptorAllocator,
        pipelines: &mut dyn PipelineProvider,
    ) -> GfxResult<usize> {
        let _span = tracy_client::span!("TextureManager::flush");
        if !self.recording && self.pending_mip_requests() == 0 {
            return Ok(0);
        }

        let mut dispatch_count = 0;
        loop {
            self.ensure_recording()?;

            if let Some(mip_generator) = self.mip_generator.as_mut().filter(|g| !g.is_empty()) {
                let pipeline = pipelines.compute_pipeline(MIP_GEN_SHADER, size_of::<MipGenPushConstants>() as u32);
                match (pipeline, descriptors.shader_set(GfxDescriptorKind::Uav)) {
                    (Some(pipeline), Some(uav_set)) => {
                        dispatch_count += mip_generator.record_batch(
                            self.device.as_ref(),
                            &self.upload_cmd,
                            self.frame_label,
                            &mut self.textures,
                            &pipeline,
                            uav_set,
                        )?;
                    }
                    _ => {
                        let dropped = mip_generator.discard_all();
                        log::warn!("mip generation is unavailable, {} requests dropped", dropped);
                    }
                }
            }

            self.submit_and_wait()?;
            if self.pending_mip_requests() == 0 {
                break;
            }
        }
        Ok(dispatch_count)
    }

    /// 纹理可能仍在被 GPU 使用，交给 frame pipeline 延迟销毁
    ///
    /// 描述符位置不会被回收
    pub fn release_texture(&mut self, handle: TextureHandle, frame_pipeline: &mut FramePipeline) -> bool {
        if handle == self.default_bundle.texture {
            log::warn!("default texture can not be released");
            return false;
        }
        match self.textures.remove(handle) {
            Some(texture) => {
                frame_pipeline.defer_release(Box::new(texture));
                true
            }
            None => false,
        }
    }

    fn ensure_recording(&mut self) -> GfxResult<()> {
        if !self.recording {
            self.upload_cmd.begin(
                self.device.as_ref(),
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                "texture-upload",
            )?;
            self.recording = true;
        }
        Ok(())
    }

    fn submit_and_wait(&mut self) -> GfxResult<()> {
        let device = self.device.as_ref();
        self.upload_cmd.end(device)?;
        self.recording = false;

        device.queue_submit(&[GfxSubmitInfo::new(&[&self.upload_cmd])])?;
        device.queue_wait_idle()?;

        for buffer in self.staging_buffers.drain(..) {
            buffer.destroy(device);
        }
        if let Some(command_pool) = &self.command_pool {
            command_pool.reset_all_buffers(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::backend::headless::{HeadlessCommand, HeadlessDevice};

    use super::*;
    use crate::descriptor_allocator::DescriptorCapacities;

    struct NoPipelines;
    impl PipelineProvider for NoPipelines {
        fn compute_pipeline(
            &mut self,
            _name: &str,
            _push_constant_size: u32,
        ) -> Option<prism_gfx::pipelines::compute_pipeline::GfxComputePipeline> {
            None
        }
    }

    fn setup() -> (Rc<HeadlessDevice>, FramePipeline, DescriptorAllocator, TextureManager) {
        let headless = Rc::new(HeadlessDevice::new());
        let device: Rc<dyn GfxDevice> = headless.clone();
        let frame_pipeline = FramePipeline::new(device.clone(), None).unwrap();
        let mut descriptors = DescriptorAllocator::new(device.clone(), DescriptorCapacities::default()).unwrap();
        let textures = TextureManager::new(device, &mut descriptors).unwrap();
        (headless, frame_pipeline, descriptors, textures)
    }

    fn teardown(mut frame_pipeline: FramePipeline, descriptors: DescriptorAllocator, textures: TextureManager) {
        textures.destroy(&mut frame_pipeline);
        frame_pipeline.flush_all().unwrap();
        frame_pipeline.destroy();
        descriptors.destroy();
    }

    #[test]
    fn test_default_texture_is_uploaded_on_flush() {
        let (headless, frame_pipeline, descriptors, mut textures) = setup();
        assert!(textures.is_recording());
        assert_eq!(textures.pending_staging_buffers(), 1);

        let dispatches = textures.flush(&descriptors, &mut NoPipelines).unwrap();
        assert_eq!(dispatches, 0);
        assert!(!textures.is_recording());
        assert_eq!(textures.pending_staging_buffers(), 0);
        assert_eq!(headless.queue_idle_count(), 1);

        let commands = headless.submitted_commands();
        assert!(commands.iter().any(|c| matches!(c, HeadlessCommand::CopyBufferToImage { .. })));

        let default = textures.default_texture();
        let texture = textures.texture(default.texture).unwrap();
        assert_eq!(texture.state(), ResourceState::ShaderResource);
        assert_eq!(default.srv.map(|s| s.index), Some(0));

        teardown(frame_pipeline, descriptors, textures);
    }

    #[test]
    fn test_mip_texture_allocates_uav_range() {
        let (_headless, frame_pipeline, mut descriptors, mut textures) = setup();
        let pixels = vec![128u8; 64 * 32 * 4];
        let bundle = textures
            .create_texture_from_image(&mut descriptors, &pixels, 64, 32, vk::Format::R8G8B8A8_UNORM, true, false, "mips")
            .unwrap();

        let texture = textures.texture(bundle.texture).unwrap();
        assert_eq!(texture.image().mip_levels(), 6);
        assert_eq!(texture.uav_views().count(), 6);
        assert_eq!(descriptors.allocated_count(GfxDescriptorKind::Uav), 6);
        assert_eq!(textures.pending_mip_requests(), 1);

        // shader 不可用时丢弃请求
        let dispatches = textures.flush(&descriptors, &mut NoPipelines).unwrap();
        assert_eq!(dispatches, 0);
        assert_eq!(textures.pending_mip_requests(), 0);

        teardown(frame_pipeline, descriptors, textures);
    }

    #[test]
    #[should_panic(expected = "mip generation only supports R8G8B8A8_UNORM")]
    fn test_mip_generation_rejects_other_formats() {
        let (_headless, _frame_pipeline, mut descriptors, mut textures) = setup();
        let pixels = vec![0u8; 16 * 16 * 16];
        let _ = textures.create_texture_from_image(
            &mut descriptors,
            &pixels,
            16,
            16,
            vk::Format::R32G32B32A32_SFLOAT,
            true,
            false,
            "hdr",
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let (_headless, frame_pipeline, mut descriptors, mut textures) = setup();
        let bundle = textures
            .create_texture_from_file(&mut descriptors, Path::new("/nonexistent/albedo.png"), true, false)
            .unwrap();
        assert_eq!(bundle, textures.default_texture());
        assert_eq!(textures.texture_count(), 1);
        teardown(frame_pipeline, descriptors, textures);
    }

    #[test]
    fn test_render_target_is_cleared() {
        let (headless, frame_pipeline, mut descriptors, mut textures) = setup();
        let clear = vk::ClearColorValue {
            float32: [0.1, 0.2, 0.3, 1.0],
        };
        let bundle = textures
            .create_render_target(
                &mut descriptors,
                vk::Extent2D {
                    width: 320,
                    height: 240,
                },
                vk::Format::R16G16B16A16_SFLOAT,
                clear,
                true,
                "hdr",
            )
            .unwrap();
        assert!(bundle.rtv.is_some());
        assert!(bundle.srv.is_some());
        assert!(bundle.uav.is_none());

        let texture = textures.texture(bundle.texture).unwrap();
        assert_eq!(texture.state(), ResourceState::RenderTarget);
        let commands = headless.recorded_commands(textures.upload_command_buffer().vk_handle());
        assert!(commands.iter().any(|c| matches!(c, HeadlessCommand::ClearColorImage { .. })));

        textures.flush(&descriptors, &mut NoPipelines).unwrap();
        teardown(frame_pipeline, descriptors, textures);
    }

    #[test]
    fn test_cubemap_uses_cube_heap() {
        let (_headless, frame_pipeline, mut descriptors, mut textures) = setup();
        let data = vec![0u8; 8 * 8 * 4 * 6];
        let bundle = textures
            .create_cubemap(&mut descriptors, 8, vk::Format::R8G8B8A8_UNORM, true, Some(&data), "sky")
            .unwrap();
        assert_eq!(bundle.srv.map(|s| s.kind), Some(GfxDescriptorKind::Cubemap));
        assert_eq!(bundle.uav.map(|s| s.kind), Some(GfxDescriptorKind::Uav));
        assert_eq!(textures.texture(bundle.texture).unwrap().image().array_layers(), 6);

        textures.flush(&descriptors, &mut NoPipelines).unwrap();
        teardown(frame_pipeline, descriptors, textures);
    }

    #[test]
    fn test_release_texture_is_deferred() {
        let (_headless, mut frame_pipeline, mut descriptors, mut textures) = setup();
        let pixels = [255u8; 4 * 4 * 4];
        let bundle = textures
            .create_texture_from_image(&mut descriptors, &pixels, 4, 4, vk::Format::R8G8B8A8_UNORM, false, false, "tiny")
            .unwrap();
        textures.flush(&descriptors, &mut NoPipelines).unwrap();

        assert!(!textures.release_texture(textures.default_texture().texture, &mut frame_pipeline));
        assert!(textures.release_texture(bundle.texture, &mut frame_pipeline));
        assert!(textures.texture(bundle.texture).is_none());
        assert_eq!(frame_pipeline.pending_release_count(), 1);

        teardown(frame_pipeline, descriptors, textures);
    }

    #[test]
    #[should_panic(expected = "expects 64 bytes")]
    fn test_pixel_size_mismatch_panics() {
        let (_headless, _frame_pipeline, mut descriptors, mut textures) = setup();
        let _ = textures.create_texture_from_image(
            &mut descriptors,
            &[0u8; 10],
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            false,
            false,
            "bad",
        );
    }
}
