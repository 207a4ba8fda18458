use ash::vk;
use prism_gfx::{
    commands::barrier::GfxImageBarrier,
    resources::{image::GfxImage, resource_state::ResourceState},
};
use prism_render_interface::{
    render_context::{FrameContext, RenderContext},
    texture_manager::TextureHandle,
};

use crate::{
    config::{PrismConfig, SceneKind},
    scenes::{gallery_scene::GalleryScene, shadow_scene::ShadowScene},
};

/// 可以替换的演示场景
///
/// 生命周期：`init_resources` -> 每帧 `render` -> `destroy`。
/// 所有 GPU 资源都通过 [`RenderContext`] 创建，销毁时交给 deferred release。
pub trait Scene {
    fn name(&self) -> &str;

    /// 在第一帧之前调用，创建的纹理会在第一帧之前统一上传
    fn init_resources(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()>;

    /// 在 begin_frame 和 end_frame 之间调用
    fn render(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()>;

    /// swapchain 重建之后调用
    fn on_resize(&mut self, _ctx: &mut RenderContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(self: Box<Self>, ctx: &mut RenderContext);
}

pub fn create_scene(config: &PrismConfig) -> Box<dyn Scene> {
    match config.scene.name {
        SceneKind::Shadows => Box::new(ShadowScene::new()),
        SceneKind::Gallery => Box::new(GalleryScene::new(config.scene.texture_dir.clone())),
    }
}

/// 外部 image（swapchain）没有状态追踪，按照已知的前后状态直接构造 barrier
fn external_image_barrier(image: &GfxImage, from: ResourceState, to: ResourceState) -> GfxImageBarrier {
    GfxImageBarrier::new()
        .image(image.handle())
        .src_mask(from.stage(), from.src_access())
        .dst_mask(to.stage(), to.access())
        .layout_transfer(from.layout(), to.layout())
        .image_aspect_flag(vk::ImageAspectFlags::COLOR)
}

/// 将纹理的 mip 0 拉伸 blit 到当前的 swapchain image，纹理的状态在 blit 之后恢复
///
/// return: 没有可用的 swapchain image 时返回 false
pub fn blit_to_swapchain(frame: &mut FrameContext<'_>, texture: TextureHandle) -> bool {
    let Some(swapchain_image) = frame.frame_pipeline.current_swapchain_image() else {
        return false;
    };
    let Some(texture) = frame.textures.texture_mut(texture) else {
        log::warn!("blit source texture is released");
        return false;
    };

    let device = frame.device;
    let cmd = frame.cmd;
    let previous_state = texture.state();
    texture.image_mut().transition(device, cmd, ResourceState::CopySource);
    cmd.image_memory_barrier(
        device,
        &[external_image_barrier(swapchain_image, ResourceState::Undefined, ResourceState::CopyDest)],
    );

    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let far_corner = |extent: vk::Extent2D| vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };
    let region = vk::ImageBlit {
        src_subresource: layers,
        src_offsets: [vk::Offset3D::default(), far_corner(texture.image().extent_2d())],
        dst_subresource: layers,
        dst_offsets: [vk::Offset3D::default(), far_corner(swapchain_image.extent_2d())],
    };
    cmd.cmd_blit_image(
        device,
        (texture.image().handle(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        (swapchain_image.handle(), vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        std::slice::from_ref(&region),
        vk::Filter::LINEAR,
    );

    cmd.image_memory_barrier(
        device,
        &[external_image_barrier(swapchain_image, ResourceState::CopyDest, ResourceState::Present)],
    );
    texture.image_mut().transition(device, cmd, previous_state);
    true
}
