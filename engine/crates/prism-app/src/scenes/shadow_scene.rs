//! 光追阴影的演示场景：地面和两个立方体
//!
//! 每个 mesh 一个 BLAS，TLAS 中引用同一个立方体 BLAS 两次；
//! 加速结构在第一帧的 command buffer 中构建，共享一个 scratch buffer。

use std::rc::Rc;

use anyhow::Context;
use ash::vk;
use prism_gfx::{
    raytracing::{acceleration::max_scratch_size, blas::Blas, tlas::Tlas},
    resources::{
        buffer::GfxBuffer,
        mesh::{GfxMesh, GfxMeshRef},
        resource_state::ResourceState,
        upload_ring_buffer::UploadRingBuffer,
    },
};
use prism_render_interface::{
    frame_counter::FIF_COUNT,
    render_context::RenderContext,
    texture_manager::GfxTextureBundle,
};

use crate::scene::{Scene, blit_to_swapchain};

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
}
impl Vertex {
    const fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
        Self { position, normal }
    }
}

/// 每帧上传的常量，和 shader 中的布局一致
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowConstants {
    pub light_dir: glam::Vec4,
    pub tlas_address: u64,
    pub frame_id: u64,
    /// render target 在 RTV 表中的位置
    pub render_target: u32,
    pub _padding: [u32; 3],
}

const RENDER_TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const CUBE_OFFSETS: [f32; 2] = [5.0, -5.0];

fn ground_mesh() -> (Vec<Vertex>, Vec<u32>) {
    let up = [0.0, 1.0, 0.0];
    let vertices = vec![
        Vertex::new([-20.0, 0.0, -20.0], up),
        Vertex::new([20.0, 0.0, -20.0], up),
        Vertex::new([20.0, 0.0, 20.0], up),
        Vertex::new([-20.0, 0.0, 20.0], up),
    ];
    (vertices, vec![0, 2, 1, 0, 3, 2])
}

/// 每个面 4 个顶点，法线朝外
fn cube_mesh() -> (Vec<Vertex>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let (n, u, v) = (glam::Vec3::from(normal), glam::Vec3::from(u), glam::Vec3::from(v));
        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            // 立方体放在地面上，中心高度为 1
            let p = n + u * su + v * sv + glam::Vec3::Y;
            vertices.push(Vertex::new(p.to_array(), normal));
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

/// 等待在第一帧中录制的加速结构构建
struct PendingBuild {
    scratch: GfxBuffer,
}

#[derive(Default)]
pub struct ShadowScene {
    meshes: Vec<GfxMeshRef>,
    blases: Vec<Rc<Blas>>,
    tlas: Option<Tlas>,
    pending_build: Option<PendingBuild>,

    constants: Option<UploadRingBuffer>,
    render_target: Option<GfxTextureBundle>,
}
impl ShadowScene {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn tlas(&self) -> Option<&Tlas> {
        self.tlas.as_ref()
    }

    #[inline]
    pub fn render_target(&self) -> Option<GfxTextureBundle> {
        self.render_target
    }

    fn create_render_target(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        let extent = ctx.render_extent();
        let (_, descriptors, textures, _) = ctx.managers();
        let bundle = textures.create_render_target(
            descriptors,
            extent,
            RENDER_TARGET_FORMAT,
            vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
            true,
            "shadow-rt",
        )?;
        self.render_target = Some(bundle);
        Ok(())
    }

    fn build_acceleration_structures(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        let device = ctx.device().clone();

        let mut blases = Vec::with_capacity(self.meshes.len());
        for mesh in &self.meshes {
            let name = format!("{}-blas", mesh.borrow().name());
            let mut blas = Blas::from_meshes(vec![mesh.clone()], &name);
            blas.prebuild(device.as_ref()).with_context(|| format!("failed to prebuild {}", name))?;
            blases.push(Rc::new(blas));
        }

        let mut tlas = Tlas::new("shadow-tlas");
        tlas.add_descriptor(
            blases[0].clone(),
            &glam::Mat4::IDENTITY,
            0xff,
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0,
        );
        for (idx, x) in CUBE_OFFSETS.into_iter().enumerate() {
            tlas.add_descriptor(
                blases[1].clone(),
                &glam::Mat4::from_translation(glam::vec3(x, 0.0, 0.0)),
                0xff,
                idx as u32 + 1,
                vk::GeometryInstanceFlagsKHR::empty(),
                0,
            );
        }
        tlas.prebuild(device.as_ref()).context("failed to prebuild tlas")?;

        let scratch_size =
            max_scratch_size(blases.iter().map(|blas| blas.prebuild_info()).chain([tlas.prebuild_info()]));
        let scratch = GfxBuffer::new_scratch_buffer(device.as_ref(), scratch_size, "shadow-as-scratch")?;
        log::info!("shadow scene: {} blas, {} instances, scratch {} bytes", blases.len(), tlas.instance_count(), scratch_size);

        self.blases = blases;
        self.tlas = Some(tlas);
        self.pending_build = Some(PendingBuild { scratch });
        Ok(())
    }
}
impl Scene for ShadowScene {
    fn name(&self) -> &str {
        "shadows"
    }

    fn init_resources(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        let _span = tracy_client::span!("ShadowScene::init_resources");
        let device = ctx.device().clone();

        let (vertices, indices) = ground_mesh();
        self.meshes.push(GfxMesh::from_data(device.as_ref(), &vertices, &indices, "ground")?.into_shared());
        let (vertices, indices) = cube_mesh();
        self.meshes.push(GfxMesh::from_data(device.as_ref(), &vertices, &indices, "cube")?.into_shared());

        self.build_acceleration_structures(ctx)?;

        self.constants = Some(UploadRingBuffer::new(
            device.as_ref(),
            size_of::<ShadowConstants>() as vk::DeviceSize,
            FIF_COUNT,
            true,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "shadow-constants",
        )?);
        self.create_render_target(ctx)?;
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        let _span = tracy_client::span!("ShadowScene::render");
        let mut frame = ctx.frame_context();
        let (device, cmd) = (frame.device, frame.cmd);

        if let Some(PendingBuild { scratch }) = self.pending_build.take() {
            // 共享 scratch，每次构建之后都需要 barrier
            for blas in &self.blases {
                blas.build(device, cmd, &scratch, true);
            }
            if let Some(tlas) = &self.tlas {
                tlas.build(device, cmd, &scratch, true);
            }
            frame.frame_pipeline.defer_release(Box::new(scratch));
        }

        let Some(rt_bundle) = self.render_target else {
            return Ok(());
        };
        if let Some(constants) = &self.constants {
            let light_dir = glam::vec3(-0.4, -1.0, 0.3).normalize();
            let data = ShadowConstants {
                light_dir: light_dir.extend(0.0),
                tlas_address: self.tlas.as_ref().map_or(0, |tlas| tlas.device_address()),
                frame_id: frame.frame_id,
                render_target: rt_bundle.rtv.map_or(0, |slot| slot.index),
                _padding: [0; 3],
            };
            constants.upload(device, *frame.frame_label, &data)?;
        }

        if let Some(rt) = frame.textures.texture_mut(rt_bundle.texture) {
            let clear_value = rt.clear_value().unwrap_or_default();
            rt.image_mut().transition(device, cmd, ResourceState::CopyDest);
            cmd.cmd_clear_color_image(device, rt.image(), vk::ImageLayout::TRANSFER_DST_OPTIMAL, &clear_value);
            rt.image_mut().transition(device, cmd, ResourceState::RenderTarget);
        }
        blit_to_swapchain(&mut frame, rt_bundle.texture);
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        if let Some(old) = self.render_target.take() {
            let (frame_pipeline, _, textures, _) = ctx.managers();
            textures.release_texture(old.texture, frame_pipeline);
        }
        self.create_render_target(ctx)
    }

    fn destroy(self: Box<Self>, ctx: &mut RenderContext) {
        let scene = *self;
        let (frame_pipeline, _, textures, _) = ctx.managers();

        if let Some(rt) = scene.render_target {
            textures.release_texture(rt.texture, frame_pipeline);
        }
        if let Some(PendingBuild { scratch }) = scene.pending_build {
            frame_pipeline.defer_release(Box::new(scratch));
        }
        if let Some(constants) = scene.constants {
            frame_pipeline.defer_release(Box::new(constants));
        }
        // 按引用关系排列：TLAS -> BLAS -> mesh，同一个 fence value 的对象按顺序释放
        if let Some(tlas) = scene.tlas {
            frame_pipeline.defer_release(Box::new(tlas));
        }
        for blas in scene.blases {
            frame_pipeline.defer_release(Box::new(blas));
        }
        for mesh in scene.meshes {
            frame_pipeline.defer_release(Box::new(mesh));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_mesh_is_closed() {
        let (vertices, indices) = cube_mesh();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|i| (*i as usize) < vertices.len()));
        // 立方体底面贴着地面
        let min_y = vertices.iter().map(|v| v.position[1]).fold(f32::MAX, f32::min);
        assert_eq!(min_y, 0.0);
    }

    #[test]
    fn test_constants_layout() {
        assert_eq!(size_of::<ShadowConstants>(), 48);
        assert_eq!(size_of::<Vertex>(), 24);
    }
}
