//! 批量的 mip 生成
//!
//! 每个请求的参数写入 [`UploadRingBuffer`] 的一个 slice，shader 通过 push constant 中的
//! device address 读取参数，并通过 bindless UAV 写入每一级 mip。
//!
//! 一次 dispatch 最多从源 mip 往下生成 [`MIP_LEVELS_PER_PASS`] 级，更长的 mip 链从上一个 pass
//! 的最后一级继续 dispatch。

use ash::vk;
use prism_gfx::{
    commands::{
        barrier::{GfxBarrierMask, GfxMemoryBarrier},
        command_buffer::GfxCommandBuffer,
    },
    descriptors::descriptor_heap::GfxDescriptorSlot,
    device::GfxDevice,
    error::GfxResult,
    pipelines::compute_pipeline::GfxComputePipeline,
    resources::{resource_state::ResourceState, upload_ring_buffer::UploadRingBuffer},
};
use slotmap::SlotMap;

use crate::{
    frame_counter::{FIF_COUNT, FrameLabel},
    texture_manager::{GfxTexture, TextureHandle},
};

/// 每一帧最多处理的请求数量，超出的部分在同一次 flush 中分批提交
pub const MAX_MIP_REQUESTS_PER_FRAME: usize = 64;
/// `shader/.build/mip_gen.spv`
pub const MIP_GEN_SHADER: &str = "mip_gen";
/// shader 中每个 workgroup 处理 32x32 个像素
pub const MIP_GEN_TILE_SIZE: u32 = 32;
/// 一个 pass 在源 mip 之后写入的层级数量，受 32x32 tile 的限制
pub const MIP_LEVELS_PER_PASS: u32 = 5;
/// 一个请求最多的 pass 数量；16384 的纹理有 15 级 mip，需要 3 个 pass
pub const MAX_MIP_PASSES: usize = 4;
/// shader 中 UAV 的格式固定为 rgba8
pub const MIP_GEN_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// 和 shader 中的结构体保持一致
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MipGenConstants {
    /// 源 mip 对应的 UAV slot，后续 mip 连续排列
    pub base_uav_index: u32,
    /// 包含源 mip 在内的层级数量
    pub mip_count: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MipGenPushConstants {
    pub constants_address: vk::DeviceAddress,
}

/// 一次 dispatch：读取 `src_mip`，写入之后的 `mip_count - 1` 级
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MipPass {
    pub src_mip: u32,
    pub mip_count: u32,
    /// `src_mip` 的尺寸
    pub width: u32,
    pub height: u32,
}
impl MipPass {
    #[inline]
    pub fn group_count(&self) -> glam::UVec3 {
        glam::uvec3(self.width.div_ceil(MIP_GEN_TILE_SIZE), self.height.div_ceil(MIP_GEN_TILE_SIZE), 1)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct MipRequest {
    pub texture: TextureHandle,
    /// mip 0 对应的 UAV slot
    pub base_uav: GfxDescriptorSlot,
    pub mip_count: u32,
    pub width: u32,
    pub height: u32,
}
impl MipRequest {
    /// 把整条 mip 链拆分为若干 pass，后一个 pass 以前一个 pass 写入的最后一级为源
    pub fn passes(&self) -> Vec<MipPass> {
        let mut passes = Vec::new();
        let mut src_mip = 0;
        while src_mip + 1 < self.mip_count {
            passes.push(MipPass {
                src_mip,
                mip_count: (self.mip_count - src_mip).min(MIP_LEVELS_PER_PASS + 1),
                width: (self.width >> src_mip).max(1),
                height: (self.height >> src_mip).max(1),
            });
            src_mip += MIP_LEVELS_PER_PASS;
        }
        passes
    }

    #[inline]
    fn constants(&self, pass: &MipPass) -> MipGenConstants {
        MipGenConstants {
            base_uav_index: self.base_uav.index + pass.src_mip,
            mip_count: pass.mip_count,
            width: pass.width,
            height: pass.height,
        }
    }
}

/// 前一个 pass 写入的 mip 对后一个 pass 的读取可见
fn mip_pass_barrier() -> GfxMemoryBarrier {
    let storage_rw = vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE;
    GfxMemoryBarrier::new().mask(GfxBarrierMask {
        src_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        src_access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
        dst_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        dst_access: storage_rw,
    })
}

pub struct MipGenerator {
    /// FIF_COUNT x MAX_MIP_REQUESTS_PER_FRAME x MAX_MIP_PASSES 个 slice
    constants: UploadRingBuffer,
    requests: Vec<MipRequest>,
}
// new & init
impl MipGenerator {
    pub fn new(device: &dyn GfxDevice) -> GfxResult<Self> {
        let constants = UploadRingBuffer::new(
            device,
            size_of::<MipGenConstants>() as vk::DeviceSize,
            FIF_COUNT * MAX_MIP_REQUESTS_PER_FRAME * MAX_MIP_PASSES,
            true,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "mip-gen-constants",
        )?;
        Ok(Self {
            constants,
            requests: Vec::new(),
        })
    }

    pub fn destroy(self, device: &dyn GfxDevice) {
        if !self.requests.is_empty() {
            log::warn!("MipGenerator destroyed with {} pending requests", self.requests.len());
        }
        self.constants.destroy(device);
    }
}
// getters
impl MipGenerator {
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[inline]
    pub fn constants_buffer(&self) -> &UploadRingBuffer {
        &self.constants
    }
}
// update
impl MipGenerator {
    pub fn enqueue(&mut self, request: MipRequest) {
        assert!(
            request.passes().len() <= MAX_MIP_PASSES,
            "mip chain of {} levels needs more than {} passes",
            request.mip_count,
            MAX_MIP_PASSES
        );
        self.requests.push(request);
    }

    /// 丢弃所有请求，纹理只保留 mip 0 的内容
    pub fn discard_all(&mut self) -> usize {
        let count = self.requests.len();
        self.requests.clear();
        count
    }

    /// 录制一批请求（最多 [`MAX_MIP_REQUESTS_PER_FRAME`] 个）
    ///
    /// pipeline 和 UAV set 只绑定一次；每个请求先转换为 UAV，每个 pass 写入参数并 dispatch，
    /// pass 之间插入 barrier，最后转换回 shader 只读。
    /// 调用者需要在下一批之前等待 GPU 执行完这一批，因为参数 slice 会被复用。
    ///
    /// return: 录制的 dispatch 数量
    pub fn record_batch(
        &mut self,
        device: &dyn GfxDevice,
        cmd: &GfxCommandBuffer,
        frame_label: FrameLabel,
        textures: &mut SlotMap<TextureHandle, GfxTexture>,
        pipeline: &GfxComputePipeline,
        uav_set: (u32, vk::DescriptorSet),
    ) -> GfxResult<usize> {
        let _span = tracy_client::span!("MipGenerator::record_batch");

        let batch_len = self.requests.len().min(MAX_MIP_REQUESTS_PER_FRAME);
        if batch_len == 0 {
            return Ok(0);
        }

        cmd.cmd_bind_pipeline(device, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline());
        cmd.cmd_bind_descriptor_sets(
            device,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.layout(),
            uav_set.0,
            &[uav_set.1],
        );

        let mut dispatch_count = 0;
        for (idx, request) in self.requests.drain(..batch_len).enumerate() {
            let Some(texture) = textures.get_mut(request.texture) else {
                log::warn!("mip request for a released texture is skipped");
                continue;
            };

            texture.image_mut().transition(device, cmd, ResourceState::UnorderedAccess);
            for (pass_idx, pass) in request.passes().iter().enumerate() {
                if pass_idx > 0 {
                    cmd.memory_barrier(device, &[mip_pass_barrier()]);
                }

                let slice = (*frame_label * MAX_MIP_REQUESTS_PER_FRAME + idx) * MAX_MIP_PASSES + pass_idx;
                self.constants.upload(device, slice, &request.constants(pass))?;
                let push_constants = MipGenPushConstants {
                    constants_address: self.constants.frame_gpu_address(slice),
                };
                cmd.cmd_push_constants(
                    device,
                    pipeline.layout(),
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push_constants),
                );
                cmd.cmd_dispatch(device, pass.group_count());
                dispatch_count += 1;
            }
            texture.image_mut().transition(device, cmd, ResourceState::ShaderResource);
        }
        Ok(dispatch_count)
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::descriptors::descriptor_heap::GfxDescriptorKind;

    use super::*;

    fn request(mip_count: u32, width: u32, height: u32) -> MipRequest {
        MipRequest {
            texture: TextureHandle::default(),
            base_uav: GfxDescriptorSlot {
                kind: GfxDescriptorKind::Uav,
                index: 10,
            },
            mip_count,
            width,
            height,
        }
    }

    #[test]
    fn test_group_count_rounds_up() {
        let passes = request(6, 100, 64).passes();
        assert_eq!(passes.len(), 1);
        assert_eq!(passes[0].group_count(), glam::uvec3(4, 2, 1));
    }

    #[test]
    fn test_long_chain_continues_from_last_written_mip() {
        let request = request(9, 256, 256);
        let passes = request.passes();
        assert_eq!(
            passes,
            vec![
                MipPass {
                    src_mip: 0,
                    mip_count: 6,
                    width: 256,
                    height: 256,
                },
                MipPass {
                    src_mip: 5,
                    mip_count: 4,
                    width: 8,
                    height: 8,
                },
            ]
        );
        assert_eq!(passes[0].group_count(), glam::uvec3(8, 8, 1));
        assert_eq!(passes[1].group_count(), glam::uvec3(1, 1, 1));

        // 每一级 mip 1..9 恰好由一个 pass 写入
        let mut written = passes.iter().flat_map(|p| p.src_mip + 1..p.src_mip + p.mip_count).collect::<Vec<_>>();
        written.sort();
        assert_eq!(written, (1..9).collect::<Vec<_>>());

        assert_eq!(request.constants(&passes[1]).base_uav_index, 15);
    }

    #[test]
    fn test_single_level_has_no_pass() {
        assert!(request(1, 1, 1).passes().is_empty());
        assert_eq!(request(2, 2, 2).passes().len(), 1);
    }

    #[test]
    fn test_max_texture_fits_in_pass_limit() {
        let mip_count = u32::BITS - 16384u32.leading_zeros();
        assert_eq!(mip_count, 15);
        assert!(request(mip_count, 16384, 16384).passes().len() <= MAX_MIP_PASSES);
    }

    #[test]
    fn test_constants_layout() {
        assert_eq!(size_of::<MipGenConstants>(), 16);
        assert_eq!(size_of::<MipGenPushConstants>(), 8);
    }
}
