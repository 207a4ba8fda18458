//! 资源驻留状态
//!
//! [`ResourceState`] 是资源在命令流中的逻辑状态，映射到 Vulkan 的
//! pipeline stage、access mask 以及 image layout。

use ash::vk;

/// 资源在命令流中的使用方式
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// 刚创建，内容未定义
    #[default]
    Undefined,
    /// 通用状态，可以用于任何操作
    Common,
    CopyDest,
    CopySource,
    /// shader 只读，包括加速结构构建时对几何数据的读取
    ShaderResource,
    /// shader 读写（storage image / storage buffer）
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    /// 作为 vertex buffer 或 index buffer 绑定
    VertexAndIndexBuffer,
    ConstantBuffer,
    AccelerationStructure,
    Present,
}

/// image 在某个状态下的 stage、access 与 layout
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxImageState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

/// buffer 在某个状态下的 stage 与 access
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxBufferState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw()
        | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw(),
);

const SHADER_READ_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    SHADER_STAGES.as_raw() | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw(),
);

const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

impl ResourceState {
    pub const fn stage(self) -> vk::PipelineStageFlags2 {
        match self {
            Self::Undefined => vk::PipelineStageFlags2::TOP_OF_PIPE,
            Self::Common => vk::PipelineStageFlags2::ALL_COMMANDS,
            Self::CopyDest | Self::CopySource => vk::PipelineStageFlags2::TRANSFER,
            Self::ShaderResource => SHADER_READ_STAGES,
            Self::UnorderedAccess | Self::ConstantBuffer => SHADER_STAGES,
            Self::RenderTarget => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthWrite => vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
            ),
            Self::VertexAndIndexBuffer => vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT.as_raw()
                    | vk::PipelineStageFlags2::INDEX_INPUT.as_raw(),
            ),
            Self::AccelerationStructure => vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw()
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw(),
            ),
            Self::Present => vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        }
    }

    pub const fn access(self) -> vk::AccessFlags2 {
        match self {
            Self::Undefined | Self::Present => vk::AccessFlags2::NONE,
            Self::Common => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
            ),
            Self::CopyDest => vk::AccessFlags2::TRANSFER_WRITE,
            Self::CopySource => vk::AccessFlags2::TRANSFER_READ,
            Self::ShaderResource => vk::AccessFlags2::SHADER_READ,
            Self::UnorderedAccess => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::SHADER_STORAGE_READ.as_raw() | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
            ),
            Self::RenderTarget => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw() | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
            ),
            Self::DepthWrite => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
            ),
            Self::VertexAndIndexBuffer => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw() | vk::AccessFlags2::INDEX_READ.as_raw(),
            ),
            Self::ConstantBuffer => vk::AccessFlags2::UNIFORM_READ,
            Self::AccelerationStructure => vk::AccessFlags2::from_raw(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
            ),
        }
    }

    /// buffer 没有 layout 的概念，非 image 专属的状态统一使用 GENERAL
    pub const fn layout(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::Common
            | Self::UnorderedAccess
            | Self::VertexAndIndexBuffer
            | Self::ConstantBuffer
            | Self::AccelerationStructure => vk::ImageLayout::GENERAL,
        }
    }

    #[inline]
    pub const fn image_state(self) -> GfxImageState {
        GfxImageState {
            stage: self.stage(),
            access: self.access(),
            layout: self.layout(),
        }
    }

    #[inline]
    pub const fn buffer_state(self) -> GfxBufferState {
        GfxBufferState {
            stage: self.stage(),
            access: self.access(),
        }
    }

    /// 是否包含写操作
    #[inline]
    pub const fn is_write(self) -> bool {
        self.access().as_raw() & WRITE_ACCESS.as_raw() != 0
    }

    /// 作为 barrier 的 src access：只读状态不需要 flush
    #[inline]
    pub const fn src_access(self) -> vk::AccessFlags2 {
        if self.is_write() {
            vk::AccessFlags2::from_raw(self.access().as_raw() & WRITE_ACCESS.as_raw())
        } else {
            vk::AccessFlags2::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layouts() {
        assert_eq!(ResourceState::Undefined.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(ResourceState::CopyDest.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(ResourceState::ShaderResource.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(ResourceState::UnorderedAccess.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(ResourceState::Present.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_write_detection() {
        assert!(ResourceState::CopyDest.is_write());
        assert!(ResourceState::UnorderedAccess.is_write());
        assert!(ResourceState::RenderTarget.is_write());
        assert!(!ResourceState::ShaderResource.is_write());
        assert!(!ResourceState::VertexAndIndexBuffer.is_write());
        assert!(!ResourceState::Undefined.is_write());
    }

    #[test]
    fn test_src_access_drops_reads() {
        assert_eq!(ResourceState::ShaderResource.src_access(), vk::AccessFlags2::NONE);
        assert_eq!(ResourceState::UnorderedAccess.src_access(), vk::AccessFlags2::SHADER_STORAGE_WRITE);
    }

    #[test]
    fn test_shader_resource_covers_as_build() {
        assert!(ResourceState::ShaderResource.stage().contains(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR));
    }
}
