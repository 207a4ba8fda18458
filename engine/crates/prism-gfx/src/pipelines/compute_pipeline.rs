use std::{ffi::CStr, io::Cursor, path::Path};

use ash::vk;

use crate::{
    device::GfxDevice,
    error::{GfxError, GfxResult},
    resources::releasable::GfxReleasable,
};

/// compute pipeline 以及它的 layout
///
/// layout 由一组 bindless set layout 和一个 push constant range 组成
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxComputePipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    push_constant_size: u32,
}
// new & init
impl GfxComputePipeline {
    pub fn new(
        device: &dyn GfxDevice,
        spirv: &[u32],
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
        name: &str,
    ) -> GfxResult<Self> {
        assert!(
            push_constant_size <= device.limits().max_push_constants_size,
            "compute pipeline {}: push constant size {} exceeds device limit",
            name,
            push_constant_size
        );

        let push_constant_ranges = if push_constant_size > 0 {
            vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: push_constant_size,
            }]
        } else {
            vec![]
        };
        let layout = device.create_pipeline_layout(set_layouts, &push_constant_ranges, name)?;

        let module = match device.create_shader_module(spirv, name) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };
        let pipeline = device.create_compute_pipeline(layout, module, c"main", name);
        // pipeline 创建完成后 shader module 就不再需要了
        device.destroy_shader_module(module);

        match pipeline {
            Ok(pipeline) => Ok(Self {
                pipeline,
                layout,
                push_constant_size,
            }),
            Err(e) => {
                device.destroy_pipeline_layout(layout);
                Err(e)
            }
        }
    }

    /// 从编译好的 SPIR-V 文件创建
    pub fn from_spv_file(
        device: &dyn GfxDevice,
        path: &Path,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
        name: &str,
    ) -> GfxResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GfxError::ShaderNotFound(path.to_path_buf()),
            _ => GfxError::Io(e),
        })?;
        let spirv = ash::util::read_spv(&mut Cursor::new(bytes))?;
        Self::new(device, &spirv, set_layouts, push_constant_size, name)
    }

    pub fn destroy(self, device: &dyn GfxDevice) {
        device.destroy_pipeline(self.pipeline);
        device.destroy_pipeline_layout(self.layout);
    }
}
// getters
impl GfxComputePipeline {
    #[inline]
    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    #[inline]
    pub fn entry_point() -> &'static CStr {
        c"main"
    }
}

impl GfxReleasable for GfxComputePipeline {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        "GfxComputePipeline".to_string()
    }
}
