//! 加速结构的公共部分
//!
//! 构建分为两个阶段：
//! 1. prebuild：查询大小，分配 result buffer，创建加速结构对象
//! 2. build：在 command buffer 中记录构建命令，scratch buffer 由调用者提供，可以在多个结构之间共享
//!
//! 状态只会沿 Unbuilt -> Prebuilt -> Built 前进

use std::cell::Cell;

use ash::vk;

use crate::{
    commands::{barrier::GfxMemoryBarrier, command_buffer::GfxCommandBuffer},
    device::{GfxAsGeometryDesc, GfxDevice},
    error::GfxResult,
    resources::buffer::GfxBuffer,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GfxAsBuildState {
    Unbuilt,
    Prebuilt,
    Built,
}

/// 构建所需的内存大小
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GfxAsPrebuildInfo {
    pub result_size: vk::DeviceSize,
    pub scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

/// 多个加速结构共享一个 scratch buffer 时需要的大小：取最大值而不是求和
pub fn max_scratch_size<'a>(infos: impl IntoIterator<Item = &'a GfxAsPrebuildInfo>) -> vk::DeviceSize {
    infos.into_iter().map(|info| info.scratch_size).max().unwrap_or(0)
}

pub struct GfxAccelerationStructure {
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,

    /// build 只需要共享引用（TLAS 通过 Rc 持有 BLAS）
    state: Cell<GfxAsBuildState>,
    prebuild_info: GfxAsPrebuildInfo,

    result_buffer: Option<GfxBuffer>,
    handle: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,

    name: String,
}
// new & init
impl GfxAccelerationStructure {
    pub fn new(ty: vk::AccelerationStructureTypeKHR, flags: vk::BuildAccelerationStructureFlagsKHR, name: &str) -> Self {
        Self {
            ty,
            flags,
            state: Cell::new(GfxAsBuildState::Unbuilt),
            prebuild_info: GfxAsPrebuildInfo::default(),
            result_buffer: None,
            handle: vk::AccelerationStructureKHR::null(),
            device_address: 0,
            name: name.to_string(),
        }
    }

    /// 查询大小，创建 result buffer 以及加速结构对象
    pub fn prebuild(&mut self, device: &dyn GfxDevice, desc: &GfxAsGeometryDesc<'_>) -> GfxResult<()> {
        assert_eq!(
            self.state.get(),
            GfxAsBuildState::Unbuilt,
            "acceleration structure {}: prebuild called twice",
            self.name
        );
        debug_assert_eq!(desc.ty, self.ty);

        let prebuild_info = device.acceleration_structure_build_sizes(desc);
        assert!(
            prebuild_info.result_size > 0,
            "acceleration structure {}: result size is zero",
            self.name
        );

        let result_buffer =
            GfxBuffer::new_acceleration_buffer(device, prebuild_info.result_size, format!("{}-result", self.name))?;
        let handle = match device.create_acceleration_structure(
            self.ty,
            result_buffer.vk_buffer(),
            prebuild_info.result_size,
            &self.name,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                result_buffer.destroy(device);
                return Err(e);
            }
        };

        self.device_address = device.acceleration_structure_address(handle);
        self.handle = handle;
        self.result_buffer = Some(result_buffer);
        self.prebuild_info = prebuild_info;
        self.state.set(GfxAsBuildState::Prebuilt);

        log::debug!(
            "prebuild {}: result {} bytes, scratch {} bytes",
            self.name,
            prebuild_info.result_size,
            prebuild_info.scratch_size
        );
        Ok(())
    }

    /// 在 cmd 中记录构建命令
    ///
    /// emit_build_barrier: 是否在构建之后插入 build write -> read 的 memory barrier，
    /// 同一批 BLAS 之间不需要，BLAS 与 TLAS 之间需要
    pub fn record_build(
        &self,
        device: &dyn GfxDevice,
        cmd: &GfxCommandBuffer,
        desc: &GfxAsGeometryDesc<'_>,
        scratch: &GfxBuffer,
        emit_build_barrier: bool,
    ) {
        self.check_buildable(scratch);

        cmd.build_acceleration_structure(device, desc, self.handle, scratch.device_address());
        if emit_build_barrier {
            cmd.memory_barrier(device, &[GfxMemoryBarrier::acceleration_structure_build()]);
        }
        self.state.set(GfxAsBuildState::Built);
    }

    /// build 之前的检查：必须已经 prebuild，scratch buffer 必须足够大
    pub fn check_buildable(&self, scratch: &GfxBuffer) {
        assert_ne!(
            self.state.get(),
            GfxAsBuildState::Unbuilt,
            "acceleration structure {}: build called before prebuild",
            self.name
        );
        assert!(
            scratch.size() >= self.prebuild_info.scratch_size,
            "acceleration structure {}: scratch buffer too small, {} < {}",
            self.name,
            scratch.size(),
            self.prebuild_info.scratch_size
        );
    }

    pub fn destroy(mut self, device: &dyn GfxDevice) {
        if self.handle != vk::AccelerationStructureKHR::null() {
            device.destroy_acceleration_structure(self.handle);
            self.handle = vk::AccelerationStructureKHR::null();
        }
        if let Some(buffer) = self.result_buffer.take() {
            buffer.destroy(device);
        }
    }
}
// getters
impl GfxAccelerationStructure {
    #[inline]
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    #[inline]
    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    #[inline]
    pub fn state(&self) -> GfxAsBuildState {
        self.state.get()
    }

    #[inline]
    pub fn prebuild_info(&self) -> &GfxAsPrebuildInfo {
        &self.prebuild_info
    }

    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// prebuild 之后才有效
    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        assert_ne!(
            self.state.get(),
            GfxAsBuildState::Unbuilt,
            "acceleration structure {}: device address queried before prebuild",
            self.name
        );
        self.device_address
    }

    #[inline]
    pub fn result_buffer(&self) -> Option<&GfxBuffer> {
        self.result_buffer.as_ref()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_scratch_size_takes_max() {
        let infos = [10, 50, 30].map(|scratch_size| GfxAsPrebuildInfo {
            result_size: 256,
            scratch_size,
            update_scratch_size: 0,
        });
        assert_eq!(max_scratch_size(&infos), 50);
        assert_eq!(max_scratch_size(&[]), 0);
    }
}
