use std::rc::Rc;

use ash::vk;

use crate::{
    basic::bytes::BytesConvert,
    commands::command_buffer::GfxCommandBuffer,
    device::{GfxAsGeometryDesc, GfxDevice},
    error::GfxResult,
    raytracing::{
        acceleration::{GfxAccelerationStructure, GfxAsBuildState, GfxAsPrebuildInfo},
        blas::Blas,
    },
    resources::{buffer::GfxBuffer, releasable::GfxReleasable},
};

/// 顶层加速结构
///
/// instance 列表只能在 prebuild 之前追加；每个 instance 共享其引用的 BLAS，
/// 因此只要 TLAS 还活着，BLAS 就不会被销毁
pub struct Tlas {
    base: GfxAccelerationStructure,

    blases: Vec<Rc<Blas>>,
    /// 和 blases 一一对应，按添加顺序排列
    instances: Vec<vk::AccelerationStructureInstanceKHR>,
    /// prebuild 时创建并写入，持久映射
    instance_buffer: Option<GfxBuffer>,
}
// new & init
impl Tlas {
    pub fn new(name: &str) -> Self {
        Self {
            base: GfxAccelerationStructure::new(
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
                name,
            ),
            blases: vec![],
            instances: vec![],
            instance_buffer: None,
        }
    }

    /// 追加一个 instance
    ///
    /// - transform: 物体到世界空间的变换，写入时转为 3x4 行主序
    /// - mask: 和 trace ray 的 cull mask 做与运算
    /// - instance_id: shader 中 `InstanceID()` 的值，必须小于 2^24
    /// - hit_group_offset: SBT 中 hit group 的偏移，必须小于 2^24
    pub fn add_descriptor(
        &mut self,
        blas: Rc<Blas>,
        transform: &glam::Mat4,
        mask: u8,
        instance_id: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        hit_group_offset: u32,
    ) {
        assert_eq!(
            self.base.state(),
            GfxAsBuildState::Unbuilt,
            "tlas {}: instances can only be added before prebuild",
            self.base.name()
        );
        assert!(instance_id < (1 << 24), "tlas {}: instance id {} exceeds 24 bits", self.base.name(), instance_id);
        assert!(
            hit_group_offset < (1 << 24),
            "tlas {}: hit group offset {} exceeds 24 bits",
            self.base.name(),
            hit_group_offset
        );

        // BLAS 未 prebuild 时这里会 panic
        let blas_address = blas.device_address();
        self.instances.push(vk::AccelerationStructureInstanceKHR {
            transform: Self::rt_matrix(transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(instance_id, mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                hit_group_offset,
                flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas_address,
            },
        });
        self.blases.push(blas);
    }

    /// 查询大小并创建加速结构，同时创建 instance buffer 并写入所有 instance
    pub fn prebuild(&mut self, device: &dyn GfxDevice) -> GfxResult<()> {
        // size 查询不读取 instance 数据，地址可以为 0
        let geometries = [Self::instance_geometry(0)];
        let primitive_counts = [self.instances.len() as u32];
        self.base.prebuild(
            device,
            &GfxAsGeometryDesc {
                ty: self.base.ty(),
                flags: self.base.flags(),
                geometries: &geometries,
                primitive_counts: &primitive_counts,
            },
        )?;

        let instance_buffer = GfxBuffer::new_build_input_buffer(
            device,
            size_of_val(self.instances.as_slice()) as vk::DeviceSize,
            vk::BufferUsageFlags::empty(),
            format!("{}-instances", self.base.name()),
        )?;
        instance_buffer.write_bytes(device, 0, self.instance_bytes())?;
        self.instance_buffer = Some(instance_buffer);

        Ok(())
    }

    pub fn build(&self, device: &dyn GfxDevice, cmd: &GfxCommandBuffer, scratch: &GfxBuffer, emit_build_barrier: bool) {
        let _span = tracy_client::span!("Tlas::build");
        self.base.check_buildable(scratch);

        let instance_address = self.instance_buffer.as_ref().map_or(0, |buffer| buffer.device_address());
        let geometries = [Self::instance_geometry(instance_address)];
        let primitive_counts = [self.instances.len() as u32];
        self.base.record_build(
            device,
            cmd,
            &GfxAsGeometryDesc {
                ty: self.base.ty(),
                flags: self.base.flags(),
                geometries: &geometries,
                primitive_counts: &primitive_counts,
            },
            scratch,
            emit_build_barrier,
        );
    }

    /// 释放 TLAS 自身的资源；TLAS 是最后一个持有者的 BLAS 一并销毁
    pub fn destroy(mut self, device: &dyn GfxDevice) {
        if let Some(buffer) = self.instance_buffer.take() {
            buffer.destroy(device);
        }
        self.base.destroy(device);
        for blas in self.blases.drain(..) {
            if let Ok(blas) = Rc::try_unwrap(blas) {
                blas.destroy(device);
            }
        }
    }
}
// getters
impl Tlas {
    #[inline]
    pub fn state(&self) -> GfxAsBuildState {
        self.base.state()
    }

    #[inline]
    pub fn prebuild_info(&self) -> &GfxAsPrebuildInfo {
        self.base.prebuild_info()
    }

    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.base.device_address()
    }

    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.base.handle()
    }

    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    #[inline]
    pub fn instances(&self) -> &[vk::AccelerationStructureInstanceKHR] {
        &self.instances
    }

    #[inline]
    pub fn blases(&self) -> &[Rc<Blas>] {
        &self.blases
    }

    /// 上传到 instance buffer 的数据
    #[inline]
    pub fn instance_bytes(&self) -> &[u8] {
        BytesConvert::slice_bytes(&self.instances)
    }

    #[inline]
    pub fn instance_buffer(&self) -> Option<&GfxBuffer> {
        self.instance_buffer.as_ref()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.base.name()
    }
}
// tools
impl Tlas {
    fn instance_geometry(instance_address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    // false: data 是 &[vk::AccelerationStructureInstanceKHR]
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_address,
                    }),
            })
    }

    /// 3x4 行主序
    fn rt_matrix(transform: &glam::Mat4) -> vk::TransformMatrixKHR {
        let c1 = &transform.x_axis;
        let c2 = &transform.y_axis;
        let c3 = &transform.z_axis;
        let c4 = &transform.w_axis;

        vk::TransformMatrixKHR {
            matrix: [
                c1.x, c2.x, c3.x, c4.x, // row 1
                c1.y, c2.y, c3.y, c4.y, // row 2
                c1.z, c2.z, c3.z, c4.z, // row 3
            ],
        }
    }
}

impl GfxReleasable for Tlas {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        format!("Tlas::{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{HeadlessCommand, HeadlessDevice},
        commands::command_pool::GfxCommandPool,
        resources::mesh::GfxMesh,
    };

    fn prebuilt_blas(device: &HeadlessDevice) -> Rc<Blas> {
        let vertices: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let mesh = GfxMesh::from_data(device, &vertices, &[0, 1, 2], "tri").unwrap().into_shared();
        let mut blas = Blas::from_meshes(vec![mesh], "tri-blas");
        blas.prebuild(device).unwrap();
        Rc::new(blas)
    }

    fn instance_transform(bytes: &[u8]) -> Vec<f32> {
        bytes[..48].chunks_exact(4).map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn test_instance_buffer_is_byte_exact() {
        let device = HeadlessDevice::new();
        let blas = prebuilt_blas(&device);
        let mut tlas = Tlas::new("scene-tlas");

        tlas.add_descriptor(
            blas.clone(),
            &glam::Mat4::from_translation(glam::vec3(5.0, 0.0, 0.0)),
            0xFF,
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0,
        );
        tlas.add_descriptor(
            blas.clone(),
            &glam::Mat4::from_translation(glam::vec3(-5.0, 0.0, 0.0)),
            0xFF,
            1,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0,
        );
        tlas.prebuild(&device).unwrap();

        let instance_size = size_of::<vk::AccelerationStructureInstanceKHR>();
        assert_eq!(instance_size, 64);

        let bytes = tlas.instance_buffer().unwrap().mapped_bytes();
        assert_eq!(bytes.len(), 2 * instance_size);
        assert_eq!(bytes, tlas.instance_bytes());

        assert_eq!(
            instance_transform(&bytes[..instance_size]),
            vec![1.0, 0.0, 0.0, 5.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
        assert_eq!(
            instance_transform(&bytes[instance_size..]),
            vec![1.0, 0.0, 0.0, -5.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );

        // 引用的 BLAS 地址
        let reference = u64::from_ne_bytes(bytes[56..64].try_into().unwrap());
        assert_eq!(reference, blas.device_address());
        assert_eq!(Rc::strong_count(&blas), 3);

        tlas.destroy(&device);
        assert_eq!(Rc::strong_count(&blas), 1);
    }

    #[test]
    fn test_build_records_instance_address() {
        let device = HeadlessDevice::new();
        let pool = GfxCommandPool::new(&device, vk::CommandPoolCreateFlags::TRANSIENT, "test-pool").unwrap();
        let cmd = GfxCommandBuffer::new(&device, &pool, "test-cmd").unwrap();
        device.begin_command_buffer(cmd.vk_handle(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();

        let blas = prebuilt_blas(&device);
        let mut tlas = Tlas::new("scene-tlas");
        tlas.add_descriptor(blas, &glam::Mat4::IDENTITY, 0xFF, 0, vk::GeometryInstanceFlagsKHR::empty(), 0);
        tlas.prebuild(&device).unwrap();

        let scratch = GfxBuffer::new_scratch_buffer(&device, tlas.prebuild_info().scratch_size, "scratch").unwrap();
        tlas.build(&device, &cmd, &scratch, false);

        let expected = tlas.instance_buffer().unwrap().device_address();
        let recorded = device.recorded_commands(cmd.vk_handle()).into_iter().find_map(|c| match c {
            HeadlessCommand::BuildAccelerationStructure {
                ty,
                instance_address,
                ..
            } => Some((ty, instance_address)),
            _ => None,
        });
        assert_eq!(recorded, Some((vk::AccelerationStructureTypeKHR::TOP_LEVEL, Some(expected))));
        assert_eq!(tlas.state(), GfxAsBuildState::Built);

        scratch.destroy(&device);
        tlas.destroy(&device);
        pool.destroy(&device);
    }

    #[test]
    #[should_panic(expected = "instances can only be added before prebuild")]
    fn test_add_after_prebuild_panics() {
        let device = HeadlessDevice::new();
        let blas = prebuilt_blas(&device);
        let mut tlas = Tlas::new("scene-tlas");
        tlas.add_descriptor(blas.clone(), &glam::Mat4::IDENTITY, 0xFF, 0, vk::GeometryInstanceFlagsKHR::empty(), 0);
        tlas.prebuild(&device).unwrap();

        tlas.add_descriptor(blas, &glam::Mat4::IDENTITY, 0xFF, 1, vk::GeometryInstanceFlagsKHR::empty(), 0);
    }

    #[test]
    #[should_panic(expected = "result size is zero")]
    fn test_empty_tlas_prebuild_panics() {
        let device = HeadlessDevice::new();
        let mut tlas = Tlas::new("empty-tlas");
        let _ = tlas.prebuild(&device);
    }

    #[test]
    #[should_panic(expected = "device address queried before prebuild")]
    fn test_unprebuilt_blas_is_rejected() {
        let device = HeadlessDevice::new();
        let vertices: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let mesh = GfxMesh::from_data(&device, &vertices, &[0, 1, 2], "tri").unwrap().into_shared();
        let blas = Rc::new(Blas::from_meshes(vec![mesh], "tri-blas"));

        let mut tlas = Tlas::new("scene-tlas");
        tlas.add_descriptor(blas, &glam::Mat4::IDENTITY, 0xFF, 0, vk::GeometryInstanceFlagsKHR::empty(), 0);
    }

    #[test]
    #[should_panic(expected = "hit group offset 16777216 exceeds 24 bits")]
    fn test_hit_group_offset_out_of_range_panics() {
        let device = HeadlessDevice::new();
        let blas = prebuilt_blas(&device);
        let mut tlas = Tlas::new("scene-tlas");
        tlas.add_descriptor(blas, &glam::Mat4::IDENTITY, 0xFF, 0, vk::GeometryInstanceFlagsKHR::empty(), 1 << 24);
    }
}
