use std::rc::Rc;

use ash::vk;

use crate::{
    basic::bytes::BytesConvert,
    commands::command_buffer::GfxCommandBuffer,
    device::{GfxAsGeometryDesc, GfxDevice},
    error::GfxResult,
    raytracing::acceleration::{GfxAccelerationStructure, GfxAsBuildState, GfxAsPrebuildInfo},
    resources::{
        buffer::GfxBuffer, mesh::GfxMeshRef, releasable::GfxReleasable, resource_handle::GfxBarrierBatch,
        resource_state::ResourceState,
    },
};

/// `vk::AabbPositionsKHR` 的大小
const AABB_STRIDE: vk::DeviceSize = 24;

pub enum BlasGeometry {
    /// 每个 mesh 对应一个 triangle geometry
    Meshes(Vec<GfxMeshRef>),
    /// procedural geometry，aabb buffer 由 BLAS 持有
    Aabbs { buffer: GfxBuffer, count: u32 },
}

pub struct Blas {
    base: GfxAccelerationStructure,
    geometry: BlasGeometry,
}
// new & init
impl Blas {
    pub fn from_meshes(meshes: Vec<GfxMeshRef>, name: &str) -> Self {
        assert!(!meshes.is_empty(), "blas {}: at least one mesh is required", name);
        Self {
            base: GfxAccelerationStructure::new(
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
                name,
            ),
            geometry: BlasGeometry::Meshes(meshes),
        }
    }

    pub fn from_aabbs(device: &dyn GfxDevice, aabbs: &[vk::AabbPositionsKHR], name: &str) -> GfxResult<Self> {
        assert!(!aabbs.is_empty(), "blas {}: at least one aabb is required", name);
        let buffer = GfxBuffer::new_build_input_buffer(
            device,
            AABB_STRIDE * aabbs.len() as vk::DeviceSize,
            vk::BufferUsageFlags::empty(),
            format!("{}-aabbs", name),
        )?;
        buffer.write_bytes(device, 0, BytesConvert::slice_bytes(aabbs))?;

        Ok(Self {
            base: GfxAccelerationStructure::new(
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
                name,
            ),
            geometry: BlasGeometry::Aabbs {
                buffer,
                count: aabbs.len() as u32,
            },
        })
    }

    pub fn prebuild(&mut self, device: &dyn GfxDevice) -> GfxResult<()> {
        let (geometries, primitive_counts) = self.geometries();
        let desc = GfxAsGeometryDesc {
            ty: self.base.ty(),
            flags: self.base.flags(),
            geometries: &geometries,
            primitive_counts: &primitive_counts,
        };
        self.base.prebuild(device, &desc)
    }

    /// 记录 BLAS 的构建
    ///
    /// mesh 的 vertex/index buffer 在构建期间被转换到 ShaderResource，构建后恢复原来的状态
    pub fn build(&self, device: &dyn GfxDevice, cmd: &GfxCommandBuffer, scratch: &GfxBuffer, emit_build_barrier: bool) {
        let _span = tracy_client::span!("Blas::build");
        self.base.check_buildable(scratch);

        let previous_states = self.transition_meshes_for_build(device, cmd);

        let (geometries, primitive_counts) = self.geometries();
        let desc = GfxAsGeometryDesc {
            ty: self.base.ty(),
            flags: self.base.flags(),
            geometries: &geometries,
            primitive_counts: &primitive_counts,
        };
        self.base.record_build(device, cmd, &desc, scratch, emit_build_barrier);

        self.restore_mesh_states(device, cmd, previous_states);
    }

    /// mesh 只有在这里是最后一个持有者时才会销毁，否则交给其他持有者
    pub fn destroy(self, device: &dyn GfxDevice) {
        self.base.destroy(device);
        match self.geometry {
            BlasGeometry::Aabbs { buffer, .. } => buffer.destroy(device),
            BlasGeometry::Meshes(meshes) => {
                for mesh in meshes {
                    if let Ok(mesh) = Rc::try_unwrap(mesh) {
                        mesh.into_inner().destroy(device);
                    }
                }
            }
        }
    }
}
// getters
impl Blas {
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
    pub fn geometry(&self) -> &BlasGeometry {
        &self.geometry
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.base.name()
    }
}
// tools
impl Blas {
    /// 当前几何数据对应的 geometry 以及每个 geometry 的 primitive 数量
    fn geometries(&self) -> (Vec<vk::AccelerationStructureGeometryKHR<'static>>, Vec<u32>) {
        match &self.geometry {
            BlasGeometry::Meshes(meshes) => meshes
                .iter()
                .map(|mesh| {
                    let mesh = mesh.borrow();
                    let geometry = vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR {
                            triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                                .vertex_format(mesh.vertex_format())
                                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                                    device_address: mesh.vertex_address(),
                                })
                                .vertex_stride(mesh.vertex_stride())
                                .max_vertex(mesh.vertex_count().saturating_sub(1))
                                .index_type(vk::IndexType::UINT32)
                                .index_data(vk::DeviceOrHostAddressConstKHR {
                                    device_address: mesh.index_address(),
                                }),
                        })
                        .flags(vk::GeometryFlagsKHR::OPAQUE);
                    (geometry, mesh.triangle_count())
                })
                .unzip(),
            BlasGeometry::Aabbs { buffer, count } => {
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                            .data(vk::DeviceOrHostAddressConstKHR {
                                device_address: buffer.device_address(),
                            })
                            .stride(AABB_STRIDE),
                    })
                    .flags(vk::GeometryFlagsKHR::OPAQUE);
                (vec![geometry], vec![*count])
            }
        }
    }

    fn transition_meshes_for_build(
        &self,
        device: &dyn GfxDevice,
        cmd: &GfxCommandBuffer,
    ) -> Vec<(ResourceState, ResourceState)> {
        let BlasGeometry::Meshes(meshes) = &self.geometry else {
            return vec![];
        };

        let mut batch = GfxBarrierBatch::new();
        let previous_states = meshes
            .iter()
            .map(|mesh| {
                let mut mesh = mesh.borrow_mut();
                let (vertex_buffer, index_buffer) = mesh.buffers_mut();
                let previous = (vertex_buffer.state(), index_buffer.state());
                batch.push(vertex_buffer, ResourceState::ShaderResource);
                batch.push(index_buffer, ResourceState::ShaderResource);
                previous
            })
            .collect();
        batch.record(device, cmd);
        previous_states
    }

    fn restore_mesh_states(
        &self,
        device: &dyn GfxDevice,
        cmd: &GfxCommandBuffer,
        previous_states: Vec<(ResourceState, ResourceState)>,
    ) {
        let BlasGeometry::Meshes(meshes) = &self.geometry else {
            return;
        };

        // 同一个 mesh 可能出现多次，逆序恢复才能回到最初的状态
        let mut batch = GfxBarrierBatch::new();
        for (mesh, (vertex_state, index_state)) in meshes.iter().zip(previous_states).rev() {
            let mut mesh = mesh.borrow_mut();
            let (vertex_buffer, index_buffer) = mesh.buffers_mut();
            batch.push(vertex_buffer, vertex_state);
            batch.push(index_buffer, index_state);
        }
        batch.record(device, cmd);
    }
}

impl GfxReleasable for Blas {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        format!("Blas::{}", self.name())
    }
}

/// 共享的 BLAS 由最后一个持有者销毁：这里不是最后一个时只释放引用，
/// 剩下的引用在 [`Tlas::destroy`](crate::raytracing::tlas::Tlas::destroy) 中销毁
impl GfxReleasable for Rc<Blas> {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        match Rc::try_unwrap(*self) {
            Ok(blas) => blas.destroy(device),
            Err(shared) => log::debug!("blas {} is still referenced by a tlas, drop this reference", shared.name()),
        }
    }

    fn release_name(&self) -> String {
        format!("Rc<Blas>::{}", self.name())
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

    fn quad_mesh(device: &HeadlessDevice) -> GfxMeshRef {
        let vertices: [[f32; 3]; 4] = [[-1.0, 0.0, -1.0], [1.0, 0.0, -1.0], [1.0, 0.0, 1.0], [-1.0, 0.0, 1.0]];
        GfxMesh::from_data(device, &vertices, &[0, 1, 2, 0, 2, 3], "quad").unwrap().into_shared()
    }

    fn recording_cmd(device: &HeadlessDevice) -> (GfxCommandPool, GfxCommandBuffer) {
        let pool = GfxCommandPool::new(device, vk::CommandPoolCreateFlags::TRANSIENT, "test-pool").unwrap();
        let cmd = GfxCommandBuffer::new(device, &pool, "test-cmd").unwrap();
        device.begin_command_buffer(cmd.vk_handle(), vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        (pool, cmd)
    }

    #[test]
    #[should_panic(expected = "build called before prebuild")]
    fn test_build_before_prebuild_panics() {
        let device = HeadlessDevice::new();
        let (_pool, cmd) = recording_cmd(&device);
        let blas = Blas::from_meshes(vec![quad_mesh(&device)], "quad-blas");
        let scratch = GfxBuffer::new_scratch_buffer(&device, 1024, "scratch").unwrap();

        blas.build(&device, &cmd, &scratch, false);
    }

    #[test]
    #[should_panic(expected = "prebuild called twice")]
    fn test_double_prebuild_panics() {
        let device = HeadlessDevice::new();
        let mut blas = Blas::from_meshes(vec![quad_mesh(&device)], "quad-blas");

        blas.prebuild(&device).unwrap();
        let _ = blas.prebuild(&device);
    }

    #[test]
    fn test_build_restores_mesh_states() {
        prism_crate_tools::init_log::init_test_log();
        let device = HeadlessDevice::new();
        let (pool, cmd) = recording_cmd(&device);
        let mesh = quad_mesh(&device);
        let mut blas = Blas::from_meshes(vec![mesh.clone()], "quad-blas");

        blas.prebuild(&device).unwrap();
        assert_eq!(blas.state(), GfxAsBuildState::Prebuilt);
        assert!(blas.prebuild_info().result_size > 0);

        let scratch = GfxBuffer::new_scratch_buffer(&device, blas.prebuild_info().scratch_size, "scratch").unwrap();
        blas.build(&device, &cmd, &scratch, true);
        assert_eq!(blas.state(), GfxAsBuildState::Built);

        let commands = device.recorded_commands(cmd.vk_handle());
        let barriers = commands.iter().filter(|c| matches!(c, HeadlessCommand::PipelineBarrier { .. })).count();
        // 进入 ShaderResource、构建后的 memory barrier、恢复原状态
        assert_eq!(barriers, 3);
        let builds = commands
            .iter()
            .filter_map(|c| match c {
                HeadlessCommand::BuildAccelerationStructure { primitive_counts, .. } => Some(primitive_counts.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(builds, vec![vec![2]]);

        assert_eq!(mesh.borrow().vertex_buffer().state(), ResourceState::VertexAndIndexBuffer);
        assert_eq!(mesh.borrow().index_buffer().state(), ResourceState::VertexAndIndexBuffer);

        // 允许对已经构建过的结构重新构建
        blas.build(&device, &cmd, &scratch, false);
        assert_eq!(blas.state(), GfxAsBuildState::Built);

        scratch.destroy(&device);
        blas.destroy(&device);
        if let Ok(mesh) = Rc::try_unwrap(mesh) {
            mesh.into_inner().destroy(&device);
        }
        pool.destroy(&device);
    }

    #[test]
    fn test_aabb_blas_owns_buffer() {
        let device = HeadlessDevice::new();
        let aabbs = [vk::AabbPositionsKHR {
            min_x: -1.0,
            min_y: -1.0,
            min_z: -1.0,
            max_x: 1.0,
            max_y: 1.0,
            max_z: 1.0,
        }];
        let mut blas = Blas::from_aabbs(&device, &aabbs, "sphere-blas").unwrap();
        blas.prebuild(&device).unwrap();

        let BlasGeometry::Aabbs { buffer, count } = blas.geometry() else {
            panic!("expected aabb geometry");
        };
        assert_eq!(*count, 1);
        assert_eq!(buffer.size(), AABB_STRIDE);
        assert_eq!(&buffer.mapped_bytes()[..4], &(-1.0f32).to_ne_bytes());

        let live_before = device.live_object_count();
        blas.destroy(&device);
        // result buffer、加速结构对象、aabb buffer
        assert_eq!(device.live_object_count(), live_before - 3);
    }
}
