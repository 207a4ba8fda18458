use std::{cell::RefCell, rc::Rc};

use ash::vk;

use crate::{
    device::GfxDevice,
    error::GfxResult,
    resources::{
        buffer::GfxBuffer,
        resource_handle::GfxResourceHandle,
        resource_state::ResourceState,
    },
};

/// BLAS 和渲染代码共享同一个 mesh，状态转换需要可变访问
pub type GfxMeshRef = Rc<RefCell<GfxMesh>>;

/// 光栅化与加速结构构建共用的网格
///
/// vertex 的前 12 个字节必须是 `R32G32B32_SFLOAT` 的位置
pub struct GfxMesh {
    vertex_buffer: GfxResourceHandle,
    index_buffer: GfxResourceHandle,

    vertex_count: u32,
    index_count: u32,
    vertex_stride: vk::DeviceSize,

    name: String,
}
// new & init
impl GfxMesh {
    pub fn from_data<V: bytemuck::Pod>(
        device: &dyn GfxDevice,
        vertices: &[V],
        indices: &[u32],
        name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let name = name.as_ref();
        assert!(size_of::<V>() >= 12, "GfxMesh {}: vertex must start with a vec3 position", name);
        assert_eq!(indices.len() % 3, 0, "GfxMesh {}: index count must be a multiple of 3", name);

        let vertex_buffer = GfxBuffer::new_build_input_buffer(
            device,
            size_of_val(vertices) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            format!("{}-vertex", name),
        )?;
        vertex_buffer.transfer_data_by_mmap(device, vertices)?;

        let index_buffer = GfxBuffer::new_build_input_buffer(
            device,
            size_of_val(indices) as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
            format!("{}-index", name),
        )?;
        index_buffer.transfer_data_by_mmap(device, indices)?;

        Ok(Self {
            vertex_buffer: GfxResourceHandle::new_buffer(vertex_buffer, ResourceState::VertexAndIndexBuffer),
            index_buffer: GfxResourceHandle::new_buffer(index_buffer, ResourceState::VertexAndIndexBuffer),
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
            vertex_stride: size_of::<V>() as vk::DeviceSize,
            name: name.to_string(),
        })
    }

    #[inline]
    pub fn into_shared(self) -> GfxMeshRef {
        Rc::new(RefCell::new(self))
    }

    pub fn destroy(self, device: &dyn GfxDevice) {
        self.vertex_buffer.destroy(device);
        self.index_buffer.destroy(device);
    }
}
// getters
impl GfxMesh {
    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    #[inline]
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    #[inline]
    pub fn vertex_stride(&self) -> vk::DeviceSize {
        self.vertex_stride
    }

    #[inline]
    pub fn vertex_format(&self) -> vk::Format {
        vk::Format::R32G32B32_SFLOAT
    }

    #[inline]
    pub fn vertex_address(&self) -> vk::DeviceAddress {
        self.vertex_buffer.buffer().device_address()
    }

    #[inline]
    pub fn index_address(&self) -> vk::DeviceAddress {
        self.index_buffer.buffer().device_address()
    }

    #[inline]
    pub fn vertex_buffer(&self) -> &GfxResourceHandle {
        &self.vertex_buffer
    }

    #[inline]
    pub fn index_buffer(&self) -> &GfxResourceHandle {
        &self.index_buffer
    }

    /// vertex buffer 与 index buffer 的可变访问，用于状态转换
    #[inline]
    pub fn buffers_mut(&mut self) -> (&mut GfxResourceHandle, &mut GfxResourceHandle) {
        (&mut self.vertex_buffer, &mut self.index_buffer)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
