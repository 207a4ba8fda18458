use crate::{
    device::GfxDevice,
    resources::{
        buffer::GfxBuffer,
        image::GfxImage,
        image_view::GfxImageView,
        mesh::{GfxMesh, GfxMeshRef},
        resource_handle::GfxResourceHandle,
        upload_ring_buffer::UploadRingBuffer,
    },
};

/// 可以交给 deferred release 队列延迟销毁的对象
pub trait GfxReleasable {
    fn release(self: Box<Self>, device: &dyn GfxDevice);

    fn release_name(&self) -> String;
}

impl GfxReleasable for GfxBuffer {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        format!("GfxBuffer::{}", self.debug_name())
    }
}

impl GfxReleasable for GfxImage {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        format!("GfxImage::{}", self.name())
    }
}

impl GfxReleasable for GfxImageView {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        "GfxImageView".to_string()
    }
}

impl GfxReleasable for GfxResourceHandle {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        match (self.as_buffer(), self.as_image()) {
            (Some(buffer), _) => format!("GfxResourceHandle::{}", buffer.debug_name()),
            (_, Some(image)) => format!("GfxResourceHandle::{}", image.name()),
            _ => "GfxResourceHandle".to_string(),
        }
    }
}

impl GfxReleasable for GfxMesh {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        format!("GfxMesh::{}", self.name())
    }
}

/// BLAS 仍持有引用时只释放这一份引用，mesh 由最后一个持有者（BLAS）销毁
impl GfxReleasable for GfxMeshRef {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        match std::rc::Rc::try_unwrap(*self) {
            Ok(mesh) => mesh.into_inner().destroy(device),
            Err(shared) => log::debug!("mesh {} is still referenced by a blas, drop this reference", shared.borrow().name()),
        }
    }

    fn release_name(&self) -> String {
        format!("GfxMeshRef::{}", self.borrow().name())
    }
}

impl GfxReleasable for UploadRingBuffer {
    fn release(self: Box<Self>, device: &dyn GfxDevice) {
        (*self).destroy(device);
    }

    fn release_name(&self) -> String {
        format!("UploadRingBuffer::{}", self.buffer().debug_name())
    }
}
