//! 共享的 mesh / BLAS 由最后一个持有者销毁，与入队顺序无关

mod common;

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use prism_gfx::{
    backend::headless::HeadlessDevice,
    raytracing::{blas::Blas, tlas::Tlas},
    resources::{mesh::GfxMesh, releasable::GfxReleasable},
};
use prism_render_interface::deferred_release::DeferredReleaseQueue;

#[derive(Copy, Clone, Debug)]
enum Shared {
    Blas,
    Tlas,
    Mesh,
}

/// 一个 mesh、一个 BLAS、引用该 BLAS 两次的 TLAS，按给定顺序入队
fn release_in_order(order: &[Shared]) -> usize {
    let device = HeadlessDevice::new();

    let vertices: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    let mesh = GfxMesh::from_data(&device, &vertices, &[0, 1, 2], "tri").unwrap().into_shared();
    let mut blas = Blas::from_meshes(vec![mesh.clone()], "tri-blas");
    blas.prebuild(&device).unwrap();
    let blas = Rc::new(blas);

    let mut tlas = Tlas::new("tri-tlas");
    for x in [5.0, -5.0] {
        tlas.add_descriptor(
            blas.clone(),
            &glam::Mat4::from_translation(glam::vec3(x, 0.0, 0.0)),
            0xFF,
            0,
            vk::GeometryInstanceFlagsKHR::empty(),
            0,
        );
    }
    tlas.prebuild(&device).unwrap();
    assert!(device.live_object_count() > 0);

    let mut objects: Vec<Option<Box<dyn GfxReleasable>>> =
        vec![Some(Box::new(blas)), Some(Box::new(tlas)), Some(Box::new(mesh))];
    let mut queue = DeferredReleaseQueue::new();
    for item in order {
        if let Some(object) = objects[*item as usize].take() {
            queue.push(1, object);
        }
    }
    assert_eq!(queue.collect(&device, 1), 3);

    device.live_object_count()
}

#[test]
fn test_shared_objects_released_in_any_order() {
    common::init();
    for order in [Shared::Blas, Shared::Tlas, Shared::Mesh].into_iter().permutations(3) {
        assert_eq!(release_in_order(&order), 0, "release order {:?} leaks", order);
    }
}
