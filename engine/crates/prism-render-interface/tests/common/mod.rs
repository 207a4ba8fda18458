#![allow(dead_code)]

use std::{path::Path, rc::Rc};

use ash::vk;
use prism_gfx::{backend::headless::HeadlessDevice, device::GfxDevice};
use prism_render_interface::{
    descriptor_allocator::DescriptorCapacities,
    render_context::{RenderContext, RenderContextDesc},
};

/// 只有 header 的 SPIR-V，headless 后端只检查 magic number
pub fn write_minimal_spirv(dir: &Path, name: &str) {
    let words: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
    std::fs::write(dir.join(format!("{}.spv", name)), bytemuck::cast_slice::<u32, u8>(&words)).unwrap();
}

pub fn new_context(shader_build_dir: &Path) -> (Rc<HeadlessDevice>, RenderContext) {
    prism_crate_tools::init_log::init_test_log();

    let headless = Rc::new(HeadlessDevice::new());
    let device: Rc<dyn GfxDevice> = headless.clone();
    let context = RenderContext::new(
        device,
        RenderContextDesc {
            descriptor_capacities: DescriptorCapacities::default(),
            shader_build_dir: shader_build_dir.to_path_buf(),
            swapchain: None,
            render_extent: vk::Extent2D {
                width: 640,
                height: 360,
            },
        },
    )
    .unwrap();
    (headless, context)
}

pub fn init() {
    prism_crate_tools::init_log::init_test_log();
}
