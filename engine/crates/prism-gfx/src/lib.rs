//! Prism 的 GFX 层
//!
//! 通过 [`device::GfxDevice`] trait 隔离具体后端：
//! - [`backend::vulkan::VulkanDevice`]：基于 ash + vk-mem 的真实实现
//! - [`backend::headless::HeadlessDevice`]：不依赖 GPU 的记录型实现，用于测试和离线运行
//!
//! 在其之上提供资源状态追踪、per-frame 上传缓冲、bindless 描述符堆以及 BLAS/TLAS 的构建。

pub mod backend;
pub mod basic;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod pipelines;
pub mod raytracing;
pub mod resources;
pub mod swapchain;
