//! 渲染层与 GPU 之间的边界
//!
//! - [`frame_pipeline::FramePipeline`]：N 帧并行的 timeline 同步、命令分配与延迟释放
//! - [`descriptor_allocator::DescriptorAllocator`]：只增不减的 bindless slot 分配
//! - [`texture_manager::TextureManager`]：纹理、render target、cubemap 以及批量的 mip 生成
//! - [`render_context::RenderContext`]：显式传递的渲染上下文，替代全局单例

pub mod cmd_allocator;
pub mod deferred_release;
pub mod descriptor_allocator;
pub mod frame_counter;
pub mod frame_pipeline;
pub mod mip_generator;
pub mod pipeline_cache;
pub mod render_context;
pub mod texture_manager;
