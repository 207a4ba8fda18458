//! 应用层
//!
//! [`render_app::RenderApp`] 持有 [`prism_render_interface::render_context::RenderContext`] 和当前的 [`scene::Scene`]，
//! 驱动每一帧；配置来自 `prism.toml`，可选的 [`shader_watcher::ShaderWatcher`] 在后台线程中监视 shader 源文件。

pub mod config;
pub mod render_app;
pub mod scene;
pub mod scenes;
pub mod shader_watcher;
