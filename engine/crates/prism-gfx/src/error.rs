use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// GFX 层的错误类型
///
/// 设备调用失败会以 `GfxError` 的形式返回；上层 manager 决定是否升级为致命错误。
#[derive(Error, Debug)]
pub enum GfxError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("failed to load vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("required vulkan {kind} is not supported: {name}")]
    Unsupported { kind: &'static str, name: String },

    #[error("no physical device meets the requirements")]
    NoPhysicalDevice,

    #[error("no surface: device was created without a window")]
    NoSurface,

    #[error("shader not found: {}", .0.display())]
    ShaderNotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wait on semaphore value {value} timed out")]
    Timeout { value: u64 },
}

pub type GfxResult<T> = Result<T, GfxError>;
