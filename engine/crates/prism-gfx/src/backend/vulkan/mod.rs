//! 基于 ash + vk-mem 的 Vulkan 后端

mod debug_messenger;
mod device;
mod instance;
mod physical_device;

pub use device::VulkanDevice;
