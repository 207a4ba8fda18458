pub mod render_swapchain;
