pub mod buffer;
pub mod image;
pub mod image_view;
pub mod mesh;
pub mod releasable;
pub mod resource_handle;
pub mod resource_state;
pub mod upload_ring_buffer;
