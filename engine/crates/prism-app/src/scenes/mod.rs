pub mod gallery_scene;
pub mod shadow_scene;
