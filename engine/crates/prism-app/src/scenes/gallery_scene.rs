//! 加载目录下的所有图片并生成 mip，每隔一段时间切换显示的图片

use std::path::{Path, PathBuf};

use itertools::Itertools;
use prism_render_interface::{render_context::RenderContext, texture_manager::GfxTextureBundle};

use crate::scene::{Scene, blit_to_swapchain};

/// 每张图片显示的帧数
const FRAMES_PER_IMAGE: u64 = 120;
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tga"];

pub struct GalleryScene {
    texture_dir: PathBuf,
    textures: Vec<GfxTextureBundle>,
}
impl GalleryScene {
    pub fn new(texture_dir: PathBuf) -> Self {
        Self {
            texture_dir,
            textures: vec![],
        }
    }

    #[inline]
    pub fn textures(&self) -> &[GfxTextureBundle] {
        &self.textures
    }

    /// 目录下（不递归）扩展名为图片的文件，按文件名排序
    fn image_files(dir: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .sorted()
            .collect()
    }
}
impl Scene for GalleryScene {
    fn name(&self) -> &str {
        "gallery"
    }

    fn init_resources(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        let _span = tracy_client::span!("GalleryScene::init_resources");

        let files = Self::image_files(&self.texture_dir);
        if files.is_empty() {
            log::warn!("no image found in {}, show the default texture", self.texture_dir.display());
        }

        let (_, descriptors, textures, _) = ctx.managers();
        for path in &files {
            let bundle = textures.create_texture_from_file(descriptors, path, true, false)?;
            self.textures.push(bundle);
        }
        if self.textures.is_empty() {
            self.textures.push(textures.default_texture());
        }
        log::info!("gallery: {} textures from {}", self.textures.len(), self.texture_dir.display());
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext) -> anyhow::Result<()> {
        let mut frame = ctx.frame_context();
        let idx = (frame.frame_id / FRAMES_PER_IMAGE) as usize % self.textures.len().max(1);
        if let Some(bundle) = self.textures.get(idx) {
            blit_to_swapchain(&mut frame, bundle.texture);
        }
        Ok(())
    }

    fn destroy(self: Box<Self>, ctx: &mut RenderContext) {
        let (frame_pipeline, _, textures, _) = ctx.managers();
        // 加载失败的图片共享默认纹理，release_texture 会跳过
        for bundle in self.textures.iter().unique_by(|b| b.texture) {
            textures.release_texture(bundle.texture, frame_pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.tga"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("d.png"), b"x").unwrap();

        let names = GalleryScene::image_files(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect_vec();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.tga"]);
    }
}
