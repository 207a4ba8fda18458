use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    rc::Rc,
};

use ash::vk;
use prism_gfx::{device::GfxDevice, pipelines::compute_pipeline::GfxComputePipeline};

/// 渲染代码获取 pipeline 的接口
pub trait PipelineProvider {
    /// 返回 None 表示 shader 不可用，依赖它的 dispatch 应当被跳过
    fn compute_pipeline(&mut self, name: &str, push_constant_size: u32) -> Option<GfxComputePipeline>;
}

/// 从 shader 编译目录中加载 SPIR-V 的 compute pipeline 缓存
///
/// 只负责加载，不负责编译：`{name}.spv` 需要事先由外部工具生成。
/// 所有 pipeline 都使用同一组 bindless set layout。
pub struct PipelineCache {
    device: Rc<dyn GfxDevice>,
    shader_build_dir: PathBuf,
    set_layouts: Vec<vk::DescriptorSetLayout>,

    pipelines: HashMap<String, GfxComputePipeline>,
    /// 加载失败的 shader，避免每一帧都重复尝试
    failed: HashSet<String>,
}
// new & init
impl PipelineCache {
    pub fn new(
        device: Rc<dyn GfxDevice>,
        shader_build_dir: impl Into<PathBuf>,
        set_layouts: Vec<vk::DescriptorSetLayout>,
    ) -> Self {
        Self {
            device,
            shader_build_dir: shader_build_dir.into(),
            set_layouts,
            pipelines: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// 调用前需要保证 GPU 不再使用这些 pipeline
    pub fn destroy(mut self) {
        for (name, pipeline) in self.pipelines.drain() {
            log::debug!("destroy compute pipeline {}", name);
            pipeline.destroy(self.device.as_ref());
        }
    }
}
// getters
impl PipelineCache {
    #[inline]
    pub fn shader_build_dir(&self) -> &Path {
        &self.shader_build_dir
    }

    #[inline]
    pub fn spv_path(&self, name: &str) -> PathBuf {
        self.shader_build_dir.join(format!("{}.spv", name))
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }
}
// hot reload
impl PipelineCache {
    /// 将 pipeline 移出缓存，下一次请求时重新加载
    ///
    /// return: 旧的 pipeline，需要交给 deferred release
    pub fn invalidate(&mut self, name: &str) -> Option<GfxComputePipeline> {
        self.failed.remove(name);
        let old = self.pipelines.remove(name);
        if old.is_some() {
            log::info!("compute pipeline {} invalidated", name);
        }
        old
    }

    /// 根据 shader 源文件路径失效对应的 pipeline，pipeline 名称即文件名去掉扩展名
    pub fn invalidate_source(&mut self, source_path: &Path) -> Option<GfxComputePipeline> {
        let name = source_path.file_stem()?.to_str()?.to_string();
        self.invalidate(&name)
    }
}
impl PipelineProvider for PipelineCache {
    fn compute_pipeline(&mut self, name: &str, push_constant_size: u32) -> Option<GfxComputePipeline> {
        if let Some(pipeline) = self.pipelines.get(name) {
            debug_assert_eq!(pipeline.push_constant_size(), push_constant_size);
            return Some(*pipeline);
        }
        if self.failed.contains(name) {
            return None;
        }

        let _span = tracy_client::span!("PipelineCache::load");
        let path = self.spv_path(name);
        match GfxComputePipeline::from_spv_file(
            self.device.as_ref(),
            &path,
            &self.set_layouts,
            push_constant_size,
            name,
        ) {
            Ok(pipeline) => {
                log::info!("compute pipeline {} loaded from {}", name, path.display());
                self.pipelines.insert(name.to_string(), pipeline);
                Some(pipeline)
            }
            Err(e) => {
                log::warn!("compute pipeline {} unavailable: {}", name, e);
                self.failed.insert(name.to_string());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::backend::headless::HeadlessDevice;

    use super::*;

    /// 只有 header 的 SPIR-V
    fn minimal_spirv_bytes() -> Vec<u8> {
        let words: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
        bytemuck::cast_slice(&words).to_vec()
    }

    #[test]
    fn test_load_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blur.spv"), minimal_spirv_bytes()).unwrap();

        let device = Rc::new(HeadlessDevice::new());
        let mut cache = PipelineCache::new(device.clone(), dir.path(), vec![]);

        let first = cache.compute_pipeline("blur", 8).unwrap();
        let second = cache.compute_pipeline("blur", 8).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.push_constant_size(), 8);

        cache.destroy();
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_missing_shader_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let device = Rc::new(HeadlessDevice::new());
        let mut cache = PipelineCache::new(device, dir.path(), vec![]);
        assert!(cache.compute_pipeline("missing", 8).is_none());
        assert!(cache.compute_pipeline("missing", 8).is_none());
        cache.destroy();
    }

    #[test]
    fn test_invalidate_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let device = Rc::new(HeadlessDevice::new());
        let mut cache = PipelineCache::new(device.clone(), dir.path(), vec![]);

        // 第一次加载失败，文件出现之后通过 invalidate 重新加载
        assert!(cache.compute_pipeline("mip_gen", 8).is_none());
        std::fs::write(dir.path().join("mip_gen.spv"), minimal_spirv_bytes()).unwrap();
        assert!(cache.invalidate_source(Path::new("shader/src/mip_gen.slang")).is_none());
        let first = cache.compute_pipeline("mip_gen", 8).unwrap();

        let old = cache.invalidate("mip_gen").unwrap();
        assert_eq!(old, first);
        old.destroy(device.as_ref());
        let second = cache.compute_pipeline("mip_gen", 8).unwrap();
        assert_ne!(first.pipeline(), second.pipeline());
        cache.destroy();
    }
}
