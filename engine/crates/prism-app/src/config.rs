//! `prism.toml` 配置
//!
//! 所有字段都有默认值，文件不存在时直接使用默认配置。

use std::path::{Path, PathBuf};

use anyhow::Context;
use prism_crate_tools::resource::PrismPath;
use prism_render_interface::descriptor_allocator::DescriptorCapacities;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "prism.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrismConfig {
    pub window: WindowConfig,
    pub descriptors: DescriptorConfig,
    pub shader: ShaderConfig,
    pub scene: SceneConfig,
    pub headless: HeadlessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}
impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Prism".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub srv_capacity: u32,
    pub rtv_capacity: u32,
    pub cube_capacity: u32,
    pub uav_capacity: u32,
}
impl Default for DescriptorConfig {
    fn default() -> Self {
        let capacities = DescriptorCapacities::default();
        Self {
            srv_capacity: capacities.srv,
            rtv_capacity: capacities.rtv,
            cube_capacity: capacities.cube,
            uav_capacity: capacities.uav,
        }
    }
}
impl DescriptorConfig {
    pub fn capacities(&self) -> DescriptorCapacities {
        DescriptorCapacities {
            srv: self.srv_capacity,
            rtv: self.rtv_capacity,
            cube: self.cube_capacity,
            uav: self.uav_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// 是否启动 shader 源文件监视
    pub watch: bool,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub poll_interval_ms: u64,
}
impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            watch: false,
            source_dir: PrismPath::shader_src_dir(),
            build_dir: PrismPath::shader_build_dir(),
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneKind {
    #[default]
    Shadows,
    Gallery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub name: SceneKind,
    /// gallery 场景加载该目录下的所有图片
    pub texture_dir: PathBuf,
}
impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            name: SceneKind::default(),
            texture_dir: PrismPath::resources_path("textures"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    pub frames: u64,
}
impl Default for HeadlessConfig {
    fn default() -> Self {
        Self { frames: 8 }
    }
}

impl PrismConfig {
    /// 文件不存在时返回默认配置，其他错误向上传递
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("{} not found, use default config", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read config {}", path.display())),
        };
        Self::from_toml(&content).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 工作区根目录下的 `prism.toml`
    pub fn load_default() -> anyhow::Result<Self> {
        Self::load(&PrismPath::workspace_path().join(CONFIG_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PrismConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, PrismConfig::default());
        assert_eq!(config.descriptors.capacities(), DescriptorCapacities::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = PrismConfig::from_toml(
            r#"
            [window]
            width = 800

            [descriptors]
            uav_capacity = 16

            [scene]
            name = "gallery"
            "#,
        )
        .unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.descriptors.uav_capacity, 16);
        assert_eq!(config.descriptors.srv_capacity, 4096);
        assert_eq!(config.scene.name, SceneKind::Gallery);
        assert_eq!(config.headless.frames, 8);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[scene]\nname = \"unknown\"\n").unwrap();
        let err = PrismConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to parse config"));
    }
}
