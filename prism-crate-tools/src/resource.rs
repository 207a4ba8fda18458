use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// ```ignore
/// let tex = PrismPath::resources_path("uv_checker.png");   // resources/uv_checker.png
/// let spv = PrismPath::shader_build_path("mip_gen.spv");   // shader/.build/mip_gen.spv
/// ```
pub struct PrismPath {}
impl PrismPath {
    /// `resources/` 目录下的文件
    pub fn resources_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("resources").join(filename)
    }

    /// `shader/src/` 着色器源码目录
    pub fn shader_src_dir() -> PathBuf {
        Self::workspace_path().join("shader").join("src")
    }

    /// `shader/.build/` 编译后的 SPIR-V 目录
    pub fn shader_build_dir() -> PathBuf {
        Self::workspace_path().join("shader").join(".build")
    }

    pub fn shader_build_path(filename: &str) -> PathBuf {
        Self::shader_build_dir().join(filename)
    }

    /// 工作区根目录
    pub fn workspace_path() -> PathBuf {
        // prism-crate-tools 直接位于工作区根目录下
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_paths_under_workspace() {
        let root = PrismPath::workspace_path();
        assert!(PrismPath::shader_build_path("a.spv").starts_with(&root));
        assert!(PrismPath::shader_build_path("a.spv").ends_with("shader/.build/a.spv"));
        assert!(PrismPath::shader_src_dir().ends_with("shader/src"));
    }

    #[test]
    fn test_workspace_contains_manifest() {
        assert!(PrismPath::workspace_path().join("Cargo.toml").exists());
    }
}
