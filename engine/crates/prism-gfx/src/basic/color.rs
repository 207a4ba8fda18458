/// debug label 使用的颜色
pub struct LabelColor;
impl LabelColor {
    /// command buffer 整体的 label
    pub const COLOR_CMD: glam::Vec4 = glam::vec4(0.0, 1.0, 0.0, 1.0);
}
