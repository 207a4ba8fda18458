use ash::vk;

pub struct BytesConvert {}
impl BytesConvert {
    /// 将任意 `Copy` 的 POD 结构视为字节序列
    ///
    /// 主要用于 ash 中未实现 `bytemuck::Pod` 的结构体，例如 `vk::AccelerationStructureInstanceKHR`
    pub fn bytes_of<T: Sized + Copy>(data: &T) -> &[u8] {
        Self::slice_bytes(std::slice::from_ref(data))
    }

    pub fn slice_bytes<T: Sized + Copy>(data: &[T]) -> &[u8] {
        unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, size_of_val(data)) }
    }
}

/// 将 `size` 向上对齐到 `align`，`align` 必须是 2 的幂
#[inline]
pub const fn align_up(size: vk::DeviceSize, align: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(16, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(0, 256), 0);
    }

    #[test]
    fn test_bytes_of_transform() {
        let transform = vk::TransformMatrixKHR {
            matrix: [1.0, 0.0, 0.0, 5.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        };
        let bytes = BytesConvert::bytes_of(&transform);
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[12..16], &5.0f32.to_ne_bytes());
    }
}
