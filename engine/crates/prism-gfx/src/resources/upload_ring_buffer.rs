use ash::vk;

use crate::{basic::bytes::align_up, device::GfxDevice, error::GfxResult, resources::buffer::GfxBuffer};

/// 常量数据的对齐要求
pub const CONSTANT_DATA_ALIGNMENT: vk::DeviceSize = 256;

/// CPU 可写、GPU 可读的多帧上传缓冲
///
/// 内存布局为 `frame_count` 个等长的 slice，每个 slice 的长度为 stride。
/// 映射在创建时完成，一直保持到 destroy。
///
/// 写入 slice `i` 之前，调用者需要保证 GPU 已经不再读取 slice `i`（由 frame pipeline 的 fence 保证）。
pub struct UploadRingBuffer {
    buffer: GfxBuffer,

    element_size: vk::DeviceSize,
    stride: vk::DeviceSize,
    frame_count: usize,
}
// new & init
impl UploadRingBuffer {
    /// - align_to_256: 是否将 element 向上对齐到 256 字节
    /// - extra_usage: 除 SHADER_DEVICE_ADDRESS 之外的 usage，例如 STORAGE_BUFFER
    pub fn new(
        device: &dyn GfxDevice,
        element_size: vk::DeviceSize,
        frame_count: usize,
        align_to_256: bool,
        extra_usage: vk::BufferUsageFlags,
        name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        assert!(element_size > 0, "UploadRingBuffer: element size must not be zero");
        assert!(frame_count > 0, "UploadRingBuffer: frame count must not be zero");

        let stride = if align_to_256 {
            align_up(element_size, CONSTANT_DATA_ALIGNMENT)
        } else {
            element_size
        };
        let buffer = GfxBuffer::new_upload_buffer(
            device,
            stride * frame_count as vk::DeviceSize,
            extra_usage,
            Some(CONSTANT_DATA_ALIGNMENT),
            name,
        )?;

        Ok(Self {
            buffer,
            element_size,
            stride,
            frame_count,
        })
    }

    pub fn destroy(self, device: &dyn GfxDevice) {
        self.buffer.destroy(device);
    }
}
// getters
impl UploadRingBuffer {
    #[inline]
    pub fn stride(&self) -> vk::DeviceSize {
        self.stride
    }

    #[inline]
    pub fn element_size(&self) -> vk::DeviceSize {
        self.element_size
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub fn buffer(&self) -> &GfxBuffer {
        &self.buffer
    }

    #[inline]
    pub fn frame_offset(&self, frame_index: usize) -> vk::DeviceSize {
        assert!(
            frame_index < self.frame_count,
            "UploadRingBuffer {}: frame index {} out of range {}",
            self.buffer.debug_name(),
            frame_index,
            self.frame_count
        );
        frame_index as vk::DeviceSize * self.stride
    }

    /// slice 的 GPU 地址，可以直接作为 push constant 传给 shader
    #[inline]
    pub fn frame_gpu_address(&self, frame_index: usize) -> vk::DeviceAddress {
        self.buffer.device_address() + self.frame_offset(frame_index)
    }

    /// slice 在映射内存中的内容，长度为 element size
    #[inline]
    pub fn frame_bytes(&self, frame_index: usize) -> &[u8] {
        let offset = self.frame_offset(frame_index) as usize;
        &self.buffer.mapped_bytes()[offset..offset + self.element_size as usize]
    }
}
// update
impl UploadRingBuffer {
    /// 将 data 写入 slice `frame_index`
    pub fn upload_data(&self, device: &dyn GfxDevice, frame_index: usize, data: &[u8]) -> GfxResult<()> {
        assert!(
            data.len() as vk::DeviceSize <= self.element_size,
            "UploadRingBuffer {}: data size {} exceeds element size {}",
            self.buffer.debug_name(),
            data.len(),
            self.element_size
        );
        let offset = self.frame_offset(frame_index);
        self.buffer.write_bytes(device, offset, data)
    }

    #[inline]
    pub fn upload<T: bytemuck::Pod>(&self, device: &dyn GfxDevice, frame_index: usize, data: &T) -> GfxResult<()> {
        self.upload_data(device, frame_index, bytemuck::bytes_of(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;

    #[test]
    fn test_stride_aligned_to_256() {
        let device = HeadlessDevice::new();
        let ring = UploadRingBuffer::new(&device, 16, 3, true, vk::BufferUsageFlags::STORAGE_BUFFER, "ring").unwrap();

        assert_eq!(ring.stride(), 256);
        assert_eq!(ring.buffer().size(), 256 * 3);
        assert_eq!(ring.frame_gpu_address(1) - ring.frame_gpu_address(0), 256);
        assert_eq!(ring.frame_gpu_address(2) - ring.frame_gpu_address(0), 512);
        ring.destroy(&device);
    }

    #[test]
    fn test_stride_unaligned() {
        let device = HeadlessDevice::new();
        let ring = UploadRingBuffer::new(&device, 16, 3, false, vk::BufferUsageFlags::STORAGE_BUFFER, "ring").unwrap();
        assert_eq!(ring.stride(), 16);
        assert_eq!(ring.frame_gpu_address(1) - ring.frame_gpu_address(0), 16);
        ring.destroy(&device);
    }

    #[test]
    fn test_upload_writes_only_its_slice() {
        let device = HeadlessDevice::new();
        let ring = UploadRingBuffer::new(&device, 16, 3, true, vk::BufferUsageFlags::STORAGE_BUFFER, "ring").unwrap();

        let data: [u32; 4] = [1, 2, 3, 4];
        ring.upload(&device, 1, &data).unwrap();

        assert_eq!(ring.frame_bytes(1), bytemuck::bytes_of(&data));
        assert!(ring.frame_bytes(0).iter().all(|b| *b == 0));
        assert!(ring.frame_bytes(2).iter().all(|b| *b == 0));
        ring.destroy(&device);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_frame_index_out_of_range() {
        let device = HeadlessDevice::new();
        let ring = UploadRingBuffer::new(&device, 16, 3, true, vk::BufferUsageFlags::STORAGE_BUFFER, "ring").unwrap();
        let _ = ring.upload_data(&device, 3, &[0u8; 16]);
    }

    #[test]
    #[should_panic(expected = "exceeds element size")]
    fn test_oversized_upload() {
        let device = HeadlessDevice::new();
        let ring = UploadRingBuffer::new(&device, 16, 3, true, vk::BufferUsageFlags::STORAGE_BUFFER, "ring").unwrap();
        let _ = ring.upload_data(&device, 0, &[0u8; 32]);
    }
}
