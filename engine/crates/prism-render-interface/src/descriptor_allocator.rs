use std::rc::Rc;

use ash::vk;
use prism_gfx::{
    descriptors::descriptor_heap::{GfxDescriptorHeap, GfxDescriptorKind, GfxDescriptorSlot},
    device::GfxDevice,
    error::GfxResult,
};

/// 每种 view 的堆容量
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorCapacities {
    pub srv: u32,
    pub rtv: u32,
    pub cube: u32,
    pub uav: u32,
}
impl Default for DescriptorCapacities {
    fn default() -> Self {
        Self {
            srv: 4096,
            rtv: 64,
            cube: 64,
            uav: 1024,
        }
    }
}
impl DescriptorCapacities {
    #[inline]
    pub fn of(&self, kind: GfxDescriptorKind) -> u32 {
        match kind {
            GfxDescriptorKind::Srv => self.srv,
            GfxDescriptorKind::Rtv => self.rtv,
            GfxDescriptorKind::Cubemap => self.cube,
            GfxDescriptorKind::Uav => self.uav,
        }
    }
}

struct HeapCursor {
    heap: GfxDescriptorHeap,
    /// 下一个未分配的 slot
    next: u32,
}

/// bindless 描述符分配器
///
/// 每种 view 一个堆，slot 线性递增分配，不回收；
/// shader 中直接使用 slot index 访问资源，因此 index 在整个会话中保持稳定。
///
/// shader 可见的堆按照 Srv、Cubemap、Uav 的顺序依次占据 set 0、1、2。
pub struct DescriptorAllocator {
    device: Rc<dyn GfxDevice>,
    /// 按照 [`GfxDescriptorKind::ALL`] 的顺序
    heaps: Vec<HeapCursor>,
    destroyed: bool,
}
// new & init
impl DescriptorAllocator {
    pub fn new(device: Rc<dyn GfxDevice>, capacities: DescriptorCapacities) -> GfxResult<Self> {
        let heaps = GfxDescriptorKind::ALL
            .iter()
            .map(|kind| {
                let heap = GfxDescriptorHeap::new(
                    device.as_ref(),
                    *kind,
                    capacities.of(*kind),
                    &format!("bindless-{}", kind.name()),
                )?;
                Ok(HeapCursor { heap, next: 0 })
            })
            .collect::<GfxResult<Vec<_>>>()?;

        Ok(Self {
            device,
            heaps,
            destroyed: false,
        })
    }

    pub fn destroy(mut self) {
        for cursor in self.heaps.drain(..) {
            log::info!("destroy descriptor heap {}: {} slots used", cursor.heap.name(), cursor.next);
            cursor.heap.destroy(self.device.as_ref());
        }
        self.destroyed = true;
    }
}
impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "DescriptorAllocator must be destroyed manually");
        }
    }
}
// getters
impl DescriptorAllocator {
    #[inline]
    fn cursor(&self, kind: GfxDescriptorKind) -> &HeapCursor {
        &self.heaps[kind as usize]
    }

    #[inline]
    fn cursor_mut(&mut self, kind: GfxDescriptorKind) -> &mut HeapCursor {
        &mut self.heaps[kind as usize]
    }

    #[inline]
    pub fn heap(&self, kind: GfxDescriptorKind) -> &GfxDescriptorHeap {
        &self.cursor(kind).heap
    }

    #[inline]
    pub fn capacity(&self, kind: GfxDescriptorKind) -> u32 {
        self.cursor(kind).heap.capacity()
    }

    #[inline]
    pub fn allocated_count(&self, kind: GfxDescriptorKind) -> u32 {
        self.cursor(kind).next
    }

    /// shader 可见的堆所在的 set index 以及 descriptor set
    pub fn shader_set(&self, kind: GfxDescriptorKind) -> Option<(u32, vk::DescriptorSet)> {
        let set = self.cursor(kind).heap.bindless_set()?.set;
        let set_index = self.heaps.iter().filter(|c| c.heap.bindless_set().is_some()).position(|c| c.heap.kind() == kind)?;
        Some((set_index as u32, set))
    }

    /// 所有 shader 可见的 set layout，按照 set index 排列
    pub fn bindless_layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        self.heaps.iter().filter_map(|c| c.heap.bindless_set()).map(|s| s.layout).collect()
    }

    /// 所有 shader 可见的 descriptor set，按照 set index 排列
    pub fn bindless_sets(&self) -> Vec<vk::DescriptorSet> {
        self.heaps.iter().filter_map(|c| c.heap.bindless_set()).map(|s| s.set).collect()
    }
}
// allocate
impl DescriptorAllocator {
    /// 分配一个 slot
    ///
    /// # Panic
    /// 堆已满
    #[inline]
    pub fn allocate(&mut self, kind: GfxDescriptorKind) -> GfxDescriptorSlot {
        self.allocate_range(kind, 1)
    }

    /// 分配 count 个连续的 slot，返回第一个
    ///
    /// # Panic
    /// 剩余空间不足 count 个
    pub fn allocate_range(&mut self, kind: GfxDescriptorKind, count: u32) -> GfxDescriptorSlot {
        assert!(count > 0, "allocate_range: count must not be zero");
        let cursor = self.cursor_mut(kind);
        let capacity = cursor.heap.capacity();
        if cursor.next + count > capacity {
            panic!(
                "descriptor heap {} exhausted: {} used, {} requested, capacity {}",
                cursor.heap.name(),
                cursor.next,
                count,
                capacity
            );
        }

        let index = cursor.next;
        cursor.next += count;
        GfxDescriptorSlot { kind, index }
    }
}
// write
impl DescriptorAllocator {
    fn write(&mut self, expected: GfxDescriptorKind, slot: GfxDescriptorSlot, view: vk::ImageView) {
        assert_eq!(slot.kind, expected, "descriptor slot kind mismatch");
        assert!(
            slot.index < self.cursor(expected).next,
            "descriptor slot {:?} is not allocated",
            slot
        );
        let device = self.device.clone();
        self.cursor_mut(expected).heap.write(device.as_ref(), slot.index, view);
    }

    #[inline]
    pub fn write_srv(&mut self, slot: GfxDescriptorSlot, view: vk::ImageView) {
        self.write(GfxDescriptorKind::Srv, slot, view);
    }

    #[inline]
    pub fn write_uav(&mut self, slot: GfxDescriptorSlot, view: vk::ImageView) {
        self.write(GfxDescriptorKind::Uav, slot, view);
    }

    #[inline]
    pub fn write_cube(&mut self, slot: GfxDescriptorSlot, view: vk::ImageView) {
        self.write(GfxDescriptorKind::Cubemap, slot, view);
    }

    #[inline]
    pub fn write_rtv(&mut self, slot: GfxDescriptorSlot, view: vk::ImageView) {
        self.write(GfxDescriptorKind::Rtv, slot, view);
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::backend::headless::HeadlessDevice;

    use super::*;

    fn small_capacities() -> DescriptorCapacities {
        DescriptorCapacities {
            srv: 4,
            rtv: 2,
            cube: 2,
            uav: 8,
        }
    }

    #[test]
    fn test_indices_strictly_increasing() {
        let device = Rc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), small_capacities()).unwrap();

        let indices: Vec<u32> = (0..4).map(|_| allocator.allocate(GfxDescriptorKind::Srv).index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(allocator.allocated_count(GfxDescriptorKind::Srv), 4);
        // 其他堆互不影响
        assert_eq!(allocator.allocate(GfxDescriptorKind::Uav).index, 0);
        allocator.destroy();
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_allocate_past_capacity() {
        let device = Rc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(device, small_capacities()).unwrap();
        for _ in 0..3 {
            allocator.allocate(GfxDescriptorKind::Rtv);
        }
    }

    #[test]
    fn test_allocate_range_is_consecutive() {
        let device = Rc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(device, small_capacities()).unwrap();
        allocator.allocate(GfxDescriptorKind::Uav);
        let base = allocator.allocate_range(GfxDescriptorKind::Uav, 5);
        assert_eq!(base.index, 1);
        assert_eq!(base.offset(4).index, 5);
        assert_eq!(allocator.allocate(GfxDescriptorKind::Uav).index, 6);
        allocator.destroy();
    }

    #[test]
    fn test_shader_sets_layout() {
        let device = Rc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), small_capacities()).unwrap();

        assert_eq!(allocator.bindless_layouts().len(), 3);
        assert!(allocator.shader_set(GfxDescriptorKind::Rtv).is_none());
        let (uav_index, uav_set) = allocator.shader_set(GfxDescriptorKind::Uav).unwrap();
        assert_eq!(uav_index, 2);

        let slot = allocator.allocate(GfxDescriptorKind::Uav);
        let view = vk::Handle::from_raw(0xdead);
        allocator.write_uav(slot, view);
        assert_eq!(device.descriptor_view(uav_set, slot.index), Some(view));

        // rtv 只写入 CPU 端的表
        let rtv = allocator.allocate(GfxDescriptorKind::Rtv);
        allocator.write_rtv(rtv, view);
        assert_eq!(allocator.heap(GfxDescriptorKind::Rtv).view(rtv.index), view);

        allocator.destroy();
        assert_eq!(device.live_object_count(), 0);
    }
}
