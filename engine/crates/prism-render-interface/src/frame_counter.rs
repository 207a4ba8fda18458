use std::{fmt::Display, ops::Deref};

/// 同时在 GPU 上执行的帧数
pub const FIF_COUNT: usize = 3;

/// 帧标签（A/B/C）
///
/// 表示当前处于 Frames in Flight 的哪一帧。
/// 通过 `Deref` 转换为索引 0/1/2。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLabel {
    A,
    B,
    C,
}
impl Deref for FrameLabel {
    type Target = usize;
    #[inline]
    fn deref(&self) -> &Self::Target {
        match self {
            Self::A => &Self::INDEX[0],
            Self::B => &Self::INDEX[1],
            Self::C => &Self::INDEX[2],
        }
    }
}
impl Display for FrameLabel {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
        }
    }
}
impl FrameLabel {
    const INDEX: [usize; FIF_COUNT] = [0, 1, 2];

    #[inline]
    pub fn from_usize(idx: usize) -> Self {
        match idx {
            0 => Self::A,
            1 => Self::B,
            2 => Self::C,
            _ => panic!("Invalid frame index: {idx}"),
        }
    }

    #[inline]
    pub const fn all() -> [FrameLabel; FIF_COUNT] {
        [FrameLabel::A, FrameLabel::B, FrameLabel::C]
    }
}

pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64) -> Self {
        Self { frame_id: init_frame_id }
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub const fn fif_count() -> usize {
        FIF_COUNT
    }

    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        FrameLabel::from_usize(self.frame_id as usize % FIF_COUNT)
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_cycles() {
        let mut counter = FrameCounter::new(0);
        let labels: Vec<usize> = (0..5)
            .map(|_| {
                let label = *counter.frame_label();
                counter.next_frame();
                label
            })
            .collect();
        assert_eq!(labels, vec![0, 1, 2, 0, 1]);
        assert_eq!(counter.frame_name(), "[F5C]");
    }

    #[test]
    #[should_panic(expected = "Invalid frame index")]
    fn test_label_out_of_range() {
        FrameLabel::from_usize(3);
    }
}
