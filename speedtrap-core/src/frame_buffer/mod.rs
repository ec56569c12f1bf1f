//! frame_buffer: bounded ring of recent frames addressed by frame index
//!
//! Frames are stored as `Arc<RgbFrame>` so a clip snapshot handed to a
//! dispatch worker shares memory with the ring instead of copying pixels.
//! Once the ring is full the oldest frame is dropped; a range that reaches
//! back past the oldest retained frame can no longer be extracted.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::video::RgbFrame;

/// Default ring size: ten seconds at 30 fps.
pub const DEFAULT_CAPACITY: usize = 300;

pub struct FrameBuffer {
    frames: VecDeque<Arc<RgbFrame>>,
    /// Frame index of `frames[0]`.
    base_index: u64,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            base_index: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index the next pushed frame will receive.
    pub fn next_index(&self) -> u64 {
        self.base_index + self.frames.len() as u64
    }

    /// Oldest index still retained, if any.
    pub fn oldest_index(&self) -> Option<u64> {
        (!self.frames.is_empty()).then_some(self.base_index)
    }

    /// Append a frame and return its index.
    pub fn push(&mut self, frame: RgbFrame) -> u64 {
        let index = self.next_index();
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.base_index += 1;
        }
        self.frames.push_back(Arc::new(frame));
        index
    }

    pub fn get(&self, index: u64) -> Option<&Arc<RgbFrame>> {
        let offset = index.checked_sub(self.base_index)?;
        self.frames.get(usize::try_from(offset).ok()?)
    }

    /// Frames `first..=last`, or `None` if any of them is not retained.
    pub fn range(&self, first: u64, last: u64) -> Option<Vec<Arc<RgbFrame>>> {
        if first > last || first < self.base_index || last >= self.next_index() {
            return None;
        }
        let start = (first - self.base_index) as usize;
        let end = (last - self.base_index) as usize;
        Some(self.frames.range(start..=end).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: i64) -> RgbFrame {
        RgbFrame::filled(2, 2, [0, 0, 0], pts)
    }

    #[test]
    fn indices_follow_push_order() {
        let mut buf = FrameBuffer::new(8);
        assert_eq!(buf.push(frame(0)), 0);
        assert_eq!(buf.push(frame(1)), 1);
        assert_eq!(buf.get(1).unwrap().pts, 1);
        assert!(buf.get(2).is_none());
    }

    #[test]
    fn range_is_inclusive() {
        let mut buf = FrameBuffer::new(8);
        for i in 0..6 {
            buf.push(frame(i));
        }
        let pts: Vec<i64> = buf.range(2, 4).unwrap().iter().map(|f| f.pts).collect();
        assert_eq!(pts, vec![2, 3, 4]);
        assert!(buf.range(4, 2).is_none());
        assert!(buf.range(5, 6).is_none());
    }

    #[test]
    fn full_ring_drops_oldest() {
        let mut buf = FrameBuffer::new(3);
        for i in 0..5 {
            buf.push(frame(i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.oldest_index(), Some(2));
        assert_eq!(buf.next_index(), 5);
        assert!(buf.get(1).is_none());
        assert!(buf.range(1, 3).is_none());
        assert_eq!(buf.range(2, 4).unwrap().len(), 3);
    }

    #[test]
    fn snapshot_outlives_eviction() {
        let mut buf = FrameBuffer::new(2);
        buf.push(frame(0));
        buf.push(frame(1));
        let snap = buf.range(0, 1).unwrap();
        buf.push(frame(2));
        buf.push(frame(3));
        assert_eq!(snap[0].pts, 0);
        assert!(buf.get(0).is_none());
    }
}
