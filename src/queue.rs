// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ordered queue of input pictures awaiting submission to the device.

use std::collections::VecDeque;

use crate::frame::PendingFrame;

/// FIFO of pictures the pump has accepted but not yet successfully written to
/// the device.
///
/// A frame is only popped once the device confirms the corresponding write;
/// a "not ready" response leaves the head in place so the same frame is
/// retried until it goes through. Nothing is ever dropped short of an
/// explicit flush.
#[derive(Default)]
pub struct FrameQueue {
    frames: VecDeque<PendingFrame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append `frame` to the tail, growing the backing storage if needed.
    ///
    /// On allocation failure the frame is handed back to the caller, which
    /// retains ownership.
    pub fn enqueue(&mut self, frame: PendingFrame) -> Result<(), PendingFrame> {
        if self.frames.try_reserve(1).is_err() {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// The oldest queued frame, left in place. The pump must submit it
    /// successfully before calling `pop_head`.
    pub fn peek_head(&self) -> Option<&PendingFrame> {
        self.frames.front()
    }

    /// Remove and return the oldest queued frame.
    pub fn pop_head(&mut self) -> Option<PendingFrame> {
        self.frames.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Drop every queued frame. Only used on session teardown.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::format::BitDepth;
    use crate::format::PictureHint;
    use crate::format::Resolution;
    use crate::frame::AuxData;
    use crate::frame::FrameStorage;

    fn frame(pts: i64) -> PendingFrame {
        PendingFrame {
            storage: FrameStorage::Software(Arc::new(vec![0u8; 16])),
            pts,
            hint: PictureHint::Unspecified,
            aux: AuxData::default(),
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            bit_depth: BitDepth::Depth8,
            end_of_stream: false,
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut queue = FrameQueue::new();
        for pts in 0..100 {
            queue.enqueue(frame(pts)).unwrap();
        }
        assert_eq!(queue.len(), 100);
        for pts in 0..100 {
            assert_eq!(queue.peek_head().unwrap().pts, pts);
            assert_eq!(queue.pop_head().unwrap().pts, pts);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut queue = FrameQueue::new();
        queue.enqueue(frame(7)).unwrap();
        // A device that keeps reporting "not ready" sees the same head every
        // time.
        for _ in 0..3 {
            assert_eq!(queue.peek_head().unwrap().pts, 7);
        }
        assert_eq!(queue.len(), 1);
    }
}
