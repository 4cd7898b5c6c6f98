//! Evidence buffer: a bounded FIFO of frames kept around so that an
//! episode's clip can start before the first anomalous frame.

use std::collections::VecDeque;

use crate::types::Frame;

/// Fixed-capacity, oldest-first frame buffer. Appending past capacity
/// evicts the oldest frame. Owned exclusively by the detection worker.
pub struct EvidenceBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl EvidenceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(4096)),
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

    /// Append a frame, evicting the oldest one if the buffer is full.
    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Remove and return the most recently appended frame.
    pub fn pop_newest(&mut self) -> Option<Frame> {
        self.frames.pop_back()
    }

    /// Drain every buffered frame, oldest first.
    pub fn drain_oldest(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.frames.drain(..)
    }
}
