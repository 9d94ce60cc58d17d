//! Motion blocks and the planner hand-off queue.

use heapless::Deque;

use crate::{Axis, AxisBits};

/// Depth of the planner-to-executor ring.
pub const BLOCK_QUEUE_DEPTH: usize = 16;

/// One straight-line multi-axis move with a trapezoidal speed profile.
///
/// Produced by the planner; the executor only ever writes the `busy` flag.
/// Step counts are magnitudes, the sign of each axis lives in
/// `direction_bits`. Rates are step frequencies of the dominant axis in Hz.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block {
    pub steps: [u32; Axis::COUNT],
    /// `max(steps)`, the dominant-axis tick count of the block.
    pub step_event_count: u32,
    /// Set bit = negative direction on that axis.
    pub direction_bits: AxisBits,

    /// Tick index up to which the block accelerates.
    pub accelerate_until: u32,
    /// Tick index after which the block decelerates.
    pub decelerate_after: u32,

    pub initial_rate: u32,
    pub nominal_rate: u32,
    pub final_rate: u32,
    /// Pre-scaled so that `rate_delta = acceleration_rate * ticks >> 32`
    /// with nearest rounding.
    pub acceleration_rate: u32,

    /// Pressure-advance integrator endpoints, 24.8 fixed point.
    pub initial_advance: i32,
    pub final_advance: i32,
    pub advance_rate: i32,

    pub active_extruder: u8,
    /// Set when tracing starts; the planner must not evict a busy block.
    pub busy: bool,
}

impl Block {
    /// Direction sign of an axis: +1 or -1.
    pub fn direction(&self, axis: Axis) -> i32 {
        if self.direction_bits.contains(axis.bit()) {
            -1
        } else {
            1
        }
    }

    pub fn signed_steps(&self, axis: Axis) -> i32 {
        self.steps[axis.index()] as i32 * self.direction(axis)
    }
}

impl Default for Block {
    fn default() -> Self {
        Self {
            steps: [0; Axis::COUNT],
            step_event_count: 0,
            direction_bits: AxisBits::empty(),
            accelerate_until: 0,
            decelerate_after: 0,
            initial_rate: 0,
            nominal_rate: 0,
            final_rate: 0,
            acceleration_rate: 0,
            initial_advance: 0,
            final_advance: 0,
            advance_rate: 0,
            active_extruder: 0,
            busy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnqueueError {
    QueueFull,
}

/// Single-producer (planner, thread context) / single-consumer (stepper
/// interrupt) block ring. The consumer peeks the head with [`current`],
/// traces it to completion, then releases it with [`discard_current`]; the
/// head's memory stays valid in between.
///
/// [`current`]: BlockQueue::current
/// [`discard_current`]: BlockQueue::discard_current
pub struct BlockQueue {
    ring: Deque<Block, BLOCK_QUEUE_DEPTH>,
}

impl BlockQueue {
    pub const fn new() -> Self {
        Self { ring: Deque::new() }
    }

    pub fn push(&mut self, block: Block) -> Result<(), EnqueueError> {
        self.ring
            .push_back(block)
            .map_err(|_| EnqueueError::QueueFull)
    }

    /// Peek the head block without dequeuing it.
    pub fn current(&mut self) -> Option<&mut Block> {
        self.ring.front_mut()
    }

    /// Release the head block back to the planner.
    pub fn discard_current(&mut self) {
        let _ = self.ring.pop_front();
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}
