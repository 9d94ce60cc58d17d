//! Pressure-advance integrator.
//!
//! With advance enabled the extruder leaves the main Bresenham loop.
//! Commanded extrusion and the advance compensation both accumulate into a
//! per-extruder pending-step counter, which a separate fixed-rate timer
//! drains one pulse at a time. The integral is kept in 24.8 fixed point;
//! only whole steps (the top 24 bits) ever reach the counter.

use crate::block::Block;
use crate::config::MAX_EXTRUDERS;
use crate::trapezoid::Phase;

pub struct AdvanceState {
    advance: i32,
    old_advance: i32,
    final_advance: i32,
    /// Steps owed to each extruder; sign is direction. Drained by the
    /// advance timer.
    pub(crate) e_steps: [i32; MAX_EXTRUDERS],
}

impl AdvanceState {
    pub fn new() -> Self {
        Self {
            advance: 0,
            old_advance: 0,
            final_advance: 0,
            e_steps: [0; MAX_EXTRUDERS],
        }
    }

    fn extruder_index(block: &Block) -> usize {
        (block.active_extruder as usize).min(MAX_EXTRUDERS - 1)
    }

    /// Load the integrator endpoints of a freshly acquired block and book
    /// any step the new starting pressure implies.
    pub(crate) fn reset_for_block(&mut self, block: &Block) {
        self.advance = block.initial_advance;
        self.final_advance = block.final_advance;
        let e = Self::extruder_index(block);
        self.e_steps[e] += (self.advance >> 8) - self.old_advance;
        self.old_advance = self.advance >> 8;
    }

    /// One commanded extruder step from the Bresenham tracer.
    pub(crate) fn bresenham_e_step(&mut self, block: &Block, negative: bool) {
        let e = Self::extruder_index(block);
        self.e_steps[e] += if negative { -1 } else { 1 };
    }

    /// Integrate the advance rate over the ticks this interrupt covered and
    /// convert whole-step changes of the integral into pending steps.
    pub(crate) fn accumulate(&mut self, phase: Phase, block: &Block, step_loops: u8) {
        match phase {
            Phase::Accelerating => {
                self.advance += block.advance_rate * i32::from(step_loops);
            }
            Phase::Decelerating => {
                self.advance -= block.advance_rate * i32::from(step_loops);
                if self.advance < self.final_advance {
                    self.advance = self.final_advance;
                }
            }
            Phase::Cruising => return,
        }
        let e = Self::extruder_index(block);
        self.e_steps[e] += (self.advance >> 8) - self.old_advance;
        self.old_advance = self.advance >> 8;
    }

    pub(crate) fn pending(&self, extruder: usize) -> i32 {
        self.e_steps[extruder]
    }
}

impl Default for AdvanceState {
    fn default() -> Self {
        Self::new()
    }
}
