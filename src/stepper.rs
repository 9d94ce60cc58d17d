//! The stepper execution aggregate.
//!
//! [`Stepper`] owns every piece of state the step-timer interrupt touches:
//! the Bresenham counters, the trapezoid state, the endstop latch, the
//! position mirror and the block queue. The interrupt context calls
//! [`Stepper::on_step_timer`] (and [`Stepper::on_advance_timer`] when
//! pressure advance is built in); everything else is main-loop API, and the
//! accessors that read or write interrupt-shared state mask the step timer
//! around the access.

use crate::advance::AdvanceState;
use crate::block::{Block, BlockQueue, EnqueueError};
use crate::config::{Features, MotionConfig};
use crate::endstop::{EndstopBits, Endstops, ReportLine};
use crate::hal::MotionHal;
use crate::output::StepRouter;
use crate::trapezoid::TrapezoidState;
use crate::{Axis, AxisBits};

/// Ticks of block-discarding idle scheduling after a quick stop.
const CLEANING_TICKS: u16 = 5000;

/// Latched endstop hits formatted for the console, plus whether the
/// configured abort reaction fired.
#[derive(Debug)]
pub struct EndstopReport {
    pub line: ReportLine,
    pub abort: bool,
}

enum Acquire {
    Acquired,
    Deferred,
    Empty,
}

pub struct Stepper<H: MotionHal> {
    hal: H,
    cfg: MotionConfig,
    queue: BlockQueue,
    trap: TrapezoidState,
    endstops: Endstops,
    router: StepRouter,
    advance: AdvanceState,

    /// Block being traced. A copy of the queue head, which stays resident
    /// (and marked busy) until the trace completes and releases it.
    current: Option<Block>,
    counter: [i32; Axis::COUNT],
    step_events_completed: u32,
    /// Direction mask currently latched into the driver pins.
    out_bits: AxisBits,

    /// Authoritative machine position in steps. With advance built in the
    /// extruder entry is not maintained here.
    count_position: [i32; Axis::COUNT],
    count_direction: [i32; Axis::COUNT],

    cleaning_buffer_counter: u16,
}

impl<H: MotionHal> Stepper<H> {
    pub fn new(hal: H, cfg: MotionConfig) -> Self {
        Self {
            hal,
            cfg,
            queue: BlockQueue::new(),
            trap: TrapezoidState::new(),
            endstops: Endstops::new(),
            router: StepRouter::new(),
            advance: AdvanceState::new(),
            current: None,
            counter: [0; Axis::COUNT],
            step_events_completed: 0,
            out_bits: AxisBits::empty(),
            count_position: [0; Axis::COUNT],
            count_direction: [1; Axis::COUNT],
            cleaning_buffer_counter: 0,
        }
    }

    /// Park all outputs, arm the step timer and start with endstop
    /// checking active.
    pub fn init(&mut self) {
        for axis in Axis::ALL {
            self.set_axis_enabled(axis, false);
            self.apply_step(axis, 0, true, false);
        }
        for e in 1..self.cfg.num_extruders {
            self.router.e_step(&mut self.hal, &self.cfg, e, false);
        }
        self.apply_directions(0);
        self.endstops.set_enabled(true);
        self.hal.schedule_next_tick(self.cfg.timer_rate / 1000);
        self.hal.enable_step_interrupt();
        info!("stepper core online");
    }

    /// Re-enable the step interrupt. Idempotent.
    pub fn wake_up(&mut self) {
        self.hal.enable_step_interrupt();
    }

    // ------------------------------------------------------------------
    // interrupt context

    /// The step-timer interrupt body. Consumes blocks from the queue and
    /// executes them by pulsing the stepper pins.
    pub fn on_step_timer(&mut self) {
        if self.cleaning_buffer_counter > 0 {
            self.current = None;
            self.queue.discard_current();
            self.cleaning_buffer_counter -= 1;
            self.hal.schedule_next_tick(self.cfg.timer_rate / 200);
            return;
        }

        if self.current.is_none() {
            match self.acquire_block() {
                Acquire::Acquired => {}
                Acquire::Deferred => return,
                Acquire::Empty => {
                    self.hal.schedule_next_tick(self.cfg.timer_rate / 1000);
                    return;
                }
            }
        }

        let block = match self.current {
            Some(block) => block,
            None => return,
        };

        // endstops first: a confirmed trigger ends the block before any
        // further pulse can go out in the offending direction
        let tripped = self.endstops.check(
            &mut self.hal,
            &self.cfg,
            &block,
            self.out_bits,
            self.router.performing_homing,
            &self.count_position,
        );
        if tripped {
            self.step_events_completed = block.step_event_count;
            warning!("endstop latched, block truncated");
            self.finish_block();
            self.hal.schedule_next_tick(self.cfg.timer_rate / 1000);
            return;
        }

        // Bresenham tracer, possibly several events per interrupt
        for _ in 0..self.trap.step_loops {
            self.trace_one_event(&block);
            self.step_events_completed += 1;
            if self.step_events_completed >= block.step_event_count {
                break;
            }
        }

        let (interval, phase) =
            self.trap
                .next_interval(&block, self.step_events_completed, &self.cfg);
        if self.cfg.has(Features::ADVANCE) {
            self.advance.accumulate(phase, &block, self.trap.step_loops);
        }
        self.hal.schedule_next_tick(interval);

        if self.step_events_completed >= block.step_event_count {
            self.finish_block();
        }
    }

    /// The auxiliary fixed-rate timer body: drain pending extruder steps
    /// booked by the pressure-advance integrator, a few per fire.
    pub fn on_advance_timer(&mut self) {
        if !self.cfg.has(Features::ADVANCE) {
            return;
        }
        for _ in 0..4 {
            for e in 0..self.cfg.num_extruders {
                let pending = self.advance.pending(e as usize);
                if pending == 0 {
                    continue;
                }
                let negative = pending < 0;
                self.router.e_dir(&mut self.hal, &self.cfg, e, negative);
                self.router.e_step(&mut self.hal, &self.cfg, e, true);
                self.router.e_step(&mut self.hal, &self.cfg, e, false);
                self.advance.e_steps[e as usize] += if negative { 1 } else { -1 };
            }
        }
    }

    fn acquire_block(&mut self) -> Acquire {
        let block = match self.queue.current() {
            Some(head) => {
                head.busy = true;
                *head
            }
            None => return Acquire::Empty,
        };

        if block.direction_bits != self.out_bits {
            self.out_bits = block.direction_bits;
            self.apply_directions(block.active_extruder);
        }
        self.trap.reset(&block, &self.cfg);
        if self.cfg.has(Features::ADVANCE) {
            self.advance.reset_for_block(&block);
        }
        let half = (block.step_event_count >> 1) as i32;
        self.counter = [-half; Axis::COUNT];
        self.step_events_completed = 0;
        let wants_z = block.steps[Axis::Z.index()] > 0;
        self.current = Some(block);

        if self.cfg.has(Features::Z_LATE_ENABLE) && wants_z {
            // give the Z driver a tick to wake up before the first pulse
            self.set_axis_enabled(Axis::Z, true);
            self.hal.schedule_next_tick(self.cfg.timer_rate / 1000);
            return Acquire::Deferred;
        }
        Acquire::Acquired
    }

    fn finish_block(&mut self) {
        self.current = None;
        self.queue.discard_current();
    }

    fn trace_one_event(&mut self, block: &Block) {
        if self.cfg.has(Features::ADVANCE) {
            let i = Axis::E.index();
            self.counter[i] += block.steps[i] as i32;
            if self.counter[i] > 0 {
                self.counter[i] -= block.step_event_count as i32;
                self.advance
                    .bresenham_e_step(block, self.out_bits.contains(AxisBits::E));
            }
        }

        // rising edges for every axis due a step, then all falling edges,
        // so each driver sees a pulse at least as wide as the axis sweep
        let mut stepped = AxisBits::empty();
        for axis in Axis::ALL {
            if axis == Axis::E && self.cfg.has(Features::ADVANCE) {
                continue;
            }
            let i = axis.index();
            self.counter[i] += block.steps[i] as i32;
            if self.counter[i] > 0 {
                self.apply_step(axis, block.active_extruder, false, true);
                self.counter[i] -= block.step_event_count as i32;
                self.count_position[i] += self.count_direction[i];
                stepped |= axis.bit();
            }
        }
        for axis in Axis::ALL {
            if stepped.contains(axis.bit()) {
                self.apply_step(axis, block.active_extruder, false, false);
            }
        }
    }

    /// Latch the direction mask into the driver pins and refresh the
    /// position deltas.
    fn apply_directions(&mut self, active_extruder: u8) {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let negative = self.out_bits.contains(axis.bit());
            self.apply_dir(axis, active_extruder, false, negative);
            self.count_direction[axis.index()] = if negative { -1 } else { 1 };
        }
        if !self.cfg.has(Features::ADVANCE) {
            let negative = self.out_bits.contains(AxisBits::E);
            self.apply_dir(Axis::E, active_extruder, false, negative);
            self.count_direction[Axis::E.index()] = if negative { -1 } else { 1 };
        }
    }

    fn apply_step(&mut self, axis: Axis, active_extruder: u8, always: bool, pulse_on: bool) {
        match axis {
            Axis::X => {
                self.router
                    .x_step(&mut self.hal, &self.cfg, active_extruder, always, pulse_on)
            }
            Axis::Y => self.router.y_step(&mut self.hal, &self.cfg, pulse_on),
            Axis::Z => self.router.z_step(
                &mut self.hal,
                &self.cfg,
                self.endstops.old_bits(),
                self.count_direction[Axis::Z.index()],
                pulse_on,
            ),
            Axis::E => self
                .router
                .e_step(&mut self.hal, &self.cfg, active_extruder, pulse_on),
        }
    }

    fn apply_dir(&mut self, axis: Axis, active_extruder: u8, always: bool, negative: bool) {
        match axis {
            Axis::X => {
                self.router
                    .x_dir(&mut self.hal, &self.cfg, active_extruder, always, negative)
            }
            Axis::Y => self.router.y_dir(&mut self.hal, &self.cfg, negative),
            Axis::Z => self.router.z_dir(&mut self.hal, &self.cfg, negative),
            Axis::E => self
                .router
                .e_dir(&mut self.hal, &self.cfg, active_extruder, negative),
        }
    }

    // ------------------------------------------------------------------
    // main-loop API

    /// Hand a planned block to the executor. Single producer only.
    pub fn queue_block(&mut self, block: Block) -> Result<(), EnqueueError> {
        self.queue.push(block)
    }

    pub fn blocks_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// A block is being traced or is waiting in the queue.
    pub fn busy(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    /// True while the post-quick-stop flush window is still draining.
    pub fn flushing(&self) -> bool {
        self.cleaning_buffer_counter > 0
    }

    /// Spin until every queued block has executed. `idle` runs between
    /// polls; in firmware it services non-motion work, in a simulation it
    /// advances the mock timer.
    pub fn synchronize(&mut self, mut idle: impl FnMut(&mut Self)) {
        while self.busy() {
            idle(self);
        }
    }

    /// Abort motion: flush the running block and drain the queue, then let
    /// the interrupt idle through a cleaning window.
    pub fn quick_stop(&mut self) {
        self.cleaning_buffer_counter = CLEANING_TICKS;
        self.hal.disable_step_interrupt();
        self.queue.clear();
        self.current = None;
        self.hal.enable_step_interrupt();
        info!("quick stop, queue drained");
    }

    /// Wait for motion to finish, then power down every driver.
    pub fn finish_and_disable(&mut self, idle: impl FnMut(&mut Self)) {
        self.synchronize(idle);
        for axis in Axis::ALL {
            self.set_axis_enabled(axis, false);
        }
    }

    pub fn set_axis_enabled(&mut self, axis: Axis, on: bool) {
        self.router.enable_axis(&mut self.hal, &self.cfg, axis, on);
    }

    pub fn set_position(&mut self, x: i32, y: i32, z: i32, e: i32) {
        self.hal.disable_step_interrupt();
        self.count_position = [x, y, z, e];
        self.hal.enable_step_interrupt();
    }

    pub fn set_e_position(&mut self, e: i32) {
        self.hal.disable_step_interrupt();
        self.count_position[Axis::E.index()] = e;
        self.hal.enable_step_interrupt();
    }

    pub fn position(&mut self, axis: Axis) -> i32 {
        self.hal.disable_step_interrupt();
        let steps = self.count_position[axis.index()];
        self.hal.enable_step_interrupt();
        steps
    }

    pub fn position_mm(&mut self, axis: Axis) -> f32 {
        self.position(axis) as f32 / self.cfg.steps_per_unit[axis.index()]
    }

    // ------------------------------------------------------------------
    // endstop API

    pub fn enable_endstops(&mut self, check: bool) {
        self.endstops.set_enabled(check);
    }

    pub fn endstop_hits(&self) -> EndstopBits {
        self.endstops.hit_bits()
    }

    pub fn endstop_trigger_steps(&self, axis: Axis) -> i32 {
        self.endstops.trigger_steps(axis)
    }

    /// Clear the hit latch without reporting (used after deliberate homing
    /// bumps).
    pub fn endstop_hits_on_purpose(&mut self) {
        self.endstops.clear_hits();
    }

    /// Drain the hit latch into a console line. With abort-on-hit armed
    /// this also quick-stops; heater and SD shutdown stay with the caller.
    pub fn check_hit_endstops(&mut self) -> Option<EndstopReport> {
        let line = self.endstops.hit_report(&self.cfg)?;
        let abort = self.endstops.abort_on_hit;
        if abort {
            self.quick_stop();
        }
        Some(EndstopReport { line, abort })
    }

    pub fn set_abort_on_endstop_hit(&mut self, abort: bool) {
        self.endstops.abort_on_hit = abort;
    }

    // ------------------------------------------------------------------
    // dual-Z homing controls

    pub fn set_homing(&mut self, homing: bool) {
        self.router.performing_homing = homing;
    }

    pub fn lock_z_motor(&mut self, locked: bool) {
        self.router.locked_z_motor = locked;
    }

    pub fn lock_z2_motor(&mut self, locked: bool) {
        self.router.locked_z2_motor = locked;
    }

    pub fn set_duplication_mode(&mut self, enabled: bool) {
        self.router.duplication_enabled = enabled;
    }

    // ------------------------------------------------------------------
    // babystep

    /// One-step nudge, callable from another interrupt. Deliberately does
    /// not touch the position mirror: the offset is meant to be invisible
    /// to the commanded path.
    pub fn babystep(&mut self, axis: Axis, negative: bool) {
        match axis {
            Axis::X | Axis::Y => self.babystep_axis(axis, negative),
            Axis::Z => {
                if self.cfg.has(Features::DELTA) {
                    self.babystep_delta_z(negative);
                } else {
                    self.babystep_axis(axis, negative);
                }
            }
            Axis::E => {}
        }
    }

    fn babystep_axis(&mut self, axis: Axis, negative: bool) {
        self.set_axis_enabled(axis, true);
        let saved_negative = self.out_bits.contains(axis.bit());
        let invert = axis == Axis::Z && self.cfg.babystep_invert_z;
        self.apply_dir(axis, 0, true, negative ^ invert);
        self.apply_step(axis, 0, true, true);
        self.hal.delay_us(2);
        self.apply_step(axis, 0, true, false);
        self.apply_dir(axis, 0, true, saved_negative);
    }

    /// Delta towers move together for a Z nudge.
    fn babystep_delta_z(&mut self, negative: bool) {
        let direction = negative ^ self.cfg.babystep_invert_z;
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            self.set_axis_enabled(axis, true);
        }
        let saved = self.out_bits;
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            self.apply_dir(axis, 0, true, direction);
        }
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            self.apply_step(axis, 0, true, true);
        }
        self.hal.delay_us(1);
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            self.apply_step(axis, 0, true, false);
        }
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            self.apply_dir(axis, 0, true, saved.contains(axis.bit()));
        }
    }

    // ------------------------------------------------------------------

    pub fn config(&self) -> &MotionConfig {
        &self.cfg
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }
}
