//! Shared simulation harness: a recording mock HAL plus helpers that drive
//! the stepper interrupt from a simulated free-running timer.

#![allow(dead_code)]

use motion_core::block::Block;
use motion_core::hal::{rearm_target, EndstopSwitch, MotionHal, StepperDriver};
use motion_core::stepper::Stepper;
use motion_core::{Axis, AxisBits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    Step,
    Dir,
    Enable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    pub at: u32,
    pub kind: PinKind,
    pub driver: StepperDriver,
    pub high: bool,
}

/// Mock of the timer and pin hardware. The counter only advances when the
/// harness jumps it to the programmed compare value, so every pin event
/// carries the exact tick time it happened at.
pub struct MockHal {
    pub now: u32,
    pub compare: u32,
    pub irq_enabled: bool,
    pub endstop_levels: [bool; EndstopSwitch::COUNT],
    pub events: Vec<PinEvent>,
    /// Every interval handed to `schedule_next_tick`, in order.
    pub intervals: Vec<u32>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            now: 0,
            compare: 0,
            irq_enabled: false,
            endstop_levels: [false; EndstopSwitch::COUNT],
            events: Vec::new(),
            intervals: Vec::new(),
        }
    }

    pub fn assert_switch(&mut self, switch: EndstopSwitch) {
        self.endstop_levels[switch.index()] = true;
    }

    pub fn release_switch(&mut self, switch: EndstopSwitch) {
        self.endstop_levels[switch.index()] = false;
    }

    /// Times of the rising step edges seen by one driver.
    pub fn rising_steps(&self, driver: StepperDriver) -> Vec<u32> {
        self.events
            .iter()
            .filter(|e| e.kind == PinKind::Step && e.driver == driver && e.high)
            .map(|e| e.at)
            .collect()
    }

    pub fn step_count(&self, driver: StepperDriver) -> usize {
        self.rising_steps(driver).len()
    }
}

impl MotionHal for MockHal {
    fn set_step_pin(&mut self, driver: StepperDriver, high: bool) {
        self.events.push(PinEvent {
            at: self.now,
            kind: PinKind::Step,
            driver,
            high,
        });
    }

    fn set_dir_pin(&mut self, driver: StepperDriver, high: bool) {
        self.events.push(PinEvent {
            at: self.now,
            kind: PinKind::Dir,
            driver,
            high,
        });
    }

    fn set_enable_pin(&mut self, driver: StepperDriver, high: bool) {
        self.events.push(PinEvent {
            at: self.now,
            kind: PinKind::Enable,
            driver,
            high,
        });
    }

    fn read_endstop(&mut self, switch: EndstopSwitch) -> bool {
        self.endstop_levels[switch.index()]
    }

    fn timer_count(&self) -> u32 {
        self.now
    }

    fn schedule_next_tick(&mut self, interval: u32) {
        self.intervals.push(interval);
        self.compare = rearm_target(self.now, self.now.wrapping_add(interval));
    }

    fn enable_step_interrupt(&mut self) {
        self.irq_enabled = true;
    }

    fn disable_step_interrupt(&mut self) {
        self.irq_enabled = false;
    }

    fn delay_us(&mut self, us: u32) {
        // the mock clock runs at 1 MHz
        self.now = self.now.wrapping_add(us);
    }
}

/// Jump simulated time to the programmed compare value and fire the step
/// interrupt once.
pub fn tick(st: &mut Stepper<MockHal>) {
    let target = st.hal().compare;
    st.hal_mut().now = target;
    st.on_step_timer();
}

pub fn run_ticks(st: &mut Stepper<MockHal>, n: usize) {
    for _ in 0..n {
        tick(st);
    }
}

/// Tick until the executor goes idle. Panics if the move never finishes.
pub fn run_until_idle(st: &mut Stepper<MockHal>, max_ticks: usize) -> usize {
    let mut ticks = 0;
    while st.busy() {
        tick(st);
        ticks += 1;
        assert!(ticks <= max_ticks, "executor still busy after {max_ticks} ticks");
    }
    ticks
}

/// Build a block from signed per-axis step counts.
pub fn make_block(
    steps: [i32; 4],
    initial_rate: u32,
    nominal_rate: u32,
    final_rate: u32,
    accelerate_until: u32,
    decelerate_after: u32,
    acceleration_rate: u32,
) -> Block {
    let mut mags = [0u32; 4];
    let mut dirs = AxisBits::empty();
    for (i, axis) in Axis::ALL.iter().enumerate() {
        mags[i] = steps[i].unsigned_abs();
        if steps[i] < 0 {
            dirs |= axis.bit();
        }
    }
    Block {
        steps: mags,
        step_event_count: *mags.iter().max().unwrap(),
        direction_bits: dirs,
        accelerate_until,
        decelerate_after,
        initial_rate,
        nominal_rate,
        final_rate,
        acceleration_rate,
        ..Block::default()
    }
}

/// A flat-profile block that cruises at one rate from first to last step.
pub fn cruise_block(steps: [i32; 4], rate: u32) -> Block {
    let mut block = make_block(steps, rate, rate, rate, 0, 0, 0);
    block.decelerate_after = block.step_event_count;
    block
}

/// Pre-scale an acceleration in steps/s^2 for a block's acceleration_rate
/// field, given the timer tick rate.
pub fn scaled_accel(steps_per_s2: u64, timer_rate: u64) -> u32 {
    ((steps_per_s2 << 32) / timer_rate) as u32
}
