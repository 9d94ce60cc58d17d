//! Endstop sampling, debouncing, direction gating and trigger latching.
//!
//! The sampler runs on every stepper tick while checking is enabled. A
//! switch counts as triggered only when two consecutive samples agree,
//! which filters single-tick glitches without any extra timer. A confirmed
//! trigger is gated on the block actually moving toward that switch, then
//! latched sticky together with the machine position at the instant of the
//! trigger; the latch is drained from thread context.

use core::fmt::Write;

use bitflags::bitflags;
use heapless::String;

use crate::block::Block;
use crate::config::{Features, MotionConfig};
use crate::hal::{EndstopSwitch, MotionHal};
use crate::{Axis, AxisBits};

bitflags! {
    /// Switch state and latch masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EndstopBits: u16 {
        const X_MIN = 1 << 0;
        const Y_MIN = 1 << 1;
        const Z_MIN = 1 << 2;
        const Z_PROBE = 1 << 3;
        const X_MAX = 1 << 4;
        const Y_MAX = 1 << 5;
        const Z_MAX = 1 << 6;
        const Z2_MIN = 1 << 7;
        const Z2_MAX = 1 << 8;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for EndstopBits {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=u16:b}", self.bits());
    }
}

const SWITCH_MAP: [(EndstopBits, EndstopSwitch); EndstopSwitch::COUNT] = [
    (EndstopBits::X_MIN, EndstopSwitch::XMin),
    (EndstopBits::X_MAX, EndstopSwitch::XMax),
    (EndstopBits::Y_MIN, EndstopSwitch::YMin),
    (EndstopBits::Y_MAX, EndstopSwitch::YMax),
    (EndstopBits::Z_MIN, EndstopSwitch::ZMin),
    (EndstopBits::Z_MAX, EndstopSwitch::ZMax),
    (EndstopBits::Z2_MIN, EndstopSwitch::Z2Min),
    (EndstopBits::Z2_MAX, EndstopSwitch::Z2Max),
    (EndstopBits::Z_PROBE, EndstopSwitch::ZProbe),
];

/// Maximum length of a formatted hit-report line.
pub type ReportLine = String<96>;

pub struct Endstops {
    enabled: bool,
    old_bits: EndstopBits,
    hit_bits: EndstopBits,
    /// Machine position captured when each axis latched.
    trig_steps: [i32; 3],
    pub(crate) abort_on_hit: bool,
}

impl Endstops {
    pub fn new() -> Self {
        Self {
            enabled: true,
            old_bits: EndstopBits::empty(),
            hit_bits: EndstopBits::empty(),
            trig_steps: [0; 3],
            abort_on_hit: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, check: bool) {
        self.enabled = check;
    }

    pub fn hit_bits(&self) -> EndstopBits {
        self.hit_bits
    }

    /// Last tick's debounced sample, consulted by the dual-Z step router.
    pub(crate) fn old_bits(&self) -> EndstopBits {
        self.old_bits
    }

    /// Position latched when the given axis tripped.
    pub fn trigger_steps(&self, axis: Axis) -> i32 {
        match axis {
            Axis::X | Axis::Y | Axis::Z => self.trig_steps[axis.index()],
            Axis::E => 0,
        }
    }

    /// Clear the latch without reporting.
    pub fn clear_hits(&mut self) {
        self.hit_bits = EndstopBits::empty();
    }

    /// Sample every fitted switch, confirm against the previous tick, and
    /// gate confirmed triggers on the block's motion direction. Returns
    /// `true` when the running block must terminate this tick.
    pub(crate) fn check<H: MotionHal>(
        &mut self,
        hal: &mut H,
        cfg: &MotionConfig,
        block: &Block,
        out_bits: AxisBits,
        performing_homing: bool,
        count_position: &[i32; Axis::COUNT],
    ) -> bool {
        if !self.enabled {
            return false;
        }

        let mut current = EndstopBits::empty();
        for (bit, switch) in SWITCH_MAP {
            if cfg.fitted_endstops.contains(bit)
                && hal.read_endstop(switch) != cfg.endstop_inverting[switch.index()]
            {
                current |= bit;
            }
        }
        if cfg.has(Features::DUAL_Z_ENDSTOPS) {
            // machines without dedicated Z2 switches mirror the Z pair
            if !cfg.fitted_endstops.contains(EndstopBits::Z2_MIN) {
                current.set(EndstopBits::Z2_MIN, current.contains(EndstopBits::Z_MIN));
            }
            if !cfg.fitted_endstops.contains(EndstopBits::Z2_MAX) {
                current.set(EndstopBits::Z2_MAX, current.contains(EndstopBits::Z_MAX));
            }
        }

        let confirmed = current.intersection(self.old_bits);
        let mut terminate = false;

        // On CoreXY the head only moves along X when the signed A and B
        // deltas do not cancel, so the X/Y gates come from the motor deltas
        // instead of the motor direction bits.
        let (x_moving, x_negative, y_moving, y_negative) = if cfg.has(Features::COREXY) {
            let a = block.signed_steps(Axis::X);
            let b = block.signed_steps(Axis::Y);
            let dx = a + b;
            let dy = a - b;
            (dx != 0, dx < 0, dy != 0, dy < 0)
        } else {
            (
                block.steps[Axis::X.index()] > 0,
                out_bits.contains(AxisBits::X),
                block.steps[Axis::Y.index()] > 0,
                out_bits.contains(AxisBits::Y),
            )
        };

        if x_moving {
            // with two carriages only the active one, and only in its
            // homing direction
            let carriage_gated = !cfg.has(Features::DUAL_X_CARRIAGE) || {
                let home = if block.active_extruder == 0 {
                    cfg.home_dir[0]
                } else {
                    cfg.x2_home_dir
                };
                home == if x_negative { -1 } else { 1 }
            };
            let bit = if x_negative {
                EndstopBits::X_MIN
            } else {
                EndstopBits::X_MAX
            };
            if carriage_gated && confirmed.contains(bit) {
                self.trig_steps[0] = count_position[0];
                self.hit_bits |= bit;
                terminate = true;
            }
        }

        if y_moving {
            let bit = if y_negative {
                EndstopBits::Y_MIN
            } else {
                EndstopBits::Y_MAX
            };
            if confirmed.contains(bit) {
                self.trig_steps[1] = count_position[1];
                self.hit_bits |= bit;
                terminate = true;
            }
        }

        if block.steps[Axis::Z.index()] > 0 {
            let z_negative = out_bits.contains(AxisBits::Z);
            let (z_bit, z2_bit) = if z_negative {
                (EndstopBits::Z_MIN, EndstopBits::Z2_MIN)
            } else {
                (EndstopBits::Z_MAX, EndstopBits::Z2_MAX)
            };
            if cfg.has(Features::DUAL_Z_ENDSTOPS) {
                let pair = confirmed.contains(z_bit) as u8
                    | (confirmed.contains(z2_bit) as u8) << 1;
                if pair != 0 {
                    self.trig_steps[2] = count_position[2];
                    self.hit_bits |= z_bit;
                    // while homing one latched switch only pauses its own
                    // motor; the block ends once both have latched
                    if !performing_homing || pair == 0b11 {
                        terminate = true;
                    }
                }
            } else if confirmed.contains(z_bit) {
                self.trig_steps[2] = count_position[2];
                self.hit_bits |= z_bit;
                terminate = true;
            }
            if cfg.has(Features::Z_PROBE_ENDSTOP) && confirmed.contains(EndstopBits::Z_PROBE) {
                self.trig_steps[2] = count_position[2];
                self.hit_bits |= EndstopBits::Z_PROBE;
                terminate = true;
            }
        }

        self.old_bits = current;
        terminate
    }

    /// Format the latched hits for the serial console and clear the latch.
    pub(crate) fn hit_report(&mut self, cfg: &MotionConfig) -> Option<ReportLine> {
        if self.hit_bits.is_empty() {
            return None;
        }
        let mut line = ReportLine::new();
        let _ = line.push_str("echo: endstops hit:");
        if self
            .hit_bits
            .intersects(EndstopBits::X_MIN | EndstopBits::X_MAX)
        {
            let _ = write!(
                line,
                " X:{:.2}",
                self.trig_steps[0] as f32 / cfg.steps_per_unit[0]
            );
        }
        if self
            .hit_bits
            .intersects(EndstopBits::Y_MIN | EndstopBits::Y_MAX)
        {
            let _ = write!(
                line,
                " Y:{:.2}",
                self.trig_steps[1] as f32 / cfg.steps_per_unit[1]
            );
        }
        if self.hit_bits.intersects(
            EndstopBits::Z_MIN | EndstopBits::Z_MAX | EndstopBits::Z2_MIN | EndstopBits::Z2_MAX,
        ) {
            let _ = write!(
                line,
                " Z:{:.2}",
                self.trig_steps[2] as f32 / cfg.steps_per_unit[2]
            );
        }
        if self.hit_bits.contains(EndstopBits::Z_PROBE) {
            let _ = write!(
                line,
                " Z_PROBE:{:.2}",
                self.trig_steps[2] as f32 / cfg.steps_per_unit[2]
            );
        }
        self.hit_bits = EndstopBits::empty();
        Some(line)
    }
}

impl Default for Endstops {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::StepperDriver;

    struct PinHal {
        levels: [bool; EndstopSwitch::COUNT],
    }

    impl PinHal {
        fn new() -> Self {
            Self {
                levels: [false; EndstopSwitch::COUNT],
            }
        }

        fn assert_switch(&mut self, switch: EndstopSwitch) {
            self.levels[switch.index()] = true;
        }

        fn release_switch(&mut self, switch: EndstopSwitch) {
            self.levels[switch.index()] = false;
        }
    }

    impl MotionHal for PinHal {
        fn set_step_pin(&mut self, _: StepperDriver, _: bool) {}
        fn set_dir_pin(&mut self, _: StepperDriver, _: bool) {}
        fn set_enable_pin(&mut self, _: StepperDriver, _: bool) {}
        fn read_endstop(&mut self, switch: EndstopSwitch) -> bool {
            self.levels[switch.index()]
        }
        fn timer_count(&self) -> u32 {
            0
        }
        fn schedule_next_tick(&mut self, _: u32) {}
        fn enable_step_interrupt(&mut self) {}
        fn disable_step_interrupt(&mut self) {}
        fn delay_us(&mut self, _: u32) {}
    }

    fn move_block(steps: [i32; 4]) -> (Block, AxisBits) {
        let mut dirs = AxisBits::empty();
        let mut mags = [0u32; 4];
        for (i, axis) in Axis::ALL.iter().enumerate() {
            mags[i] = steps[i].unsigned_abs();
            if steps[i] < 0 {
                dirs |= axis.bit();
            }
        }
        let block = Block {
            steps: mags,
            step_event_count: *mags.iter().max().unwrap(),
            direction_bits: dirs,
            ..Block::default()
        };
        (block, dirs)
    }

    #[test]
    fn single_sample_glitch_is_ignored() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let cfg = MotionConfig::default();
        let (block, dirs) = move_block([-20, 0, 0, 0]);
        let pos = [0; 4];

        hal.assert_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        hal.release_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().is_empty());
    }

    #[test]
    fn two_agreeing_samples_trip_and_latch() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let cfg = MotionConfig::default();
        let (block, dirs) = move_block([-20, 0, 0, 0]);
        let pos = [-7, 0, 0, 0];

        hal.assert_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().contains(EndstopBits::X_MIN));
        assert_eq!(es.trigger_steps(Axis::X), -7);
    }

    #[test]
    fn wrong_direction_does_not_trip() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let cfg = MotionConfig::default();
        // moving +X, the min switch must not end the block
        let (block, dirs) = move_block([20, 0, 0, 0]);
        let pos = [0; 4];

        hal.assert_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().is_empty());
    }

    #[test]
    fn disabled_checking_samples_nothing() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        es.set_enabled(false);
        let cfg = MotionConfig::default();
        let (block, dirs) = move_block([-20, 0, 0, 0]);
        let pos = [0; 4];

        hal.assert_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().is_empty());
    }

    #[test]
    fn inverted_switch_reads_asserted_when_low() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let mut cfg = MotionConfig::default();
        cfg.endstop_inverting[EndstopSwitch::XMin.index()] = true;
        let (block, dirs) = move_block([-20, 0, 0, 0]);
        let pos = [0; 4];

        // pin low = asserted for an inverting switch
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().contains(EndstopBits::X_MIN));
    }

    #[test]
    fn z_max_trip_latches_z_max() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let cfg = MotionConfig::default();
        let (block, dirs) = move_block([0, 0, 15, 0]);
        let pos = [0, 0, 42, 0];

        hal.assert_switch(EndstopSwitch::ZMax);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().contains(EndstopBits::Z_MAX));
        assert!(!es.hit_bits().contains(EndstopBits::Z_MIN));
        assert_eq!(es.trigger_steps(Axis::Z), 42);
    }

    #[test]
    fn corexy_pure_x_move_ignores_y_switch() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let mut cfg = MotionConfig::default();
        cfg.features |= Features::COREXY;
        // -X head move: both motors step negative, deltas cancel on Y
        let (block, dirs) = move_block([-10, -10, 0, 0]);
        let pos = [0; 4];

        hal.assert_switch(EndstopSwitch::YMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().is_empty());

        // the X min switch does gate this move
        hal.assert_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().contains(EndstopBits::X_MIN));
    }

    #[test]
    fn dual_x_checks_only_active_carriage_home_direction() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let mut cfg = MotionConfig::default();
        cfg.features |= Features::DUAL_X_CARRIAGE;
        cfg.home_dir[0] = -1;
        cfg.x2_home_dir = 1;
        let pos = [0; 4];

        // carriage 1 homes toward max, so its min-direction move is not gated
        let (mut block, dirs) = move_block([-20, 0, 0, 0]);
        block.active_extruder = 1;
        hal.assert_switch(EndstopSwitch::XMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().is_empty());

        // carriage 0 homes toward min and does trip
        block.active_extruder = 0;
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().contains(EndstopBits::X_MIN));
    }

    #[test]
    fn dual_z_homing_waits_for_both_switches() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let mut cfg = MotionConfig::default();
        cfg.features |= Features::DUAL_Z_STEPPERS | Features::DUAL_Z_ENDSTOPS;
        cfg.fitted_endstops |= EndstopBits::Z2_MIN | EndstopBits::Z2_MAX;
        let (block, dirs) = move_block([0, 0, -50, 0]);
        let pos = [0; 4];

        hal.assert_switch(EndstopSwitch::ZMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, true, &pos));
        // one switch latched during homing pauses that motor but keeps the
        // block alive
        assert!(!es.check(&mut hal, &cfg, &block, dirs, true, &pos));
        assert!(es.hit_bits().contains(EndstopBits::Z_MIN));

        hal.assert_switch(EndstopSwitch::Z2Min);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, true, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, true, &pos));
    }

    #[test]
    fn dual_z_outside_homing_trips_on_either() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let mut cfg = MotionConfig::default();
        cfg.features |= Features::DUAL_Z_STEPPERS | Features::DUAL_Z_ENDSTOPS;
        cfg.fitted_endstops |= EndstopBits::Z2_MIN | EndstopBits::Z2_MAX;
        let (block, dirs) = move_block([0, 0, -50, 0]);
        let pos = [0; 4];

        hal.assert_switch(EndstopSwitch::ZMin);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
    }

    #[test]
    fn z_probe_latches_its_own_bit() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let mut cfg = MotionConfig::default();
        cfg.features |= Features::Z_PROBE_ENDSTOP;
        cfg.fitted_endstops |= EndstopBits::Z_PROBE;
        let (block, dirs) = move_block([0, 0, -30, 0]);
        let pos = [0, 0, -11, 0];

        hal.assert_switch(EndstopSwitch::ZProbe);
        assert!(!es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.check(&mut hal, &cfg, &block, dirs, false, &pos));
        assert!(es.hit_bits().contains(EndstopBits::Z_PROBE));
        assert!(!es.hit_bits().contains(EndstopBits::Z_MIN));
        assert_eq!(es.trigger_steps(Axis::Z), -11);
    }

    #[test]
    fn report_formats_positions_and_clears() {
        let mut hal = PinHal::new();
        let mut es = Endstops::new();
        let cfg = MotionConfig::default();
        let (block, dirs) = move_block([-20, 0, 0, 0]);
        // 160 steps at 80 steps/mm is 2 mm
        let pos = [160, 0, 0, 0];

        hal.assert_switch(EndstopSwitch::XMin);
        es.check(&mut hal, &cfg, &block, dirs, false, &pos);
        es.check(&mut hal, &cfg, &block, dirs, false, &pos);

        let line = es.hit_report(&cfg).unwrap();
        assert_eq!(line.as_str(), "echo: endstops hit: X:2.00");
        assert!(es.hit_bits().is_empty());
        assert!(es.hit_report(&cfg).is_none());
    }
}
