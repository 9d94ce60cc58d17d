//! Capability and polarity configuration.
//!
//! One [`MotionConfig`] instance is built at startup and handed to the
//! stepper core. Machine capabilities are a single [`Features`] word so
//! that hot-path dispatch stays a one-word bit test.

use bitflags::bitflags;

use crate::endstop::EndstopBits;
use crate::hal::EndstopSwitch;
use crate::Axis;

bitflags! {
    /// Build capabilities of the machine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Features: u16 {
        /// X/Y head axes are driven by A/B motors together.
        const COREXY = 1 << 0;
        /// Two independent X carriages, selected by the active extruder.
        const DUAL_X_CARRIAGE = 1 << 1;
        /// Second Y driver mirrors the first.
        const DUAL_Y_STEPPERS = 1 << 2;
        /// Second Z driver mirrors the first.
        const DUAL_Z_STEPPERS = 1 << 3;
        /// Each Z motor has its own endstop; homing can halt one motor
        /// while the other keeps going.
        const DUAL_Z_ENDSTOPS = 1 << 4;
        /// Power the Z driver only when a block actually moves Z, with a
        /// wake-up delay before the first pulse.
        const Z_LATE_ENABLE = 1 << 5;
        /// Pressure-advance extrusion through the auxiliary timer.
        const ADVANCE = 1 << 6;
        /// Dedicated Z probe switch in addition to the Z endstops.
        const Z_PROBE_ENDSTOP = 1 << 7;
        /// Emit 2 or 4 step pulses per interrupt at high step rates.
        const HIGH_SPEED_STEPPING = 1 << 8;
        /// Delta kinematics; Z babysteps pulse all three towers.
        const DELTA = 1 << 9;
    }
}

pub const MAX_EXTRUDERS: usize = 4;

/// Static machine description consumed by the motion core.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub features: Features,

    /// Step-timer ticks per second.
    pub timer_rate: u32,
    /// Hard ceiling on the step frequency of the dominant axis.
    pub max_step_frequency: u32,
    /// Above this rate the core doubles (then quadruples) steps per
    /// interrupt instead of shrinking the interval further.
    pub double_step_frequency: u32,

    /// Per-axis step pin inversion; the E entry covers every extruder.
    pub invert_step: [bool; Axis::COUNT],
    /// Direction pin inversion for X, Y, Z.
    pub invert_dir: [bool; 3],
    /// Direction pin inversion per extruder.
    pub invert_e_dir: [bool; MAX_EXTRUDERS],
    /// Electrical level of the second Y direction pin relative to the first.
    pub invert_y2_vs_y_dir: bool,
    /// Electrical level that powers a driver on; the E entry covers every
    /// extruder.
    pub enable_on: [bool; Axis::COUNT],

    /// Which switches are actually wired up. Unfitted switches never read
    /// as asserted.
    pub fitted_endstops: EndstopBits,
    /// Per-switch inversion: `true` when the asserted state reads low.
    pub endstop_inverting: [bool; EndstopSwitch::COUNT],

    /// Homing direction for X, Y, Z: -1 toward min, +1 toward max.
    pub home_dir: [i8; 3],
    /// Homing direction of the second X carriage.
    pub x2_home_dir: i8,

    pub steps_per_unit: [f32; Axis::COUNT],
    pub num_extruders: u8,

    /// Flip the direction of Z babysteps.
    pub babystep_invert_z: bool,
}

impl MotionConfig {
    pub fn has(&self, feature: Features) -> bool {
        self.features.contains(feature)
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            features: Features::empty(),
            timer_rate: 1_000_000,
            max_step_frequency: 40_000,
            double_step_frequency: 10_000,
            invert_step: [false; Axis::COUNT],
            invert_dir: [false; 3],
            invert_e_dir: [false; MAX_EXTRUDERS],
            invert_y2_vs_y_dir: false,
            enable_on: [false; Axis::COUNT],
            fitted_endstops: EndstopBits::X_MIN
                .union(EndstopBits::Y_MIN)
                .union(EndstopBits::Z_MIN)
                .union(EndstopBits::X_MAX)
                .union(EndstopBits::Y_MAX)
                .union(EndstopBits::Z_MAX),
            endstop_inverting: [false; EndstopSwitch::COUNT],
            home_dir: [-1, -1, -1],
            x2_home_dir: 1,
            steps_per_unit: [80.0, 80.0, 400.0, 95.0],
            num_extruders: 1,
            babystep_invert_z: false,
        }
    }
}
