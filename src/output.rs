//! Axis output router.
//!
//! Maps a logical per-axis step or direction to the physical driver pins:
//! dual-driver fan-out, dual-carriage selection, per-pin polarity, and the
//! per-motor step suppression that dual-endstop Z homing needs. All levels
//! leaving this module are electrical.

use crate::config::{Features, MotionConfig};
use crate::endstop::EndstopBits;
use crate::hal::{MotionHal, StepperDriver};
use crate::Axis;

pub(crate) struct StepRouter {
    /// Dual-X duplication mode: both carriages mirror every X move.
    pub(crate) duplication_enabled: bool,
    /// Set from the main loop for the span of a dual-endstop Z homing move.
    pub(crate) performing_homing: bool,
    pub(crate) locked_z_motor: bool,
    pub(crate) locked_z2_motor: bool,
}

fn dir_level(negative: bool, invert: bool) -> bool {
    if negative {
        invert
    } else {
        !invert
    }
}

impl StepRouter {
    pub(crate) fn new() -> Self {
        Self {
            duplication_enabled: false,
            performing_homing: false,
            locked_z_motor: false,
            locked_z2_motor: false,
        }
    }

    pub(crate) fn x_step<H: MotionHal>(
        &self,
        hal: &mut H,
        cfg: &MotionConfig,
        active_extruder: u8,
        always: bool,
        pulse_on: bool,
    ) {
        let level = pulse_on ^ cfg.invert_step[Axis::X.index()];
        if cfg.has(Features::DUAL_X_CARRIAGE) {
            if self.duplication_enabled || always {
                hal.set_step_pin(StepperDriver::X, level);
                hal.set_step_pin(StepperDriver::X2, level);
            } else if active_extruder != 0 {
                hal.set_step_pin(StepperDriver::X2, level);
            } else {
                hal.set_step_pin(StepperDriver::X, level);
            }
        } else {
            hal.set_step_pin(StepperDriver::X, level);
        }
    }

    pub(crate) fn x_dir<H: MotionHal>(
        &self,
        hal: &mut H,
        cfg: &MotionConfig,
        active_extruder: u8,
        always: bool,
        negative: bool,
    ) {
        let level = dir_level(negative, cfg.invert_dir[0]);
        if cfg.has(Features::DUAL_X_CARRIAGE) {
            if self.duplication_enabled || always {
                hal.set_dir_pin(StepperDriver::X, level);
                hal.set_dir_pin(StepperDriver::X2, level);
            } else if active_extruder != 0 {
                hal.set_dir_pin(StepperDriver::X2, level);
            } else {
                hal.set_dir_pin(StepperDriver::X, level);
            }
        } else {
            hal.set_dir_pin(StepperDriver::X, level);
        }
    }

    pub(crate) fn y_step<H: MotionHal>(&self, hal: &mut H, cfg: &MotionConfig, pulse_on: bool) {
        let level = pulse_on ^ cfg.invert_step[Axis::Y.index()];
        hal.set_step_pin(StepperDriver::Y, level);
        if cfg.has(Features::DUAL_Y_STEPPERS) {
            hal.set_step_pin(StepperDriver::Y2, level);
        }
    }

    pub(crate) fn y_dir<H: MotionHal>(&self, hal: &mut H, cfg: &MotionConfig, negative: bool) {
        let level = dir_level(negative, cfg.invert_dir[1]);
        hal.set_dir_pin(StepperDriver::Y, level);
        if cfg.has(Features::DUAL_Y_STEPPERS) {
            hal.set_dir_pin(StepperDriver::Y2, level != cfg.invert_y2_vs_y_dir);
        }
    }

    /// `z_direction` is the sign currently applied to the Z axis; during
    /// dual-endstop homing a motor whose own switch has latched in the
    /// homing direction is held still while the other catches up.
    pub(crate) fn z_step<H: MotionHal>(
        &self,
        hal: &mut H,
        cfg: &MotionConfig,
        old_endstop_bits: EndstopBits,
        z_direction: i32,
        pulse_on: bool,
    ) {
        let level = pulse_on ^ cfg.invert_step[Axis::Z.index()];
        if !cfg.has(Features::DUAL_Z_STEPPERS) {
            hal.set_step_pin(StepperDriver::Z, level);
            return;
        }
        if cfg.has(Features::DUAL_Z_ENDSTOPS) && self.performing_homing {
            let (z_bit, z2_bit, toward_home) = if cfg.home_dir[2] > 0 {
                (EndstopBits::Z_MAX, EndstopBits::Z2_MAX, z_direction > 0)
            } else {
                (EndstopBits::Z_MIN, EndstopBits::Z2_MIN, z_direction < 0)
            };
            let z_held = (old_endstop_bits.contains(z_bit) && toward_home) || self.locked_z_motor;
            let z2_held =
                (old_endstop_bits.contains(z2_bit) && toward_home) || self.locked_z2_motor;
            if !z_held {
                hal.set_step_pin(StepperDriver::Z, level);
            }
            if !z2_held {
                hal.set_step_pin(StepperDriver::Z2, level);
            }
        } else {
            hal.set_step_pin(StepperDriver::Z, level);
            hal.set_step_pin(StepperDriver::Z2, level);
        }
    }

    pub(crate) fn z_dir<H: MotionHal>(&self, hal: &mut H, cfg: &MotionConfig, negative: bool) {
        let level = dir_level(negative, cfg.invert_dir[2]);
        hal.set_dir_pin(StepperDriver::Z, level);
        if cfg.has(Features::DUAL_Z_STEPPERS) {
            hal.set_dir_pin(StepperDriver::Z2, level);
        }
    }

    pub(crate) fn e_step<H: MotionHal>(
        &self,
        hal: &mut H,
        cfg: &MotionConfig,
        extruder: u8,
        pulse_on: bool,
    ) {
        let level = pulse_on ^ cfg.invert_step[Axis::E.index()];
        hal.set_step_pin(StepperDriver::extruder(extruder), level);
    }

    pub(crate) fn e_dir<H: MotionHal>(
        &self,
        hal: &mut H,
        cfg: &MotionConfig,
        extruder: u8,
        negative: bool,
    ) {
        let invert = cfg.invert_e_dir[(extruder as usize).min(cfg.invert_e_dir.len() - 1)];
        hal.set_dir_pin(StepperDriver::extruder(extruder), dir_level(negative, invert));
    }

    pub(crate) fn enable_axis<H: MotionHal>(
        &self,
        hal: &mut H,
        cfg: &MotionConfig,
        axis: Axis,
        on: bool,
    ) {
        let level = on == cfg.enable_on[axis.index()];
        match axis {
            Axis::X => {
                hal.set_enable_pin(StepperDriver::X, level);
                if cfg.has(Features::DUAL_X_CARRIAGE) {
                    hal.set_enable_pin(StepperDriver::X2, level);
                }
            }
            Axis::Y => {
                hal.set_enable_pin(StepperDriver::Y, level);
                if cfg.has(Features::DUAL_Y_STEPPERS) {
                    hal.set_enable_pin(StepperDriver::Y2, level);
                }
            }
            Axis::Z => {
                hal.set_enable_pin(StepperDriver::Z, level);
                if cfg.has(Features::DUAL_Z_STEPPERS) {
                    hal.set_enable_pin(StepperDriver::Z2, level);
                }
            }
            Axis::E => {
                for e in 0..cfg.num_extruders {
                    hal.set_enable_pin(StepperDriver::extruder(e), level);
                }
            }
        }
    }
}
