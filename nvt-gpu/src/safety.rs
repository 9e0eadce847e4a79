//! Safety policy for GPU writes
//!
//! Pure clamping and validation rules applied by every write path before a
//! value reaches the driver. Clamping silently corrects a request (the
//! caller logs and receives the corrected value); only the thermal guard is
//! a hard refusal.

use serde::{Deserialize, Serialize};

use crate::constants::limits;

/// Process-wide safety bounds, constructed once and threaded into each
/// component that writes to the device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_core_offset_mhz: i32,
    pub max_memory_offset_mhz: i32,
    pub min_fan_percent: u32,
    pub warning_temp_c: u32,
    pub critical_temp_c: u32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_core_offset_mhz: limits::MAX_CORE_OFFSET_MHZ,
            max_memory_offset_mhz: limits::MAX_MEMORY_OFFSET_MHZ,
            min_fan_percent: limits::MIN_FAN_PERCENT,
            warning_temp_c: limits::WARNING_TEMP_C,
            critical_temp_c: limits::CRITICAL_TEMP_C,
        }
    }
}

/// Clamp a signed clock offset into `[-max_abs, max_abs]`.
pub fn clamp_offset(value_mhz: i32, max_abs_mhz: i32) -> i32 {
    value_mhz.clamp(-max_abs_mhz, max_abs_mhz)
}

/// Clamp a power limit into the hardware-reported `[min_w, max_w]` range.
pub fn clamp_power(watts: f64, min_w: f64, max_w: f64) -> f64 {
    watts.clamp(min_w, max_w)
}

/// Apply the fan floor and thermal escalation to a requested speed.
///
/// At or above the critical temperature the request is overridden to 100%.
/// At or above the warning temperature (but below critical) at least 70% is
/// enforced. Below that, the configured minimum fan percentage is the floor.
/// The result is always within 0-100.
pub fn fan_floor(requested_percent: u32, temperature_c: u32, limits: &SafetyLimits) -> u32 {
    if temperature_c >= limits.critical_temp_c {
        return 100;
    }

    let requested = if temperature_c >= limits.warning_temp_c {
        requested_percent.max(crate::constants::limits::WARNING_FAN_PERCENT)
    } else {
        requested_percent
    };

    requested.max(limits.min_fan_percent).min(100)
}

/// Whether a clock-offset write is allowed at the given temperature.
///
/// Returns false at or above the critical temperature: the caller must
/// refuse the write outright, never downgrade it to a clamp.
pub fn thermal_guard(temperature_c: u32, critical_temp_c: u32) -> bool {
    temperature_c < critical_temp_c
}
