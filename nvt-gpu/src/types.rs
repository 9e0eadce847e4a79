//! GPU data types

use std::collections::VecDeque;

use nvml_wrapper::bitmasks::device::ThrottleReasons;
use serde::{Deserialize, Serialize};

use crate::constants::telemetry;

/// Static GPU information; fetched once or on demand, immutable per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub driver_version: String,
    pub vbios_version: String,
    pub pcie_gen: u32,
    pub pcie_width: u32,
    pub memory_total_mb: u64,
}

/// Live GPU telemetry, recomputed on every poll.
///
/// Core fields (temperature, utilization, memory) are mandatory; everything
/// else degrades to a documented default on hardware/driver combinations
/// that do not support it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStats {
    pub temperature_c: u32,
    pub fan_speed_percent: u32,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub gpu_utilization_percent: u32,
    pub memory_utilization_percent: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub core_clock_mhz: u32,
    pub memory_clock_mhz: u32,
    /// Active throttle-reason tags decoded from the driver bitmask
    pub throttle_reasons: Vec<ThrottleReason>,
    /// Highest core clock observed since the last explicit reset
    pub peak_core_clock_mhz: u32,
    /// Integer mean over the last 30 core-clock samples
    pub avg_core_clock_mhz: u32,
    pub pcie_gen: u32,
    pub pcie_width: u32,
    pub pcie_gen_max: u32,
    pub pcie_width_max: u32,
    pub thermal_threshold_c: u32,
    /// Degrees below the slowdown threshold; negative when already past it
    pub thermal_headroom_c: i32,
    /// True when a power cap is actively constraining the boost clock
    pub power_limit_active: bool,
    /// Volatile uncorrected ECC error count, 0 when unsupported
    pub memory_errors: u64,
}

/// Power limit constraints from the GPU, in watts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerLimits {
    pub current_w: f64,
    pub default_w: f64,
    pub min_w: f64,
    pub max_w: f64,
}

/// Current clock offset values. The authoritative value lives in the driver
/// and may read as 0 after a reset even if previously set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClockOffsets {
    pub core_offset_mhz: i32,
    pub memory_offset_mhz: i32,
}

/// One decoded throttle-reason tag. Tags are independent; several may be
/// active at once and their order carries no meaning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    Idle,
    SwPowerCap,
    HwPowerBrake,
    SwThermalSlowdown,
    HwThermalSlowdown,
    HwSlowdown,
    SyncBoost,
    DisplayClockSetting,
    ApplicationClocksSetting,
}

impl ThrottleReason {
    /// Decode the driver bitmask into tags. Raw bits never leave the facade.
    pub fn decode(mask: ThrottleReasons) -> Vec<ThrottleReason> {
        let mut reasons = Vec::new();
        if mask.contains(ThrottleReasons::GPU_IDLE) {
            reasons.push(ThrottleReason::Idle);
        }
        if mask.contains(ThrottleReasons::SW_POWER_CAP) {
            reasons.push(ThrottleReason::SwPowerCap);
        }
        if mask.contains(ThrottleReasons::HW_POWER_BRAKE_SLOWDOWN) {
            reasons.push(ThrottleReason::HwPowerBrake);
        }
        if mask.contains(ThrottleReasons::SW_THERMAL_SLOWDOWN) {
            reasons.push(ThrottleReason::SwThermalSlowdown);
        }
        if mask.contains(ThrottleReasons::HW_THERMAL_SLOWDOWN) {
            reasons.push(ThrottleReason::HwThermalSlowdown);
        }
        if mask.contains(ThrottleReasons::HW_SLOWDOWN) {
            reasons.push(ThrottleReason::HwSlowdown);
        }
        if mask.contains(ThrottleReasons::SYNC_BOOST) {
            reasons.push(ThrottleReason::SyncBoost);
        }
        if mask.contains(ThrottleReasons::DISPLAY_CLOCK_SETTING) {
            reasons.push(ThrottleReason::DisplayClockSetting);
        }
        if mask.contains(ThrottleReasons::APPLICATIONS_CLOCKS_SETTING) {
            reasons.push(ThrottleReason::ApplicationClocksSetting);
        }
        reasons
    }

    /// Whether this tag means a power cap is constraining the clock.
    pub fn is_power_cap(self) -> bool {
        matches!(self, ThrottleReason::SwPowerCap | ThrottleReason::HwPowerBrake)
    }
}

impl std::fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ThrottleReason::Idle => "Idle",
            ThrottleReason::SwPowerCap => "Power (SW)",
            ThrottleReason::HwPowerBrake => "Power (HW)",
            ThrottleReason::SwThermalSlowdown => "Thermal (SW)",
            ThrottleReason::HwThermalSlowdown => "Thermal (HW)",
            ThrottleReason::HwSlowdown => "HW Slowdown",
            ThrottleReason::SyncBoost => "Sync Boost",
            ThrottleReason::DisplayClockSetting => "Display",
            ThrottleReason::ApplicationClocksSetting => "App Clocks",
        };
        write!(f, "{}", label)
    }
}

/// Controller-owned running clock state: the observed peak and the rolling
/// window behind the average. Reset only by explicit user action.
#[derive(Debug, Clone, Default)]
pub struct ClockTracker {
    peak_mhz: u32,
    samples: VecDeque<u32>,
}

impl ClockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one core-clock sample; evicts the oldest sample past the
    /// window length.
    pub fn observe(&mut self, core_clock_mhz: u32) {
        if core_clock_mhz > self.peak_mhz {
            self.peak_mhz = core_clock_mhz;
        }
        self.samples.push_back(core_clock_mhz);
        while self.samples.len() > telemetry::CLOCK_WINDOW_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn peak_mhz(&self) -> u32 {
        self.peak_mhz
    }

    /// Integer mean over the window; 0 with no samples.
    pub fn average_mhz(&self) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u64 = self.samples.iter().map(|&c| c as u64).sum();
        (sum / self.samples.len() as u64) as u32
    }

    pub fn reset_peak(&mut self) {
        self.peak_mhz = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_empty_mask() {
        assert!(ThrottleReason::decode(ThrottleReasons::empty()).is_empty());
    }

    #[test]
    fn decode_multiple_tags() {
        let mask = ThrottleReasons::SW_POWER_CAP | ThrottleReasons::HW_THERMAL_SLOWDOWN;
        let tags = ThrottleReason::decode(mask);
        assert_eq!(tags.len(), 2);
        assert!(tags.contains(&ThrottleReason::SwPowerCap));
        assert!(tags.contains(&ThrottleReason::HwThermalSlowdown));
    }

    #[test]
    fn power_cap_tags() {
        assert!(ThrottleReason::SwPowerCap.is_power_cap());
        assert!(ThrottleReason::HwPowerBrake.is_power_cap());
        assert!(!ThrottleReason::SwThermalSlowdown.is_power_cap());
        assert!(!ThrottleReason::Idle.is_power_cap());
    }

    #[test]
    fn tracker_average_respects_window_cap() {
        let mut tracker = ClockTracker::new();
        for _ in 0..35 {
            tracker.observe(100);
        }
        assert_eq!(tracker.average_mhz(), 100);
    }

    #[test]
    fn tracker_average_integer_mean() {
        let mut tracker = ClockTracker::new();
        for _ in 0..29 {
            tracker.observe(0);
        }
        tracker.observe(300);
        assert_eq!(tracker.average_mhz(), 10);
    }

    #[test]
    fn tracker_empty_average_is_zero() {
        assert_eq!(ClockTracker::new().average_mhz(), 0);
    }

    #[test]
    fn tracker_peak_survives_window_eviction() {
        let mut tracker = ClockTracker::new();
        tracker.observe(2000);
        for _ in 0..40 {
            tracker.observe(100);
        }
        assert_eq!(tracker.peak_mhz(), 2000);
        tracker.reset_peak();
        assert_eq!(tracker.peak_mhz(), 0);
    }
}
