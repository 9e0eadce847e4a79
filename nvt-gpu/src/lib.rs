//! GPU telemetry and control for nvtune
//!
//! Provides the device control facade over the NVIDIA management library
//! (NVML) and the safety policy every write path is clamped against:
//! - Typed reads: device info, live stats with throttle-reason decoding,
//!   power limits, clock offsets
//! - Clamped writes: power limit, clock offsets, frequency locks, fan speed
//! - Thermal guard: clock-offset writes are refused outright at critical
//!   temperature

pub mod constants;
pub mod device;
pub mod safety;
mod types;

pub use device::GpuController;
pub use safety::{clamp_offset, clamp_power, fan_floor, thermal_guard, SafetyLimits};
pub use types::{
    ClockOffsets, ClockTracker, DeviceInfo, DeviceStats, PowerLimits, ThrottleReason,
};

pub use nvt_error::{NvtuneError, Result};
