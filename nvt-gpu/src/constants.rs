//! Constants for GPU control
//!
//! Centralizes safety defaults and unit conversions used by the facade.

/// Default safety limits. These are intentionally conservative; the GPU may
/// accept larger values, but every write path clamps against the limits the
/// controller was constructed with.
pub mod limits {
    /// Maximum core clock offset magnitude in MHz
    pub const MAX_CORE_OFFSET_MHZ: i32 = 200;

    /// Maximum memory clock offset magnitude in MHz
    pub const MAX_MEMORY_OFFSET_MHZ: i32 = 500;

    /// Minimum fan speed percentage accepted in manual mode
    pub const MIN_FAN_PERCENT: u32 = 30;

    /// Temperature at which the user should be warned; manual fan writes
    /// are raised to at least [`WARNING_FAN_PERCENT`] here
    pub const WARNING_TEMP_C: u32 = 80;

    /// Temperature at which fan writes are forced to 100% and clock offset
    /// writes are refused outright
    pub const CRITICAL_TEMP_C: u32 = 90;

    /// Fan floor enforced between the warning and critical temperatures
    pub const WARNING_FAN_PERCENT: u32 = 70;
}

/// Unit conversions at the NVML boundary
pub mod units {
    /// NVML reports power in milliwatts
    pub const MILLIWATTS_PER_WATT: f64 = 1000.0;

    /// NVML reports memory in bytes
    pub const BYTES_PER_MIB: u64 = 1024 * 1024;
}

/// Telemetry bookkeeping
pub mod telemetry {
    /// Rolling window length for the average core clock (one sample per poll)
    pub const CLOCK_WINDOW_SAMPLES: usize = 30;

    /// Thermal slowdown threshold reported when the driver does not expose one
    pub const FALLBACK_SLOWDOWN_TEMP_C: u32 = 83;
}
