//! Device control facade over NVML
//!
//! `GpuController` owns the NVML context for its process lifetime and exposes
//! typed read/write operations with the safety policy applied on every write
//! path. Device handles are re-fetched per call; NVML itself is the
//! authoritative store for clocks, limits, and fan policy.

use nvml_wrapper::enum_wrappers::device::{
    Clock, EccCounter, MemoryError, TemperatureSensor, TemperatureThreshold,
};
use nvml_wrapper::enums::device::{FanControlPolicy, GpuLockedClocksSetting};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use tracing::{debug, info, warn};

use nvt_error::{NvtuneError, Result};

use crate::constants::{telemetry, units};
use crate::safety::{self, SafetyLimits};
use crate::types::{ClockOffsets, ClockTracker, DeviceInfo, DeviceStats, PowerLimits, ThrottleReason};

/// Controller for a single NVIDIA GPU.
///
/// Reads are safe for any caller; writes clamp against the configured
/// [`SafetyLimits`] and require the process to hold sufficient privilege
/// (the driver reports `NoPermission` otherwise, surfaced as
/// [`NvtuneError::PermissionDenied`]).
pub struct GpuController {
    nvml: Nvml,
    index: u32,
    limits: SafetyLimits,
    clocks: ClockTracker,
}

impl GpuController {
    /// Initialize NVML and bind to the GPU at `index`.
    pub fn new(index: u32, limits: SafetyLimits) -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| {
            NvtuneError::DeviceUnavailable(format!("failed to initialize NVML: {}", e))
        })?;

        let count = nvml
            .device_count()
            .map_err(|e| NvtuneError::DeviceUnavailable(format!("device enumeration failed: {}", e)))?;
        if count == 0 {
            return Err(NvtuneError::DeviceUnavailable("no NVIDIA GPU found".to_string()));
        }
        if index >= count {
            return Err(NvtuneError::DeviceUnavailable(format!(
                "GPU index {} not found (available: 0-{})",
                index,
                count - 1
            )));
        }

        let controller = Self {
            nvml,
            index,
            limits,
            clocks: ClockTracker::new(),
        };

        match (controller.device()?.name(), controller.nvml.sys_driver_version()) {
            (Ok(name), Ok(driver)) => info!("NVML initialized: {} (driver {})", name, driver),
            _ => info!("NVML initialized for GPU {}", index),
        }

        Ok(controller)
    }

    /// Initialize with the default safety limits.
    pub fn with_defaults(index: u32) -> Result<Self> {
        Self::new(index, SafetyLimits::default())
    }

    /// Enumerate GPUs present in the system as (index, name) pairs.
    pub fn probe_gpus() -> Result<Vec<(u32, String)>> {
        let nvml = Nvml::init().map_err(|e| {
            NvtuneError::DeviceUnavailable(format!("failed to initialize NVML: {}", e))
        })?;
        let count = nvml
            .device_count()
            .map_err(|e| NvtuneError::DeviceUnavailable(format!("device enumeration failed: {}", e)))?;

        let mut gpus = Vec::with_capacity(count as usize);
        for index in 0..count {
            let name = nvml
                .device_by_index(index)
                .and_then(|d| d.name())
                .unwrap_or_else(|_| "Unknown NVIDIA GPU".to_string());
            gpus.push((index, name));
        }
        Ok(gpus)
    }

    /// The safety limits this controller clamps against.
    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    fn device(&self) -> Result<Device<'_>> {
        self.nvml.device_by_index(self.index).map_err(|e| {
            NvtuneError::DeviceUnavailable(format!("failed to acquire GPU {}: {}", self.index, e))
        })
    }

    // ========================================================================
    // Telemetry
    // ========================================================================

    /// Static device information.
    pub fn info(&self) -> Result<DeviceInfo> {
        let device = self.device()?;

        let name = device.name().map_err(device_err("read GPU name"))?;
        let uuid = device.uuid().map_err(device_err("read GPU uuid"))?;
        let driver_version = self
            .nvml
            .sys_driver_version()
            .map_err(device_err("read driver version"))?;
        // VBIOS and PCIe state are not reported by every driver stack
        let vbios_version = device
            .vbios_version()
            .unwrap_or_else(|_| "Unknown".to_string());
        let pcie_gen = device.current_pcie_link_gen().unwrap_or(0);
        let pcie_width = device.current_pcie_link_width().unwrap_or(0);

        let memory = device.memory_info().map_err(device_err("read memory info"))?;

        Ok(DeviceInfo {
            index: self.index,
            name,
            uuid,
            driver_version,
            vbios_version,
            pcie_gen,
            pcie_width,
            memory_total_mb: memory.total / units::BYTES_PER_MIB,
        })
    }

    /// Live statistics. Temperature, utilization, and memory are mandatory;
    /// every other field independently degrades to its documented default on
    /// unsupported hardware/driver combinations.
    pub fn stats(&mut self) -> Result<DeviceStats> {
        let device = self.device()?;

        let temperature_c = device
            .temperature(TemperatureSensor::Gpu)
            .map_err(device_err("read temperature"))?;
        let utilization = device
            .utilization_rates()
            .map_err(device_err("read utilization"))?;
        let memory = device.memory_info().map_err(device_err("read memory info"))?;

        let fan_speed_percent = device.fan_speed(0).unwrap_or(0);
        let power_draw_w = device
            .power_usage()
            .map(|mw| mw as f64 / units::MILLIWATTS_PER_WATT)
            .unwrap_or(0.0);
        let power_limit_w = device
            .power_management_limit()
            .map(|mw| mw as f64 / units::MILLIWATTS_PER_WATT)
            .unwrap_or(0.0);
        let core_clock_mhz = device.clock_info(Clock::Graphics).unwrap_or(0);
        let memory_clock_mhz = device.clock_info(Clock::Memory).unwrap_or(0);

        let throttle_reasons = device
            .current_throttle_reasons()
            .map(ThrottleReason::decode)
            .unwrap_or_default();

        let (pcie_gen, pcie_width, pcie_gen_max, pcie_width_max) = (
            device.current_pcie_link_gen().unwrap_or(0),
            device.current_pcie_link_width().unwrap_or(0),
            device.max_pcie_link_gen().unwrap_or(0),
            device.max_pcie_link_width().unwrap_or(0),
        );

        let thermal_threshold_c = device
            .temperature_threshold(TemperatureThreshold::Slowdown)
            .unwrap_or(telemetry::FALLBACK_SLOWDOWN_TEMP_C);

        let memory_errors = device
            .total_ecc_errors(MemoryError::Uncorrected, EccCounter::Volatile)
            .unwrap_or(0);
        drop(device);

        self.clocks.observe(core_clock_mhz);

        let power_limit_active = throttle_reasons.iter().any(|r| r.is_power_cap());

        Ok(DeviceStats {
            temperature_c,
            fan_speed_percent,
            power_draw_w,
            power_limit_w,
            gpu_utilization_percent: utilization.gpu,
            memory_utilization_percent: utilization.memory,
            memory_used_mb: memory.used / units::BYTES_PER_MIB,
            memory_total_mb: memory.total / units::BYTES_PER_MIB,
            core_clock_mhz,
            memory_clock_mhz,
            throttle_reasons,
            peak_core_clock_mhz: self.clocks.peak_mhz(),
            avg_core_clock_mhz: self.clocks.average_mhz(),
            pcie_gen,
            pcie_width,
            pcie_gen_max,
            pcie_width_max,
            thermal_threshold_c,
            thermal_headroom_c: thermal_threshold_c as i32 - temperature_c as i32,
            power_limit_active,
            memory_errors,
        })
    }

    /// Zero the tracked peak core clock.
    pub fn reset_peak(&mut self) {
        self.clocks.reset_peak();
        info!("Peak clock counter reset");
    }

    // ========================================================================
    // Power management
    // ========================================================================

    /// Power limit constraints, re-read from the device on every call.
    pub fn power_limits(&self) -> Result<PowerLimits> {
        let device = self.device()?;

        let current = device
            .power_management_limit()
            .map_err(device_err("read power limit"))?;
        let default = device
            .power_management_limit_default()
            .map_err(device_err("read default power limit"))?;
        let constraints = device
            .power_management_limit_constraints()
            .map_err(device_err("read power limit constraints"))?;

        Ok(PowerLimits {
            current_w: current as f64 / units::MILLIWATTS_PER_WATT,
            default_w: default as f64 / units::MILLIWATTS_PER_WATT,
            min_w: constraints.min_limit as f64 / units::MILLIWATTS_PER_WATT,
            max_w: constraints.max_limit as f64 / units::MILLIWATTS_PER_WATT,
        })
    }

    /// Set the power limit, clamped into the hardware-reported range.
    /// Returns the value actually applied.
    pub fn set_power_limit(&mut self, watts: f64) -> Result<f64> {
        let limits = self.power_limits()?;
        let clamped = safety::clamp_power(watts, limits.min_w, limits.max_w);

        if clamped != watts {
            warn!(
                "Power limit {}W clamped to {}W (valid range: {}W - {}W)",
                watts, clamped, limits.min_w, limits.max_w
            );
        }

        let milliwatts = (clamped * units::MILLIWATTS_PER_WATT) as u32;
        let mut device = self.device()?;
        device
            .set_power_management_limit(milliwatts)
            .map_err(write_err("set power limit"))?;

        info!("Power limit set to {}W", clamped);
        Ok(clamped)
    }

    // ========================================================================
    // Clock offsets
    // ========================================================================

    /// Current clock offsets. Either component reads as 0 when the driver
    /// does not expose it (or after a reset).
    pub fn clock_offsets(&self) -> Result<ClockOffsets> {
        let device = self.device()?;
        Ok(ClockOffsets {
            core_offset_mhz: device.gpc_clock_vf_offset().unwrap_or(0),
            memory_offset_mhz: device.mem_clock_vf_offset().unwrap_or(0),
        })
    }

    /// Set clock offsets. Unspecified components default to the current read
    /// value. Both components are clamped against the safety limits, and the
    /// thermal guard is checked against a fresh stats read immediately before
    /// writing; a tripped guard refuses the write with no change.
    /// Returns the (core, memory) values actually applied.
    pub fn set_clock_offsets(
        &mut self,
        core_offset_mhz: Option<i32>,
        memory_offset_mhz: Option<i32>,
    ) -> Result<(i32, i32)> {
        let current = self.clock_offsets()?;
        let requested_core = core_offset_mhz.unwrap_or(current.core_offset_mhz);
        let requested_mem = memory_offset_mhz.unwrap_or(current.memory_offset_mhz);

        let safe_core = safety::clamp_offset(requested_core, self.limits.max_core_offset_mhz);
        let safe_mem = safety::clamp_offset(requested_mem, self.limits.max_memory_offset_mhz);

        if safe_core != requested_core {
            warn!(
                "Core offset {}MHz clamped to {}MHz (limit: ±{}MHz)",
                requested_core, safe_core, self.limits.max_core_offset_mhz
            );
        }
        if safe_mem != requested_mem {
            warn!(
                "Memory offset {}MHz clamped to {}MHz (limit: ±{}MHz)",
                requested_mem, safe_mem, self.limits.max_memory_offset_mhz
            );
        }

        let stats = self.stats()?;
        if !safety::thermal_guard(stats.temperature_c, self.limits.critical_temp_c) {
            return Err(NvtuneError::ThermalGuardTripped {
                temperature: stats.temperature_c,
                critical: self.limits.critical_temp_c,
            });
        }

        let mut device = self.device()?;
        device
            .set_gpc_clock_vf_offset(safe_core)
            .map_err(write_err("set core clock offset"))?;
        info!("Core clock offset set to {}MHz", safe_core);

        device
            .set_mem_clock_vf_offset(safe_mem)
            .map_err(write_err("set memory clock offset"))?;
        info!("Memory clock offset set to {}MHz", safe_mem);

        Ok((safe_core, safe_mem))
    }

    /// Reset clock offsets to stock values.
    pub fn reset_clock_offsets(&mut self) -> Result<()> {
        self.set_clock_offsets(Some(0), Some(0))?;
        info!("Clock offsets reset to stock values");
        Ok(())
    }

    /// Set a frequency lock. `(0, 0)` disables the lock; any other pair sets
    /// the floor/ceiling.
    pub fn set_locked_clocks(&mut self, min_mhz: u32, max_mhz: u32) -> Result<()> {
        let mut device = self.device()?;

        if min_mhz == 0 && max_mhz == 0 {
            device
                .reset_gpu_locked_clocks()
                .map_err(write_err("reset locked clocks"))?;
            info!("GPU locked clocks reset");
        } else {
            device
                .set_gpu_locked_clocks(GpuLockedClocksSetting::Numeric {
                    min_clock_mhz: min_mhz,
                    max_clock_mhz: max_mhz,
                })
                .map_err(write_err("set locked clocks"))?;
            info!("GPU locked clocks set to {}-{} MHz", min_mhz, max_mhz);
        }

        Ok(())
    }

    // ========================================================================
    // Fan control
    // ========================================================================

    /// Number of fans on the GPU; 0 when the driver cannot say.
    pub fn fan_count(&self) -> u32 {
        self.device()
            .and_then(|d| d.num_fans().map_err(device_err("read fan count")))
            .unwrap_or(0)
    }

    /// Current speed of one fan as a percentage. A reading of 0 is
    /// legitimate under zero-RPM idle.
    pub fn fan_speed(&self, fan_index: u32) -> u32 {
        let Ok(device) = self.device() else { return 0 };
        device
            .fan_speed(fan_index)
            .or_else(|_| device.fan_speed(0))
            .unwrap_or(0)
    }

    /// Command one fan to a fixed percentage. The fan floor and thermal
    /// escalation are applied against a fresh temperature read, the fan's
    /// control policy switches to manual, and the applied value is returned.
    pub fn set_fan_speed(&mut self, percent: u32, fan_index: u32) -> Result<u32> {
        let stats = self.stats()?;

        if stats.temperature_c >= self.limits.critical_temp_c {
            warn!(
                "GPU at critical temperature ({}°C), forcing fan to 100%",
                stats.temperature_c
            );
        } else if stats.temperature_c >= self.limits.warning_temp_c {
            warn!(
                "GPU temperature high ({}°C), enforcing minimum 70% fan speed",
                stats.temperature_c
            );
        }

        let safe_speed = safety::fan_floor(percent, stats.temperature_c, &self.limits);
        if safe_speed != percent && percent < self.limits.min_fan_percent {
            warn!(
                "Fan speed {}% raised to {}% (safety minimum: {}%)",
                percent, safe_speed, self.limits.min_fan_percent
            );
        }

        let mut device = self.device()?;
        device
            .set_fan_control_policy(fan_index, FanControlPolicy::Manual)
            .map_err(write_err("set manual fan policy"))?;
        device
            .set_fan_speed(fan_index, safe_speed)
            .map_err(write_err("set fan speed"))?;

        info!("Fan {} speed set to {}%", fan_index, safe_speed);
        Ok(safe_speed)
    }

    /// Return one fan to firmware-automatic control.
    pub fn set_fan_auto(&mut self, fan_index: u32) -> Result<()> {
        let mut device = self.device()?;
        device
            .set_fan_control_policy(fan_index, FanControlPolicy::TemperatureContinousSw)
            .map_err(write_err("set automatic fan policy"))?;

        info!("Fan {} set to automatic control", fan_index);
        Ok(())
    }

    /// Command every fan to the same percentage. Not atomic across fans: a
    /// failure partway leaves earlier fans set and surfaces the error.
    /// Returns the applied percentage.
    pub fn set_all_fans_speed(&mut self, percent: u32) -> Result<u32> {
        let count = self.fan_count().max(1);
        let mut applied = percent;
        for fan_index in 0..count {
            applied = self.set_fan_speed(percent, fan_index)?;
        }
        Ok(applied)
    }

    /// Return every fan to automatic control; same partial-failure contract
    /// as [`Self::set_all_fans_speed`].
    pub fn set_all_fans_auto(&mut self) -> Result<()> {
        let count = self.fan_count().max(1);
        for fan_index in 0..count {
            self.set_fan_auto(fan_index)?;
        }
        Ok(())
    }
}

fn device_err(context: &'static str) -> impl Fn(NvmlError) -> NvtuneError {
    move |e| {
        debug!("{} failed: {}", context, e);
        NvtuneError::DeviceError(format!("failed to {}: {}", context, e))
    }
}

fn write_err(context: &'static str) -> impl Fn(NvmlError) -> NvtuneError {
    move |e| match e {
        NvmlError::NoPermission => NvtuneError::PermissionDenied(format!(
            "{} requires elevated privileges",
            context
        )),
        other => NvtuneError::DeviceError(format!("failed to {}: {}", context, other)),
    }
}
