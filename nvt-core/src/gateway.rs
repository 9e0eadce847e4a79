//! Privilege boundary gateway
//!
//! Read operations run in this process against an owned [`GpuController`]
//! (no elevation). Write operations are dispatched as one-shot commands to
//! the `nvtune-helper` binary via pkexec: spawn, wait up to the elevation
//! timeout, parse the single JSON object the helper prints to stdout.
//!
//! Elevated writes are serialized by a single-writer lock; no two helper
//! invocations are in flight at once from one process. Reads never take the
//! writer lock and only contend on the device-access lock.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nvt_error::{NvtuneError, Result};
use nvt_gpu::{ClockOffsets, DeviceInfo, DeviceStats, GpuController, PowerLimits, SafetyLimits};
use nvt_protocol::{HelperCommand, HelperResponse};

use crate::constants::timing;
use crate::fan_control::FanBackend;
use crate::profiles::Profile;

/// Name of the elevated helper binary.
pub const HELPER_BINARY: &str = "nvtune-helper";

/// Well-known install locations for the helper, tried after the directory
/// of the current executable.
const HELPER_SEARCH_PATHS: &[&str] = &[
    "/usr/libexec/nvtune-helper",
    "/usr/local/bin/nvtune-helper",
    "/usr/bin/nvtune-helper",
];

/// Gateway between unprivileged callers and the GPU.
pub struct Gateway {
    /// Device-access lock around the read-side facade
    reader: Mutex<GpuController>,
    /// Single-writer lock: at most one elevated invocation in flight
    write_lock: Mutex<()>,
    pkexec: Option<PathBuf>,
    helper: PathBuf,
    timeout: Duration,
}

impl Gateway {
    /// Open the gateway for one GPU, locating pkexec and the helper binary.
    pub fn new(gpu_index: u32, limits: SafetyLimits) -> Result<Self> {
        let reader = GpuController::new(gpu_index, limits)?;

        let pkexec = find_in_path("pkexec");
        if pkexec.is_none() {
            warn!("pkexec not found; privileged operations will fail");
        }

        let helper = find_helper_binary()
            .ok_or_else(|| NvtuneError::config("nvtune-helper binary not found"))?;
        debug!("Using helper binary at {:?}", helper);

        Ok(Self {
            reader: Mutex::new(reader),
            write_lock: Mutex::new(()),
            pkexec,
            helper,
            timeout: timing::ELEVATION_TIMEOUT,
        })
    }

    /// Use an explicit helper binary path (tests, custom installs).
    pub fn with_helper(gpu_index: u32, limits: SafetyLimits, helper: PathBuf) -> Result<Self> {
        let reader = GpuController::new(gpu_index, limits)?;
        Ok(Self {
            reader: Mutex::new(reader),
            write_lock: Mutex::new(()),
            pkexec: find_in_path("pkexec"),
            helper,
            timeout: timing::ELEVATION_TIMEOUT,
        })
    }

    // ========================================================================
    // Reads (no elevation)
    // ========================================================================

    pub fn info(&self) -> Result<DeviceInfo> {
        self.reader.lock().info()
    }

    pub fn stats(&self) -> Result<DeviceStats> {
        self.reader.lock().stats()
    }

    pub fn power_limits(&self) -> Result<PowerLimits> {
        self.reader.lock().power_limits()
    }

    pub fn clock_offsets(&self) -> Result<ClockOffsets> {
        self.reader.lock().clock_offsets()
    }

    pub fn fan_count(&self) -> u32 {
        self.reader.lock().fan_count()
    }

    pub fn fan_speed(&self, fan_index: u32) -> u32 {
        self.reader.lock().fan_speed(fan_index)
    }

    /// Reset the reader-side peak clock counter.
    pub fn reset_peak(&self) {
        self.reader.lock().reset_peak();
    }

    pub fn safety_limits(&self) -> SafetyLimits {
        *self.reader.lock().limits()
    }

    // ========================================================================
    // Writes (via the elevated helper)
    // ========================================================================

    /// Set the power limit. Returns the value actually applied.
    pub fn set_power_limit(&self, watts: f64) -> Result<f64> {
        let response = self.run_helper(&HelperCommand::SetPowerLimit { watts })?;
        let applied = response.power_limit.unwrap_or(watts);
        info!("Power limit set to {}W", applied);
        Ok(applied)
    }

    /// Set clock offsets; unspecified components keep their current value.
    /// Returns the (core, memory) offsets actually applied after clamping.
    pub fn set_clock_offsets(
        &self,
        core_offset_mhz: Option<i32>,
        memory_offset_mhz: Option<i32>,
    ) -> Result<(i32, i32)> {
        let (core, memory) = match (core_offset_mhz, memory_offset_mhz) {
            (Some(core), Some(memory)) => (core, memory),
            _ => {
                let current = self.clock_offsets()?;
                (
                    core_offset_mhz.unwrap_or(current.core_offset_mhz),
                    memory_offset_mhz.unwrap_or(current.memory_offset_mhz),
                )
            }
        };

        let response = self.run_helper(&HelperCommand::SetClockOffsets {
            core_mhz: core,
            memory_mhz: memory,
        })?;

        let applied_core = response.core_offset.unwrap_or(core);
        let applied_mem = response.memory_offset.unwrap_or(memory);
        info!(
            "Clock offsets set to core:{}MHz, mem:{}MHz",
            applied_core, applied_mem
        );
        Ok((applied_core, applied_mem))
    }

    /// Reset clock offsets to stock.
    pub fn reset_clock_offsets(&self) -> Result<()> {
        self.run_helper(&HelperCommand::ResetClocks)?;
        info!("Clock offsets reset to stock");
        Ok(())
    }

    /// Set or reset ((0, 0)) the frequency lock.
    pub fn set_locked_clocks(&self, min_mhz: u32, max_mhz: u32) -> Result<()> {
        self.run_helper(&HelperCommand::SetLockedClocks { min_mhz, max_mhz })?;
        info!("Locked clocks set to {}-{} MHz", min_mhz, max_mhz);
        Ok(())
    }

    /// Set one fan's speed. Returns the percentage actually applied.
    pub fn set_fan_speed(&self, percent: u32, fan_index: u32) -> Result<u32> {
        let response = self.run_helper(&HelperCommand::SetFanSpeed { percent, fan_index })?;
        let applied = response.fan_speed.unwrap_or(percent);
        info!("Fan {} set to {}%", fan_index, applied);
        Ok(applied)
    }

    /// Restore one fan to automatic control.
    pub fn set_fan_auto(&self, fan_index: u32) -> Result<()> {
        self.run_helper(&HelperCommand::SetFanAuto { fan_index })?;
        info!("Fan {} set to auto", fan_index);
        Ok(())
    }

    /// Command every fan to the same speed; one helper invocation per fan,
    /// not atomic across fans. Returns the last applied percentage.
    pub fn set_all_fans_speed(&self, percent: u32) -> Result<u32> {
        let count = self.fan_count().max(1);
        let mut applied = percent;
        for fan_index in 0..count {
            applied = self.set_fan_speed(percent, fan_index)?;
        }
        Ok(applied)
    }

    /// Restore every fan to automatic control; same partial-failure
    /// contract as [`Self::set_all_fans_speed`].
    pub fn set_all_fans_auto(&self) -> Result<()> {
        let count = self.fan_count().max(1);
        for fan_index in 0..count {
            self.set_fan_auto(fan_index)?;
        }
        Ok(())
    }

    /// Apply a profile's power/offset/fan settings in one elevated
    /// invocation.
    pub fn apply_profile(&self, profile: &Profile) -> Result<HelperResponse> {
        let profile_json = serde_json::to_string(profile)?;
        let response = self.run_helper(&HelperCommand::ApplyProfile { profile_json })?;
        info!("Profile '{}' applied", profile.name);
        Ok(response)
    }

    // ========================================================================
    // Helper invocation
    // ========================================================================

    fn run_helper(&self, command: &HelperCommand) -> Result<HelperResponse> {
        // Serialize elevated writes: hold the writer lock for the whole
        // spawn/wait/parse cycle.
        let _writer = self.write_lock.lock();

        let pkexec = self
            .pkexec
            .as_ref()
            .ok_or_else(|| NvtuneError::config("pkexec not found - install polkit"))?;

        debug!("Running helper: {} {:?}", command.name(), command.to_args());

        let mut child = Command::new(pkexec)
            .arg(&self.helper)
            .args(command.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NvtuneError::config(format!("failed to spawn elevation: {}", e)))?;

        // Drain pipes on their own threads so a chatty child cannot block
        // on a full pipe while we wait for it.
        let stdout_reader = drain_pipe(child.stdout.take());
        let stderr_reader = drain_pipe(child.stderr.take());

        let status = match wait_with_deadline(&mut child, self.timeout) {
            Some(status) => status,
            None => {
                // The helper is abandoned, not waited on any further.
                let _ = child.kill();
                let _ = child.wait();
                return Err(NvtuneError::ElevationTimeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() && stdout.trim().is_empty() {
            // pkexec was cancelled or failed before the helper ran
            let dismissed = matches!(status.code(), Some(126) | Some(127))
                || stderr.to_lowercase().contains("dismissed");
            if dismissed {
                return Err(NvtuneError::ElevationCancelled);
            }
            let detail = stderr.trim();
            return Err(NvtuneError::HelperFailed(if detail.is_empty() {
                format!("helper exited with {}", status)
            } else {
                detail.to_string()
            }));
        }

        let response: HelperResponse = serde_json::from_str(stdout.trim()).map_err(|_| {
            NvtuneError::ProtocolError(format!(
                "invalid helper response: {}",
                truncate_for_log(stdout.trim())
            ))
        })?;

        if !response.success {
            return Err(NvtuneError::HelperFailed(
                response
                    .error
                    .unwrap_or_else(|| "unknown helper error".to_string()),
            ));
        }

        Ok(response)
    }
}

/// The fan-curve controller issues its writes through the gateway.
impl FanBackend for Gateway {
    fn read_temperature(&self) -> Result<u32> {
        Ok(self.stats()?.temperature_c)
    }

    fn read_fan_speed(&self) -> u32 {
        self.fan_speed(0)
    }

    fn write_fan_speed(&self, percent: u32) -> Result<u32> {
        self.set_all_fans_speed(percent)
    }

    fn restore_fan_auto(&self) -> Result<()> {
        self.set_all_fans_auto()
    }
}

fn drain_pipe<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer);
        }
        buffer
    })
}

/// Poll the child until it exits or the deadline passes. Returns None on
/// deadline expiry.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(timing::STOP_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("try_wait on helper failed: {}", e);
                return None;
            }
        }
    }
}

fn truncate_for_log(s: &str) -> String {
    const MAX: usize = 200;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Locate the helper binary: next to the current executable first, then the
/// well-known install locations.
fn find_helper_binary() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(HELPER_BINARY);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    HELPER_SEARCH_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}
