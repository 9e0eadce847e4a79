//! Shared protocol types for the nvtune elevated helper.
//!
//! The unprivileged side dispatches write operations as a one-shot command:
//! a command name plus positional string arguments, executed by the
//! `nvtune-helper` binary under elevation. The helper answers with exactly
//! one JSON object on stdout: `{"success": true, ...}` on success or
//! `{"success": false, "error": "..."}` (plus a non-zero exit code) on
//! failure. Anything else on stdout is a protocol error on the caller side.

use serde::{Deserialize, Serialize};

/// Maximum accepted fan/GPU index; NVML indices are small, anything larger
/// is a malformed request.
pub const MAX_INDEX: u32 = 255;

/// A single helper invocation, encoded as positional string arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperCommand {
    Status,
    SetPowerLimit { watts: f64 },
    SetClockOffsets { core_mhz: i32, memory_mhz: i32 },
    SetLockedClocks { min_mhz: u32, max_mhz: u32 },
    ResetClocks,
    SetFanSpeed { percent: u32, fan_index: u32 },
    SetFanAuto { fan_index: u32 },
    ApplyProfile { profile_json: String },
    ApplyBootProfile,
    ListProfiles,
    ListGpus,
    Help,
}

impl HelperCommand {
    /// The command name as it appears on the helper command line.
    pub fn name(&self) -> &'static str {
        match self {
            HelperCommand::Status => "status",
            HelperCommand::SetPowerLimit { .. } => "set-power-limit",
            HelperCommand::SetClockOffsets { .. } => "set-clock-offsets",
            HelperCommand::SetLockedClocks { .. } => "set-locked-clocks",
            HelperCommand::ResetClocks => "reset-clocks",
            HelperCommand::SetFanSpeed { .. } => "set-fan-speed",
            HelperCommand::SetFanAuto { .. } => "set-fan-auto",
            HelperCommand::ApplyProfile { .. } => "apply-profile",
            HelperCommand::ApplyBootProfile => "apply-boot-profile",
            HelperCommand::ListProfiles => "list-profiles",
            HelperCommand::ListGpus => "list-gpus",
            HelperCommand::Help => "help",
        }
    }

    /// Encode as the argument vector passed to the helper binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            HelperCommand::SetPowerLimit { watts } => args.push(watts.to_string()),
            HelperCommand::SetClockOffsets { core_mhz, memory_mhz } => {
                args.push(core_mhz.to_string());
                args.push(memory_mhz.to_string());
            }
            HelperCommand::SetLockedClocks { min_mhz, max_mhz } => {
                args.push(min_mhz.to_string());
                args.push(max_mhz.to_string());
            }
            HelperCommand::SetFanSpeed { percent, fan_index } => {
                args.push(percent.to_string());
                args.push(fan_index.to_string());
            }
            HelperCommand::SetFanAuto { fan_index } => args.push(fan_index.to_string()),
            HelperCommand::ApplyProfile { profile_json } => args.push(profile_json.clone()),
            _ => {}
        }
        args
    }

    /// Parse a helper command line (command name first, then positional
    /// arguments). Returns a usage-style message on malformed input.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let Some(name) = args.first() else {
            return Err("missing command".to_string());
        };

        let arg = |idx: usize, what: &str| -> Result<&String, String> {
            args.get(idx)
                .ok_or_else(|| format!("usage: {}", usage_for(name, what)))
        };

        match name.as_str() {
            "status" => Ok(HelperCommand::Status),
            "set-power-limit" => {
                let watts = arg(1, "<watts>")?
                    .parse::<f64>()
                    .map_err(|_| "invalid watts value".to_string())?;
                if !watts.is_finite() || watts < 0.0 {
                    return Err("invalid watts value".to_string());
                }
                Ok(HelperCommand::SetPowerLimit { watts })
            }
            "set-clock-offsets" => {
                let core_mhz = arg(1, "<core_mhz> <mem_mhz>")?
                    .parse::<i32>()
                    .map_err(|_| "invalid core offset".to_string())?;
                let memory_mhz = arg(2, "<core_mhz> <mem_mhz>")?
                    .parse::<i32>()
                    .map_err(|_| "invalid memory offset".to_string())?;
                Ok(HelperCommand::SetClockOffsets { core_mhz, memory_mhz })
            }
            "set-locked-clocks" => {
                let min_mhz = arg(1, "<min_mhz> <max_mhz>")?
                    .parse::<u32>()
                    .map_err(|_| "invalid min clock".to_string())?;
                let max_mhz = arg(2, "<min_mhz> <max_mhz>")?
                    .parse::<u32>()
                    .map_err(|_| "invalid max clock".to_string())?;
                Ok(HelperCommand::SetLockedClocks { min_mhz, max_mhz })
            }
            "reset-clocks" => Ok(HelperCommand::ResetClocks),
            "set-fan-speed" => {
                let percent = arg(1, "<percent> [fan_idx]")?
                    .parse::<u32>()
                    .map_err(|_| "invalid fan percent".to_string())?;
                validate_percent(percent)?;
                let fan_index = match args.get(2) {
                    Some(s) => s.parse::<u32>().map_err(|_| "invalid fan index".to_string())?,
                    None => 0,
                };
                validate_index(fan_index)?;
                Ok(HelperCommand::SetFanSpeed { percent, fan_index })
            }
            "set-fan-auto" => {
                let fan_index = match args.get(1) {
                    Some(s) => s.parse::<u32>().map_err(|_| "invalid fan index".to_string())?,
                    None => 0,
                };
                validate_index(fan_index)?;
                Ok(HelperCommand::SetFanAuto { fan_index })
            }
            "apply-profile" => {
                let profile_json = arg(1, "<json>")?.clone();
                Ok(HelperCommand::ApplyProfile { profile_json })
            }
            "apply-boot-profile" => Ok(HelperCommand::ApplyBootProfile),
            "list-profiles" => Ok(HelperCommand::ListProfiles),
            "list-gpus" => Ok(HelperCommand::ListGpus),
            "help" => Ok(HelperCommand::Help),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

fn usage_for(name: &str, what: &str) -> String {
    format!("{} {}", name, what)
}

/// Human-readable command table printed by the `help` command.
pub fn help_text() -> &'static str {
    "nvtune helper commands:\n\
     \x20 status                         - GPU info, stats, limits, offsets\n\
     \x20 list-gpus                      - enumerate GPUs\n\
     \x20 list-profiles                  - list saved profiles\n\
     \x20 set-power-limit <watts>        - set power limit\n\
     \x20 set-clock-offsets <core> <mem> - set clock offsets\n\
     \x20 set-locked-clocks <min> <max>  - set frequency lock (0 0 resets)\n\
     \x20 reset-clocks                   - reset clock offsets to stock\n\
     \x20 set-fan-speed <pct> [idx]      - set fan speed\n\
     \x20 set-fan-auto [idx]             - restore automatic fan control\n\
     \x20 apply-profile <json>           - apply a profile blob\n\
     \x20 apply-boot-profile             - apply the configured boot profile\n\
     \x20 help                           - this text"
}

/// One entry of the `list-gpus` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuSummary {
    pub index: u32,
    pub name: String,
}

/// The single JSON object a helper invocation writes to stdout.
///
/// All fields except `success` are optional; each command fills the fields
/// relevant to it. Unknown fields are preserved-by-omission: the caller only
/// reads what it asked for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelperResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_offset: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_offset: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_mhz: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_mhz: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_mode: Option<String>,

    // apply-boot-profile reporting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpus: Option<Vec<GpuSummary>>,

    // status payload; typed structs live in nvt-gpu and are serialized here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_limits: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offsets: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_limits: Option<serde_json::Value>,
}

impl HelperResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_power_limit(mut self, watts: f64) -> Self {
        self.power_limit = Some(watts);
        self
    }

    pub fn with_offsets(mut self, core: i32, memory: i32) -> Self {
        self.core_offset = Some(core);
        self.memory_offset = Some(memory);
        self
    }

    pub fn with_locked_clocks(mut self, min_mhz: u32, max_mhz: u32) -> Self {
        self.min_mhz = Some(min_mhz);
        self.max_mhz = Some(max_mhz);
        self
    }

    pub fn with_fan(mut self, speed: u32, index: u32) -> Self {
        self.fan_speed = Some(speed);
        self.fan_index = Some(index);
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_boot_result(
        mut self,
        status: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        self.action = Some("boot-apply".to_string());
        self.status = Some(status.into());
        self.reason = reason;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // A response that cannot serialize is itself a protocol failure.
            r#"{"success":false,"error":"response serialization failed"}"#.to_string()
        })
    }
}

pub fn validate_percent(percent: u32) -> Result<(), String> {
    if percent > 100 {
        return Err("percent must be 0-100".to_string());
    }
    Ok(())
}

pub fn validate_index(index: u32) -> Result<(), String> {
    if index > MAX_INDEX {
        return Err(format!("index out of range (0-{})", MAX_INDEX));
    }
    Ok(())
}
