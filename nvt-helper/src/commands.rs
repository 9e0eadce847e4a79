//! Command dispatch for the elevated helper
//!
//! Each command initializes its own device facade, performs one mutation
//! (or the documented composite), and builds the response object. The
//! facade applies the safety policy; nothing here bypasses it.

use tracing::info;

use nvt_core::{
    run_boot_apply, apply_to_device, BootApplyOutcome, Profile, ProfileFanMode, ProfileStore,
    StateDir,
};
use nvt_error::{NvtuneError, Result};
use nvt_gpu::{GpuController, SafetyLimits};
use nvt_protocol::{help_text, GpuSummary, HelperCommand, HelperResponse};

pub fn dispatch(command: &HelperCommand) -> Result<HelperResponse> {
    match command {
        HelperCommand::Status => status(),
        HelperCommand::SetPowerLimit { watts } => set_power_limit(*watts),
        HelperCommand::SetClockOffsets { core_mhz, memory_mhz } => {
            set_clock_offsets(*core_mhz, *memory_mhz)
        }
        HelperCommand::SetLockedClocks { min_mhz, max_mhz } => {
            set_locked_clocks(*min_mhz, *max_mhz)
        }
        HelperCommand::ResetClocks => reset_clocks(),
        HelperCommand::SetFanSpeed { percent, fan_index } => set_fan_speed(*percent, *fan_index),
        HelperCommand::SetFanAuto { fan_index } => set_fan_auto(*fan_index),
        HelperCommand::ApplyProfile { profile_json } => apply_profile(profile_json),
        HelperCommand::ApplyBootProfile => apply_boot_profile(),
        HelperCommand::ListProfiles => list_profiles(),
        HelperCommand::ListGpus => list_gpus(),
        HelperCommand::Help => {
            eprintln!("{}", help_text());
            Ok(HelperResponse::ok())
        }
    }
}

fn controller() -> Result<GpuController> {
    GpuController::new(0, SafetyLimits::default())
}

fn status() -> Result<HelperResponse> {
    let mut gpu = controller()?;

    let info = gpu.info()?;
    let stats = gpu.stats()?;
    let power = gpu.power_limits()?;
    let offsets = gpu.clock_offsets()?;
    let limits = *gpu.limits();

    let mut response = HelperResponse::ok();
    response.gpu = Some(serde_json::to_value(&info)?);
    response.stats = Some(serde_json::to_value(&stats)?);
    response.power_limits = Some(serde_json::to_value(power)?);
    response.offsets = Some(serde_json::to_value(offsets)?);
    response.safety_limits = Some(serde_json::to_value(limits)?);
    Ok(response)
}

fn set_power_limit(watts: f64) -> Result<HelperResponse> {
    let mut gpu = controller()?;
    let applied = gpu.set_power_limit(watts)?;
    Ok(HelperResponse::ok().with_power_limit(applied))
}

fn set_clock_offsets(core_mhz: i32, memory_mhz: i32) -> Result<HelperResponse> {
    let mut gpu = controller()?;
    let (core, memory) = gpu.set_clock_offsets(Some(core_mhz), Some(memory_mhz))?;
    Ok(HelperResponse::ok().with_offsets(core, memory))
}

fn set_locked_clocks(min_mhz: u32, max_mhz: u32) -> Result<HelperResponse> {
    let mut gpu = controller()?;
    gpu.set_locked_clocks(min_mhz, max_mhz)?;
    Ok(HelperResponse::ok().with_locked_clocks(min_mhz, max_mhz))
}

fn reset_clocks() -> Result<HelperResponse> {
    let mut gpu = controller()?;
    gpu.reset_clock_offsets()?;
    Ok(HelperResponse::ok())
}

fn set_fan_speed(percent: u32, fan_index: u32) -> Result<HelperResponse> {
    let mut gpu = controller()?;
    let applied = gpu.set_fan_speed(percent, fan_index)?;
    Ok(HelperResponse::ok().with_fan(applied, fan_index))
}

fn set_fan_auto(fan_index: u32) -> Result<HelperResponse> {
    let mut gpu = controller()?;
    gpu.set_fan_auto(fan_index)?;
    let mut response = HelperResponse::ok().with_mode("auto");
    response.fan_index = Some(fan_index);
    Ok(response)
}

/// The apply-profile composite: power limit, then clock offsets, then fan
/// settings, inside this single elevated invocation. The frequency lock is
/// the caller-level orchestration's business (`apply-boot-profile` and the
/// profile store's apply path).
fn apply_profile(profile_json: &str) -> Result<HelperResponse> {
    let profile: Profile = serde_json::from_str(profile_json)
        .map_err(|e| NvtuneError::ProtocolError(format!("invalid profile JSON: {}", e)))?;

    let mut gpu = controller()?;
    let mut response = HelperResponse::ok();

    if let Some(watts) = profile.power_limit_watts {
        let applied = gpu.set_power_limit(watts)?;
        response.power_limit = Some(applied);
    }

    if profile.core_offset_mhz.is_some() || profile.memory_offset_mhz.is_some() {
        let (core, memory) =
            gpu.set_clock_offsets(profile.core_offset_mhz, profile.memory_offset_mhz)?;
        response.core_offset = Some(core);
        response.memory_offset = Some(memory);
    }

    match profile.fan_mode {
        ProfileFanMode::Auto => {
            gpu.set_all_fans_auto()?;
            response.fan_mode = Some("auto".to_string());
        }
        ProfileFanMode::Manual => {
            let requested = profile.fan_speed_percent.unwrap_or(50);
            let applied = gpu.set_all_fans_speed(requested)?;
            response.fan_mode = Some("manual".to_string());
            response.fan_speed = Some(applied);
        }
    }

    info!("Profile applied via helper");
    Ok(response)
}

fn apply_boot_profile() -> Result<HelperResponse> {
    let state = StateDir::open_default()?;
    let store = ProfileStore::open_default()?;

    let outcome = run_boot_apply(&state, &store, |profile| {
        let mut gpu = controller()?;
        apply_to_device(profile, &mut gpu)
    })?;

    let response = match outcome {
        BootApplyOutcome::Applied { profile } => {
            let mut response = HelperResponse::ok().with_boot_result("success", None);
            response.profile = Some(profile);
            response
        }
        BootApplyOutcome::Skipped { reason } => {
            HelperResponse::ok().with_boot_result("skipped", Some(reason.to_string()))
        }
    };
    Ok(response)
}

fn list_profiles() -> Result<HelperResponse> {
    let store = ProfileStore::open_default()?;
    let mut response = HelperResponse::ok();
    response.profiles = Some(store.list()?);
    Ok(response)
}

fn list_gpus() -> Result<HelperResponse> {
    let gpus = GpuController::probe_gpus()?;

    let mut response = HelperResponse::ok();
    response.gpu_count = Some(gpus.len() as u32);
    response.gpus = Some(
        gpus.into_iter()
            .map(|(index, name)| GpuSummary { index, name })
            .collect(),
    );
    Ok(response)
}
