//! nvtune Core Library
//!
//! The unprivileged side of the nvtune control plane:
//!
//! - `gateway` - reads against an owned GPU facade, writes through the
//!   one-shot elevated helper
//! - `fan_control` - the background fan-curve controller
//! - `curve` - fan curve representation and interpolation
//! - `profiles` - durable named profiles and the apply orchestration
//! - `boot` - boot-time apply with crash-marker safety
//! - `constants` - paths, timing, and tuning defaults

pub mod boot;
pub mod constants;
pub mod curve;
pub mod fan_control;
pub mod gateway;
pub mod profiles;

pub use boot::{
    run_boot_apply, BootApplyOutcome, StateDir, REASON_CRASH_RECOVERY, REASON_NO_BOOT_PROFILE,
};
pub use curve::{CurvePoint, FanCurve};
pub use fan_control::{FanBackend, FanController, FanMode, FanState, FanTuning};
pub use gateway::Gateway;
pub use profiles::{
    apply_to_device, sanitize_name, ApplyReport, Profile, ProfileFanMode, ProfileStore,
};

pub use nvt_error::{NvtuneError, Result};
