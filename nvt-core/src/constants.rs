//! Constants and path resolution for nvtune
//!
//! Centralizes timing values, fan-control tuning defaults, and the on-disk
//! layout of persisted state.

use std::time::Duration;

/// Persisted-state layout: `<config>/nvtune/{profiles/, boot_profile, .applying}`
pub mod paths {
    use std::path::PathBuf;

    /// Application directory name under the user config dir
    pub const APP_DIR: &str = "nvtune";

    /// Subdirectory holding one JSON record per profile
    pub const PROFILES_DIR: &str = "profiles";

    /// Single-string record naming the profile applied at boot
    pub const BOOT_PROFILE_FILE: &str = "boot_profile";

    /// Existence-only crash marker; present strictly between "apply started"
    /// and "apply completed or explicitly failed"
    pub const APPLYING_MARKER_FILE: &str = ".applying";

    /// Resolve the owning user's config base directory.
    ///
    /// When running elevated (the helper under pkexec/sudo), the process
    /// must read the invoking user's configuration, not root's, so
    /// `PKEXEC_UID` and `SUDO_USER` are consulted before the standard
    /// lookup.
    pub fn user_config_dir() -> Option<PathBuf> {
        let elevated_base = if let Ok(uid) = std::env::var("PKEXEC_UID") {
            uid.parse::<u32>().ok().and_then(home_by_uid)
        } else if let Ok(user) = std::env::var("SUDO_USER") {
            home_by_name(&user)
        } else {
            None
        };

        if let Some(home) = elevated_base {
            return Some(home.join(".config"));
        }

        // SAFETY: geteuid has no preconditions; it only reports the
        // effective user id of the calling process.
        if unsafe { libc::geteuid() } == 0 {
            if let Ok(home) = std::env::var("HOME") {
                return Some(PathBuf::from(home).join(".config"));
            }
        }

        dirs::config_dir()
    }

    /// The nvtune state directory (`~/.config/nvtune` in the common case).
    pub fn state_dir() -> Option<PathBuf> {
        user_config_dir().map(|base| base.join(APP_DIR))
    }

    /// The profiles directory under the state directory.
    pub fn profiles_dir() -> Option<PathBuf> {
        state_dir().map(|dir| dir.join(PROFILES_DIR))
    }

    fn home_by_uid(uid: u32) -> Option<PathBuf> {
        passwd_lookup(|_, entry_uid| entry_uid == uid)
    }

    fn home_by_name(name: &str) -> Option<PathBuf> {
        passwd_lookup(|entry_name, _| entry_name == name)
    }

    /// Scan /etc/passwd for a matching entry, returning its home directory.
    fn passwd_lookup(matches: impl Fn(&str, u32) -> bool) -> Option<PathBuf> {
        let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
        for line in passwd.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                continue;
            }
            let Ok(uid) = fields[2].parse::<u32>() else {
                continue;
            };
            if matches(fields[0], uid) {
                return Some(PathBuf::from(fields[5]));
            }
        }
        None
    }
}

/// Timing values
pub mod timing {
    use super::Duration;

    /// Fan-curve loop cadence
    pub const FAN_POLL_INTERVAL: Duration = Duration::from_millis(1500);

    /// Granularity at which the fan loop checks its stop flag while sleeping
    pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// How long the gateway waits for an elevated helper invocation before
    /// killing it and reporting a timeout
    pub const ELEVATION_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Fan-control tuning defaults
pub mod fan {
    /// Temperature must move at least this far before the curve target is
    /// recomputed
    pub const DEFAULT_HYSTERESIS_C: u32 = 3;

    /// Maximum commanded-speed change per control cycle, in percent points
    pub const DEFAULT_RAMP_STEP_PERCENT: u32 = 5;
}
