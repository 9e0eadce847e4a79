//! Boot-time apply and crash safety
//!
//! Two records live beside the profile store: a plain-text file naming the
//! profile to apply at boot, and an existence-only `.applying` marker. The
//! marker is present strictly between "apply started" and "apply completed
//! or explicitly failed"; finding it at startup means the previous apply
//! died mid-flight, so the boot apply is skipped (never retried
//! automatically) and the marker cleared.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use nvt_error::{NvtuneError, Result};

use crate::constants::paths;
use crate::profiles::{ApplyReport, Profile, ProfileStore};

/// Outcome of a boot-time apply attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootApplyOutcome {
    Applied { profile: String },
    Skipped { reason: &'static str },
}

/// Skip reason when the crash marker was found at startup.
pub const REASON_CRASH_RECOVERY: &str = "crash_recovery";

/// Skip reason when no boot profile is configured.
pub const REASON_NO_BOOT_PROFILE: &str = "no_boot_profile";

/// Handle to the directory holding the boot-profile record and crash
/// marker.
pub struct StateDir {
    dir: PathBuf,
}

impl StateDir {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn open_default() -> Result<Self> {
        let dir = paths::state_dir()
            .ok_or_else(|| NvtuneError::config("could not resolve user config directory"))?;
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn boot_profile_path(&self) -> PathBuf {
        self.dir.join(paths::BOOT_PROFILE_FILE)
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(paths::APPLYING_MARKER_FILE)
    }

    // ========================================================================
    // Boot profile record
    // ========================================================================

    /// The configured boot profile name, if any.
    pub fn boot_profile(&self) -> Option<String> {
        let name = fs::read_to_string(self.boot_profile_path()).ok()?;
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    pub fn set_boot_profile(&self, name: &str) -> Result<()> {
        let path = self.boot_profile_path();
        fs::write(&path, name).map_err(|e| NvtuneError::FileWrite { path, source: e })?;
        info!("Boot profile set to: {}", name);
        Ok(())
    }

    pub fn clear_boot_profile(&self) -> Result<()> {
        let path = self.boot_profile_path();
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Boot profile cleared");
        }
        Ok(())
    }

    // ========================================================================
    // Crash marker
    // ========================================================================

    /// Raise the marker: an apply is in progress.
    pub fn mark_applying(&self) -> Result<()> {
        let path = self.marker_path();
        fs::write(&path, b"").map_err(|e| NvtuneError::FileWrite { path, source: e })?;
        debug!("Applying marker set");
        Ok(())
    }

    /// Lower the marker after the apply completed or explicitly failed.
    pub fn clear_applying(&self) {
        let path = self.marker_path();
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to clear applying marker: {}", e);
            } else {
                debug!("Applying marker cleared");
            }
        }
    }

    pub fn applying_marker_present(&self) -> bool {
        self.marker_path().exists()
    }

    /// Check for a leftover marker and clear it. Returns true when the
    /// previous apply was interrupted.
    pub fn take_crash_marker(&self) -> bool {
        if self.applying_marker_present() {
            warn!("Crash marker found: previous apply did not complete");
            self.clear_applying();
            true
        } else {
            false
        }
    }
}

/// Run the boot-time apply.
///
/// Consults the crash marker first: if present, the interrupted attempt is
/// treated as abandoned and this apply is skipped. Otherwise the marker
/// brackets the whole attempt (profile load included) and is cleared on
/// every exit path, so it only survives a process killed mid-apply.
///
/// `apply` performs the actual orchestration (see
/// [`crate::profiles::apply_to_device`]); it is injected so the decision
/// logic stays independent of device access.
pub fn run_boot_apply<F>(
    state: &StateDir,
    store: &ProfileStore,
    apply: F,
) -> Result<BootApplyOutcome>
where
    F: FnOnce(&Profile) -> Result<ApplyReport>,
{
    if state.take_crash_marker() {
        return Ok(BootApplyOutcome::Skipped {
            reason: REASON_CRASH_RECOVERY,
        });
    }

    let Some(name) = state.boot_profile() else {
        debug!("No boot profile configured, skipping boot apply");
        return Ok(BootApplyOutcome::Skipped {
            reason: REASON_NO_BOOT_PROFILE,
        });
    };

    state.mark_applying()?;
    let result = store.load(&name).and_then(|profile| apply(&profile));
    state.clear_applying();

    match result {
        Ok(_) => {
            info!("Boot profile '{}' applied", name);
            Ok(BootApplyOutcome::Applied { profile: name })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ProfileStore;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, StateDir, ProfileStore) {
        let dir = tempdir().unwrap();
        let state = StateDir::new(dir.path()).unwrap();
        let store = ProfileStore::new(dir.path().join("profiles")).unwrap();
        (dir, state, store)
    }

    fn save_profile(store: &ProfileStore, name: &str) {
        let mut profile = Profile::new(name);
        store.save(&mut profile).unwrap();
    }

    #[test]
    fn boot_profile_record_roundtrip() {
        let (_dir, state, _store) = setup();
        assert_eq!(state.boot_profile(), None);

        state.set_boot_profile("night").unwrap();
        assert_eq!(state.boot_profile(), Some("night".to_string()));

        state.clear_boot_profile().unwrap();
        assert_eq!(state.boot_profile(), None);
    }

    #[test]
    fn empty_boot_profile_record_reads_as_none() {
        let (_dir, state, _store) = setup();
        state.set_boot_profile("  ").unwrap();
        assert_eq!(state.boot_profile(), None);
    }

    #[test]
    fn crash_marker_skips_apply_and_clears() {
        let (_dir, state, store) = setup();
        save_profile(&store, "boot-me");
        state.set_boot_profile("boot-me").unwrap();
        state.mark_applying().unwrap();

        let outcome = run_boot_apply(&state, &store, |_| {
            panic!("apply must not run during crash recovery")
        })
        .unwrap();

        assert_eq!(
            outcome,
            BootApplyOutcome::Skipped { reason: REASON_CRASH_RECOVERY }
        );
        assert!(!state.applying_marker_present());
    }

    #[test]
    fn missing_boot_profile_name_skips() {
        let (_dir, state, store) = setup();

        let outcome =
            run_boot_apply(&state, &store, |_| Ok(ApplyReport::default())).unwrap();

        assert_eq!(
            outcome,
            BootApplyOutcome::Skipped { reason: REASON_NO_BOOT_PROFILE }
        );
    }

    #[test]
    fn successful_apply_brackets_with_marker() {
        let (_dir, state, store) = setup();
        save_profile(&store, "boot-me");
        state.set_boot_profile("boot-me").unwrap();

        let marker_during = std::cell::Cell::new(false);
        let outcome = run_boot_apply(&state, &store, |profile| {
            assert_eq!(profile.name, "boot-me");
            marker_during.set(state.applying_marker_present());
            Ok(ApplyReport::default())
        })
        .unwrap();

        assert!(marker_during.get(), "marker must be up while applying");
        assert!(!state.applying_marker_present(), "marker cleared after");
        assert_eq!(
            outcome,
            BootApplyOutcome::Applied { profile: "boot-me".to_string() }
        );
    }

    #[test]
    fn failed_apply_still_clears_marker() {
        let (_dir, state, store) = setup();
        save_profile(&store, "boot-me");
        state.set_boot_profile("boot-me").unwrap();

        let result = run_boot_apply(&state, &store, |_| {
            Err(NvtuneError::partial_apply("power_limit", "no permission"))
        });

        assert!(result.is_err());
        assert!(!state.applying_marker_present());
    }

    #[test]
    fn missing_profile_errors_and_clears_marker() {
        let (_dir, state, store) = setup();
        state.set_boot_profile("ghost").unwrap();

        let result = run_boot_apply(&state, &store, |_| Ok(ApplyReport::default()));

        assert!(matches!(result, Err(NvtuneError::ProfileNotFound(_))));
        assert!(!state.applying_marker_present());
    }
}
