//! Profile storage and apply orchestration
//!
//! Profiles are durable named bundles of target hardware settings, stored
//! one JSON file per profile under the user config dir. Files are written
//! atomically (temp file, fsync, rename) so a crash mid-write never leaves
//! a torn record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use nvt_error::{NvtuneError, Result};
use nvt_gpu::GpuController;

use crate::constants::paths;
use crate::curve::FanCurve;

/// Fan behavior a profile requests when applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileFanMode {
    #[default]
    Auto,
    Manual,
}

/// A named, persisted bundle of target hardware settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    pub power_limit_watts: Option<f64>,
    pub core_offset_mhz: Option<i32>,
    pub memory_offset_mhz: Option<i32>,
    /// Frequency lock ceiling; None or 0 means no lock
    pub max_clock_mhz: Option<u32>,
    #[serde(default)]
    pub fan_mode: ProfileFanMode,
    pub fan_speed_percent: Option<u32>,
    pub fan_curve: Option<FanCurve>,
    #[serde(default)]
    pub apply_on_boot: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub description: String,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            power_limit_watts: None,
            core_offset_mhz: None,
            memory_offset_mhz: None,
            max_clock_mhz: None,
            fan_mode: ProfileFanMode::Auto,
            fan_speed_percent: None,
            fan_curve: None,
            apply_on_boot: false,
            created_at: 0,
            updated_at: 0,
            description: String::new(),
        }
    }

    /// Stock settings, no overclock.
    pub fn stock() -> Self {
        Self {
            core_offset_mhz: Some(0),
            memory_offset_mhz: Some(0),
            description: "Stock settings - no overclocking".to_string(),
            ..Self::new("Stock")
        }
    }

    /// Reduced clocks and a fixed low fan speed.
    pub fn quiet() -> Self {
        Self {
            core_offset_mhz: Some(-100),
            memory_offset_mhz: Some(0),
            fan_mode: ProfileFanMode::Manual,
            fan_speed_percent: Some(40),
            description: "Reduced power and fan noise".to_string(),
            ..Self::new("Quiet")
        }
    }

    /// Moderate overclock.
    pub fn performance() -> Self {
        Self {
            core_offset_mhz: Some(100),
            memory_offset_mhz: Some(200),
            description: "Moderate overclock for extra performance".to_string(),
            ..Self::new("Performance")
        }
    }
}

/// Derive the stable storage identifier for a profile name: keep
/// alphanumerics plus `. _ -` and space, trim, lowercase, spaces to
/// underscores. Distinct names may collide under this mapping; the last
/// writer wins.
pub fn sanitize_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect();
    kept.trim().to_lowercase().replace(' ', "_")
}

/// Per-step results of an apply orchestration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub power_limit: Option<f64>,
    pub core_offset: Option<i32>,
    pub memory_offset: Option<i32>,
    pub locked_min_mhz: Option<u32>,
    pub locked_max_mhz: Option<u32>,
    pub fan_mode: Option<String>,
    pub fan_speed: Option<u32>,
}

/// Apply a profile directly to the device, in the fixed order: power limit,
/// clock offsets, frequency lock (explicitly reset when the profile has
/// none, so the lock always ends in a known state), fan settings. Each step
/// is skipped when its field is unset. A failure partway is reported as
/// [`NvtuneError::PartialApplyFailure`] naming the step; earlier steps are
/// not rolled back.
pub fn apply_to_device(profile: &Profile, gpu: &mut GpuController) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    if let Some(watts) = profile.power_limit_watts {
        let applied = gpu
            .set_power_limit(watts)
            .map_err(|e| NvtuneError::partial_apply("power_limit", e.to_string()))?;
        report.power_limit = Some(applied);
    }

    if profile.core_offset_mhz.is_some() || profile.memory_offset_mhz.is_some() {
        let (core, memory) = gpu
            .set_clock_offsets(profile.core_offset_mhz, profile.memory_offset_mhz)
            .map_err(|e| NvtuneError::partial_apply("clock_offsets", e.to_string()))?;
        report.core_offset = Some(core);
        report.memory_offset = Some(memory);
    }

    let (min_mhz, max_mhz) = match profile.max_clock_mhz {
        Some(max) if max > 0 => (0, max),
        _ => (0, 0),
    };
    gpu.set_locked_clocks(min_mhz, max_mhz)
        .map_err(|e| NvtuneError::partial_apply("frequency_lock", e.to_string()))?;
    report.locked_min_mhz = Some(min_mhz);
    report.locked_max_mhz = Some(max_mhz);

    match profile.fan_mode {
        ProfileFanMode::Auto => {
            gpu.set_all_fans_auto()
                .map_err(|e| NvtuneError::partial_apply("fan", e.to_string()))?;
            report.fan_mode = Some("auto".to_string());
        }
        ProfileFanMode::Manual => {
            if let Some(percent) = profile.fan_speed_percent {
                let applied = gpu
                    .set_all_fans_speed(percent)
                    .map_err(|e| NvtuneError::partial_apply("fan", e.to_string()))?;
                report.fan_mode = Some("manual".to_string());
                report.fan_speed = Some(applied);
            }
        }
    }

    info!("Applied profile: {}", profile.name);
    Ok(report)
}

/// Profile CRUD against a directory of JSON records.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Open (creating if needed) a store at an explicit directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Open the store at the default profiles directory.
    pub fn open_default() -> Result<Self> {
        let dir = paths::profiles_dir()
            .ok_or_else(|| NvtuneError::config("could not resolve user config directory"))?;
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_name(name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// All stored profile names, sorted. Unreadable records are skipped
    /// with a warning.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(NvtuneError::from)
                .and_then(|data| Ok(serde_json::from_str::<Profile>(&data)?))
            {
                Ok(profile) => names.push(profile.name),
                Err(e) => warn!("Could not read profile {:?}: {}", path, e),
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<Profile> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(NvtuneError::ProfileNotFound(name.to_string()));
        }

        let data = fs::read_to_string(&path).map_err(|e| NvtuneError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save a profile, refreshing `updated_at` and setting `created_at`
    /// only when absent.
    pub fn save(&self, profile: &mut Profile) -> Result<()> {
        let now = current_timestamp();
        if profile.created_at == 0 {
            profile.created_at = now;
        }
        profile.updated_at = now;

        let path = self.path_for(&profile.name);
        let json = serde_json::to_string_pretty(profile)?;
        write_atomically(&path, json.as_bytes())?;

        info!("Profile saved: {}", profile.name);
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(NvtuneError::ProfileNotFound(name.to_string()));
        }
        fs::remove_file(&path)?;
        info!("Profile deleted: {}", name);
        Ok(())
    }

    /// Snapshot the current power limit and clock offsets into a new,
    /// saved profile.
    pub fn create_from_current(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        gpu: &GpuController,
    ) -> Result<Profile> {
        let power = gpu.power_limits()?;
        let offsets = gpu.clock_offsets()?;

        let mut profile = Profile {
            power_limit_watts: Some(power.current_w),
            core_offset_mhz: Some(offsets.core_offset_mhz),
            memory_offset_mhz: Some(offsets.memory_offset_mhz),
            description: description.into(),
            ..Profile::new(name)
        };
        self.save(&mut profile)?;
        Ok(profile)
    }

    /// Export a profile to an external JSON file wrapped in an envelope.
    pub fn export(&self, name: &str, dest: &Path) -> Result<()> {
        let profile = self.load(name)?;
        let envelope = ProfileEnvelope {
            format_version: 1,
            exported_at: current_timestamp(),
            profile,
        };

        let json = serde_json::to_string_pretty(&envelope)?;
        fs::write(dest, json).map_err(|e| NvtuneError::FileWrite {
            path: dest.to_path_buf(),
            source: e,
        })?;

        info!("Exported profile '{}' to {:?}", name, dest);
        Ok(())
    }

    /// Import a profile from an external JSON file; accepts both the
    /// enveloped and the raw profile format. Refuses to replace an
    /// existing profile unless `overwrite` is set.
    pub fn import(&self, source: &Path, overwrite: bool) -> Result<Profile> {
        let data = fs::read_to_string(source).map_err(|e| NvtuneError::FileRead {
            path: source.to_path_buf(),
            source: e,
        })?;

        let mut profile = match serde_json::from_str::<ProfileEnvelope>(&data) {
            Ok(envelope) => envelope.profile,
            Err(_) => serde_json::from_str::<Profile>(&data)?,
        };

        if self.exists(&profile.name) && !overwrite {
            return Err(NvtuneError::ProfileExists(profile.name));
        }

        self.save(&mut profile)?;
        info!("Imported profile '{}' from {:?}", profile.name, source);
        Ok(profile)
    }
}

/// Envelope for exported profile files.
#[derive(Debug, Serialize, Deserialize)]
struct ProfileEnvelope {
    format_version: u32,
    exported_at: u64,
    profile: Profile,
}

/// Write a file atomically: temp file in the same directory, fsync, rename.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&temp_path).map_err(|e| NvtuneError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    file.write_all(contents).map_err(|e| NvtuneError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    file.sync_all().map_err(|e| NvtuneError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| NvtuneError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Wrote {:?}", path);
    Ok(())
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurvePoint;
    use tempfile::tempdir;

    fn full_profile() -> Profile {
        Profile {
            power_limit_watts: Some(250.0),
            core_offset_mhz: Some(120),
            memory_offset_mhz: Some(400),
            max_clock_mhz: Some(1800),
            fan_mode: ProfileFanMode::Manual,
            fan_speed_percent: Some(60),
            fan_curve: Some(
                FanCurve::new(vec![
                    CurvePoint { temp_c: 30, fan_percent: 30 },
                    CurvePoint { temp_c: 80, fan_percent: 100 },
                ])
                .unwrap(),
            ),
            apply_on_boot: true,
            description: "gaming profile".to_string(),
            ..Profile::new("Gaming OC")
        }
    }

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_name("Gaming OC"), "gaming_oc");
        assert_eq!(sanitize_name("My.Profile-2"), "my.profile-2");
        assert_eq!(sanitize_name("weird/../name!"), "weird..name");
        assert_eq!(sanitize_name("  spaced  "), "spaced");
    }

    #[test]
    fn save_load_roundtrip_preserves_fields() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        let mut profile = full_profile();
        store.save(&mut profile).unwrap();

        let loaded = store.load("Gaming OC").unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn save_sets_created_once_and_advances_updated() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        let mut profile = full_profile();
        store.save(&mut profile).unwrap();
        let created_first = profile.created_at;
        let updated_first = profile.updated_at;
        assert!(created_first > 0);

        store.save(&mut profile).unwrap();
        assert_eq!(profile.created_at, created_first);
        assert!(profile.updated_at >= updated_first);
    }

    #[test]
    fn list_returns_sorted_names() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        for name in ["Zeta", "alpha", "Mid"] {
            let mut p = Profile::new(name);
            store.save(&mut p).unwrap();
        }

        let names = store.list().unwrap();
        assert_eq!(names, vec!["Mid", "Zeta", "alpha"]);
    }

    #[test]
    fn delete_removes_record() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        let mut profile = Profile::new("Doomed");
        store.save(&mut profile).unwrap();
        assert!(store.exists("Doomed"));

        store.delete("Doomed").unwrap();
        assert!(!store.exists("Doomed"));
        assert!(matches!(
            store.load("Doomed"),
            Err(NvtuneError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn delete_missing_profile_fails() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.delete("nope"),
            Err(NvtuneError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn colliding_sanitized_names_last_writer_wins() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        let mut first = Profile::new("My Profile");
        let mut second = Profile::new("my profile");
        store.save(&mut first).unwrap();
        store.save(&mut second).unwrap();

        // One record on disk, holding the second writer's content
        assert_eq!(store.list().unwrap(), vec!["my profile"]);
    }

    #[test]
    fn export_import_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("store")).unwrap();
        let export_path = dir.path().join("exported.json");

        let mut profile = full_profile();
        store.save(&mut profile).unwrap();
        store.export("Gaming OC", &export_path).unwrap();

        store.delete("Gaming OC").unwrap();
        let imported = store.import(&export_path, false).unwrap();
        assert_eq!(imported.name, "Gaming OC");
        assert_eq!(imported.power_limit_watts, Some(250.0));
        assert_eq!(imported.created_at, profile.created_at);
    }

    #[test]
    fn import_refuses_overwrite_unless_asked() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("store")).unwrap();
        let export_path = dir.path().join("exported.json");

        let mut profile = Profile::new("Keep");
        store.save(&mut profile).unwrap();
        store.export("Keep", &export_path).unwrap();

        assert!(matches!(
            store.import(&export_path, false),
            Err(NvtuneError::ProfileExists(_))
        ));
        assert!(store.import(&export_path, true).is_ok());
    }

    #[test]
    fn import_accepts_raw_profile_json() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("store")).unwrap();
        let raw_path = dir.path().join("raw.json");

        let json = serde_json::to_string(&Profile::quiet()).unwrap();
        fs::write(&raw_path, json).unwrap();

        let imported = store.import(&raw_path, false).unwrap();
        assert_eq!(imported.name, "Quiet");
        assert_eq!(imported.fan_mode, ProfileFanMode::Manual);
    }

    #[test]
    fn presets_are_well_formed() {
        assert_eq!(Profile::stock().core_offset_mhz, Some(0));
        assert_eq!(Profile::quiet().fan_speed_percent, Some(40));
        assert_eq!(Profile::performance().memory_offset_mhz, Some(200));
    }

    #[test]
    fn profile_json_defaults_missing_fields() {
        // A minimal blob (as an external caller might hand the helper)
        let profile: Profile =
            serde_json::from_str(r#"{"power_limit_watts": 200.0}"#).unwrap();
        assert_eq!(profile.name, "");
        assert_eq!(profile.fan_mode, ProfileFanMode::Auto);
        assert_eq!(profile.power_limit_watts, Some(200.0));
        assert!(!profile.apply_on_boot);
    }
}
