//! Integration tests for the profile store and boot/crash-safety layer
//!
//! Exercises the persisted-state behavior as a whole against a temporary
//! directory: profile round-trips, the sanitized-name keyspace, and the
//! boot-apply marker lifecycle across simulated crashes.

use nvt_core::{
    run_boot_apply, ApplyReport, BootApplyOutcome, CurvePoint, FanCurve, NvtuneError, Profile,
    ProfileFanMode, ProfileStore, StateDir, REASON_CRASH_RECOVERY,
};
use tempfile::tempdir;

fn sample_profile(name: &str) -> Profile {
    Profile {
        power_limit_watts: Some(220.0),
        core_offset_mhz: Some(90),
        memory_offset_mhz: Some(300),
        max_clock_mhz: Some(1900),
        fan_mode: ProfileFanMode::Manual,
        fan_speed_percent: Some(55),
        fan_curve: Some(
            FanCurve::new(vec![
                CurvePoint { temp_c: 30, fan_percent: 30 },
                CurvePoint { temp_c: 70, fan_percent: 65 },
                CurvePoint { temp_c: 90, fan_percent: 100 },
            ])
            .unwrap(),
        ),
        apply_on_boot: true,
        description: "integration fixture".to_string(),
        ..Profile::new(name)
    }
}

#[test]
fn profile_survives_save_load_save() {
    let dir = tempdir().unwrap();
    let store = ProfileStore::new(dir.path()).unwrap();

    let mut original = sample_profile("Round Trip");
    store.save(&mut original).unwrap();

    let mut reloaded = store.load("Round Trip").unwrap();
    store.save(&mut reloaded).unwrap();

    // Everything except timestamps round-trips exactly; timestamps only
    // move forward.
    let settled = store.load("Round Trip").unwrap();
    assert_eq!(settled.name, original.name);
    assert_eq!(settled.power_limit_watts, original.power_limit_watts);
    assert_eq!(settled.core_offset_mhz, original.core_offset_mhz);
    assert_eq!(settled.memory_offset_mhz, original.memory_offset_mhz);
    assert_eq!(settled.max_clock_mhz, original.max_clock_mhz);
    assert_eq!(settled.fan_mode, original.fan_mode);
    assert_eq!(settled.fan_speed_percent, original.fan_speed_percent);
    assert_eq!(settled.fan_curve, original.fan_curve);
    assert_eq!(settled.apply_on_boot, original.apply_on_boot);
    assert_eq!(settled.description, original.description);
    assert_eq!(settled.created_at, original.created_at);
    assert!(settled.updated_at >= original.updated_at);
}

#[test]
fn store_is_keyed_by_sanitized_name() {
    let dir = tempdir().unwrap();
    let store = ProfileStore::new(dir.path()).unwrap();

    let mut profile = sample_profile("Über Profile #1");
    store.save(&mut profile).unwrap();

    // The original (unsanitized) name still loads the record
    let loaded = store.load("Über Profile #1").unwrap();
    assert_eq!(loaded.name, "Über Profile #1");
}

#[test]
fn boot_apply_full_cycle_against_store() {
    let dir = tempdir().unwrap();
    let state = StateDir::new(dir.path()).unwrap();
    let store = ProfileStore::new(dir.path().join("profiles")).unwrap();

    let mut profile = sample_profile("Night");
    store.save(&mut profile).unwrap();
    state.set_boot_profile("Night").unwrap();

    let outcome = run_boot_apply(&state, &store, |p| {
        assert_eq!(p.fan_speed_percent, Some(55));
        Ok(ApplyReport::default())
    })
    .unwrap();

    assert_eq!(outcome, BootApplyOutcome::Applied { profile: "Night".to_string() });
    assert!(!state.applying_marker_present());

    // A second boot with a leftover marker (simulated crash) must skip and
    // recover.
    state.mark_applying().unwrap();
    let outcome = run_boot_apply(&state, &store, |_| {
        panic!("must not apply after a crash")
    })
    .unwrap();
    assert_eq!(outcome, BootApplyOutcome::Skipped { reason: REASON_CRASH_RECOVERY });
    assert!(!state.applying_marker_present());

    // And the boot after that proceeds normally again.
    let outcome = run_boot_apply(&state, &store, |_| Ok(ApplyReport::default())).unwrap();
    assert_eq!(outcome, BootApplyOutcome::Applied { profile: "Night".to_string() });
}

#[test]
fn boot_apply_failure_surfaces_partial_step() {
    let dir = tempdir().unwrap();
    let state = StateDir::new(dir.path()).unwrap();
    let store = ProfileStore::new(dir.path().join("profiles")).unwrap();

    let mut profile = sample_profile("Flaky");
    store.save(&mut profile).unwrap();
    state.set_boot_profile("Flaky").unwrap();

    let err = run_boot_apply(&state, &store, |_| {
        Err(NvtuneError::partial_apply("frequency_lock", "driver rejected"))
    })
    .unwrap_err();

    match err {
        NvtuneError::PartialApplyFailure { step, .. } => assert_eq!(step, "frequency_lock"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!state.applying_marker_present());
}
