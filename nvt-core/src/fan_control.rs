//! Fan-curve controller
//!
//! Runs the user's fan curve as an independent background loop. Each tick
//! reads the GPU temperature, applies hysteresis so 1°C jitter does not
//! oscillate the fans, interpolates the curve, enforces the global fan
//! floor, ramp-limits the change, and commands the speed through the
//! gateway. A failed iteration is logged and the loop continues; it is
//! never fatal to the controller.
//!
//! Foreground readers get snapshots of [`FanState`]; the state lock is
//! independent of the gateway's device-access lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use nvt_error::Result;

use crate::constants::{fan, timing};
use crate::curve::FanCurve;

/// Fan control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    /// Firmware manages the fans; the controller is idle
    Auto,
    /// A one-shot commanded percentage, no loop
    Manual,
    /// The background curve loop is active
    Curve,
}

/// Controller-owned fan state. Commanded and reported speeds are tracked
/// separately: hardware does not reliably echo commanded values, and a
/// reported 0 is legitimate under zero-RPM idle.
#[derive(Debug, Clone)]
pub struct FanState {
    pub mode: FanMode,
    pub commanded_speed: u32,
    pub reported_speed: u32,
    pub current_temp: u32,
    pub curve: Option<FanCurve>,
}

impl Default for FanState {
    fn default() -> Self {
        Self {
            mode: FanMode::Auto,
            commanded_speed: 0,
            reported_speed: 0,
            current_temp: 0,
            curve: None,
        }
    }
}

/// Tuning values for the control loop, threaded in at construction.
#[derive(Debug, Clone, Copy)]
pub struct FanTuning {
    pub poll_interval: Duration,
    pub hysteresis_c: u32,
    pub ramp_step_percent: u32,
    pub min_fan_percent: u32,
}

impl Default for FanTuning {
    fn default() -> Self {
        Self {
            poll_interval: timing::FAN_POLL_INTERVAL,
            hysteresis_c: fan::DEFAULT_HYSTERESIS_C,
            ramp_step_percent: fan::DEFAULT_RAMP_STEP_PERCENT,
            min_fan_percent: nvt_gpu::constants::limits::MIN_FAN_PERCENT,
        }
    }
}

/// The device operations the controller needs. Implemented by the gateway;
/// the write side applies the safety policy again before anything reaches
/// the driver.
#[cfg_attr(test, mockall::automock)]
pub trait FanBackend: Send + Sync {
    fn read_temperature(&self) -> Result<u32>;
    /// Reported speed of the primary fan; 0 when unreadable or idle.
    fn read_fan_speed(&self) -> u32;
    /// Command all fans; returns the percentage actually applied.
    fn write_fan_speed(&self, percent: u32) -> Result<u32>;
    fn restore_fan_auto(&self) -> Result<()>;
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Fan-curve controller. Owns the background loop and the shared
/// [`FanState`].
pub struct FanController {
    state: Arc<Mutex<FanState>>,
    tuning: FanTuning,
    worker: Option<Worker>,
}

impl FanController {
    pub fn new(tuning: FanTuning) -> Self {
        Self {
            state: Arc::new(Mutex::new(FanState::default())),
            tuning,
            worker: None,
        }
    }

    /// Snapshot of the current fan state for foreground readers.
    pub fn snapshot(&self) -> FanState {
        self.state.lock().clone()
    }

    pub fn mode(&self) -> FanMode {
        self.state.lock().mode
    }

    /// One-shot manual speed. Stops the curve loop if it is running.
    /// Returns the percentage actually applied (after the write path's
    /// safety clamping).
    pub fn set_manual(&mut self, backend: &dyn FanBackend, percent: u32) -> Result<u32> {
        self.stop_loop();

        let applied = backend.write_fan_speed(percent)?;
        let reported = backend.read_fan_speed();

        let mut state = self.state.lock();
        state.mode = FanMode::Manual;
        state.commanded_speed = applied;
        state.reported_speed = reported;

        info!("Fan mode set to manual at {}%", applied);
        Ok(applied)
    }

    /// Restore firmware-automatic control. Stops the curve loop if it is
    /// running.
    pub fn set_auto(&mut self, backend: &dyn FanBackend) -> Result<()> {
        self.stop_loop();

        backend.restore_fan_auto()?;

        let mut state = self.state.lock();
        state.mode = FanMode::Auto;
        state.commanded_speed = 0;

        info!("Fan mode set to auto");
        Ok(())
    }

    /// Enter curve mode: store the curve and start the background loop.
    /// Any previous loop is stopped first.
    pub fn start_curve(&mut self, backend: Arc<dyn FanBackend>, curve: FanCurve) {
        self.stop_loop();

        {
            let mut state = self.state.lock();
            state.mode = FanMode::Curve;
            state.curve = Some(curve);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::clone(&self.state);
        let tuning = self.tuning;
        let loop_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            run_loop(state, tuning, backend, loop_stop);
        });

        self.worker = Some(Worker { handle, stop });
        info!("Fan curve loop started");
    }

    /// Stop the curve loop, waiting (boundedly) for the in-flight iteration
    /// to finish so a write cannot race the stop.
    pub fn stop_loop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.handle.join().is_err() {
                warn!("Fan curve loop panicked before shutdown");
            } else {
                info!("Fan curve loop stopped");
            }
        }
    }

    pub fn is_loop_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for FanController {
    fn drop(&mut self) {
        self.stop_loop();
    }
}

fn run_loop(
    state: Arc<Mutex<FanState>>,
    tuning: FanTuning,
    backend: Arc<dyn FanBackend>,
    stop: Arc<AtomicBool>,
) {
    // Hysteresis bookkeeping lives with the loop, not the shared state:
    // last_curve_temp only advances when a recomputation actually happens.
    let mut last_curve_temp: Option<i32> = None;
    let mut last_target: Option<u32> = None;

    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = curve_iteration(
            &state,
            &tuning,
            backend.as_ref(),
            &mut last_curve_temp,
            &mut last_target,
        ) {
            warn!("Fan curve iteration failed: {}", e);
        }

        sleep_interruptibly(&stop, tuning.poll_interval);
    }
}

/// Sleep for `interval`, waking early when the stop flag is raised.
fn sleep_interruptibly(stop: &AtomicBool, interval: Duration) {
    let deadline = Instant::now() + interval;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(timing::STOP_POLL_INTERVAL.min(deadline - now));
    }
}

/// One control cycle: temperature → hysteresis → interpolation → floor →
/// ramp limit → write.
fn curve_iteration(
    state: &Mutex<FanState>,
    tuning: &FanTuning,
    backend: &dyn FanBackend,
    last_curve_temp: &mut Option<i32>,
    last_target: &mut Option<u32>,
) -> Result<()> {
    let temp = backend.read_temperature()?;

    let target = match (*last_curve_temp, *last_target) {
        (Some(prev_temp), Some(prev_target))
            if hysteresis_suppresses(prev_temp, temp as i32, tuning.hysteresis_c) =>
        {
            debug!(
                "Temperature {}°C within hysteresis of {}°C, keeping target {}%",
                temp, prev_temp, prev_target
            );
            prev_target
        }
        _ => {
            let curve = state.lock().curve.clone();
            let Some(curve) = curve else {
                debug!("No curve configured, skipping cycle");
                return Ok(());
            };

            let computed = curve.interpolate(temp as i32).max(tuning.min_fan_percent);
            *last_curve_temp = Some(temp as i32);
            *last_target = Some(computed);
            computed
        }
    };

    let previous = state.lock().commanded_speed;
    let stepped = ramp_toward(previous, target, tuning.ramp_step_percent);

    let applied = backend.write_fan_speed(stepped)?;
    let reported = backend.read_fan_speed();

    let mut guard = state.lock();
    guard.current_temp = temp;
    guard.commanded_speed = applied;
    guard.reported_speed = reported;

    debug!(
        "Curve cycle: temp={}°C target={}% commanded={}%",
        temp, target, applied
    );
    Ok(())
}

/// Whether the temperature moved too little to justify recomputing the
/// target.
fn hysteresis_suppresses(last_temp: i32, temp: i32, threshold_c: u32) -> bool {
    (temp - last_temp).unsigned_abs() < threshold_c
}

/// Move from the last commanded speed toward `target` by at most `step`
/// percent points. With nothing commanded yet, jump straight to the target.
fn ramp_toward(current: u32, target: u32, step: u32) -> u32 {
    if current == 0 {
        return target;
    }
    if target > current {
        target.min(current + step)
    } else {
        target.max(current.saturating_sub(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurvePoint;

    fn test_tuning() -> FanTuning {
        FanTuning {
            poll_interval: Duration::from_millis(10),
            hysteresis_c: 3,
            ramp_step_percent: 5,
            min_fan_percent: 30,
        }
    }

    fn test_curve() -> FanCurve {
        FanCurve::new(vec![
            CurvePoint { temp_c: 30, fan_percent: 30 },
            CurvePoint { temp_c: 70, fan_percent: 65 },
            CurvePoint { temp_c: 90, fan_percent: 100 },
        ])
        .unwrap()
    }

    fn state_with_curve(commanded: u32) -> Mutex<FanState> {
        Mutex::new(FanState {
            mode: FanMode::Curve,
            commanded_speed: commanded,
            curve: Some(test_curve()),
            ..FanState::default()
        })
    }

    #[test]
    fn ramp_limits_to_step_per_cycle() {
        assert_eq!(ramp_toward(40, 70, 5), 45);
        assert_eq!(ramp_toward(70, 40, 5), 65);
        assert_eq!(ramp_toward(48, 50, 5), 50);
        assert_eq!(ramp_toward(50, 50, 5), 50);
    }

    #[test]
    fn ramp_jumps_when_nothing_commanded() {
        assert_eq!(ramp_toward(0, 47, 5), 47);
    }

    #[test]
    fn hysteresis_band() {
        assert!(hysteresis_suppresses(60, 61, 3));
        assert!(hysteresis_suppresses(60, 58, 3));
        assert!(!hysteresis_suppresses(60, 63, 3));
        assert!(!hysteresis_suppresses(60, 64, 3));
        assert!(!hysteresis_suppresses(60, 56, 3));
    }

    #[test]
    fn iteration_computes_and_writes_target() {
        let state = state_with_curve(0);
        let mut backend = MockFanBackend::new();
        backend.expect_read_temperature().returning(|| Ok(50));
        // 50°C on the reference curve interpolates to 47%
        backend
            .expect_write_fan_speed()
            .withf(|p| *p == 47)
            .returning(|p| Ok(p));
        backend.expect_read_fan_speed().returning(|| 46);

        let mut last_temp = None;
        let mut last_target = None;
        curve_iteration(&state, &test_tuning(), &backend, &mut last_temp, &mut last_target)
            .unwrap();

        let snapshot = state.lock().clone();
        assert_eq!(snapshot.commanded_speed, 47);
        assert_eq!(snapshot.reported_speed, 46);
        assert_eq!(snapshot.current_temp, 50);
        assert_eq!(last_temp, Some(50));
        assert_eq!(last_target, Some(47));
    }

    #[test]
    fn iteration_applies_fan_floor_to_cold_targets() {
        let state = state_with_curve(0);
        let mut backend = MockFanBackend::new();
        backend.expect_read_temperature().returning(|| Ok(10));
        // Curve says 30% at the low edge; floor of 30 keeps it there, a
        // lower curve value would be raised
        backend
            .expect_write_fan_speed()
            .withf(|p| *p == 30)
            .returning(|p| Ok(p));
        backend.expect_read_fan_speed().returning(|| 30);

        let mut last_temp = None;
        let mut last_target = None;
        curve_iteration(&state, &test_tuning(), &backend, &mut last_temp, &mut last_target)
            .unwrap();
    }

    #[test]
    fn iteration_reuses_target_within_hysteresis() {
        let state = state_with_curve(47);
        let mut backend = MockFanBackend::new();
        backend.expect_read_temperature().returning(|| Ok(61));
        // Previous target kept; ramp from 47 toward 47 stays put
        backend
            .expect_write_fan_speed()
            .withf(|p| *p == 47)
            .returning(|p| Ok(p));
        backend.expect_read_fan_speed().returning(|| 47);

        let mut last_temp = Some(60);
        let mut last_target = Some(47);
        curve_iteration(&state, &test_tuning(), &backend, &mut last_temp, &mut last_target)
            .unwrap();

        // last_curve_temp must not advance while suppressed
        assert_eq!(last_temp, Some(60));
    }

    #[test]
    fn iteration_recomputes_past_hysteresis() {
        let state = state_with_curve(47);
        let mut backend = MockFanBackend::new();
        backend.expect_read_temperature().returning(|| Ok(64));
        // 64°C interpolates to 59%; ramp limits 47 -> 52
        backend
            .expect_write_fan_speed()
            .withf(|p| *p == 52)
            .returning(|p| Ok(p));
        backend.expect_read_fan_speed().returning(|| 52);

        let mut last_temp = Some(60);
        let mut last_target = Some(47);
        curve_iteration(&state, &test_tuning(), &backend, &mut last_temp, &mut last_target)
            .unwrap();

        assert_eq!(last_temp, Some(64));
        assert_eq!(last_target, Some(59));
    }

    #[test]
    fn iteration_surfaces_read_errors_without_touching_state() {
        let state = state_with_curve(40);
        let mut backend = MockFanBackend::new();
        backend
            .expect_read_temperature()
            .returning(|| Err(nvt_error::NvtuneError::device("telemetry lost")));

        let mut last_temp = None;
        let mut last_target = None;
        let result =
            curve_iteration(&state, &test_tuning(), &backend, &mut last_temp, &mut last_target);

        assert!(result.is_err());
        assert_eq!(state.lock().commanded_speed, 40);
    }

    #[test]
    fn controller_lifecycle() {
        let mut backend = MockFanBackend::new();
        backend.expect_read_temperature().returning(|| Ok(50));
        backend.expect_write_fan_speed().returning(|p| Ok(p));
        backend.expect_read_fan_speed().returning(|| 45);
        backend.expect_restore_fan_auto().returning(|| Ok(()));
        let backend: Arc<dyn FanBackend> = Arc::new(backend);

        let mut controller = FanController::new(test_tuning());
        assert_eq!(controller.mode(), FanMode::Auto);

        controller.start_curve(Arc::clone(&backend), test_curve());
        assert!(controller.is_loop_running());
        assert_eq!(controller.mode(), FanMode::Curve);

        controller.stop_loop();
        assert!(!controller.is_loop_running());

        controller.set_auto(backend.as_ref()).unwrap();
        assert_eq!(controller.mode(), FanMode::Auto);
    }

    #[test]
    fn manual_mode_stops_loop_and_records_applied_speed() {
        let mut backend = MockFanBackend::new();
        backend.expect_read_temperature().returning(|| Ok(50));
        // The write path may clamp: a request of 10 comes back as 30
        backend.expect_write_fan_speed().returning(|p| Ok(p.max(30)));
        backend.expect_read_fan_speed().returning(|| 30);
        let backend: Arc<dyn FanBackend> = Arc::new(backend);

        let mut controller = FanController::new(test_tuning());
        controller.start_curve(Arc::clone(&backend), test_curve());

        let applied = controller.set_manual(backend.as_ref(), 10).unwrap();
        assert_eq!(applied, 30);
        assert!(!controller.is_loop_running());

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.mode, FanMode::Manual);
        assert_eq!(snapshot.commanded_speed, 30);
    }
}
