//! Fan curve representation and interpolation
//!
//! A curve is a sorted set of (temperature, percent) control points.
//! Interpolation is linear between bracketing points and clamps to the edge
//! points outside the defined range. Arithmetic is integer throughout, so
//! the computed target is the truncated interpolation result.

use nvt_error::{NvtuneError, Result};
use serde::{Deserialize, Serialize};

/// One control point: at `temp_c` degrees the fan should run at
/// `fan_percent` percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temp_c: i32,
    pub fan_percent: u32,
}

/// A user-defined temperature→percent mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanCurve {
    points: Vec<CurvePoint>,
}

impl FanCurve {
    /// Build a curve from control points. Points are sorted by temperature;
    /// empty curves, duplicate temperatures, and percentages above 100 are
    /// rejected.
    pub fn new(mut points: Vec<CurvePoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(NvtuneError::InvalidConfig {
                field: "fan_curve".to_string(),
                reason: "curve must have at least one point".to_string(),
            });
        }

        points.sort_by_key(|p| p.temp_c);

        for pair in points.windows(2) {
            if pair[0].temp_c == pair[1].temp_c {
                return Err(NvtuneError::InvalidConfig {
                    field: "fan_curve".to_string(),
                    reason: format!("duplicate temperature point {}°C", pair[0].temp_c),
                });
            }
        }
        for point in &points {
            if point.fan_percent > 100 {
                return Err(NvtuneError::InvalidConfig {
                    field: "fan_curve".to_string(),
                    reason: format!("fan percent {} out of range", point.fan_percent),
                });
            }
        }

        Ok(Self { points })
    }

    /// The default balanced curve.
    pub fn balanced() -> Self {
        Self {
            points: vec![
                CurvePoint { temp_c: 30, fan_percent: 30 },
                CurvePoint { temp_c: 50, fan_percent: 40 },
                CurvePoint { temp_c: 60, fan_percent: 50 },
                CurvePoint { temp_c: 70, fan_percent: 65 },
                CurvePoint { temp_c: 80, fan_percent: 85 },
                CurvePoint { temp_c: 85, fan_percent: 100 },
            ],
        }
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Target fan percentage for a temperature.
    ///
    /// Below the lowest point the lowest point's percent applies; above the
    /// highest, the highest point's percent. In between, linear
    /// interpolation between the bracketing points. An empty curve (only
    /// reachable through deserialization) yields 0; the write path's fan
    /// floor still applies.
    pub fn interpolate(&self, temp_c: i32) -> u32 {
        let Some(first) = self.points.first() else { return 0 };
        let last = self.points[self.points.len() - 1];

        if temp_c <= first.temp_c {
            return first.fan_percent;
        }
        if temp_c >= last.temp_c {
            return last.fan_percent;
        }

        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if temp_c >= a.temp_c && temp_c <= b.temp_c {
                let span = b.temp_c - a.temp_c;
                if span == 0 {
                    return a.fan_percent;
                }
                let delta = b.fan_percent as i32 - a.fan_percent as i32;
                let value = a.fan_percent as i32 + delta * (temp_c - a.temp_c) / span;
                return value.clamp(0, 100) as u32;
            }
        }

        last.fan_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_curve() -> FanCurve {
        FanCurve::new(vec![
            CurvePoint { temp_c: 30, fan_percent: 30 },
            CurvePoint { temp_c: 70, fan_percent: 65 },
            CurvePoint { temp_c: 90, fan_percent: 100 },
        ])
        .unwrap()
    }

    #[test]
    fn interpolates_between_points() {
        let curve = reference_curve();
        assert_eq!(curve.interpolate(50), 47);
    }

    #[test]
    fn clamps_below_lowest_point() {
        assert_eq!(reference_curve().interpolate(20), 30);
    }

    #[test]
    fn clamps_above_highest_point() {
        assert_eq!(reference_curve().interpolate(95), 100);
    }

    #[test]
    fn exact_points_return_their_percent() {
        let curve = reference_curve();
        assert_eq!(curve.interpolate(30), 30);
        assert_eq!(curve.interpolate(70), 65);
        assert_eq!(curve.interpolate(90), 100);
    }

    #[test]
    fn handles_descending_segments() {
        // A curve that lowers speed over a range is unusual but legal
        let curve = FanCurve::new(vec![
            CurvePoint { temp_c: 30, fan_percent: 60 },
            CurvePoint { temp_c: 50, fan_percent: 40 },
        ])
        .unwrap();
        assert_eq!(curve.interpolate(40), 50);
    }

    #[test]
    fn sorts_unordered_points() {
        let curve = FanCurve::new(vec![
            CurvePoint { temp_c: 70, fan_percent: 65 },
            CurvePoint { temp_c: 30, fan_percent: 30 },
        ])
        .unwrap();
        assert_eq!(curve.points()[0].temp_c, 30);
        assert_eq!(curve.interpolate(50), 47);
    }

    #[test]
    fn rejects_empty_curve() {
        assert!(FanCurve::new(vec![]).is_err());
    }

    #[test]
    fn rejects_duplicate_temperatures() {
        let result = FanCurve::new(vec![
            CurvePoint { temp_c: 50, fan_percent: 40 },
            CurvePoint { temp_c: 50, fan_percent: 60 },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_percent_above_hundred() {
        let result = FanCurve::new(vec![CurvePoint { temp_c: 50, fan_percent: 101 }]);
        assert!(result.is_err());
    }

    #[test]
    fn single_point_curve_is_flat() {
        let curve = FanCurve::new(vec![CurvePoint { temp_c: 50, fan_percent: 42 }]).unwrap();
        assert_eq!(curve.interpolate(0), 42);
        assert_eq!(curve.interpolate(50), 42);
        assert_eq!(curve.interpolate(100), 42);
    }

    #[test]
    fn balanced_preset_is_valid() {
        let curve = FanCurve::balanced();
        assert_eq!(curve.interpolate(30), 30);
        assert_eq!(curve.interpolate(85), 100);
        assert_eq!(curve.interpolate(100), 100);
    }

    #[test]
    fn serde_roundtrip() {
        let curve = reference_curve();
        let json = serde_json::to_string(&curve).unwrap();
        let back: FanCurve = serde_json::from_str(&json).unwrap();
        assert_eq!(back, curve);
    }
}
