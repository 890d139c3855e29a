/// Two frequencies closer than this are treated as the same sweep step.
pub const FREQUENCY_TOLERANCE_HZ: f64 = 1e4;

/// One recorded sweep point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementPoint {
    pub frequency_hz: f64,
    pub gen_level_dbm: f64,
    /// Peak level seen by the spectrum analyzer.
    pub sa_level_dbm: f64,
    /// Mean detector output voltage seen by the oscilloscope.
    pub osc_voltage_v: f64,
}

/// A measurement point corrected with the two S21 calibration paths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecalculatedPoint {
    pub point: MeasurementPoint,
    pub s21_gen_sa_db: f64,
    pub s21_gen_det_db: f64,
    /// Power actually delivered to the detector input.
    pub det_level_dbm: f64,
}

impl MeasurementPoint {
    pub fn is_at_frequency(&self, frequency_hz: f64) -> bool {
        (self.frequency_hz - frequency_hz).abs() < FREQUENCY_TOLERANCE_HZ
    }
}

/// All points recorded at (or within 10 kHz of) the given frequency, in
/// recording order.
pub fn points_at_frequency(
    points: &[MeasurementPoint],
    frequency_hz: f64,
) -> Vec<MeasurementPoint> {
    points
        .iter()
        .filter(|p| p.is_at_frequency(frequency_hz))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(frequency_hz: f64, gen_level_dbm: f64) -> MeasurementPoint {
        MeasurementPoint {
            frequency_hz,
            gen_level_dbm,
            sa_level_dbm: gen_level_dbm - 3.0,
            osc_voltage_v: 0.1,
        }
    }

    #[test]
    fn filters_points_within_tolerance() {
        let points = [
            point(1e9, -10.0),
            point(1e9 + 5e3, -20.0),
            point(1.5e9, -10.0),
            point(1e9 - 2e4, -30.0),
        ];
        let selected = points_at_frequency(&points, 1e9);
        assert_eq!(selected, vec![points[0], points[1]]);
    }
}
