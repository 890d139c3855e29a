/// How far the trace peak must rise above the trace mean to count as a
/// signal rather than noise floor.
pub const TOLERANCE_DB: f32 = 6.0;

/// Decides whether an analyzer trace captured the generator tone.
///
/// This is the only gate on whether a sweep point gets recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelValidator;

impl LevelValidator {
    /// `Some(peak)` when the trace peak exceeds its mean by more than
    /// [`TOLERANCE_DB`], `None` for noise floor or an empty trace.
    pub fn check(&self, trace: &[f32]) -> Option<f32> {
        let (max, mean) = peak_and_mean(trace)?;
        (max > mean + TOLERANCE_DB).then_some(max)
    }
}

/// Peak and mean of a trace, `None` if it is empty.
pub fn peak_and_mean(trace: &[f32]) -> Option<(f32, f32)> {
    if trace.is_empty() {
        return None;
    }
    let max = trace.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mean = trace.iter().map(|&v| f64::from(v)).sum::<f64>() / trace.len() as f64;
    Some((max, mean as f32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_clear_peak() {
        // mean -40, peak -20
        assert_eq!(LevelValidator.check(&[-20.0, -60.0]), Some(-20.0));
    }

    #[test]
    fn rejects_noise_floor() {
        // mean -40, peak -38
        assert_eq!(LevelValidator.check(&[-38.0, -42.0]), None);
    }

    #[test]
    fn flat_trace_is_rejected() {
        assert_eq!(LevelValidator.check(&[-90.0; 1001]), None);
    }

    #[test]
    fn exactly_six_db_is_not_enough() {
        // mean -43, peak -37: difference of exactly 6 dB
        assert_eq!(LevelValidator.check(&[-37.0, -49.0]), None);
        assert_eq!(LevelValidator.check(&[-36.9, -49.0]), Some(-36.9));
    }

    #[test]
    fn empty_trace_is_rejected() {
        assert_eq!(LevelValidator.check(&[]), None);
    }

    #[test]
    fn boundary_holds_for_many_shapes() {
        for floor in [-120.0f32, -90.0, -40.0, 0.0, 15.0] {
            for rise in [0.0f32, 1.0, 5.5, 6.0, 6.5, 12.0, 40.0] {
                let mut trace = vec![floor; 99];
                trace.push(floor + rise);
                let (max, mean) = peak_and_mean(&trace).unwrap();
                let expected = (max - mean > TOLERANCE_DB).then_some(max);
                assert_eq!(LevelValidator.check(&trace), expected, "floor {floor} rise {rise}");
            }
        }
    }
}
