//! Closed-loop vertical range adaptation for the oscilloscope channel.

use log::{debug, warn};

use crate::cancel::CancellationToken;
use crate::instrument::{InstrumentResult, Oscilloscope};

/// Step up when the mean voltage exceeds this many divisions.
pub const SCALE_UP_DIVISIONS: f64 = 3.0;
/// Step down when the mean voltage is below this many divisions.
pub const SCALE_DOWN_DIVISIONS: f64 = 1.0;

/// Volts/division settings the channel is allowed to use, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct VerticalScaleLadder {
    rungs: Vec<f64>,
}

impl Default for VerticalScaleLadder {
    fn default() -> Self {
        Self {
            rungs: vec![1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 0.1, 0.2, 0.5, 1.0],
        }
    }
}

impl VerticalScaleLadder {
    /// A custom ladder. `None` unless the rungs are positive and strictly
    /// ascending.
    pub fn new(rungs: Vec<f64>) -> Option<Self> {
        let valid = !rungs.is_empty()
            && rungs.iter().all(|r| r.is_finite() && *r > 0.0)
            && rungs.windows(2).all(|w| w[0] < w[1]);
        valid.then_some(Self { rungs })
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    pub fn rung(&self, index: usize) -> f64 {
        self.rungs[index]
    }

    pub fn top(&self) -> usize {
        self.rungs.len() - 1
    }

    /// Index of the rung closest to `scale` (compared logarithmically).
    ///
    /// A scale the instrument reports that is not on the ladder, or is
    /// garbage, snaps to a valid rung rather than failing.
    pub fn index_of(&self, scale: f64) -> usize {
        if !(scale.is_finite() && scale > 0.0) {
            return 0;
        }
        let target = scale.ln();
        self.rungs
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (a.ln() - target).abs().total_cmp(&(b.ln() - target).abs())
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// The result of one refinement: the last measured mean voltage and the rung
/// the channel was left on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refinement {
    pub voltage: f64,
    pub scale_index: usize,
    pub steps: usize,
}

/// Keeps the detector voltage between one and three divisions so the ADC
/// neither clips nor wastes resolution.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveRangeController {
    ladder: VerticalScaleLadder,
}

impl AdaptiveRangeController {
    pub fn new(ladder: VerticalScaleLadder) -> Self {
        Self { ladder }
    }

    pub fn ladder(&self) -> &VerticalScaleLadder {
        &self.ladder
    }

    /// Move the channel one rung at a time until `voltage` sits inside the
    /// window, re-measuring with `measure` after every change.
    ///
    /// Stops early when cancellation is requested and returns the last
    /// measured value. At either end of the ladder an out-of-window value is
    /// accepted as-is. Never takes more steps than the ladder has rungs.
    pub fn refine<F>(
        &self,
        osc: &mut dyn Oscilloscope,
        initial_voltage: f64,
        cancel: &CancellationToken,
        mut measure: F,
    ) -> InstrumentResult<Refinement>
    where
        F: FnMut(&mut dyn Oscilloscope) -> InstrumentResult<f64>,
    {
        let mut voltage = initial_voltage;
        let mut index = self.ladder.index_of(osc.get_vertical_scale()?);
        let mut steps = 0;

        while steps < self.ladder.len() {
            if cancel.is_cancelled() {
                debug!("Range refinement interrupted at {voltage:.4} V");
                break;
            }
            let Some(next) = self.next_rung(voltage, index) else {
                break;
            };
            let (from, to) = (self.ladder.rung(index), self.ladder.rung(next));
            osc.set_vertical_scale(to)?;
            debug!("Vertical scale {from} V/div -> {to} V/div (value: {voltage:.4} V)");
            index = next;
            steps += 1;
            voltage = measure(osc)?;
        }

        if steps == self.ladder.len() && self.next_rung(voltage, index).is_some() {
            warn!("Vertical scale did not settle after {steps} steps, keeping {voltage:.4} V");
        }

        Ok(Refinement {
            voltage,
            scale_index: index,
            steps,
        })
    }

    /// The adjacent rung `voltage` calls for, or `None` when the current rung
    /// is right or there is nowhere left to go.
    fn next_rung(&self, voltage: f64, index: usize) -> Option<usize> {
        let scale = self.ladder.rung(index);
        if voltage > SCALE_UP_DIVISIONS * scale && index < self.ladder.top() {
            Some(index + 1)
        } else if voltage < SCALE_DOWN_DIVISIONS * scale && index > 0 {
            Some(index - 1)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Generator;
    use crate::sim::SimBench;
    use approx::assert_abs_diff_eq;

    fn measure(osc: &mut dyn Oscilloscope) -> InstrumentResult<f64> {
        osc.ready_for_acquisition()?;
        osc.trigger_force()?;
        while osc.is_acquiring()? {}
        Ok(osc.get_waveform_data()?.mean_voltage().unwrap_or(0.0))
    }

    /// A simulated scope on `scale` V/div looking at a generator at `level`.
    fn bench_at(level: Option<f64>, scale: f64) -> (SimBench, crate::sim::SimOscilloscope) {
        let sim = SimBench::default();
        let mut generator = sim.generator();
        if let Some(level) = level {
            generator.set_level(level).unwrap();
            generator.rf_on().unwrap();
        }
        let mut osc = sim.oscilloscope();
        osc.set_binary_data_format().unwrap();
        osc.set_vertical_scale(scale).unwrap();
        (sim, osc)
    }

    #[test]
    fn steps_up_until_the_voltage_fits() {
        // -5 dBm at the detector: about 1.12 V, which sits on 0.5 V/div
        let (sim, mut osc) = bench_at(Some(-4.0), 1e-3);
        let initial = measure(&mut osc).unwrap();
        let refined = AdaptiveRangeController::default()
            .refine(&mut osc, initial, &CancellationToken::new(), measure)
            .unwrap();

        assert_eq!(refined.scale_index, 8);
        assert_eq!(refined.steps, 8);
        assert_eq!(sim.vertical_scale(), 0.5);
        assert_abs_diff_eq!(refined.voltage, 2.0 * 10f64.powf(-0.25), epsilon = 1e-3);
    }

    #[test]
    fn steps_down_to_the_bottom_rung_and_stays() {
        let (sim, mut osc) = bench_at(None, 1.0);
        let refined = AdaptiveRangeController::default()
            .refine(&mut osc, 0.0, &CancellationToken::new(), measure)
            .unwrap();
        assert_eq!(refined.scale_index, 0);
        assert_eq!(refined.steps, 9);
        assert_eq!(sim.vertical_scale(), 1e-3);
    }

    #[test]
    fn accepts_clipping_at_the_top_rung() {
        let (_sim, mut osc) = bench_at(Some(20.0), 1.0);
        let initial = measure(&mut osc).unwrap();
        let refined = AdaptiveRangeController::default()
            .refine(&mut osc, initial, &CancellationToken::new(), measure)
            .unwrap();
        assert_eq!(refined.steps, 0);
        assert_eq!(refined.scale_index, 9);
        assert_abs_diff_eq!(refined.voltage, 5.0, epsilon = 1e-3);
    }

    #[test]
    fn cancellation_returns_the_last_value() {
        let (sim, mut osc) = bench_at(None, 1.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let refined = AdaptiveRangeController::default()
            .refine(&mut osc, 0.0, &cancel, measure)
            .unwrap();
        assert_eq!(refined.steps, 0);
        assert_eq!(refined.voltage, 0.0);
        assert_eq!(sim.vertical_scale(), 1.0);
    }

    #[test]
    fn oscillating_readings_are_bounded_by_the_ladder() {
        let (_sim, mut osc) = bench_at(None, 0.1);
        let controller = AdaptiveRangeController::default();
        let mut calls = 0;
        let refined = controller
            .refine(&mut osc, 100.0, &CancellationToken::new(), |_| {
                calls += 1;
                Ok(if calls % 2 == 0 { 100.0 } else { 0.0 })
            })
            .unwrap();
        assert_eq!(refined.steps, controller.ladder().len());
        assert!(refined.scale_index <= controller.ladder().top());
    }

    #[test]
    fn index_stays_on_the_ladder_for_any_reported_scale() {
        let ladder = VerticalScaleLadder::default();
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e-9, 3e-3, 0.15, 1.0, 1e6] {
            assert!(ladder.index_of(scale) <= ladder.top(), "{scale}");
        }
        assert_eq!(ladder.index_of(1e6), ladder.top());
        assert_eq!(ladder.index_of(0.1), 6);
        assert_eq!(ladder.index_of(0.0), 0);
    }

    #[test]
    fn custom_ladder_must_ascend() {
        assert!(VerticalScaleLadder::new(vec![0.1, 0.05]).is_none());
        assert!(VerticalScaleLadder::new(vec![]).is_none());
        assert!(VerticalScaleLadder::new(vec![0.0, 1.0]).is_none());
        assert_eq!(VerticalScaleLadder::new(vec![0.1, 1.0]).unwrap().len(), 2);
    }
}
