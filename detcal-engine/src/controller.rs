//! The sweep itself: instrument setup, the frequency × level double loop and
//! the RF fail-safe around it.

use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

use flume::Sender;
use log::{debug, error, info, warn};
use thiserror::Error;

use detcal_messages::{Hertz, MeasurementPoint, SettingsError, SweepEvent, SweepSettings};

use crate::calibrator::S21Calibrator;
use crate::cancel::CancellationToken;
use crate::codec::Waveform;
use crate::instrument::{
    Bandwidth, Bench, Coupling, Generator, InstrumentError, InstrumentResult, Oscilloscope,
    SpectrumAnalyzer,
};
use crate::progress::ProgressReporter;
use crate::range::AdaptiveRangeController;
use crate::validator::LevelValidator;

/// Record length requested from the oscilloscope.
pub const OSC_DATA_POINTS: u32 = 10_000;
/// Channel that is on after an oscilloscope reset.
const DEFAULT_OSC_CHANNEL: u8 = 1;

/// Waits the instruments need between commands. The defaults were found on
/// the bench; none of them are reported by the instruments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// After arming the oscilloscope.
    pub arm_settle: Duration,
    /// Between `is_acquiring` polls.
    pub poll_interval: Duration,
    /// An analyzer sweep takes `sweep_time_factor × sweep_time +
    /// sweep_settle_margin` to land.
    pub sweep_time_factor: f64,
    pub sweep_settle_margin: Duration,
    /// After a frequency or level change.
    pub command_settle: Duration,
    /// After an oscilloscope reset.
    pub reset_settle: Duration,
    /// Give up on an acquisition that never completes.
    pub acquisition_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            arm_settle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            sweep_time_factor: 2.0,
            sweep_settle_margin: Duration::from_millis(300),
            command_settle: Duration::from_millis(100),
            reset_settle: Duration::from_secs(2),
            acquisition_timeout: Duration::from_secs(30),
        }
    }
}

impl Timing {
    /// No waits at all, for simulated instruments.
    pub fn immediate() -> Self {
        Self {
            arm_settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            sweep_time_factor: 0.0,
            sweep_settle_margin: Duration::ZERO,
            command_settle: Duration::ZERO,
            reset_settle: Duration::ZERO,
            acquisition_timeout: Duration::from_secs(10),
        }
    }

    pub fn analyzer_settle(&self, sweep_time: f64) -> Duration {
        let scaled = (self.sweep_time_factor * sweep_time).max(0.0);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(Duration::MAX)
            .saturating_add(self.sweep_settle_margin)
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// How a sweep ended when nothing went wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Every point was visited. Points that failed validation are absent.
    Completed(Vec<MeasurementPoint>),
    /// Stopped at a checkpoint; holds what was captured until then.
    Cancelled(Vec<MeasurementPoint>),
}

impl SweepOutcome {
    pub fn points(&self) -> &[MeasurementPoint] {
        match self {
            SweepOutcome::Completed(points) | SweepOutcome::Cancelled(points) => points,
        }
    }

    pub fn into_points(self) -> Vec<MeasurementPoint> {
        match self {
            SweepOutcome::Completed(points) | SweepOutcome::Cancelled(points) => points,
        }
    }
}

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("{} not initialized", .instruments.join(", "))]
    NotReady { instruments: Vec<&'static str> },

    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    #[error("instrument setup failed: {0}")]
    SetupFailed(#[source] InstrumentError),

    #[error("sweep aborted after {} points: {source}", .partial.len())]
    Loop {
        source: InstrumentError,
        partial: Vec<MeasurementPoint>,
    },

    #[error("RF output could not be switched off: {source}")]
    SafeShutdownFailed {
        source: InstrumentError,
        partial: Vec<MeasurementPoint>,
    },
}

impl SweepError {
    /// Points captured before the failure. Empty for failures before the loop.
    pub fn partial_points(&self) -> &[MeasurementPoint] {
        match self {
            SweepError::Loop { partial, .. } | SweepError::SafeShutdownFailed { partial, .. } => {
                partial
            }
            _ => &[],
        }
    }

    pub fn into_partial_points(self) -> Vec<MeasurementPoint> {
        match self {
            SweepError::Loop { partial, .. } | SweepError::SafeShutdownFailed { partial, .. } => {
                partial
            }
            _ => Vec::new(),
        }
    }
}

/// Where the running sweep is. Owned by exactly one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepState {
    pub freq_index: usize,
    pub level_index: usize,
    /// Inner iterations finished, recorded or not.
    pub completed: usize,
    pub points: Vec<MeasurementPoint>,
}

/// Switch the generator output off and drive it to its minimum level. Both
/// are attempted even if the first fails.
fn rf_shutdown(generator: &mut dyn Generator) -> InstrumentResult<()> {
    let off = generator.rf_off();
    let min = generator.set_min_level();
    off.and(min)
}

/// Holds the generator while RF may be on. Dropping it without
/// [`RfGuard::release`] still shuts the output down, so an early return or a
/// panic inside the loop cannot leave RF on.
struct RfGuard<'a> {
    generator: &'a mut dyn Generator,
    armed: bool,
}

impl<'a> RfGuard<'a> {
    fn new(generator: &'a mut dyn Generator) -> Self {
        Self {
            generator,
            armed: true,
        }
    }

    fn release(mut self) -> InstrumentResult<()> {
        self.armed = false;
        rf_shutdown(&mut *self.generator)
    }
}

impl<'a> Deref for RfGuard<'a> {
    type Target = dyn Generator + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.generator
    }
}

impl<'a> DerefMut for RfGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.generator
    }
}

impl Drop for RfGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = rf_shutdown(&mut *self.generator) {
                error!("RF fail-safe could not switch the generator off: {e}");
            }
        }
    }
}

enum Exit {
    Completed,
    Cancelled,
}

/// Per-run bookkeeping handed through the loop.
struct RunContext<'a> {
    cancel: &'a CancellationToken,
    events: &'a Sender<SweepEvent>,
    progress: ProgressReporter,
    state: SweepState,
}

impl RunContext<'_> {
    fn emit(&self, event: SweepEvent) {
        if self.events.send(event).is_err() {
            debug!("Sweep event dropped, nobody is listening");
        }
    }

    fn cancelled(&self, checkpoint: &str) -> bool {
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            info!("Sweep stopped by user ({checkpoint})");
        }
        cancelled
    }
}

/// Sequences the instruments through one calibration sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepController {
    timing: Timing,
    range: AdaptiveRangeController,
    validator: LevelValidator,
    calibrator: Option<S21Calibrator>,
}

impl SweepController {
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            ..Default::default()
        }
    }

    /// Used only to log the predicted detector level before a sweep.
    pub fn with_calibrator(mut self, calibrator: Option<S21Calibrator>) -> Self {
        self.calibrator = calibrator;
        self
    }

    /// Run a complete sweep on `bench`.
    ///
    /// Nothing is sent to the instruments unless all three report
    /// initialized and the settings are valid. Once setup starts, the
    /// generator output is switched off and set to its minimum level on
    /// every way out of this function.
    pub fn run(
        &self,
        settings: &SweepSettings,
        bench: &mut Bench,
        cancel: &CancellationToken,
        events: &Sender<SweepEvent>,
    ) -> Result<SweepOutcome, SweepError> {
        let instruments = bench.not_ready();
        if !instruments.is_empty() {
            warn!("Sweep refused, not initialized: {}", instruments.join(", "));
            return Err(SweepError::NotReady { instruments });
        }
        settings.validate()?;

        let mut ctx = RunContext {
            cancel,
            events,
            progress: ProgressReporter::new(events.clone()),
            state: SweepState::default(),
        };
        let total_points = settings.total_points();
        info!(
            "Starting sweep: {} frequencies × {} levels",
            settings.freq_points(),
            settings.level_points()
        );
        if let Some(calibrator) = &self.calibrator {
            info!(
                "Maximum detector input level: {:.2} dBm",
                calibrator.max_detector_level(settings)
            );
        }
        ctx.emit(SweepEvent::Started { total_points });

        let Bench {
            generator,
            analyzer,
            oscilloscope,
        } = bench;

        if let Err(e) = self.configure(
            settings,
            generator.as_mut(),
            analyzer.as_mut(),
            oscilloscope.as_mut(),
        ) {
            error!("Instrument setup failed: {e}");
            if let Err(off) = rf_shutdown(generator.as_mut()) {
                error!("RF fail-safe could not switch the generator off: {off}");
            }
            ctx.progress.report_progress_value(100);
            return Err(SweepError::SetupFailed(e));
        }

        let mut rf = RfGuard::new(generator.as_mut());
        let looped = rf.rf_on().and_then(|()| {
            pause(self.timing.command_settle);
            self.sweep(
                settings,
                &mut *rf,
                analyzer.as_mut(),
                oscilloscope.as_mut(),
                &mut ctx,
            )
        });
        let shutdown = rf.release();
        ctx.progress.report_progress_value(100);
        let points = ctx.state.points;

        match (looped, shutdown) {
            (Err(source), shutdown) => {
                error!("Measurement loop error: {source}");
                if let Err(off) = shutdown {
                    error!("RF fail-safe could not switch the generator off: {off}");
                }
                Err(SweepError::Loop {
                    source,
                    partial: points,
                })
            }
            (Ok(_), Err(source)) => {
                error!("RF fail-safe could not switch the generator off: {source}");
                Err(SweepError::SafeShutdownFailed {
                    source,
                    partial: points,
                })
            }
            (Ok(Exit::Cancelled), Ok(())) => {
                info!("Sweep cancelled with {} points", points.len());
                Ok(SweepOutcome::Cancelled(points))
            }
            (Ok(Exit::Completed), Ok(())) => {
                info!("Sweep finished with {} of {total_points} points", points.len());
                Ok(SweepOutcome::Completed(points))
            }
        }
    }

    /// Put all three instruments into the state the sweep expects.
    pub fn configure(
        &self,
        settings: &SweepSettings,
        generator: &mut dyn Generator,
        analyzer: &mut dyn SpectrumAnalyzer,
        osc: &mut dyn Oscilloscope,
    ) -> InstrumentResult<()> {
        debug!("Configuring {}", generator.name());
        generator.factory_preset()?;
        generator.set_min_level()?;

        debug!("Configuring {}", analyzer.name());
        analyzer.set_swept_mode()?;
        analyzer.set_ref_level(settings.ref_level)?;
        analyzer.set_sweep_time(settings.sweep_time)?;
        analyzer.set_sweep_points(settings.sweep_points)?;
        analyzer.trace_clear_all()?;
        analyzer.set_format_trace_bin()?;

        debug!("Configuring {}", osc.name());
        let channel = settings.channel;
        osc.reset()?;
        pause(self.timing.reset_settle);
        osc.channel_off(DEFAULT_OSC_CHANNEL)?;
        osc.select_channel(channel)?;
        if settings.impedance_50ohm {
            osc.set_50ohm_termination()?;
        }
        osc.set_coupling(if settings.coupling_dc {
            Coupling::Dc
        } else {
            Coupling::Ac
        })?;
        osc.set_vertical_scale(1.0)?;
        osc.set_vertical_position(0.0)?;
        osc.channel_on(channel)?;
        osc.set_bandwidth(Bandwidth::Full)?;
        if settings.high_res {
            osc.set_high_res_mode()?;
        }
        osc.set_horizontal_scale(settings.hor_scale)?;
        osc.set_horizontal_position(0.0)?;
        osc.set_measurement_source(channel)?;
        osc.set_trigger_edge(channel, 0.0)?;
        osc.stop_after_sequence()?;
        osc.set_data_source(channel)?;
        osc.set_data_points(OSC_DATA_POINTS)?;
        osc.set_binary_data_format()?;
        pause(self.timing.command_settle);
        Ok(())
    }

    fn sweep(
        &self,
        settings: &SweepSettings,
        generator: &mut dyn Generator,
        analyzer: &mut dyn SpectrumAnalyzer,
        osc: &mut dyn Oscilloscope,
        ctx: &mut RunContext<'_>,
    ) -> InstrumentResult<Exit> {
        let levels = settings.levels_descending();
        let total = settings.total_points();

        for (freq_index, frequency) in settings.frequencies().into_iter().enumerate() {
            if ctx.cancelled("before frequency") {
                return Ok(Exit::Cancelled);
            }
            ctx.state.freq_index = freq_index;
            ctx.emit(SweepEvent::FrequencyChanged(Hertz(frequency)));
            debug!("Frequency {}", Hertz(frequency));

            analyzer.set_span(settings.span_wide)?;
            analyzer.set_rbw(settings.rbw_wide)?;
            analyzer.set_vbw(settings.vbw_wide)?;
            generator.set_frequency(frequency)?;
            analyzer.set_center_freq(frequency)?;
            pause(self.timing.command_settle);
            generator.set_level(settings.level_max())?;
            pause(self.timing.command_settle);
            self.analyzer_sweep(settings, analyzer)?;

            if settings.precise {
                if ctx.cancelled("before precise centering") {
                    return Ok(Exit::Cancelled);
                }
                self.center_on_peak(settings, analyzer)?;
                if ctx.cancelled("after precise centering") {
                    return Ok(Exit::Cancelled);
                }
            }

            for (level_index, &level) in levels.iter().enumerate() {
                if ctx.cancelled("before level") {
                    return Ok(Exit::Cancelled);
                }
                ctx.state.level_index = level_index;
                debug!("Frequency: {}; Level: {level:.2} dBm", Hertz(frequency));

                generator.set_level(level)?;
                let (trace, waveform) =
                    self.single_measurement(settings, analyzer, osc, ctx.cancel)?;
                let initial = mean_voltage(osc, &waveform)?;
                let refined = self
                    .range
                    .refine(osc, initial, ctx.cancel, |osc| self.acquire(osc, ctx.cancel))?;

                match self.validator.check(&trace) {
                    Some(peak) => {
                        let point = MeasurementPoint {
                            frequency_hz: frequency,
                            gen_level_dbm: level,
                            sa_level_dbm: f64::from(peak),
                            osc_voltage_v: refined.voltage,
                        };
                        ctx.state.points.push(point);
                        ctx.emit(SweepEvent::PointRecorded(point));
                    }
                    None => warn!(
                        "Signal at ({frequency} Hz, {level} dBm) under the noise limit, skipped"
                    ),
                }

                ctx.state.completed += 1;
                ctx.progress.report_progress_step(ctx.state.completed, total);
            }
        }
        Ok(Exit::Completed)
    }

    fn analyzer_sweep(
        &self,
        settings: &SweepSettings,
        analyzer: &mut dyn SpectrumAnalyzer,
    ) -> InstrumentResult<()> {
        analyzer.start_single_measurement()?;
        pause(self.timing.analyzer_settle(settings.sweep_time));
        Ok(())
    }

    /// Re-center on the peak of the last wide sweep, switch to the narrow-band
    /// parameters and sweep again.
    fn center_on_peak(
        &self,
        settings: &SweepSettings,
        analyzer: &mut dyn SpectrumAnalyzer,
    ) -> InstrumentResult<()> {
        analyzer.find_peak_max()?;
        let peak = analyzer.get_peak_freq()?;
        debug!("Peak at {}", Hertz(peak));
        analyzer.set_center_freq(peak)?;
        analyzer.set_span(settings.span_narrow)?;
        analyzer.set_rbw(settings.rbw_narrow)?;
        analyzer.set_vbw(settings.vbw_narrow)?;
        pause(self.timing.command_settle);
        self.analyzer_sweep(settings, analyzer)
    }

    /// One synchronized capture: an analyzer trace and an oscilloscope record
    /// taken while the generator holds its current level.
    pub fn single_measurement(
        &self,
        settings: &SweepSettings,
        analyzer: &mut dyn SpectrumAnalyzer,
        osc: &mut dyn Oscilloscope,
        cancel: &CancellationToken,
    ) -> InstrumentResult<(Vec<f32>, Waveform)> {
        osc.ready_for_acquisition()?;
        pause(self.timing.arm_settle);
        self.analyzer_sweep(settings, analyzer)?;
        osc.trigger_force()?;
        self.wait_for_acquisition(osc, cancel)?;

        let trace = analyzer.get_trace_data()?;
        let waveform = osc.get_waveform_data()?;
        Ok((trace, waveform))
    }

    /// Oscilloscope-only capture, used to re-measure after a scale change.
    fn acquire(
        &self,
        osc: &mut dyn Oscilloscope,
        cancel: &CancellationToken,
    ) -> InstrumentResult<f64> {
        osc.ready_for_acquisition()?;
        pause(self.timing.arm_settle);
        osc.trigger_force()?;
        self.wait_for_acquisition(osc, cancel)?;
        let waveform = osc.get_waveform_data()?;
        mean_voltage(osc, &waveform)
    }

    fn wait_for_acquisition(
        &self,
        osc: &mut dyn Oscilloscope,
        cancel: &CancellationToken,
    ) -> InstrumentResult<()> {
        let started = Instant::now();
        while osc.is_acquiring()? {
            if cancel.is_cancelled() {
                debug!("Stopped waiting for acquisition");
                break;
            }
            if started.elapsed() >= self.timing.acquisition_timeout {
                return Err(InstrumentError::Timeout {
                    instrument: osc.name(),
                    command: "is_acquiring",
                });
            }
            pause(self.timing.poll_interval);
        }
        Ok(())
    }
}

fn mean_voltage(osc: &dyn Oscilloscope, waveform: &Waveform) -> InstrumentResult<f64> {
    waveform.mean_voltage().ok_or(InstrumentError::Response {
        instrument: osc.name(),
        command: "get_waveform_data",
        message: "empty waveform".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBench;

    #[test]
    fn default_timing_matches_the_bench() {
        let timing = Timing::default();
        assert_eq!(timing.analyzer_settle(0.1), Duration::from_millis(500));
        assert_eq!(timing.arm_settle, Duration::from_millis(200));
        assert_eq!(timing.poll_interval, Duration::from_millis(100));
        assert_eq!(Timing::immediate().analyzer_settle(5.0), Duration::ZERO);
    }

    #[test]
    fn configure_sets_up_every_instrument_in_order() {
        let sim = SimBench::default();
        let controller = SweepController::new(Timing::immediate());
        let settings = SweepSettings {
            channel: 2,
            high_res: false,
            ..Default::default()
        };
        controller
            .configure(
                &settings,
                &mut sim.generator(),
                &mut sim.analyzer(),
                &mut sim.oscilloscope(),
            )
            .unwrap();

        let journal = sim.journal();
        assert_eq!(journal[0], "generator:factory_preset");
        assert_eq!(journal[1], "generator:set_min_level");
        assert_eq!(journal[2], "spectrum analyzer:set_swept_mode");
        assert!(journal.contains(&"spectrum analyzer:set_format_trace_bin".to_owned()));
        assert!(journal.contains(&"oscilloscope:select_channel 2".to_owned()));
        assert!(journal.contains(&"oscilloscope:set_data_points 10000".to_owned()));
        assert!(!journal.iter().any(|c| c.contains("set_high_res_mode")));
        assert_eq!(journal.last().unwrap(), "oscilloscope:set_binary_data_format");
    }

    #[test]
    fn single_measurement_reads_both_instruments() {
        let sim = SimBench::default();
        let controller = SweepController::new(Timing::immediate());
        let settings = SweepSettings::default();
        let (mut generator, mut analyzer, mut osc) =
            (sim.generator(), sim.analyzer(), sim.oscilloscope());
        controller
            .configure(&settings, &mut generator, &mut analyzer, &mut osc)
            .unwrap();
        generator.set_frequency(1e9).unwrap();
        analyzer.set_center_freq(1e9).unwrap();
        generator.set_level(-11.0).unwrap();
        generator.rf_on().unwrap();

        let (trace, waveform) = controller
            .single_measurement(&settings, &mut analyzer, &mut osc, &CancellationToken::new())
            .unwrap();
        assert_eq!(trace.len(), 1001);
        assert_eq!(LevelValidator.check(&trace), Some(-14.0));
        assert_eq!(waveform.voltage.len(), OSC_DATA_POINTS as usize);
        // -12 dBm at the detector, 0.5 V
        let mean = waveform.mean_voltage().unwrap();
        assert!((mean - 0.502).abs() < 0.01, "{mean}");
    }
}
