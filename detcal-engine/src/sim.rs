//! A simulated bench: generator, analyzer and oscilloscope wired to the same
//! RF path.
//!
//! The analyzer and oscilloscope hand their data through the same binary
//! encodings the real instruments use, so the decoding path is exercised
//! end to end. Every command is appended to a journal that tests can inspect.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::codec::{self, Waveform, WaveformPreamble};
use crate::instrument::{
    Bandwidth, Bench, Coupling, Generator, Instrument, InstrumentError, InstrumentResult,
    NotReady, Oscilloscope, SpectrumAnalyzer,
};

pub const GENERATOR: &str = "generator";
pub const ANALYZER: &str = "spectrum analyzer";
pub const OSCILLOSCOPE: &str = "oscilloscope";

pub const GENERATOR_MIN_LEVEL_DBM: f64 = -110.0;
pub const GENERATOR_MAX_LEVEL_DBM: f64 = 20.0;

/// ADC counts for a full screen of ten vertical divisions.
const SCREEN_COUNTS: f64 = 65536.0;
const SCREEN_DIVISIONS: f64 = 10.0;

/// Physical parameters of the simulated RF path.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Insertion loss from the generator to the analyzer input, dB (negative).
    pub gen_sa_db: f64,
    /// Insertion loss from the generator to the detector input, dB (negative).
    pub gen_det_db: f64,
    pub noise_floor_dbm: f64,
    /// Detector output voltage for a 0 dBm input.
    pub detector_volts_at_0dbm: f64,
    /// How many `is_acquiring` polls report busy after a trigger.
    pub acquisition_polls: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gen_sa_db: -3.0,
            gen_det_db: -1.0,
            noise_floor_dbm: -90.0,
            detector_volts_at_0dbm: 2.0,
            acquisition_polls: 1,
        }
    }
}

#[derive(Debug)]
struct GeneratorState {
    frequency: f64,
    level: f64,
    rf_on: bool,
}

#[derive(Debug)]
struct AnalyzerState {
    center: f64,
    span: f64,
    sweep_points: u32,
    binary: bool,
    trace: Option<Vec<f32>>,
    marker: Option<usize>,
}

impl AnalyzerState {
    fn bin_frequency(&self, bin: usize) -> f64 {
        if self.sweep_points <= 1 {
            return self.center;
        }
        let step = self.span / f64::from(self.sweep_points - 1);
        self.center - self.span / 2.0 + step * bin as f64
    }
}

#[derive(Debug)]
struct ScopeState {
    scale: f64,
    data_points: u32,
    binary: bool,
    armed: bool,
    polls_left: u32,
    acquired: Option<(Vec<u16>, WaveformPreamble)>,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    journal: Vec<String>,
    disconnected: HashSet<&'static str>,
    /// Command name → number of successful calls allowed before it fails.
    failures: HashMap<&'static str, usize>,
    calls: HashMap<&'static str, usize>,
    generator: GeneratorState,
    analyzer: AnalyzerState,
    scope: ScopeState,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            journal: Vec::new(),
            disconnected: HashSet::new(),
            failures: HashMap::new(),
            calls: HashMap::new(),
            generator: GeneratorState {
                frequency: 1e9,
                level: GENERATOR_MIN_LEVEL_DBM,
                rf_on: false,
            },
            analyzer: AnalyzerState {
                center: 1e9,
                span: 1e6,
                sweep_points: 1001,
                binary: false,
                trace: None,
                marker: None,
            },
            scope: ScopeState {
                scale: 1.0,
                data_points: 1000,
                binary: false,
                armed: false,
                polls_left: 0,
                acquired: None,
            },
        }
    }

    /// Power arriving at a port with the given path loss.
    fn power_at(&self, path_db: f64) -> Option<f64> {
        self.generator
            .rf_on
            .then_some(self.generator.level + path_db)
    }

    fn detector_voltage(&self) -> f64 {
        self.power_at(self.config.gen_det_db)
            .map_or(0.0, |dbm| {
                self.config.detector_volts_at_0dbm * 10f64.powf(dbm / 20.0)
            })
    }

    fn sweep_trace(&self) -> Vec<f32> {
        let a = &self.analyzer;
        let floor = self.config.noise_floor_dbm;
        let mut trace = vec![floor as f32; a.sweep_points as usize];
        let Some(level) = self.power_at(self.config.gen_sa_db) else {
            return trace;
        };
        let offset = self.generator.frequency - (a.center - a.span / 2.0);
        if !(0.0..=a.span).contains(&offset) {
            return trace;
        }
        let bin = if a.sweep_points > 1 {
            (offset / a.span * f64::from(a.sweep_points - 1)).round() as usize
        } else {
            0
        };
        trace[bin] = level.max(floor) as f32;
        trace
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record a command and decide whether it goes through.
fn issue<'a>(
    state: &'a Mutex<SimState>,
    instrument: &'static str,
    command: &'static str,
    args: String,
) -> InstrumentResult<MutexGuard<'a, SimState>> {
    let mut s = lock(state);
    if s.disconnected.contains(instrument) {
        return Err(InstrumentError::NotConnected { instrument });
    }
    let entry = if args.is_empty() {
        format!("{instrument}:{command}")
    } else {
        format!("{instrument}:{command} {args}")
    };
    trace!("sim {entry}");
    s.journal.push(entry);

    let calls = s.calls.entry(command).or_default();
    let previous = *calls;
    *calls += 1;
    if s.failures.get(command).is_some_and(|&allowed| previous >= allowed) {
        return Err(InstrumentError::Command {
            instrument,
            command,
            message: "simulated failure".to_owned(),
        });
    }
    Ok(s)
}

/// Handle to a simulated bench. Clones share the same instruments.
#[derive(Debug, Clone)]
pub struct SimBench {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimBench {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    pub fn generator(&self) -> SimGenerator {
        SimGenerator {
            state: Arc::clone(&self.state),
        }
    }

    pub fn analyzer(&self) -> SimAnalyzer {
        SimAnalyzer {
            state: Arc::clone(&self.state),
        }
    }

    pub fn oscilloscope(&self) -> SimOscilloscope {
        SimOscilloscope {
            state: Arc::clone(&self.state),
        }
    }

    /// A bench made of the three simulated instruments.
    pub fn connect(&self) -> Result<Bench, NotReady> {
        Bench::connect(
            Box::new(self.generator()),
            Box::new(self.analyzer()),
            Box::new(self.oscilloscope()),
        )
    }

    /// Make one instrument (by name) drop its connection.
    pub fn disconnect(&self, instrument: &'static str) {
        lock(&self.state).disconnected.insert(instrument);
    }

    /// Let `command` succeed `successes` more times, then fail on every call.
    pub fn fail_after(&self, command: &'static str, successes: usize) {
        let mut s = lock(&self.state);
        let already = s.calls.get(command).copied().unwrap_or(0);
        s.failures.insert(command, already + successes);
    }

    /// Every command issued so far, as `instrument:command args`.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.state).journal.clone()
    }

    pub fn rf_is_on(&self) -> bool {
        lock(&self.state).generator.rf_on
    }

    pub fn generator_level(&self) -> f64 {
        lock(&self.state).generator.level
    }

    pub fn vertical_scale(&self) -> f64 {
        lock(&self.state).scope.scale
    }
}

#[derive(Debug)]
pub struct SimGenerator {
    state: Arc<Mutex<SimState>>,
}

impl SimGenerator {
    fn issue(
        &self,
        command: &'static str,
        args: String,
    ) -> InstrumentResult<MutexGuard<'_, SimState>> {
        issue(&self.state, GENERATOR, command, args)
    }
}

impl Instrument for SimGenerator {
    fn name(&self) -> &'static str {
        GENERATOR
    }

    fn is_initialized(&self) -> bool {
        !lock(&self.state).disconnected.contains(GENERATOR)
    }
}

impl Generator for SimGenerator {
    fn factory_preset(&mut self) -> InstrumentResult<()> {
        let mut s = self.issue("factory_preset", String::new())?;
        s.generator.rf_on = false;
        s.generator.level = GENERATOR_MIN_LEVEL_DBM;
        Ok(())
    }

    fn set_frequency(&mut self, hz: f64) -> InstrumentResult<()> {
        self.issue("set_frequency", hz.to_string())?.generator.frequency = hz;
        Ok(())
    }

    fn set_level(&mut self, dbm: f64) -> InstrumentResult<()> {
        let mut s = self.issue("set_level", dbm.to_string())?;
        if !(GENERATOR_MIN_LEVEL_DBM..=GENERATOR_MAX_LEVEL_DBM).contains(&dbm) {
            return Err(InstrumentError::Command {
                instrument: GENERATOR,
                command: "set_level",
                message: format!(
                    "{dbm} dBm outside [{GENERATOR_MIN_LEVEL_DBM}, {GENERATOR_MAX_LEVEL_DBM}] dBm"
                ),
            });
        }
        s.generator.level = dbm;
        Ok(())
    }

    fn set_min_level(&mut self) -> InstrumentResult<()> {
        self.issue("set_min_level", String::new())?.generator.level = GENERATOR_MIN_LEVEL_DBM;
        Ok(())
    }

    fn rf_on(&mut self) -> InstrumentResult<()> {
        self.issue("rf_on", String::new())?.generator.rf_on = true;
        Ok(())
    }

    fn rf_off(&mut self) -> InstrumentResult<()> {
        self.issue("rf_off", String::new())?.generator.rf_on = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimAnalyzer {
    state: Arc<Mutex<SimState>>,
}

impl SimAnalyzer {
    fn issue(
        &self,
        command: &'static str,
        args: String,
    ) -> InstrumentResult<MutexGuard<'_, SimState>> {
        issue(&self.state, ANALYZER, command, args)
    }

    /// Accept a setting the model doesn't act on.
    fn accept(&self, command: &'static str, value: f64) -> InstrumentResult<()> {
        self.issue(command, value.to_string()).map(drop)
    }
}

impl Instrument for SimAnalyzer {
    fn name(&self) -> &'static str {
        ANALYZER
    }

    fn is_initialized(&self) -> bool {
        !lock(&self.state).disconnected.contains(ANALYZER)
    }
}

impl SpectrumAnalyzer for SimAnalyzer {
    fn set_swept_mode(&mut self) -> InstrumentResult<()> {
        self.issue("set_swept_mode", String::new()).map(drop)
    }

    fn set_center_freq(&mut self, hz: f64) -> InstrumentResult<()> {
        self.issue("set_center_freq", hz.to_string())?.analyzer.center = hz;
        Ok(())
    }

    fn set_span(&mut self, hz: f64) -> InstrumentResult<()> {
        self.issue("set_span", hz.to_string())?.analyzer.span = hz;
        Ok(())
    }

    fn set_rbw(&mut self, hz: f64) -> InstrumentResult<()> {
        self.accept("set_rbw", hz)
    }

    fn set_vbw(&mut self, hz: f64) -> InstrumentResult<()> {
        self.accept("set_vbw", hz)
    }

    fn set_ref_level(&mut self, dbm: f64) -> InstrumentResult<()> {
        self.accept("set_ref_level", dbm)
    }

    fn set_sweep_time(&mut self, seconds: f64) -> InstrumentResult<()> {
        self.accept("set_sweep_time", seconds)
    }

    fn set_sweep_points(&mut self, points: u32) -> InstrumentResult<()> {
        self.issue("set_sweep_points", points.to_string())?
            .analyzer
            .sweep_points = points;
        Ok(())
    }

    fn trace_clear_all(&mut self) -> InstrumentResult<()> {
        let mut s = self.issue("trace_clear_all", String::new())?;
        s.analyzer.trace = None;
        s.analyzer.marker = None;
        Ok(())
    }

    fn set_format_trace_bin(&mut self) -> InstrumentResult<()> {
        self.issue("set_format_trace_bin", String::new())?.analyzer.binary = true;
        Ok(())
    }

    fn start_single_measurement(&mut self) -> InstrumentResult<()> {
        let mut s = self.issue("start_single_measurement", String::new())?;
        let trace = s.sweep_trace();
        s.analyzer.trace = Some(trace);
        Ok(())
    }

    fn find_peak_max(&mut self) -> InstrumentResult<()> {
        let mut s = self.issue("find_peak_max", String::new())?;
        let marker = s.analyzer.trace.as_ref().and_then(|trace| {
            trace
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, _)| i)
        });
        s.analyzer.marker = marker;
        Ok(())
    }

    fn get_peak_freq(&mut self) -> InstrumentResult<f64> {
        let s = self.issue("get_peak_freq", String::new())?;
        s.analyzer
            .marker
            .map(|bin| s.analyzer.bin_frequency(bin))
            .ok_or_else(|| InstrumentError::Response {
                instrument: ANALYZER,
                command: "get_peak_freq",
                message: "no marker set".to_owned(),
            })
    }

    fn get_trace_data(&mut self) -> InstrumentResult<Vec<f32>> {
        let s = self.issue("get_trace_data", String::new())?;
        let response = |message: &str| InstrumentError::Response {
            instrument: ANALYZER,
            command: "get_trace_data",
            message: message.to_owned(),
        };
        if !s.analyzer.binary {
            return Err(response("trace format is ASCII"));
        }
        let trace = s.analyzer.trace.as_ref().ok_or_else(|| response("no trace"))?;
        let block = codec::encode_real32_be(trace);
        codec::decode_real32_be(&block).map_err(|e| response(&e.to_string()))
    }
}

#[derive(Debug)]
pub struct SimOscilloscope {
    state: Arc<Mutex<SimState>>,
}

impl SimOscilloscope {
    fn issue(
        &self,
        command: &'static str,
        args: String,
    ) -> InstrumentResult<MutexGuard<'_, SimState>> {
        issue(&self.state, OSCILLOSCOPE, command, args)
    }

    fn accept(&self, command: &'static str, args: String) -> InstrumentResult<()> {
        self.issue(command, args).map(drop)
    }
}

impl Instrument for SimOscilloscope {
    fn name(&self) -> &'static str {
        OSCILLOSCOPE
    }

    fn is_initialized(&self) -> bool {
        !lock(&self.state).disconnected.contains(OSCILLOSCOPE)
    }
}

impl Oscilloscope for SimOscilloscope {
    fn reset(&mut self) -> InstrumentResult<()> {
        let mut s = self.issue("reset", String::new())?;
        s.scope.scale = 1.0;
        s.scope.binary = false;
        s.scope.armed = false;
        s.scope.acquired = None;
        Ok(())
    }

    fn select_channel(&mut self, channel: u8) -> InstrumentResult<()> {
        self.accept("select_channel", channel.to_string())
    }

    fn channel_on(&mut self, channel: u8) -> InstrumentResult<()> {
        self.accept("channel_on", channel.to_string())
    }

    fn channel_off(&mut self, channel: u8) -> InstrumentResult<()> {
        self.accept("channel_off", channel.to_string())
    }

    fn set_50ohm_termination(&mut self) -> InstrumentResult<()> {
        self.accept("set_50ohm_termination", String::new())
    }

    fn set_coupling(&mut self, coupling: Coupling) -> InstrumentResult<()> {
        self.accept("set_coupling", format!("{coupling:?}"))
    }

    fn set_vertical_scale(&mut self, volts_per_div: f64) -> InstrumentResult<()> {
        self.issue("set_vertical_scale", volts_per_div.to_string())?
            .scope
            .scale = volts_per_div;
        Ok(())
    }

    fn get_vertical_scale(&mut self) -> InstrumentResult<f64> {
        Ok(self.issue("get_vertical_scale", String::new())?.scope.scale)
    }

    fn set_vertical_position(&mut self, divisions: f64) -> InstrumentResult<()> {
        self.accept("set_vertical_position", divisions.to_string())
    }

    fn set_bandwidth(&mut self, bandwidth: Bandwidth) -> InstrumentResult<()> {
        self.accept("set_bandwidth", format!("{bandwidth:?}"))
    }

    fn set_high_res_mode(&mut self) -> InstrumentResult<()> {
        self.accept("set_high_res_mode", String::new())
    }

    fn set_horizontal_scale(&mut self, seconds_per_div: f64) -> InstrumentResult<()> {
        self.accept("set_horizontal_scale", seconds_per_div.to_string())
    }

    fn set_horizontal_position(&mut self, position: f64) -> InstrumentResult<()> {
        self.accept("set_horizontal_position", position.to_string())
    }

    fn set_measurement_source(&mut self, channel: u8) -> InstrumentResult<()> {
        self.accept("set_measurement_source", channel.to_string())
    }

    fn set_trigger_edge(&mut self, channel: u8, level_v: f64) -> InstrumentResult<()> {
        self.accept("set_trigger_edge", format!("{channel} {level_v}"))
    }

    fn stop_after_sequence(&mut self) -> InstrumentResult<()> {
        self.accept("stop_after_sequence", String::new())
    }

    fn set_data_source(&mut self, channel: u8) -> InstrumentResult<()> {
        self.accept("set_data_source", channel.to_string())
    }

    fn set_data_points(&mut self, points: u32) -> InstrumentResult<()> {
        self.issue("set_data_points", points.to_string())?
            .scope
            .data_points = points;
        Ok(())
    }

    fn set_binary_data_format(&mut self) -> InstrumentResult<()> {
        self.issue("set_binary_data_format", String::new())?.scope.binary = true;
        Ok(())
    }

    fn ready_for_acquisition(&mut self) -> InstrumentResult<()> {
        self.issue("ready_for_acquisition", String::new())?.scope.armed = true;
        Ok(())
    }

    fn trigger_force(&mut self) -> InstrumentResult<()> {
        let mut s = self.issue("trigger_force", String::new())?;
        if !s.scope.armed {
            return Ok(());
        }
        let scale = s.scope.scale;
        let preamble = WaveformPreamble {
            y_mult: scale * SCREEN_DIVISIONS / SCREEN_COUNTS,
            y_zero: 0.0,
            y_offset: SCREEN_COUNTS / 2.0,
            x_incr: 1e-6,
            x_zero: 0.0,
        };
        let counts = preamble.to_counts(s.detector_voltage());
        let raw = vec![counts; s.scope.data_points as usize];
        s.scope.acquired = Some((raw, preamble));
        s.scope.armed = false;
        s.scope.polls_left = s.config.acquisition_polls;
        Ok(())
    }

    fn is_acquiring(&mut self) -> InstrumentResult<bool> {
        let mut s = self.issue("is_acquiring", String::new())?;
        if s.scope.polls_left > 0 {
            s.scope.polls_left -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn get_waveform_data(&mut self) -> InstrumentResult<Waveform> {
        let s = self.issue("get_waveform_data", String::new())?;
        let response = |message: &str| InstrumentError::Response {
            instrument: OSCILLOSCOPE,
            command: "get_waveform_data",
            message: message.to_owned(),
        };
        if !s.scope.binary {
            return Err(response("data format is ASCII"));
        }
        let (raw, preamble) = s.scope.acquired.as_ref().ok_or_else(|| response("no acquisition"))?;
        let block = codec::encode_rpbinary16(raw);
        let counts = codec::decode_rpbinary16(&block).map_err(|e| response(&e.to_string()))?;
        Ok(preamble.scale(&counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn generator_enforces_level_limits() {
        let sim = SimBench::default();
        let mut generator = sim.generator();
        assert!(generator.set_level(21.0).is_err());
        assert!(generator.set_level(-111.0).is_err());
        generator.set_level(20.0).unwrap();
        generator.set_min_level().unwrap();
        assert_eq!(sim.generator_level(), GENERATOR_MIN_LEVEL_DBM);
    }

    #[test]
    fn analyzer_sees_the_tone_only_with_rf_on() {
        let sim = SimBench::default();
        let (mut generator, mut analyzer) = (sim.generator(), sim.analyzer());
        analyzer.set_format_trace_bin().unwrap();
        analyzer.set_center_freq(1.5e9).unwrap();
        generator.set_frequency(1.5e9).unwrap();
        generator.set_level(-20.0).unwrap();

        analyzer.start_single_measurement().unwrap();
        let dark = analyzer.get_trace_data().unwrap();
        assert!(dark.iter().all(|&v| v == -90.0));

        generator.rf_on().unwrap();
        analyzer.start_single_measurement().unwrap();
        let lit = analyzer.get_trace_data().unwrap();
        assert_eq!(lit.len(), 1001);
        assert_eq!(lit[500], -23.0);

        analyzer.find_peak_max().unwrap();
        assert_eq!(analyzer.get_peak_freq().unwrap(), 1.5e9);
    }

    #[test]
    fn analyzer_requires_binary_format() {
        let sim = SimBench::default();
        let mut analyzer = sim.analyzer();
        analyzer.start_single_measurement().unwrap();
        assert!(matches!(
            analyzer.get_trace_data(),
            Err(InstrumentError::Response { .. })
        ));
    }

    #[test]
    fn oscilloscope_clips_at_the_screen_edge() {
        let sim = SimBench::default();
        let (mut generator, mut osc) = (sim.generator(), sim.oscilloscope());
        osc.set_binary_data_format().unwrap();
        generator.set_level(1.0).unwrap();
        generator.rf_on().unwrap();

        // 0 dBm at the detector: 2 V, well above five divisions of 10 mV.
        osc.set_vertical_scale(10e-3).unwrap();
        osc.ready_for_acquisition().unwrap();
        osc.trigger_force().unwrap();
        assert!(osc.is_acquiring().unwrap());
        assert!(!osc.is_acquiring().unwrap());
        let clipped = osc.get_waveform_data().unwrap().mean_voltage().unwrap();
        assert_abs_diff_eq!(clipped, 0.05, epsilon = 1e-5);

        osc.set_vertical_scale(1.0).unwrap();
        osc.ready_for_acquisition().unwrap();
        osc.trigger_force().unwrap();
        let volts = osc.get_waveform_data().unwrap().mean_voltage().unwrap();
        assert_abs_diff_eq!(volts, 2.0, epsilon = 1e-3);
    }

    #[test]
    fn injected_failures_and_journal() {
        let sim = SimBench::default();
        sim.fail_after("set_frequency", 1);
        let mut generator = sim.generator();
        generator.set_frequency(1e9).unwrap();
        assert!(generator.set_frequency(2e9).is_err());
        assert_eq!(
            sim.journal(),
            vec![
                "generator:set_frequency 1000000000",
                "generator:set_frequency 2000000000"
            ]
        );
    }

    #[test]
    fn disconnected_instrument_refuses_commands() {
        let sim = SimBench::default();
        sim.disconnect(OSCILLOSCOPE);
        let mut osc = sim.oscilloscope();
        assert!(!osc.is_initialized());
        assert_eq!(
            osc.reset(),
            Err(InstrumentError::NotConnected {
                instrument: OSCILLOSCOPE
            })
        );
        assert!(sim.connect().is_err());
    }
}
