//! Capability traits for the three bench instruments.
//!
//! Every call is synchronous and may fail; the transport behind it (SCPI over
//! VISA, a simulator, a test double) is not the engine's concern.

use thiserror::Error;

use crate::codec::Waveform;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentError {
    #[error("{instrument} is not connected")]
    NotConnected { instrument: &'static str },

    #[error("{instrument} rejected '{command}': {message}")]
    Command {
        instrument: &'static str,
        command: &'static str,
        message: String,
    },

    #[error("{instrument} returned an unreadable response to '{command}': {message}")]
    Response {
        instrument: &'static str,
        command: &'static str,
        message: String,
    },

    #[error("{instrument} timed out on '{command}'")]
    Timeout {
        instrument: &'static str,
        command: &'static str,
    },
}

pub type InstrumentResult<T> = Result<T, InstrumentError>;

/// What every instrument can report about itself.
pub trait Instrument: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether the transport is up and the instrument answered its
    /// identification query.
    fn is_initialized(&self) -> bool;
}

/// Microwave signal generator.
pub trait Generator: Instrument {
    fn factory_preset(&mut self) -> InstrumentResult<()>;
    fn set_frequency(&mut self, hz: f64) -> InstrumentResult<()>;
    fn set_level(&mut self, dbm: f64) -> InstrumentResult<()>;
    /// Drive the output to the lowest level the generator supports.
    fn set_min_level(&mut self) -> InstrumentResult<()>;
    fn rf_on(&mut self) -> InstrumentResult<()>;
    fn rf_off(&mut self) -> InstrumentResult<()>;
}

/// Swept spectrum analyzer.
pub trait SpectrumAnalyzer: Instrument {
    fn set_swept_mode(&mut self) -> InstrumentResult<()>;
    fn set_center_freq(&mut self, hz: f64) -> InstrumentResult<()>;
    fn set_span(&mut self, hz: f64) -> InstrumentResult<()>;
    fn set_rbw(&mut self, hz: f64) -> InstrumentResult<()>;
    fn set_vbw(&mut self, hz: f64) -> InstrumentResult<()>;
    fn set_ref_level(&mut self, dbm: f64) -> InstrumentResult<()>;
    fn set_sweep_time(&mut self, seconds: f64) -> InstrumentResult<()>;
    fn set_sweep_points(&mut self, points: u32) -> InstrumentResult<()>;
    fn trace_clear_all(&mut self) -> InstrumentResult<()>;
    /// Switch trace output to REAL,32 with normal (big-endian) byte order.
    fn set_format_trace_bin(&mut self) -> InstrumentResult<()>;
    /// Equivalent of pressing the front panel 'Single' key.
    fn start_single_measurement(&mut self) -> InstrumentResult<()>;
    fn find_peak_max(&mut self) -> InstrumentResult<()>;
    fn get_peak_freq(&mut self) -> InstrumentResult<f64>;
    /// Trace 1 in dBm, one value per sweep point.
    fn get_trace_data(&mut self) -> InstrumentResult<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Ac,
    Dc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    Full,
    Limited20Mhz,
}

/// Digital oscilloscope measuring the detector's video output.
pub trait Oscilloscope: Instrument {
    fn reset(&mut self) -> InstrumentResult<()>;
    fn select_channel(&mut self, channel: u8) -> InstrumentResult<()>;
    fn channel_on(&mut self, channel: u8) -> InstrumentResult<()>;
    fn channel_off(&mut self, channel: u8) -> InstrumentResult<()>;
    fn set_50ohm_termination(&mut self) -> InstrumentResult<()>;
    fn set_coupling(&mut self, coupling: Coupling) -> InstrumentResult<()>;
    fn set_vertical_scale(&mut self, volts_per_div: f64) -> InstrumentResult<()>;
    fn get_vertical_scale(&mut self) -> InstrumentResult<f64>;
    fn set_vertical_position(&mut self, divisions: f64) -> InstrumentResult<()>;
    fn set_bandwidth(&mut self, bandwidth: Bandwidth) -> InstrumentResult<()>;
    fn set_high_res_mode(&mut self) -> InstrumentResult<()>;
    fn set_horizontal_scale(&mut self, seconds_per_div: f64) -> InstrumentResult<()>;
    fn set_horizontal_position(&mut self, position: f64) -> InstrumentResult<()>;
    fn set_measurement_source(&mut self, channel: u8) -> InstrumentResult<()>;
    fn set_trigger_edge(&mut self, channel: u8, level_v: f64) -> InstrumentResult<()>;
    fn stop_after_sequence(&mut self) -> InstrumentResult<()>;
    fn set_data_source(&mut self, channel: u8) -> InstrumentResult<()>;
    fn set_data_points(&mut self, points: u32) -> InstrumentResult<()>;
    /// Two bytes per point, RPBinary encoding.
    fn set_binary_data_format(&mut self) -> InstrumentResult<()>;
    /// Arm a single acquisition sequence.
    fn ready_for_acquisition(&mut self) -> InstrumentResult<()>;
    fn trigger_force(&mut self) -> InstrumentResult<()>;
    fn is_acquiring(&mut self) -> InstrumentResult<bool>;
    fn get_waveform_data(&mut self) -> InstrumentResult<Waveform>;
}

/// The three instruments a sweep needs, owned together.
///
/// A `Bench` can only be built from instruments that are connected. A running
/// session owns its bench outright, so nothing else can talk to the hardware
/// while a sweep is in progress.
pub struct Bench {
    pub generator: Box<dyn Generator>,
    pub analyzer: Box<dyn SpectrumAnalyzer>,
    pub oscilloscope: Box<dyn Oscilloscope>,
}

impl std::fmt::Debug for Bench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bench")
            .field("generator", &self.generator.name())
            .field("analyzer", &self.analyzer.name())
            .field("oscilloscope", &self.oscilloscope.name())
            .finish()
    }
}

#[derive(Error, Debug)]
#[error("{} not initialized", .instruments.join(", "))]
pub struct NotReady {
    pub instruments: Vec<&'static str>,
    pub bench: Bench,
}

impl Bench {
    /// Assemble a bench, refusing if any instrument isn't connected. The
    /// instruments are handed back inside the error.
    pub fn connect(
        generator: Box<dyn Generator>,
        analyzer: Box<dyn SpectrumAnalyzer>,
        oscilloscope: Box<dyn Oscilloscope>,
    ) -> Result<Self, NotReady> {
        let bench = Self {
            generator,
            analyzer,
            oscilloscope,
        };
        let missing = bench.not_ready();
        if missing.is_empty() {
            Ok(bench)
        } else {
            Err(NotReady {
                instruments: missing,
                bench,
            })
        }
    }

    /// Names of the instruments that currently report not initialized.
    ///
    /// Connections can drop after the bench was assembled, so the controller
    /// asks again before every sweep.
    pub fn not_ready(&self) -> Vec<&'static str> {
        [
            (self.generator.name(), self.generator.is_initialized()),
            (self.analyzer.name(), self.analyzer.is_initialized()),
            (self.oscilloscope.name(), self.oscilloscope.is_initialized()),
        ]
        .into_iter()
        .filter(|(_, ready)| !ready)
        .map(|(name, _)| name)
        .collect()
    }
}
