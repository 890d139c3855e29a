use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A linearly spaced sweep axis, persisted as a `[min, max, points]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64, usize)", into = "(f64, f64, usize)")]
pub struct SweepRange {
    pub min: f64,
    pub max: f64,
    pub points: usize,
}

impl SweepRange {
    pub const fn new(min: f64, max: f64, points: usize) -> Self {
        Self { min, max, points }
    }

    /// The axis values in ascending order.
    ///
    /// A single-point axis collapses to `[min]`. The last value is exactly
    /// `max` so that the generator is never asked for a level a rounding
    /// error above the configured maximum.
    pub fn values(&self) -> Vec<f64> {
        match self.points {
            0 => Vec::new(),
            1 => vec![self.min],
            n => {
                let step = (self.max - self.min) / (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        if i == n - 1 {
                            self.max
                        } else {
                            self.min + step * i as f64
                        }
                    })
                    .collect()
            }
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), SettingsError> {
        finite(field, self.min)?;
        finite(field, self.max)?;
        if self.points == 0 {
            return Err(SettingsError::NoPoints { field });
        }
        if self.min > self.max {
            return Err(SettingsError::MinAboveMax {
                field,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl From<(f64, f64, usize)> for SweepRange {
    fn from((min, max, points): (f64, f64, usize)) -> Self {
        Self { min, max, points }
    }
}

impl From<SweepRange> for (f64, f64, usize) {
    fn from(range: SweepRange) -> Self {
        (range.min, range.max, range.points)
    }
}

/// Everything one sweep needs to know, in base SI units (Hz, dBm, s).
///
/// The engine copies the settings when a session starts; nothing can change
/// them while the sweep is running. Every loading path validates, so a
/// `SweepSettings` read from disk is always usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SweepSettings {
    /// Generator frequencies, Hz.
    pub rf_frequencies: SweepRange,
    /// Generator output levels, dBm.
    pub rf_levels: SweepRange,

    pub span_wide: f64,
    pub rbw_wide: f64,
    pub vbw_wide: f64,
    pub span_narrow: f64,
    pub rbw_narrow: f64,
    pub vbw_narrow: f64,
    pub ref_level: f64,
    #[serde(default = "default_sweep_time")]
    pub sweep_time: f64,
    pub sweep_points: u32,
    /// Re-center on the detected peak with the narrow-band parameters before
    /// stepping through the levels.
    #[serde(default)]
    pub precise: bool,
    #[serde(default, rename = "RECALC_ATTEN")]
    pub recalc_attenuation: bool,

    pub channel: u8,
    #[serde(default)]
    pub impedance_50ohm: bool,
    #[serde(default)]
    pub coupling_dc: bool,
    #[serde(default)]
    pub high_res: bool,
    /// Horizontal scale, s/div.
    pub hor_scale: f64,
}

fn default_sweep_time() -> f64 {
    0.1
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            rf_frequencies: SweepRange::new(1e9, 2e9, 3),
            rf_levels: SweepRange::new(-50.0, -10.0, 5),
            span_wide: 1e6,
            rbw_wide: 10e3,
            vbw_wide: 10e3,
            span_narrow: 100e3,
            rbw_narrow: 1e3,
            vbw_narrow: 1e3,
            ref_level: 0.0,
            sweep_time: default_sweep_time(),
            sweep_points: 1001,
            precise: false,
            recalc_attenuation: false,
            channel: 1,
            impedance_50ohm: true,
            coupling_dc: true,
            high_res: true,
            hor_scale: 1e-3,
        }
    }
}

impl SweepSettings {
    pub fn freq_min(&self) -> f64 {
        self.rf_frequencies.min
    }

    pub fn freq_max(&self) -> f64 {
        self.rf_frequencies.max
    }

    pub fn freq_points(&self) -> usize {
        self.rf_frequencies.points
    }

    pub fn level_min(&self) -> f64 {
        self.rf_levels.min
    }

    pub fn level_max(&self) -> f64 {
        self.rf_levels.max
    }

    pub fn level_points(&self) -> usize {
        self.rf_levels.points
    }

    /// Sweep frequencies, ascending.
    pub fn frequencies(&self) -> Vec<f64> {
        self.rf_frequencies.values()
    }

    /// Generator levels in the order they are visited: highest first.
    pub fn levels_descending(&self) -> Vec<f64> {
        let mut levels = self.rf_levels.values();
        levels.reverse();
        levels
    }

    pub fn total_points(&self) -> usize {
        self.freq_points() * self.level_points()
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.rf_frequencies.validate("RF_FREQUENCIES")?;
        positive("RF_FREQUENCIES", self.rf_frequencies.min)?;
        self.rf_levels.validate("RF_LEVELS")?;

        for (field, value) in [
            ("SPAN_WIDE", self.span_wide),
            ("RBW_WIDE", self.rbw_wide),
            ("VBW_WIDE", self.vbw_wide),
            ("SPAN_NARROW", self.span_narrow),
            ("RBW_NARROW", self.rbw_narrow),
            ("VBW_NARROW", self.vbw_narrow),
            ("HOR_SCALE", self.hor_scale),
        ] {
            positive(field, value)?;
        }

        finite("REF_LEVEL", self.ref_level)?;
        finite("SWEEP_TIME", self.sweep_time)?;
        if self.sweep_time < 0.0 {
            return Err(SettingsError::Negative {
                field: "SWEEP_TIME",
                value: self.sweep_time,
            });
        }
        if self.sweep_points == 0 {
            return Err(SettingsError::NoPoints {
                field: "SWEEP_POINTS",
            });
        }
        if !(1..=4).contains(&self.channel) {
            return Err(SettingsError::Channel(self.channel));
        }
        Ok(())
    }

    /// Parse and validate settings from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read and validate a settings file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Write the settings as pretty JSON, creating the parent directory if
    /// needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, self.to_json_string()?).map_err(io_err)
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), SettingsError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SettingsError::NotFinite { field, value })
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), SettingsError> {
    finite(field, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(SettingsError::NotPositive { field, value })
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} needs at least one point")]
    NoPoints { field: &'static str },

    #[error("{field}: minimum {min} is greater than maximum {max}")]
    MinAboveMax {
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("Oscilloscope channel must be between 1 and 4, got {0}")]
    Channel(u8),

    #[error("Couldn't access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse settings: {0}")]
    Json(#[from] serde_json::Error),
}
