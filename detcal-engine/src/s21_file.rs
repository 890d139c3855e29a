//! Reader for the VNA trace files the S21 calibration tables come from.
//!
//! The file is INI-like. `[VNA]` holds the frequency axis, `[Trace]` holds a
//! `size` and one complex sample per point as `N\ampy` (real) and `N\ampz`
//! (imaginary), numbered from 1. Section and key names are case-insensitive.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use detcal_messages::{Decibels, S21Table, S21TableError, SweepRange};
use log::debug;
use num_complex::Complex64;
use thiserror::Error;

const DEFAULT_START_FREQ: f64 = 100e3;
const DEFAULT_STOP_FREQ: f64 = 6.5e9;
const DEFAULT_SWEEP_POINTS: usize = 1001;

#[derive(Error, Debug)]
pub enum S21FileError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no [Trace] section")]
    NoTrace,

    #[error("line {line}: '{text}' is neither a section nor a key")]
    Syntax { line: usize, text: String },

    #[error("[{section}] {key} = '{value}' is not a number")]
    Number {
        section: &'static str,
        key: String,
        value: String,
    },

    #[error("trace point {0} is missing its real or imaginary part")]
    MissingPoint(usize),

    #[error("trace point {0} has zero magnitude")]
    ZeroMagnitude(usize),

    #[error(transparent)]
    Table(#[from] S21TableError),
}

/// Section name → (lowercased key → raw value).
type Sections = HashMap<String, HashMap<String, String>>;

fn parse_sections(content: &str) -> Result<Sections, S21FileError> {
    let mut sections = Sections::new();
    let mut current: Option<String> = None;

    for (n, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_ascii_lowercase();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let (Some(section), Some((key, value))) = (&current, line.split_once('=')) else {
            return Err(S21FileError::Syntax {
                line: n + 1,
                text: line.to_owned(),
            });
        };
        sections
            .entry(section.clone())
            .or_default()
            .insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }
    Ok(sections)
}

fn number<T: std::str::FromStr>(
    section: &'static str,
    keys: Option<&HashMap<String, String>>,
    key: &str,
) -> Result<Option<T>, S21FileError> {
    let Some(value) = keys.and_then(|k| k.get(key)) else {
        return Ok(None);
    };
    value
        .parse()
        .map(Some)
        .map_err(|_| S21FileError::Number {
            section,
            key: key.to_owned(),
            value: value.clone(),
        })
}

/// A parsed trace: the frequency axis and the complex S21 samples.
#[derive(Debug, Clone, PartialEq)]
pub struct S21Trace {
    pub frequencies: Vec<f64>,
    pub samples: Vec<Complex64>,
}

impl S21Trace {
    pub fn parse(content: &str) -> Result<Self, S21FileError> {
        let sections = parse_sections(content)?;
        let vna = sections.get("vna");
        let trace = sections.get("trace").ok_or(S21FileError::NoTrace)?;

        let start = number("VNA", vna, "m_f64startfreq")?.unwrap_or(DEFAULT_START_FREQ);
        let stop = number("VNA", vna, "m_f64stopfreq")?.unwrap_or(DEFAULT_STOP_FREQ);
        let size = match number("Trace", Some(trace), "size")? {
            Some(size) => size,
            None => number("VNA", vna, "m_s32sweeppoints")?.unwrap_or(DEFAULT_SWEEP_POINTS),
        };

        let samples = (1..=size)
            .map(|i| {
                let re = number("Trace", Some(trace), &format!("{i}\\ampy"))?;
                let im = number("Trace", Some(trace), &format!("{i}\\ampz"))?;
                match (re, im) {
                    (Some(re), Some(im)) => Ok(Complex64::new(re, im)),
                    _ => Err(S21FileError::MissingPoint(i)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("S21 trace: {size} points, {start} Hz to {stop} Hz");
        Ok(Self {
            frequencies: SweepRange::new(start, stop, size).values(),
            samples,
        })
    }

    /// Magnitude of every sample in dB.
    pub fn magnitudes_db(&self) -> Result<Vec<f64>, S21FileError> {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let magnitude = s.norm();
                if magnitude == 0.0 {
                    Err(S21FileError::ZeroMagnitude(i + 1))
                } else {
                    Ok(Decibels::from_linear(magnitude).as_db())
                }
            })
            .collect()
    }

    pub fn into_table(self) -> Result<S21Table, S21FileError> {
        let magnitudes = self.magnitudes_db()?;
        Ok(S21Table::new(self.frequencies, magnitudes)?)
    }
}

/// Read a trace file straight into a calibration table.
pub fn load_s21_table<P: AsRef<Path>>(path: P) -> Result<S21Table, S21FileError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| S21FileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    S21Trace::parse(&content)?.into_table()
}
