//! CSV result files.
//!
//! Measured sets leave the three calibration columns empty; recalculated sets
//! fill all seven.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use detcal_messages::{MeasurementPoint, RecalculatedPoint};
use log::info;
use thiserror::Error;

pub const RESULTS_HEADER: &str = concat!(
    "Gen Frequency (Hz), Gen Level (dBm), SA Level (dBm), Osc Voltage (V), ",
    "S21 Gen-Sa (dB), S21 Gen-Det (dB), Det Level (dBm)"
);

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("Couldn't access results file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Stream(#[from] io::Error),

    #[error("results file has no header line")]
    MissingHeader,

    #[error("line {line}: expected at least 4 columns, found {found}")]
    Columns { line: usize, found: usize },

    #[error("line {line}: '{value}' is not a finite number")]
    Number { line: usize, value: String },
}

pub fn write_measured<W: Write>(mut writer: W, points: &[MeasurementPoint]) -> io::Result<()> {
    writeln!(writer, "{RESULTS_HEADER}")?;
    for p in points {
        writeln!(
            writer,
            "{},{},{},{},,,",
            p.frequency_hz, p.gen_level_dbm, p.sa_level_dbm, p.osc_voltage_v
        )?;
    }
    writer.flush()
}

pub fn write_recalculated<W: Write>(mut writer: W, points: &[RecalculatedPoint]) -> io::Result<()> {
    writeln!(writer, "{RESULTS_HEADER}")?;
    for r in points {
        let p = &r.point;
        writeln!(
            writer,
            "{},{},{},{},{},{},{}",
            p.frequency_hz,
            p.gen_level_dbm,
            p.sa_level_dbm,
            p.osc_voltage_v,
            r.s21_gen_sa_db,
            r.s21_gen_det_db,
            r.det_level_dbm
        )?;
    }
    writer.flush()
}

/// Read the first four columns of a results file. Calibration columns, if
/// present, are ignored; they are recomputed from the tables.
pub fn read_measured<R: BufRead>(reader: R) -> Result<Vec<MeasurementPoint>, ResultsError> {
    let mut header_seen = false;
    let mut points = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let (n, line) = (index + 1, line?);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !header_seen {
            // Tolerate a '#'-prefixed header as written by numeric tools.
            if line.trim_start_matches('#').trim() != RESULTS_HEADER {
                return Err(ResultsError::MissingHeader);
            }
            header_seen = true;
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(ResultsError::Columns {
                line: n,
                found: fields.len(),
            });
        }
        let mut values = [0.0; 4];
        for (value, text) in values.iter_mut().zip(&fields) {
            *value = text
                .parse()
                .ok()
                .filter(|v: &f64| v.is_finite())
                .ok_or_else(|| ResultsError::Number {
                    line: n,
                    value: (*text).to_owned(),
                })?;
        }
        let [frequency_hz, gen_level_dbm, sa_level_dbm, osc_voltage_v] = values;
        points.push(MeasurementPoint {
            frequency_hz,
            gen_level_dbm,
            sa_level_dbm,
            osc_voltage_v,
        });
    }

    if header_seen {
        Ok(points)
    } else {
        Err(ResultsError::MissingHeader)
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, ResultsError> {
    let io_err = |source| ResultsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    File::create(path).map(BufWriter::new).map_err(io_err)
}

pub fn save_measured<P: AsRef<Path>>(
    path: P,
    points: &[MeasurementPoint],
) -> Result<(), ResultsError> {
    let path = path.as_ref();
    write_measured(create(path)?, points)?;
    info!("Results saved to {}", path.display());
    Ok(())
}

pub fn save_recalculated<P: AsRef<Path>>(
    path: P,
    points: &[RecalculatedPoint],
) -> Result<(), ResultsError> {
    let path = path.as_ref();
    write_recalculated(create(path)?, points)?;
    info!("Recalculated results saved to {}", path.display());
    Ok(())
}

pub fn load_measured<P: AsRef<Path>>(path: P) -> Result<Vec<MeasurementPoint>, ResultsError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ResultsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_measured(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(frequency_hz: f64, gen_level_dbm: f64) -> MeasurementPoint {
        MeasurementPoint {
            frequency_hz,
            gen_level_dbm,
            sa_level_dbm: gen_level_dbm - 3.0,
            osc_voltage_v: 0.125,
        }
    }

    #[test]
    fn measured_rows_leave_calibration_empty() {
        let mut out = Vec::new();
        write_measured(&mut out, &[point(1e9, -10.0)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(RESULTS_HEADER));
        assert_eq!(lines.next(), Some("1000000000,-10,-13,0.125,,,"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn recalculated_rows_fill_every_column() {
        let recalc = RecalculatedPoint {
            point: point(1.5e9, -20.0),
            s21_gen_sa_db: -4.0,
            s21_gen_det_db: -1.5,
            det_level_dbm: -25.5,
        };
        let mut out = Vec::new();
        write_recalculated(&mut out, &[recalc]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some("1500000000,-20,-23,0.125,-4,-1.5,-25.5")
        );
    }

    #[test]
    fn reads_back_measured_and_recalculated_files() {
        let points = vec![point(1e9, -10.0), point(2e9, -50.0)];
        let file = tempfile::NamedTempFile::new().unwrap();
        save_measured(file.path(), &points).unwrap();
        assert_eq!(load_measured(file.path()).unwrap(), points);

        let text = format!("# {RESULTS_HEADER}\n1e9,-10,-13,0.125,-3,-1,-15\n\n");
        assert_eq!(read_measured(text.as_bytes()).unwrap(), vec![point(1e9, -10.0)]);
    }

    #[test]
    fn rejects_malformed_files() {
        assert!(matches!(
            read_measured("1,2,3,4\n".as_bytes()),
            Err(ResultsError::MissingHeader)
        ));
        assert!(matches!(
            read_measured("".as_bytes()),
            Err(ResultsError::MissingHeader)
        ));
        let short = format!("{RESULTS_HEADER}\n1,2,3\n");
        assert!(matches!(
            read_measured(short.as_bytes()),
            Err(ResultsError::Columns { line: 2, found: 3 })
        ));
        let bad = format!("{RESULTS_HEADER}\n1,2,x,4,,,\n");
        assert!(matches!(
            read_measured(bad.as_bytes()),
            Err(ResultsError::Number { line: 2, .. })
        ));
    }

    #[test]
    fn rejects_non_finite_values() {
        for row in ["NaN,-10,-13,0.1,,,", "1e9,inf,-13,0.1,,,", "1e9,-10,-inf,0.1"] {
            let text = format!("{RESULTS_HEADER}\n1e9,-10,-13,0.1,,,\n{row}\n");
            match read_measured(text.as_bytes()) {
                Err(ResultsError::Number { line: 3, .. }) => {}
                other => panic!("{row}: expected a number error, got {other:?}"),
            }
        }
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("results.csv");
        save_measured(&path, &[]).unwrap();
        assert!(path.exists());
    }
}
