//! Command-line interface: run a sweep against the simulated bench, or work
//! with settings and result files offline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use detcal_engine::Engine;
use detcal_engine::calibrator::{self, S21Calibrator};
use detcal_engine::controller::{SweepController, Timing};
use detcal_engine::results;
use detcal_engine::s21_file::load_s21_table;
use detcal_engine::sim::SimBench;
use detcal_messages::{Command, S21Table, SweepEvent, SweepSettings, SweepStatus};

use crate::display::SweepDisplay;

#[derive(Debug, Parser)]
#[clap(
    version,
    about = "Detector calibration sweeps: generator, spectrum analyzer and oscilloscope"
)]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
pub struct Detcal {
    #[clap(flatten)]
    pub global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Don't draw progress bars.
    #[clap(long)]
    #[clap(global = true)]
    pub no_progress_bars: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv).
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    pub verbosity: u8,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Sweep the simulated bench and save the measured points.
    Run(RunArgs),

    /// Write the default sweep settings to a file.
    InitSettings {
        /// Where to write the settings.
        settings: PathBuf,

        /// Replace an existing file.
        #[clap(long)]
        force: bool,
    },

    /// Correct a saved result set with S21 calibration tables.
    Recalc(RecalcArgs),

    /// Predict the highest level the detector will see during a sweep.
    MaxLevel {
        #[clap(long)]
        settings: PathBuf,

        /// S21 trace of the generator to detector path.
        #[clap(long)]
        s21_gen_det: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Sweep settings (JSON).
    #[clap(long)]
    settings: PathBuf,

    /// S21 trace of the generator to spectrum analyzer path.
    #[clap(long, requires = "s21-gen-det")]
    s21_gen_sa: Option<PathBuf>,

    /// S21 trace of the generator to detector path.
    #[clap(long, requires = "s21-gen-sa")]
    s21_gen_det: Option<PathBuf>,

    /// Where to write the results (CSV).
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Stop the sweep once this many points are recorded.
    #[clap(long)]
    stop_after: Option<usize>,

    /// Skip the instrument settle delays.
    #[clap(long)]
    fast: bool,
}

#[derive(Debug, Args)]
struct RecalcArgs {
    /// Measured results (CSV).
    #[clap(short, long)]
    input: PathBuf,

    #[clap(long)]
    s21_gen_sa: PathBuf,

    #[clap(long)]
    s21_gen_det: PathBuf,

    /// Where to write the recalculated results (CSV).
    #[clap(short, long)]
    output: PathBuf,
}

impl Detcal {
    pub fn run(self) -> anyhow::Result<()> {
        match self.command {
            CliCommand::Run(args) => run_sweep(args, self.global_opts.no_progress_bars),
            CliCommand::InitSettings { settings, force } => init_settings(&settings, force),
            CliCommand::Recalc(args) => recalc(args),
            CliCommand::MaxLevel {
                settings,
                s21_gen_det,
            } => max_level(&settings, &s21_gen_det),
        }
    }
}

fn load_table(path: &Path) -> anyhow::Result<S21Table> {
    load_s21_table(path).with_context(|| format!("Couldn't load S21 trace {}", path.display()))
}

fn load_settings(path: &Path) -> anyhow::Result<SweepSettings> {
    SweepSettings::load(path).with_context(|| format!("Couldn't load settings {}", path.display()))
}

fn run_sweep(args: RunArgs, no_progress_bars: bool) -> anyhow::Result<()> {
    let settings = load_settings(&args.settings)?;
    let calibration = match (&args.s21_gen_sa, &args.s21_gen_det) {
        (Some(gen_sa), Some(gen_det)) => Some((load_table(gen_sa)?, load_table(gen_det)?)),
        _ => None,
    };
    let timing = if args.fast {
        Timing::immediate()
    } else {
        Timing::default()
    };
    let bench = SimBench::default()
        .connect()
        .map_err(|e| anyhow!("Bench unavailable: {e}"))?;

    let (cmd_tx, cmd_rx) = flume::unbounded();
    let (event_tx, event_rx) = flume::bounded(16);
    let engine_handle = thread::spawn(move || {
        Engine::new(cmd_rx, event_tx, bench, SweepController::new(timing)).run()
    });

    let expect_recalc = settings.recalc_attenuation && calibration.is_some();
    if let Some((gen_sa, gen_det)) = calibration {
        cmd_tx
            .send(Command::SetCalibration { gen_sa, gen_det })
            .map_err(|_| anyhow!("Engine stopped before the sweep began"))?;
    }
    cmd_tx
        .send(Command::Start(settings))
        .map_err(|_| anyhow!("Engine stopped before the sweep began"))?;

    let mut display = SweepDisplay::new(!no_progress_bars);
    let mut stop_sent = false;
    for event in event_rx.iter() {
        let ends_sweep = match &event {
            SweepEvent::Finished(points) => !expect_recalc || points.is_empty(),
            SweepEvent::Stopped(_) | SweepEvent::Error { .. } => true,
            SweepEvent::Rejected(_) | SweepEvent::Recalculated(_) => true,
            _ => false,
        };
        display.handle_event(event);

        if let Some(limit) = args.stop_after {
            if !stop_sent && display.points.len() >= limit {
                info!("{limit} points recorded, stopping");
                let _ = cmd_tx.send(Command::Stop);
                stop_sent = true;
            }
        }
        if ends_sweep {
            break;
        }
    }

    // Sweep is over - shut the engine down
    let _ = cmd_tx.send(Command::Shutdown);
    drop(event_rx);
    engine_handle
        .join()
        .map_err(|_| anyhow!("Engine thread panicked"))??;

    if let Some(reason) = display.rejected {
        bail!("Sweep rejected: {reason}");
    }
    if let Some(output) = &args.output {
        match &display.recalculated {
            Some(recalculated) => results::save_recalculated(output, recalculated)?,
            None => results::save_measured(output, &display.points)?,
        }
    }

    let status = display.status.unwrap_or(SweepStatus::Finished);
    println!("{status}: {} points", display.points.len());
    if let SweepStatus::Error(message) = status {
        bail!("Sweep failed: {message}");
    }
    Ok(())
}

fn init_settings(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to replace it", path.display());
    }
    SweepSettings::default()
        .save(path)
        .with_context(|| format!("Couldn't write settings {}", path.display()))?;
    info!("Default settings written to {}", path.display());
    Ok(())
}

fn recalc(args: RecalcArgs) -> anyhow::Result<()> {
    let points = results::load_measured(&args.input)?;
    if points.is_empty() {
        warn!("{} holds no points", args.input.display());
    }
    let calibrator = S21Calibrator::new(
        Arc::new(load_table(&args.s21_gen_sa)?),
        Arc::new(load_table(&args.s21_gen_det)?),
    );
    let recalculated = calibrator.recalculate(&points);
    results::save_recalculated(&args.output, &recalculated)?;
    println!("Recalculated {} points", recalculated.len());
    Ok(())
}

fn max_level(settings: &Path, s21_gen_det: &Path) -> anyhow::Result<()> {
    let settings = load_settings(settings)?;
    let gen_det = load_table(s21_gen_det)?;
    let level = calibrator::max_detector_level(&settings, &gen_det);
    println!("Maximum detector level: {level:.2} dBm");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use detcal_messages::SweepRange;
    use std::fs;

    fn parse(args: &[&str]) -> Detcal {
        Detcal::try_parse_from(args).unwrap()
    }

    fn small_settings(dir: &Path) -> PathBuf {
        let path = dir.join("settings.json");
        SweepSettings {
            rf_frequencies: SweepRange::new(1e9, 2e9, 2),
            rf_levels: SweepRange::new(-30.0, -10.0, 3),
            ..Default::default()
        }
        .save(&path)
        .unwrap();
        path
    }

    fn write_trace(dir: &Path, name: &str) -> PathBuf {
        // 0 dB at every point
        let path = dir.join(name);
        let trace = [
            "[VNA]",
            "m_f64StartFreq=1e9",
            "m_f64StopFreq=2e9",
            "[Trace]",
            "size=2",
            "1\\ampy=1",
            "1\\ampz=0",
            "2\\ampy=0",
            "2\\ampz=1",
        ];
        fs::write(&path, trace.join("\n")).unwrap();
        path
    }

    #[test]
    fn parses_global_flags_anywhere() {
        let cli = parse(&["detcal", "run", "--settings", "s.json", "-vv", "--no-progress-bars"]);
        assert_eq!(cli.global_opts.verbosity, 2);
        assert!(cli.global_opts.no_progress_bars);
    }

    #[test]
    fn calibration_traces_come_in_pairs() {
        let result = Detcal::try_parse_from([
            "detcal",
            "run",
            "--settings",
            "s.json",
            "--s21-gen-sa",
            "sa.trs",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn init_settings_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        init_settings(&path, false).unwrap();
        assert_eq!(SweepSettings::load(&path).unwrap(), SweepSettings::default());
        assert!(init_settings(&path, false).is_err());
        assert!(init_settings(&path, true).is_ok());
    }

    #[test]
    fn run_writes_measured_results() {
        let dir = tempfile::tempdir().unwrap();
        let settings = small_settings(dir.path());
        let output = dir.path().join("out").join("results.csv");

        let cli = parse(&[
            "detcal",
            "run",
            "--fast",
            "--no-progress-bars",
            "--settings",
            settings.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ]);
        cli.run().unwrap();
        assert_eq!(results::load_measured(&output).unwrap().len(), 6);
    }

    #[test]
    fn run_saves_empty_results_when_every_point_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        // Below the simulated analyzer noise floor.
        SweepSettings {
            rf_frequencies: SweepRange::new(1e9, 2e9, 2),
            rf_levels: SweepRange::new(-100.0, -95.0, 2),
            recalc_attenuation: true,
            ..Default::default()
        }
        .save(&settings)
        .unwrap();
        let gen_sa = write_trace(dir.path(), "sa.trs");
        let gen_det = write_trace(dir.path(), "det.trs");
        let output = dir.path().join("results.csv");

        let cli = parse(&[
            "detcal",
            "run",
            "--fast",
            "--no-progress-bars",
            "--settings",
            settings.to_str().unwrap(),
            "--s21-gen-sa",
            gen_sa.to_str().unwrap(),
            "--s21-gen-det",
            gen_det.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ]);
        cli.run().unwrap();
        assert!(results::load_measured(&output).unwrap().is_empty());
    }

    // Real settle delays keep the sweep busy long enough for Stop to land.
    #[test]
    fn run_stops_early_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let settings = small_settings(dir.path());
        let output = dir.path().join("results.csv");

        let cli = parse(&[
            "detcal",
            "run",
            "--no-progress-bars",
            "--stop-after",
            "1",
            "--settings",
            settings.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ]);
        cli.run().unwrap();
        let saved = results::load_measured(&output).unwrap();
        assert!(!saved.is_empty() && saved.len() < 6, "{}", saved.len());
    }

    #[test]
    fn recalc_fills_calibration_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("measured.csv");
        let output = dir.path().join("recalculated.csv");
        let point = detcal_messages::MeasurementPoint {
            frequency_hz: 1.5e9,
            gen_level_dbm: -10.0,
            sa_level_dbm: -13.0,
            osc_voltage_v: 0.2,
        };
        results::save_measured(&input, &[point]).unwrap();
        let gen_sa = write_trace(dir.path(), "sa.trs");
        let gen_det = write_trace(dir.path(), "det.trs");

        let cli = parse(&[
            "detcal",
            "recalc",
            "--input",
            input.to_str().unwrap(),
            "--s21-gen-sa",
            gen_sa.to_str().unwrap(),
            "--s21-gen-det",
            gen_det.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ]);
        cli.run().unwrap();

        let text = fs::read_to_string(&output).unwrap();
        let row: Vec<&str> = text.lines().nth(1).unwrap().split(',').collect();
        assert_eq!(row.len(), 7);
        assert_eq!(row[6].parse::<f64>().unwrap(), -13.0);
    }
}
