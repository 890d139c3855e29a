use crate::{S21Table, SweepSettings};

/// Commands sent from the front end to the engine.
#[derive(Debug)]
pub enum Command {
    /// Start a sweep with a copy of these settings. Rejected while another
    /// sweep is running.
    Start(SweepSettings),
    /// Ask the running sweep to stop at its next checkpoint.
    Stop,
    /// Install the generator→analyzer and generator→detector calibration
    /// tables.
    SetCalibration { gen_sa: S21Table, gen_det: S21Table },
    /// Recalculate the last result set with the installed calibration.
    Recalculate,
    /// Stop any running sweep and terminate the engine.
    Shutdown,
}
