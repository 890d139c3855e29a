//! Data types shared between the sweep engine and its front ends.
//!
//! Nothing in here talks to hardware or spawns threads; these are the values
//! that travel over the command and event channels.

mod command;
mod event;
mod point;
mod s21;
mod settings;
mod state;
mod units;

pub use command::Command;
pub use event::{RejectReason, SweepEvent};
pub use point::{FREQUENCY_TOLERANCE_HZ, MeasurementPoint, RecalculatedPoint, points_at_frequency};
pub use s21::{S21Table, S21TableError};
pub use settings::{SettingsError, SweepRange, SweepSettings};
pub use state::{SessionState, SweepStatus};
pub use units::{Decibels, Hertz};
