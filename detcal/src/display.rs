use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};

use detcal_messages::{
    Hertz, MeasurementPoint, RecalculatedPoint, RejectReason, SweepEvent, SweepStatus,
    points_at_frequency,
};

/// Local front-end state derived from engine events.
pub(crate) struct SweepDisplay {
    bar: ProgressBar,

    /// Last status the operator should see.
    pub status: Option<SweepStatus>,

    /// Points recorded so far, replaced by the terminal event's set.
    pub points: Vec<MeasurementPoint>,

    pub recalculated: Option<Vec<RecalculatedPoint>>,

    pub rejected: Option<RejectReason>,

    /// Frequency the generator is currently parked at.
    frequency: Option<Hertz>,
}

impl SweepDisplay {
    pub fn new(draw: bool) -> Self {
        let bar = ProgressBar::with_draw_target(
            Some(100),
            if draw {
                ProgressDrawTarget::stdout()
            } else {
                ProgressDrawTarget::hidden()
            },
        );
        let style = ProgressStyle::default_bar()
            .template("{msg:24}: [{wide_bar:.blue}] {pos:>3}% ({elapsed_precise})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);

        Self {
            bar,
            status: None,
            points: Vec::new(),
            recalculated: None,
            rejected: None,
            frequency: None,
        }
    }

    /// Points recorded at `frequency`, in recording order.
    pub fn points_at(&self, frequency: Hertz) -> Vec<MeasurementPoint> {
        points_at_frequency(&self.points, frequency.0)
    }

    fn summarize_frequency(&mut self) {
        if let Some(frequency) = self.frequency.take() {
            info!("{} points recorded at {frequency}", self.points_at(frequency).len());
        }
    }

    pub fn handle_event(&mut self, event: SweepEvent) {
        if let Some(status) = event.status() {
            self.bar.set_message(status.to_string());
            self.status = Some(status);
        }

        match event {
            SweepEvent::Started { total_points } => {
                info!("Sweep started, {total_points} points");
                self.points.clear();
                self.recalculated = None;
                self.frequency = None;
                self.bar.reset();
            }
            SweepEvent::FrequencyChanged(frequency) => {
                self.summarize_frequency();
                self.frequency = Some(frequency);
                self.bar.set_message(format!("At {frequency}"));
            }
            SweepEvent::PointRecorded(point) => {
                let line = format!(
                    "{:>14.0} Hz {:>8.2} dBm -> SA {:>8.2} dBm, detector {:.6} V",
                    point.frequency_hz, point.gen_level_dbm, point.sa_level_dbm, point.osc_voltage_v
                );
                if self.bar.is_hidden() {
                    info!("{line}");
                } else {
                    self.bar.println(line);
                }
                self.points.push(point);
            }
            SweepEvent::ProgressUpdated(pct) => self.bar.set_position(u64::from(pct)),
            SweepEvent::Finished(points) | SweepEvent::Stopped(points) => {
                self.points = points;
                self.summarize_frequency();
                self.finish_bar();
            }
            SweepEvent::Error { message, points } => {
                warn!("Sweep failed: {message}");
                self.points = points;
                self.summarize_frequency();
                self.finish_bar();
            }
            SweepEvent::Rejected(reason) => {
                warn!("Rejected: {reason}");
                self.rejected = Some(reason);
            }
            SweepEvent::Recalculated(points) => {
                info!("Recalculated {} points", points.len());
                self.recalculated = Some(points);
            }
        }
    }

    fn finish_bar(&self) {
        let message = self
            .status
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        self.bar.abandon_with_message(message);
    }
}
