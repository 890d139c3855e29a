use crate::{Hertz, MeasurementPoint, RecalculatedPoint, SweepStatus};

/// Events sent from the engine to the front end, in the order the sweep
/// produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// A session took ownership of the instruments.
    Started { total_points: usize },
    /// The generator moved to a new sweep frequency.
    FrequencyChanged(Hertz),
    PointRecorded(MeasurementPoint),
    ProgressUpdated(u8),
    /// The sweep visited every point.
    Finished(Vec<MeasurementPoint>),
    /// The sweep was cancelled; carries the points captured so far.
    Stopped(Vec<MeasurementPoint>),
    /// The sweep failed; carries the points captured before the failure.
    Error {
        message: String,
        points: Vec<MeasurementPoint>,
    },
    /// A command was refused without touching the instruments.
    Rejected(RejectReason),
    /// A recalculated result set that replaces the previous one.
    Recalculated(Vec<RecalculatedPoint>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NotReady(String),
    AlreadyRunning,
    InvalidSettings(String),
    NoCalibration,
    NoResults,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotReady(why) => write!(f, "instruments not ready: {why}"),
            RejectReason::AlreadyRunning => write!(f, "a sweep is already running"),
            RejectReason::InvalidSettings(why) => write!(f, "invalid settings: {why}"),
            RejectReason::NoCalibration => write!(f, "no S21 calibration loaded"),
            RejectReason::NoResults => write!(f, "no results to recalculate"),
        }
    }
}

impl SweepEvent {
    /// The operator-facing status this event implies, if it changes it.
    pub fn status(&self) -> Option<SweepStatus> {
        match self {
            SweepEvent::Started { .. } => Some(SweepStatus::InProgress(0)),
            SweepEvent::ProgressUpdated(pct) => Some(SweepStatus::InProgress(*pct)),
            SweepEvent::Finished(_) => Some(SweepStatus::Finished),
            SweepEvent::Stopped(_) => Some(SweepStatus::Stopped),
            SweepEvent::Error { message, .. } => Some(SweepStatus::Error(message.clone())),
            SweepEvent::Rejected(RejectReason::NotReady(why)) => {
                Some(SweepStatus::NotReady(why.clone()))
            }
            SweepEvent::Rejected(RejectReason::InvalidSettings(why)) => {
                Some(SweepStatus::Error(format!("invalid settings: {why}")))
            }
            _ => None,
        }
    }

    /// Whether this event ends a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SweepEvent::Finished(_) | SweepEvent::Stopped(_) | SweepEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_map_to_operator_status() {
        assert_eq!(
            SweepEvent::ProgressUpdated(40).status(),
            Some(SweepStatus::InProgress(40))
        );
        assert_eq!(
            SweepEvent::Stopped(vec![]).status().unwrap().to_string(),
            "Stopped by user"
        );
        assert_eq!(
            SweepEvent::Rejected(RejectReason::NotReady("oscilloscope".into()))
                .status()
                .unwrap()
                .to_string(),
            "Not ready, check instruments: oscilloscope"
        );
        assert_eq!(SweepEvent::FrequencyChanged(Hertz(1e9)).status(), None);
        assert_eq!(SweepEvent::Rejected(RejectReason::AlreadyRunning).status(), None);
    }
}
