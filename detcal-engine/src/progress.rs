use flume::Sender;
use log::debug;

use detcal_messages::SweepEvent;

/// Publishes sweep progress as a percentage that never goes backwards.
#[derive(Debug)]
pub struct ProgressReporter {
    event_tx: Sender<SweepEvent>,
    last: u8,
}

impl ProgressReporter {
    pub fn new(event_tx: Sender<SweepEvent>) -> Self {
        Self { event_tx, last: 0 }
    }

    /// Last percentage sent.
    pub fn last(&self) -> u8 {
        self.last
    }

    /// Report an absolute percentage, clamped to 100. Values below the last
    /// one sent are ignored.
    pub fn report_progress_value(&mut self, pct: u8) {
        let pct = pct.min(100);
        if pct < self.last {
            return;
        }
        self.last = pct;
        if self.event_tx.send(SweepEvent::ProgressUpdated(pct)).is_err() {
            debug!("Progress {pct}% dropped, nobody is listening");
        }
    }

    /// Report `floor(100 × completed / total)`. An empty sweep counts as done.
    pub fn report_progress_step(&mut self, completed: usize, total: usize) {
        let pct = if total == 0 {
            100
        } else {
            (completed.min(total) * 100 / total) as u8
        };
        self.report_progress_value(pct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &flume::Receiver<SweepEvent>) -> Vec<u8> {
        rx.try_iter()
            .filter_map(|e| match e {
                SweepEvent::ProgressUpdated(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn steps_floor_to_percent() {
        let (tx, rx) = flume::unbounded();
        let mut progress = ProgressReporter::new(tx);
        for done in 1..=3 {
            progress.report_progress_step(done, 3);
        }
        assert_eq!(drain(&rx), vec![33, 66, 100]);
    }

    #[test]
    fn never_goes_backwards() {
        let (tx, rx) = flume::unbounded();
        let mut progress = ProgressReporter::new(tx);
        progress.report_progress_value(50);
        progress.report_progress_value(20);
        progress.report_progress_value(250);
        assert_eq!(drain(&rx), vec![50, 100]);
        assert_eq!(progress.last(), 100);
    }

    #[test]
    fn empty_sweep_is_complete() {
        let (tx, rx) = flume::unbounded();
        ProgressReporter::new(tx).report_progress_step(0, 0);
        assert_eq!(drain(&rx), vec![100]);
    }

    #[test]
    fn survives_a_dropped_receiver() {
        let (tx, rx) = flume::unbounded();
        drop(rx);
        let mut progress = ProgressReporter::new(tx);
        progress.report_progress_step(1, 2);
        assert_eq!(progress.last(), 50);
    }
}
