pub mod calibrator;
pub mod cancel;
pub mod codec;
pub mod controller;
pub mod instrument;
pub mod progress;
pub mod range;
pub mod results;
pub mod s21_file;
pub mod session;
pub mod sim;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use detcal_messages::{Command, MeasurementPoint, RejectReason, S21Table, SweepEvent, SweepSettings};

pub use calibrator::S21Calibrator;
pub use cancel::CancellationToken;
pub use controller::{SweepController, SweepError, SweepOutcome, Timing};
pub use instrument::{Bench, Generator, Instrument, InstrumentError, Oscilloscope, SpectrumAnalyzer};
pub use session::{SessionError, SessionGate, SweepSession};

/// The sweep engine backend.
/// Owns the bench between sweeps and processes commands from the front end.
pub struct Engine {
    cmd_rx: Receiver<Command>,
    event_tx: Sender<SweepEvent>,
    controller: SweepController,
    bench: Option<Bench>,
    session: Option<SweepSession>,
    gate: SessionGate,
    calibration: Option<S21Calibrator>,
    results: Vec<MeasurementPoint>,
    recalc_after_sweep: bool,
    should_exit: bool,
}

impl Engine {
    /// Create a new Engine instance.
    pub fn new(
        cmd_rx: Receiver<Command>,
        event_tx: Sender<SweepEvent>,
        bench: Bench,
        controller: SweepController,
    ) -> Self {
        debug!("Constructing a new engine for {bench:?}");
        Self {
            cmd_rx,
            event_tx,
            controller,
            bench: Some(bench),
            session: None,
            gate: SessionGate::new(),
            calibration: None,
            results: Vec::new(),
            recalc_after_sweep: false,
            should_exit: false,
        }
    }

    /// A handle front ends can poll to know whether a sweep owns the
    /// instruments.
    pub fn session_gate(&self) -> SessionGate {
        self.gate.clone()
    }

    /// Run the engine (blocking) until `Shutdown` or until every command
    /// sender is gone. A running sweep is cancelled and joined before this
    /// returns.
    pub fn run(mut self) -> Result<()> {
        while !self.should_exit {
            let msg = self.cmd_rx.recv_timeout(Duration::from_millis(100));
            match msg {
                Ok(command) => {
                    debug!("Engine received command: {command:?}");
                    self.handle_command(command);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Command channel closed");
                    self.should_exit = true;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.poll_session();
        }

        if let Some(session) = self.session.take() {
            session.cancel();
            self.finish_session(session);
        }
        info!("Engine stopped");
        Ok(())
    }

    fn emit(&self, event: SweepEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Engine event dropped, nobody is listening");
        }
    }

    fn reject(&self, reason: RejectReason) {
        warn!("Command rejected: {reason}");
        self.emit(SweepEvent::Rejected(reason));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(settings) => self.start(settings),
            Command::Stop => match &self.session {
                Some(session) => {
                    info!("Stop requested");
                    session.cancel();
                }
                None => debug!("Stop ignored, no sweep running"),
            },
            Command::SetCalibration { gen_sa, gen_det } => self.set_calibration(gen_sa, gen_det),
            Command::Recalculate => self.recalculate(),
            Command::Shutdown => {
                if let Some(session) = &self.session {
                    session.cancel();
                }
                self.should_exit = true;
            }
        }
    }

    /// Whether a sweep still owns the bench. A session that has already
    /// released the gate is joined here so its bench and results are back
    /// before the next command runs.
    fn sweep_running(&mut self) -> bool {
        if self.gate.is_active() {
            return true;
        }
        if let Some(session) = self.session.take() {
            self.finish_session(session);
        }
        false
    }

    fn start(&mut self, settings: SweepSettings) {
        if self.sweep_running() {
            return self.reject(RejectReason::AlreadyRunning);
        }
        if let Err(e) = settings.validate() {
            return self.reject(RejectReason::InvalidSettings(e.to_string()));
        }
        let Some(bench) = self.bench.take() else {
            return self.reject(RejectReason::NotReady("instruments unavailable".to_owned()));
        };
        let missing = bench.not_ready();
        if !missing.is_empty() {
            self.bench = Some(bench);
            return self.reject(RejectReason::NotReady(missing.join(", ")));
        }
        let claim = match self.gate.try_claim() {
            Ok(claim) => claim,
            Err(_) => {
                self.bench = Some(bench);
                return self.reject(RejectReason::AlreadyRunning);
            }
        };

        self.recalc_after_sweep = settings.recalc_attenuation;
        let controller = self
            .controller
            .clone()
            .with_calibrator(self.calibration.clone());
        self.session = Some(SweepSession::spawn(
            claim,
            settings,
            bench,
            controller,
            self.event_tx.clone(),
        ));
    }

    fn set_calibration(&mut self, gen_sa: S21Table, gen_det: S21Table) {
        info!(
            "S21 calibration loaded: gen-SA {} points, gen-det {} points",
            gen_sa.len(),
            gen_det.len()
        );
        self.calibration = Some(S21Calibrator::new(Arc::new(gen_sa), Arc::new(gen_det)));
    }

    fn recalculate(&mut self) {
        if self.sweep_running() {
            return self.reject(RejectReason::AlreadyRunning);
        }
        let Some(calibration) = &self.calibration else {
            return self.reject(RejectReason::NoCalibration);
        };
        if self.results.is_empty() {
            return self.reject(RejectReason::NoResults);
        }
        let recalculated = calibration.recalculate(&self.results);
        info!("Recalculated {} points", recalculated.len());
        self.emit(SweepEvent::Recalculated(recalculated));
    }

    fn poll_session(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.is_finished())
        {
            if let Some(session) = self.session.take() {
                self.finish_session(session);
            }
        }
    }

    fn finish_session(&mut self, session: SweepSession) {
        match session.join() {
            Ok((bench, result)) => {
                self.bench = Some(bench);
                let completed = matches!(result, Ok(SweepOutcome::Completed(_)));
                self.results = match result {
                    Ok(outcome) => outcome.into_points(),
                    Err(e) => e.into_partial_points(),
                };
                // An all-rejected sweep has nothing to correct.
                if completed
                    && self.recalc_after_sweep
                    && self.calibration.is_some()
                    && !self.results.is_empty()
                {
                    self.recalculate();
                }
            }
            Err(e) => {
                error!("{e}");
                self.emit(SweepEvent::Error {
                    message: e.to_string(),
                    points: Vec::new(),
                });
            }
        }
    }
}
