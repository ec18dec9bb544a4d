use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use crate::baseline::ThresholdSnapshot;
use crate::config::Settings;
use crate::daq::{Daq, TaskSpec};
use crate::error::{DaqError, ProtocolError};
use crate::session::{BaselineReview, Session, SessionNotice, SessionStatus};
use crate::signal::RollingBuffer;
use crate::stimulus::{PulseShape, PulseTrigger};
use crate::trial::{ProtocolObserver, TrialState};
use crate::types::{StimulatorSetup, TrialType};

/// Órdenes que el frente (consola) envía al hilo de adquisición
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetDemographics { patient_id: String, foot_measurement: String },
    SetExportDir(PathBuf),
    SetTrialType(TrialType),
    SetStimulatorSetup(StimulatorSetup),
    SetThresholdPercentage(u8),
    /// Arranca la tarea; también rearma tras un overrun
    StartStreaming,
    StopStreaming,
    StartBaseline,
    FinishBaselineStep,
    AcceptBaseline,
    RejectBaseline,
    StopBaseline { save: bool },
    StartTrial,
    ConfirmZero,
    Stop,
    AcceptTrial { notes: String },
    DiscardTrial,
    Status,
    Shutdown,
}

/// Respuesta a una orden aceptada
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Done,
    Threshold(Option<f64>),
    BaselineReview(BaselineReview),
    BaselineAccepted(ThresholdSnapshot),
    BaselineClosed(Option<ThresholdSnapshot>),
    TrialState(TrialState),
    Exported(PathBuf),
    Status(SessionStatus),
}

/// Eventos asíncronos del hilo de adquisición
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StreamingChanged(bool),
    BaselineQuietStanceComplete,
    TrialStateChanged { from: TrialState, to: TrialState },
    StimulusFired { body_index: usize, count: usize },
    /// Fallo de adquisición: el ensayo en curso se perdió y hay que rearmar
    Fatal(DaqError),
}

struct Request {
    command: Command,
    reply: Sender<Result<Ack, ProtocolError>>,
}

/// Reenvía los cambios del ensayo como eventos. Las muestras no se reenvían:
/// la vista en vivo lee el buffer compartido
struct ChannelObserver {
    events: Sender<Event>,
}

impl ProtocolObserver for ChannelObserver {
    fn on_trial_state_changed(&mut self, from: TrialState, to: TrialState) {
        let _ = self.events.send(Event::TrialStateChanged { from, to });
    }

    fn on_stimulus_fired(&mut self, body_index: usize, count: usize) {
        let _ = self.events.send(Event::StimulusFired { body_index, count });
    }
}

/// Buffer de la vista en vivo compartido con el refresco de pantalla
pub type SharedDisplay = Arc<Mutex<RollingBuffer>>;

/// Hilo de adquisición en marcha. Es dueño del dispositivo hasta `shutdown`
pub struct Acquisition {
    commands: Sender<Request>,
    events: Receiver<Event>,
    display: SharedDisplay,
    worker: Option<JoinHandle<Daq>>,
}

impl Acquisition {
    /// Crea la tarea en el dispositivo y lanza el hilo. La tarea queda
    /// parada hasta `Command::StartStreaming`
    pub fn spawn(mut daq: Daq, settings: &Settings) -> Result<Self, ProtocolError> {
        let (event_tx, event_rx) = unbounded();
        let session = Session::new(settings, Box::new(ChannelObserver { events: event_tx.clone() }))?;

        daq.create_task(&TaskSpec::from_settings(settings))?;

        let display: SharedDisplay = Arc::new(Mutex::new(RollingBuffer::new(settings.display_capacity())));
        let (cmd_tx, cmd_rx) = bounded::<Request>(16);

        let worker = Worker {
            daq,
            session,
            pulse: PulseShape::from_settings(settings),
            display: Arc::clone(&display),
            events: event_tx,
        };
        let handle = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || worker.run(cmd_rx))?;

        Ok(Self {
            commands: cmd_tx,
            events: event_rx,
            display,
            worker: Some(handle),
        })
    }

    /// Envía una orden y espera su respuesta
    pub fn request(&self, command: Command) -> Result<Ack, ProtocolError> {
        let stopped = || ProtocolError::InvalidState {
            action: "send a command",
            state: "the acquisition worker has stopped",
        };
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(Request {
                command,
                reply: reply_tx,
            })
            .map_err(|_| stopped())?;
        reply_rx.recv().map_err(|_| stopped())?
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn display(&self) -> SharedDisplay {
        Arc::clone(&self.display)
    }

    /// Parada ordenada: primero el bucle (y se espera a que termine), después
    /// la tarea del dispositivo
    pub fn shutdown(mut self) -> Result<(), DaqError> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<(), DaqError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let (reply_tx, _reply_rx) = bounded(1);
        let _ = self.commands.send(Request {
            command: Command::Shutdown,
            reply: reply_tx,
        });
        let mut daq = worker
            .join()
            .map_err(|_| DaqError::Hardware("acquisition thread panicked".into()))?;
        if daq.is_running() {
            daq.stop()?;
        }
        daq.close()?;
        tracing::info!("Adquisición cerrada");
        Ok(())
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::error!("Error al cerrar la adquisición: {}", e);
        }
    }
}

struct Worker {
    daq: Daq,
    session: Session,
    pulse: PulseShape,
    display: SharedDisplay,
    events: Sender<Event>,
}

enum Flow {
    Continue,
    Exit,
}

impl Worker {
    /// Bucle del hilo. Con la tarea en marcha cada lectura bloquea hasta el
    /// siguiente tick del reloj del hardware; parada, espera órdenes
    fn run(mut self, commands: Receiver<Request>) -> Daq {
        tracing::debug!("Hilo de adquisición iniciado");
        loop {
            if self.daq.is_running() {
                match commands.try_recv() {
                    Ok(request) => {
                        if let Flow::Exit = self.handle(request) {
                            break;
                        }
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
                self.acquire_one();
            } else {
                match commands.recv() {
                    Ok(request) => {
                        if let Flow::Exit = self.handle(request) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        tracing::debug!("Hilo de adquisición terminado");
        self.daq
    }

    fn acquire_one(&mut self) {
        match self.daq.read() {
            Ok(sample) => {
                self.display
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(sample);
                let mut trigger = PulseTrigger::new(&mut self.daq, self.pulse);
                if let Some(SessionNotice::BaselineQuietStanceComplete) = self.session.feed(sample, &mut trigger) {
                    let _ = self.events.send(Event::BaselineQuietStanceComplete);
                }
            }
            Err(e) => {
                tracing::error!("Fallo de adquisición: {}", e);
                self.session.abort_sampling();
                if let Err(stop_err) = self.daq.stop() {
                    tracing::warn!("No se pudo parar la tarea: {}", stop_err);
                }
                let _ = self.events.send(Event::StreamingChanged(false));
                let _ = self.events.send(Event::Fatal(e));
            }
        }
    }

    fn handle(&mut self, request: Request) -> Flow {
        if request.command == Command::Shutdown {
            self.session.abort_sampling();
            let _ = request.reply.send(Ok(Ack::Done));
            return Flow::Exit;
        }
        let result = self.execute(request.command);
        if let Err(e) = &result {
            tracing::debug!("Orden rechazada: {}", e);
        }
        let _ = request.reply.send(result);
        Flow::Continue
    }

    fn execute(&mut self, command: Command) -> Result<Ack, ProtocolError> {
        let session = &mut self.session;
        match command {
            Command::SetDemographics {
                patient_id,
                foot_measurement,
            } => session.set_demographics(&patient_id, &foot_measurement).map(|_| Ack::Done),
            Command::SetExportDir(dir) => session.set_export_dir(dir).map(|_| Ack::Done),
            Command::SetTrialType(t) => session.set_trial_type(t).map(|_| Ack::Done),
            Command::SetStimulatorSetup(s) => session.set_stimulator_setup(s).map(|_| Ack::Done),
            Command::SetThresholdPercentage(p) => session.set_threshold_percentage(p).map(Ack::Threshold),
            Command::StartStreaming => {
                self.daq.start()?;
                self.display.lock().unwrap_or_else(|e| e.into_inner()).clear();
                session.set_streaming(true);
                let _ = self.events.send(Event::StreamingChanged(true));
                tracing::info!("Adquisición en marcha");
                Ok(Ack::Done)
            }
            Command::StopStreaming => {
                session.abort_sampling();
                self.daq.stop()?;
                let _ = self.events.send(Event::StreamingChanged(false));
                tracing::info!("Adquisición parada");
                Ok(Ack::Done)
            }
            Command::StartBaseline => session.start_baseline().map(|_| Ack::Done),
            Command::FinishBaselineStep => session.finish_baseline_step().map(Ack::BaselineReview),
            Command::AcceptBaseline => session.accept_baseline().map(Ack::BaselineAccepted),
            Command::RejectBaseline => session.reject_baseline().map(|_| Ack::Done),
            Command::StopBaseline { save } => Ok(Ack::BaselineClosed(session.stop_baseline(save))),
            Command::StartTrial => session.start_trial().map(|_| Ack::Done),
            Command::ConfirmZero => session.confirm_zero().map(|_| Ack::Done),
            Command::Stop => Ok(Ack::TrialState(session.stop())),
            Command::AcceptTrial { notes } => session.accept_trial(&notes).map(Ack::Exported),
            Command::DiscardTrial => session.discard_trial().map(|_| Ack::Done),
            Command::Status => Ok(Ack::Status(session.status())),
            Command::Shutdown => Ok(Ack::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::testing::{unit_scaling, FakeBackend, FakeLog};

    fn spawn() -> (Acquisition, Arc<Mutex<FakeLog>>) {
        let (backend, log) = FakeBackend::new(vec![[0.0, 0.0, 700.0, 0.0, 0.0, 0.0, 0.0, 0.0]; 4]);
        let daq = Daq::open(Box::new(backend), unit_scaling()).unwrap();
        (Acquisition::spawn(daq, &Settings::default()).unwrap(), log)
    }

    #[test]
    fn test_shutdown_closes_task_after_join() {
        let (acquisition, log) = spawn();
        acquisition.request(Command::StartStreaming).unwrap();
        acquisition.shutdown().unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.created, 1);
        assert_eq!(log.closed, 1);
    }

    #[test]
    fn test_gates_are_reported_through_the_channel() {
        let (acquisition, _) = spawn();
        let err = acquisition.request(Command::StartTrial).unwrap_err();
        assert!(matches!(err, ProtocolError::PreconditionNotMet(_)));

        match acquisition.request(Command::Status).unwrap() {
            Ack::Status(status) => {
                assert!(!status.streaming);
                assert_eq!(status.trial_state, TrialState::Idle);
            }
            other => panic!("respuesta inesperada: {:?}", other),
        }
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (acquisition, _) = spawn();
        acquisition.request(Command::StartStreaming).unwrap();
        let err = acquisition.request(Command::StartStreaming).unwrap_err();
        assert!(matches!(err, ProtocolError::Daq(DaqError::TaskAlreadyRunning)));
        let events: Vec<Event> = acquisition.events().try_iter().collect();
        assert!(events.contains(&Event::StreamingChanged(true)));
    }

    #[test]
    fn test_display_fills_while_streaming() {
        let (acquisition, _) = spawn();
        acquisition.request(Command::StartStreaming).unwrap();
        let display = acquisition.display();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while display.lock().unwrap().len() < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(display.lock().unwrap().len() >= 10);
        assert_eq!(display.lock().unwrap().latest().unwrap().fz(), 700.0);
    }

    #[test]
    fn test_stop_streaming_keeps_baseline_under_review() {
        let dir = tempfile::tempdir().unwrap();
        let (acquisition, _) = spawn();
        acquisition
            .request(Command::SetDemographics {
                patient_id: "P001".into(),
                foot_measurement: "27".into(),
            })
            .unwrap();
        acquisition.request(Command::SetExportDir(dir.path().to_path_buf())).unwrap();
        acquisition.request(Command::StartStreaming).unwrap();
        acquisition.request(Command::StartBaseline).unwrap();
        acquisition.request(Command::ConfirmZero).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if acquisition.events().recv_timeout(remaining).unwrap() == Event::BaselineQuietStanceComplete {
                break;
            }
        }
        assert!(matches!(
            acquisition.request(Command::FinishBaselineStep).unwrap(),
            Ack::BaselineReview(_)
        ));

        acquisition.request(Command::StopStreaming).unwrap();
        match acquisition.request(Command::Status).unwrap() {
            Ack::Status(status) => {
                assert!(!status.streaming);
                assert!(status.baseline_reviewing);
            }
            other => panic!("respuesta inesperada: {:?}", other),
        }
        acquisition.request(Command::RejectBaseline).unwrap();
        acquisition.shutdown().unwrap();
    }
}
