use crate::baseline::ThresholdSnapshot;
use crate::config::StandingProtocol;
use crate::error::ProtocolError;
use crate::signal::mean;
use crate::stimulus::StimulusTrigger;
use crate::types::{Sample, TrialType};

/// Estados del ensayo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Idle,
    /// Armado; falta que el operador confirme el cero de la plataforma
    AwaitingZero,
    /// Acumulando la ventana de bipedestación quieta (y la pausa posterior)
    QuietStance,
    Streaming,
    /// Terminado; el registro espera aceptar o descartar
    Complete,
}

impl TrialState {
    pub fn name(&self) -> &'static str {
        match self {
            TrialState::Idle => "idle",
            TrialState::AwaitingZero => "awaiting platform zero",
            TrialState::QuietStance => "recording quiet stance",
            TrialState::Streaming => "streaming",
            TrialState::Complete => "complete",
        }
    }
}

/// Observador de lo que ocurre en el ensayo
pub trait ProtocolObserver {
    /// Muestra registrada en el ensayo (ya marcada si hubo estímulo)
    fn on_sample(&mut self, _sample: &Sample) {}

    fn on_trial_state_changed(&mut self, _from: TrialState, _to: TrialState) {}

    /// `body_index` es la posición de la muestra marcada dentro del cuerpo
    fn on_stimulus_fired(&mut self, _body_index: usize, _count: usize) {}
}

/// Observador que ignora todo
#[derive(Debug, Default)]
pub struct NullObserver;

impl ProtocolObserver for NullObserver {}

/// Parámetros fijados al armar un ensayo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialRequest {
    pub trial_type: TrialType,
    pub stimulus_enabled: bool,
    /// Copia del umbral del calibrador; `None` si aún no existe
    pub threshold: Option<ThresholdSnapshot>,
}

/// Ensayo terminado: bipedestación quieta + cuerpo, en orden cronológico
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub trial_type: TrialType,
    pub threshold: ThresholdSnapshot,
    pub stimulus_enabled: bool,
    pub reference_force: f64,
    pub quiet_stance: Vec<Sample>,
    pub body: Vec<Sample>,
    pub apa_detected: bool,
    pub stimuli: usize,
}

impl TrialRecord {
    /// Todas las muestras en el orden de exportación
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.quiet_stance.iter().chain(self.body.iter())
    }

    pub fn len(&self) -> usize {
        self.quiet_stance.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ActiveTrial {
    request: TrialRequest,
    threshold: ThresholdSnapshot,
    quiet_stance: Vec<Sample>,
    reference_force: f64,
    settle_remaining: usize,
    body: Vec<Sample>,
    apa_latched: bool,
    stimuli: usize,
}

/// Máquina de estados de un ensayo de paso o de pie
pub struct TrialController {
    state: TrialState,
    quiet_stance_len: usize,
    settle_len: usize,
    standing: StandingProtocol,
    active: Option<ActiveTrial>,
    finished: Option<TrialRecord>,
    observer: Box<dyn ProtocolObserver + Send>,
}

impl TrialController {
    pub fn new(quiet_stance_len: usize, settle_len: usize, standing: StandingProtocol) -> Self {
        Self {
            state: TrialState::Idle,
            quiet_stance_len: quiet_stance_len.max(1),
            settle_len,
            standing,
            active: None,
            finished: None,
            observer: Box::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ProtocolObserver + Send>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    /// El ensayo está consumiendo muestras
    pub fn is_sampling(&self) -> bool {
        matches!(self.state, TrialState::QuietStance | TrialState::Streaming)
    }

    pub fn trial_type(&self) -> Option<TrialType> {
        match (&self.active, &self.finished) {
            (Some(t), _) => Some(t.request.trial_type),
            (None, Some(r)) => Some(r.trial_type),
            (None, None) => None,
        }
    }

    pub fn apa_detected(&self) -> bool {
        match (&self.active, &self.finished) {
            (Some(t), _) => t.apa_latched,
            (None, Some(r)) => r.apa_detected,
            (None, None) => false,
        }
    }

    pub fn stimuli_fired(&self) -> usize {
        match (&self.active, &self.finished) {
            (Some(t), _) => t.stimuli,
            (None, Some(r)) => r.stimuli,
            (None, None) => 0,
        }
    }

    pub fn body_len(&self) -> usize {
        match (&self.active, &self.finished) {
            (Some(t), _) => t.body.len(),
            (None, Some(r)) => r.body.len(),
            (None, None) => 0,
        }
    }

    pub fn standing_protocol(&self) -> StandingProtocol {
        self.standing
    }

    fn transition(&mut self, to: TrialState) {
        let from = self.state;
        if from != to {
            self.state = to;
            tracing::debug!("Ensayo: {} -> {}", from.name(), to.name());
            self.observer.on_trial_state_changed(from, to);
        }
    }

    /// Arma un ensayo con el umbral congelado en `request`
    pub fn arm(&mut self, request: TrialRequest) -> Result<(), ProtocolError> {
        if self.state != TrialState::Idle {
            return Err(ProtocolError::InvalidState {
                action: "start a trial",
                state: self.state.name(),
            });
        }
        let threshold = request.threshold.ok_or(ProtocolError::ThresholdNotSet)?;

        self.active = Some(ActiveTrial {
            request,
            threshold,
            quiet_stance: Vec::with_capacity(self.quiet_stance_len),
            reference_force: 0.0,
            settle_remaining: self.settle_len,
            body: Vec::new(),
            apa_latched: false,
            stimuli: 0,
        });
        self.transition(TrialState::AwaitingZero);
        tracing::info!(
            "{} armado (umbral {:.3} N, estímulo {})",
            request.trial_type.label(),
            threshold.value,
            if request.stimulus_enabled { "activo" } else { "desactivado" }
        );
        Ok(())
    }

    /// El operador confirmó el cero de la plataforma
    pub fn confirm_zero(&mut self) -> Result<(), ProtocolError> {
        if self.state != TrialState::AwaitingZero {
            return Err(ProtocolError::InvalidState {
                action: "confirm platform zero",
                state: self.state.name(),
            });
        }
        self.transition(TrialState::QuietStance);
        Ok(())
    }

    /// Procesa una muestra. Fuera de `QuietStance`/`Streaming` no hace nada
    pub fn feed(&mut self, sample: Sample, trigger: &mut dyn StimulusTrigger) {
        let Some(trial) = self.active.as_mut() else {
            return;
        };

        match self.state {
            TrialState::QuietStance => {
                if trial.quiet_stance.len() < self.quiet_stance_len {
                    trial.quiet_stance.push(sample);
                    self.observer.on_sample(&sample);
                    if trial.quiet_stance.len() == self.quiet_stance_len {
                        trial.reference_force =
                            mean(trial.quiet_stance.iter().map(|s| s.fx())).unwrap_or(0.0);
                        tracing::info!(
                            "Bipedestación quieta completa: referencia Fx = {:.3} N",
                            trial.reference_force
                        );
                    } else {
                        return;
                    }
                } else if trial.settle_remaining > 0 {
                    trial.settle_remaining -= 1;
                }
                if trial.settle_remaining == 0 {
                    self.transition(TrialState::Streaming);
                }
            }
            TrialState::Streaming => self.feed_body(sample, trigger),
            _ => {}
        }
    }

    fn feed_body(&mut self, mut sample: Sample, trigger: &mut dyn StimulusTrigger) {
        let standing = self.standing;
        let Some(trial) = self.active.as_mut() else {
            return;
        };
        let index = trial.body.len();

        let fire = match trial.request.trial_type {
            TrialType::Step => {
                !trial.apa_latched
                    && (sample.fx() - trial.reference_force).abs() > trial.threshold.value.abs()
            }
            TrialType::Standing => {
                (index + 1) % standing.interval() == 0 && trial.stimuli < standing.max_stimuli()
            }
        };

        if fire {
            // En el ensayo de paso el estimulador puede estar desactivado; el
            // de pie estimula siempre en cada intervalo
            let pulse = match trial.request.trial_type {
                TrialType::Step => {
                    trial.apa_latched = true;
                    tracing::info!("APA detectada en la muestra {} del ensayo", index);
                    trial.request.stimulus_enabled
                }
                TrialType::Standing => true,
            };
            if pulse {
                match trigger.trigger() {
                    Ok(()) => {
                        sample = sample.with_stim();
                        trial.stimuli += 1;
                        self.observer.on_stimulus_fired(index, trial.stimuli);
                    }
                    Err(e) => tracing::warn!("El estímulo no se pudo disparar: {}", e),
                }
            }
        }

        trial.body.push(sample);
        self.observer.on_sample(&sample);

        if trial.request.trial_type == TrialType::Standing && trial.body.len() >= standing.duration() {
            tracing::info!("Ensayo de pie completo: {} estímulos", trial.stimuli);
            self.complete();
        }
    }

    /// Cierra el ensayo activo y guarda su registro hasta aceptarlo o descartarlo
    fn complete(&mut self) {
        if let Some(trial) = self.active.take() {
            self.finished = Some(TrialRecord {
                trial_type: trial.request.trial_type,
                threshold: trial.threshold,
                stimulus_enabled: trial.request.stimulus_enabled,
                reference_force: trial.reference_force,
                quiet_stance: trial.quiet_stance,
                body: trial.body,
                apa_detected: trial.apa_latched,
                stimuli: trial.stimuli,
            });
        }
        self.transition(TrialState::Complete);
    }

    /// Parada del operador. Antes del cuerpo del ensayo lo aborta y vuelve a
    /// `Idle`; durante el cuerpo lo completa. En otros estados no hace nada
    pub fn stop(&mut self) -> TrialState {
        match self.state {
            TrialState::AwaitingZero | TrialState::QuietStance => {
                tracing::info!("Ensayo abortado antes del cuerpo");
                self.active = None;
                self.transition(TrialState::Idle);
            }
            TrialState::Streaming => self.complete(),
            TrialState::Idle | TrialState::Complete => {}
        }
        self.state
    }

    /// Descarta el ensayo que aún está tomando muestras (overrun, parada de la
    /// adquisición). Un ensayo `Complete` conserva su registro
    pub fn abort(&mut self) {
        if matches!(self.state, TrialState::Idle | TrialState::Complete) {
            return;
        }
        tracing::warn!("Ensayo abortado en estado {}", self.state.name());
        self.active = None;
        self.transition(TrialState::Idle);
    }

    /// Registro del ensayo completo, sin sacarlo del controlador
    pub fn record(&self) -> Result<&TrialRecord, ProtocolError> {
        match (&self.finished, self.state) {
            (Some(record), TrialState::Complete) => Ok(record),
            _ => Err(ProtocolError::InvalidState {
                action: "take the trial record",
                state: self.state.name(),
            }),
        }
    }

    /// Entrega el registro del ensayo completo y vuelve a `Idle`
    pub fn take_record(&mut self) -> Result<TrialRecord, ProtocolError> {
        self.record()?;
        let record = self.finished.take().ok_or(ProtocolError::InvalidState {
            action: "take the trial record",
            state: "no trial data",
        })?;
        self.transition(TrialState::Idle);
        Ok(record)
    }

    /// Descarta el ensayo completo sin entregar el registro
    pub fn discard(&mut self) -> Result<(), ProtocolError> {
        if self.state != TrialState::Complete {
            return Err(ProtocolError::InvalidState {
                action: "discard the trial",
                state: self.state.name(),
            });
        }
        self.finished = None;
        self.transition(TrialState::Idle);
        Ok(())
    }
}

/// Primera muestra del cuerpo de un registro cuya desviación de Fx supera
/// el umbral. Sirve para reproducir la detección sobre un archivo exportado
pub fn first_crossing(samples: &[Sample], quiet_stance_len: usize, threshold: f64) -> Option<usize> {
    if samples.len() <= quiet_stance_len {
        return None;
    }
    let reference = mean(samples[..quiet_stance_len].iter().map(|s| s.fx()))?;
    samples[quiet_stance_len..]
        .iter()
        .position(|s| (s.fx() - reference).abs() > threshold.abs())
        .map(|i| i + quiet_stance_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingTrigger {
        count: usize,
        fail: bool,
    }

    impl StimulusTrigger for CountingTrigger {
        fn trigger(&mut self) -> Result<(), DaqError> {
            if self.fail {
                return Err(DaqError::PulseBusy);
            }
            self.count += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorded {
        states: Vec<(TrialState, TrialState)>,
        stimuli: Vec<usize>,
        samples: usize,
    }

    struct RecordingObserver(Arc<Mutex<Recorded>>);

    impl ProtocolObserver for RecordingObserver {
        fn on_sample(&mut self, _sample: &Sample) {
            self.0.lock().unwrap().samples += 1;
        }
        fn on_trial_state_changed(&mut self, from: TrialState, to: TrialState) {
            self.0.lock().unwrap().states.push((from, to));
        }
        fn on_stimulus_fired(&mut self, body_index: usize, _count: usize) {
            self.0.lock().unwrap().stimuli.push(body_index);
        }
    }

    fn threshold(value: f64) -> Option<ThresholdSnapshot> {
        Some(ThresholdSnapshot {
            value,
            percentage: 10,
            trials: 2,
        })
    }

    fn sample(fx: f64) -> Sample {
        Sample::new([fx, 0.0, 700.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn step_request(enabled: bool) -> TrialRequest {
        TrialRequest {
            trial_type: TrialType::Step,
            stimulus_enabled: enabled,
            threshold: threshold(2.5),
        }
    }

    fn standing_controller(duration: usize, interval: usize, max: usize) -> TrialController {
        TrialController::new(10, 0, StandingProtocol::new(duration, interval, max).unwrap())
    }

    fn started(controller: &mut TrialController, request: TrialRequest, trigger: &mut CountingTrigger) {
        controller.arm(request).unwrap();
        controller.confirm_zero().unwrap();
        for _ in 0..10 {
            controller.feed(sample(1.0), trigger);
        }
    }

    #[test]
    fn test_arm_without_threshold_is_rejected() {
        let mut controller = standing_controller(100, 10, 10);
        let request = TrialRequest {
            threshold: None,
            ..step_request(true)
        };
        assert!(matches!(controller.arm(request), Err(ProtocolError::ThresholdNotSet)));
        assert_eq!(controller.state(), TrialState::Idle);
    }

    #[test]
    fn test_step_trial_fires_once() {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let mut controller =
            standing_controller(100, 10, 10).with_observer(Box::new(RecordingObserver(Arc::clone(&log))));
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        assert_eq!(controller.state(), TrialState::Streaming);

        // Por debajo del umbral, luego varias muestras por encima
        for fx in [2.0, -0.5, 3.0, 8.0, -5.0, 10.0, 1.0] {
            controller.feed(sample(fx), &mut trigger);
        }
        assert_eq!(trigger.count, 1);
        assert!(controller.apa_detected());

        assert_eq!(controller.stop(), TrialState::Complete);
        let record = controller.take_record().unwrap();
        assert_eq!(record.quiet_stance.len(), 10);
        assert_eq!(record.body.len(), 7);
        let tagged: Vec<usize> = record
            .body
            .iter()
            .enumerate()
            .filter(|(_, s)| s.stim)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(tagged, vec![3]);
        assert_eq!(record.reference_force, 1.0);

        let log = log.lock().unwrap();
        assert_eq!(log.stimuli, vec![3]);
        assert_eq!(log.samples, 17);
        assert_eq!(
            log.states,
            vec![
                (TrialState::Idle, TrialState::AwaitingZero),
                (TrialState::AwaitingZero, TrialState::QuietStance),
                (TrialState::QuietStance, TrialState::Streaming),
                (TrialState::Streaming, TrialState::Complete),
                (TrialState::Complete, TrialState::Idle),
            ]
        );
    }

    #[test]
    fn test_step_trial_without_stimulus_latches_without_tag() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(false), &mut trigger);
        controller.feed(sample(20.0), &mut trigger);
        assert!(controller.apa_detected());
        assert_eq!(trigger.count, 0);
        controller.stop();
        let record = controller.take_record().unwrap();
        assert!(record.body.iter().all(|s| !s.stim));
        assert!(record.apa_detected);
    }

    #[test]
    fn test_failed_trigger_latches_and_leaves_sample_untagged() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        trigger.fail = true;
        controller.feed(sample(20.0), &mut trigger);
        trigger.fail = false;
        controller.feed(sample(20.0), &mut trigger);
        assert_eq!(trigger.count, 0);
        assert_eq!(controller.stimuli_fired(), 0);
        assert!(controller.apa_detected());
    }

    #[test]
    fn test_standing_trial_fires_floor_duration_over_interval() {
        let mut controller = standing_controller(95_000, 10_000, 10);
        let mut trigger = CountingTrigger::default();
        let request = TrialRequest {
            trial_type: TrialType::Standing,
            ..step_request(true)
        };
        started(&mut controller, request, &mut trigger);

        // Más muestras de las que dura el ensayo: las sobrantes se ignoran
        for _ in 0..120_000 {
            controller.feed(sample(50.0), &mut trigger);
        }
        assert_eq!(trigger.count, 9);
        assert_eq!(controller.state(), TrialState::Complete);

        let record = controller.take_record().unwrap();
        assert_eq!(record.body.len(), 95_000);
        let tagged: Vec<usize> = record
            .body
            .iter()
            .enumerate()
            .filter(|(_, s)| s.stim)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(tagged.len(), 9);
        assert_eq!(tagged[0], 9_999);
        assert_eq!(tagged[8], 89_999);
    }

    #[test]
    fn test_standing_trial_stimulates_with_stimulator_disabled() {
        let mut controller = standing_controller(95_000, 10_000, 10);
        let mut trigger = CountingTrigger::default();
        let request = TrialRequest {
            trial_type: TrialType::Standing,
            ..step_request(false)
        };
        started(&mut controller, request, &mut trigger);
        for _ in 0..95_010 {
            controller.feed(sample(0.0), &mut trigger);
        }
        assert_eq!(trigger.count, 9);
        let record = controller.take_record().unwrap();
        assert!(!record.stimulus_enabled);
        assert_eq!(record.body.iter().filter(|s| s.stim).count(), 9);
    }

    #[test]
    fn test_abort_keeps_completed_record() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        controller.feed(sample(20.0), &mut trigger);
        controller.stop();

        controller.abort();
        assert_eq!(controller.state(), TrialState::Complete);
        assert_eq!(controller.record().unwrap().body.len(), 1);
        assert_eq!(controller.stimuli_fired(), 1);
        assert_eq!(controller.take_record().unwrap().stimuli, 1);
    }

    #[test]
    fn test_abort_drops_trial_still_sampling() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        controller.abort();
        assert_eq!(controller.state(), TrialState::Idle);
        assert!(controller.record().is_err());
        controller.feed(sample(20.0), &mut trigger);
        assert_eq!(trigger.count, 0);
    }

    #[test]
    fn test_standing_trial_respects_max_stimuli() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        let request = TrialRequest {
            trial_type: TrialType::Standing,
            ..step_request(true)
        };
        started(&mut controller, request, &mut trigger);
        for _ in 0..100 {
            controller.feed(sample(0.0), &mut trigger);
        }
        assert_eq!(trigger.count, 10);
        assert_eq!(controller.state(), TrialState::Complete);
    }

    #[test]
    fn test_stop_during_quiet_stance_aborts() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        controller.arm(step_request(true)).unwrap();
        controller.confirm_zero().unwrap();
        for _ in 0..5 {
            controller.feed(sample(100.0), &mut trigger);
        }
        assert_eq!(controller.stop(), TrialState::Idle);
        // Tras la parada nada dispara
        controller.feed(sample(100.0), &mut trigger);
        assert_eq!(trigger.count, 0);
        assert!(controller.take_record().is_err());
    }

    #[test]
    fn test_no_stimulus_after_stop() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        controller.stop();
        controller.feed(sample(100.0), &mut trigger);
        assert_eq!(trigger.count, 0);
        assert_eq!(controller.take_record().unwrap().body.len(), 0);
    }

    #[test]
    fn test_settle_gap_is_not_recorded() {
        let mut controller = TrialController::new(10, 5, StandingProtocol::new(100, 10, 10).unwrap());
        let mut trigger = CountingTrigger::default();
        controller.arm(step_request(true)).unwrap();
        controller.confirm_zero().unwrap();
        for _ in 0..10 {
            controller.feed(sample(1.0), &mut trigger);
        }
        assert_eq!(controller.state(), TrialState::QuietStance);
        // La pausa ignora incluso desviaciones grandes
        for _ in 0..5 {
            controller.feed(sample(90.0), &mut trigger);
        }
        assert_eq!(controller.state(), TrialState::Streaming);
        assert_eq!(trigger.count, 0);
        controller.feed(sample(1.0), &mut trigger);
        controller.stop();
        let record = controller.take_record().unwrap();
        assert_eq!(record.len(), 11);
    }

    #[test]
    fn test_first_crossing_matches_live_detection() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        for fx in [1.5, 2.0, -1.0, 4.0, 9.0] {
            controller.feed(sample(fx), &mut trigger);
        }
        controller.stop();
        let record = controller.take_record().unwrap();
        let samples: Vec<Sample> = record.samples().copied().collect();
        let live = samples.iter().position(|s| s.stim);
        assert_eq!(live, Some(13));
        assert_eq!(first_crossing(&samples, 10, -2.5), live);
        assert_eq!(first_crossing(&samples, 10, 50.0), None);
    }

    #[test]
    fn test_discard_and_rearm() {
        let mut controller = standing_controller(100, 10, 10);
        let mut trigger = CountingTrigger::default();
        started(&mut controller, step_request(true), &mut trigger);
        assert!(controller.arm(step_request(true)).is_err());
        controller.stop();
        controller.discard().unwrap();
        assert_eq!(controller.state(), TrialState::Idle);
        controller.arm(step_request(true)).unwrap();
        assert_eq!(controller.state(), TrialState::AwaitingZero);
    }
}
