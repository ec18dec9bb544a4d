use std::path::{Path, PathBuf};

use crate::baseline::{BaselineCalibrator, ThresholdSnapshot};
use crate::config::Settings;
use crate::error::ProtocolError;
use crate::export::{available_path, build_record, generate_filename, write_record, TrialMetadata};
use crate::peaks::PeakParams;
use crate::signal::Platform;
use crate::stimulus::StimulusTrigger;
use crate::trial::{ProtocolObserver, TrialController, TrialRequest, TrialState};
use crate::types::{Demographics, Sample, StimulatorSetup, TrialType};

/// Resumen de un ensayo basal listo para revisar
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineReview {
    pub samples: usize,
    pub first_peak: Option<usize>,
    pub first_valley: Option<usize>,
    pub apa: Option<f64>,
}

/// Foto del estado de la sesión para la consola
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub patient_id: Option<String>,
    pub export_dir: Option<PathBuf>,
    pub streaming: bool,
    pub trial_type: TrialType,
    pub stimulator_setup: StimulatorSetup,
    pub trial_state: TrialState,
    pub baseline_recording: bool,
    pub baseline_reviewing: bool,
    pub threshold: Option<ThresholdSnapshot>,
    pub percentage: u8,
    pub baseline_trials: usize,
    pub trials_saved: usize,
}

/// Avisos que la sesión produce al procesar una muestra
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    /// La ventana quieta del ensayo basal está completa: el sujeto puede dar el paso
    BaselineQuietStanceComplete,
}

/// Estado de una sesión de recogida: paciente, destino, calibración y ensayos
pub struct Session {
    demographics: Option<Demographics>,
    export_dir: Option<PathBuf>,
    streaming: bool,
    trial_type: TrialType,
    stimulator_setup: StimulatorSetup,
    platform: Platform,
    calibrator: BaselineCalibrator,
    baseline_awaiting_zero: bool,
    controller: TrialController,
    trials_saved: usize,
}

impl Session {
    pub fn new(settings: &Settings, observer: Box<dyn ProtocolObserver + Send>) -> Result<Self, ProtocolError> {
        settings.validate()?;
        let params = PeakParams {
            min_height: settings.apa.min_height,
            min_prominence: settings.apa.min_prominence,
        };
        let quiet = settings.quiet_stance_samples();
        let controller = TrialController::new(quiet, settings.settle_samples(), settings.standing_protocol()?)
            .with_observer(observer);

        Ok(Self {
            demographics: None,
            export_dir: None,
            streaming: false,
            trial_type: TrialType::Step,
            stimulator_setup: StimulatorSetup::Test,
            platform: Platform::new(settings.platform.z_offset, settings.platform.minimum_vertical_force),
            calibrator: BaselineCalibrator::new(params, quiet, settings.protocol.threshold_percentage),
            baseline_awaiting_zero: false,
            controller,
            trials_saved: 0,
        })
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            patient_id: self.demographics.as_ref().map(|d| d.patient_id.clone()),
            export_dir: self.export_dir.clone(),
            streaming: self.streaming,
            trial_type: self.trial_type,
            stimulator_setup: self.stimulator_setup,
            trial_state: self.controller.state(),
            baseline_recording: self.calibrator.is_recording() || self.baseline_awaiting_zero,
            baseline_reviewing: self.calibrator.is_reviewing(),
            threshold: self.calibrator.snapshot(),
            percentage: self.calibrator.percentage(),
            baseline_trials: self.calibrator.trial_count(),
            trials_saved: self.trials_saved,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn controller(&self) -> &TrialController {
        &self.controller
    }

    pub fn calibrator(&self) -> &BaselineCalibrator {
        &self.calibrator
    }

    fn busy(&self) -> bool {
        self.controller.state() != TrialState::Idle
            || self.calibrator.is_recording()
            || self.calibrator.is_reviewing()
            || self.baseline_awaiting_zero
    }

    fn ensure_idle(&self, action: &'static str) -> Result<(), ProtocolError> {
        if self.busy() {
            return Err(ProtocolError::InvalidState {
                action,
                state: "a baseline capture or trial is in progress",
            });
        }
        Ok(())
    }

    pub fn set_demographics(&mut self, patient_id: &str, foot_measurement: &str) -> Result<(), ProtocolError> {
        self.ensure_idle("change patient demographics")?;
        let demographics = Demographics::new(patient_id, foot_measurement).ok_or(
            ProtocolError::PreconditionNotMet("patient ID and foot measurement must both be non-empty"),
        )?;
        tracing::info!("Paciente {} registrado", demographics.patient_id);
        self.demographics = Some(demographics);
        Ok(())
    }

    pub fn set_export_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ProtocolError::InvalidExportPath(dir.to_path_buf()));
        }
        self.export_dir = Some(dir.to_path_buf());
        Ok(())
    }

    pub fn set_trial_type(&mut self, trial_type: TrialType) -> Result<(), ProtocolError> {
        self.ensure_idle("change the trial type")?;
        self.trial_type = trial_type;
        Ok(())
    }

    pub fn set_stimulator_setup(&mut self, setup: StimulatorSetup) -> Result<(), ProtocolError> {
        self.ensure_idle("change the stimulator setup")?;
        self.stimulator_setup = setup;
        Ok(())
    }

    /// Cambia el porcentaje; el umbral se recalcula al momento. Un ensayo ya
    /// armado conserva la copia que tomó
    pub fn set_threshold_percentage(&mut self, percentage: u8) -> Result<Option<f64>, ProtocolError> {
        self.calibrator.set_percentage(percentage)?;
        Ok(self.calibrator.threshold())
    }

    /// Lo fija el bucle de adquisición al arrancar o parar la tarea
    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    fn check_collection_gates(&self) -> Result<(), ProtocolError> {
        if self.demographics.is_none() {
            return Err(ProtocolError::PreconditionNotMet(
                "patient ID and foot measurement have not been saved",
            ));
        }
        if self.export_dir.is_none() {
            return Err(ProtocolError::PreconditionNotMet(
                "export directory has not been set",
            ));
        }
        if !self.streaming {
            return Err(ProtocolError::PreconditionNotMet(
                "data is not streaming: start the recording first",
            ));
        }
        Ok(())
    }

    /// Arma un ensayo basal; empieza a grabar al confirmar el cero
    pub fn start_baseline(&mut self) -> Result<(), ProtocolError> {
        self.check_collection_gates()?;
        self.ensure_idle("start a baseline capture")?;
        self.baseline_awaiting_zero = true;
        Ok(())
    }

    /// Confirmación del cero de la plataforma para lo que esté armado
    pub fn confirm_zero(&mut self) -> Result<(), ProtocolError> {
        if self.baseline_awaiting_zero {
            self.calibrator.begin_capture()?;
            self.baseline_awaiting_zero = false;
            return Ok(());
        }
        self.controller.confirm_zero()
    }

    pub fn finish_baseline_step(&mut self) -> Result<BaselineReview, ProtocolError> {
        let analysis = self.calibrator.finish_capture()?;
        Ok(BaselineReview {
            samples: analysis.delta.len(),
            first_peak: analysis.peaks.first().copied(),
            first_valley: analysis.valleys.first().copied(),
            apa: analysis.apa,
        })
    }

    pub fn accept_baseline(&mut self) -> Result<ThresholdSnapshot, ProtocolError> {
        self.calibrator.accept_pending()?;
        self.calibrator.snapshot().ok_or(ProtocolError::ThresholdNotSet)
    }

    pub fn reject_baseline(&mut self) -> Result<(), ProtocolError> {
        self.calibrator.reject_pending()
    }

    /// Cierra la tanda de ensayos basales. Guardando se conserva el conjunto y
    /// el umbral; descartando se borran
    pub fn stop_baseline(&mut self, save: bool) -> Option<ThresholdSnapshot> {
        self.baseline_awaiting_zero = false;
        if save {
            self.calibrator.abort_capture();
        } else {
            self.calibrator.discard_all();
        }
        self.calibrator.snapshot()
    }

    /// Arma un ensayo con una copia del umbral actual
    pub fn start_trial(&mut self) -> Result<(), ProtocolError> {
        self.check_collection_gates()?;
        self.ensure_idle("start a trial")?;
        self.controller.arm(TrialRequest {
            trial_type: self.trial_type,
            stimulus_enabled: self.stimulator_setup.stimulus_enabled(),
            threshold: self.calibrator.snapshot(),
        })
    }

    /// Reparte la muestra entre la captura basal y el ensayo activo
    pub fn feed(&mut self, sample: Sample, trigger: &mut dyn StimulusTrigger) -> Option<SessionNotice> {
        if self.calibrator.is_recording() {
            let was_complete = self.calibrator.quiet_stance_complete();
            self.calibrator.feed(sample);
            if !was_complete && self.calibrator.quiet_stance_complete() {
                return Some(SessionNotice::BaselineQuietStanceComplete);
            }
            return None;
        }
        self.controller.feed(sample, trigger);
        None
    }

    /// Parada del operador: interrumpe la captura basal o detiene el ensayo
    pub fn stop(&mut self) -> TrialState {
        if self.baseline_awaiting_zero || self.calibrator.is_recording() {
            self.baseline_awaiting_zero = false;
            self.calibrator.abort_capture();
        }
        self.controller.stop()
    }

    /// Exporta el ensayo completo y suma uno al contador
    pub fn accept_trial(&mut self, notes: &str) -> Result<PathBuf, ProtocolError> {
        let (demographics, dir) = match (&self.demographics, &self.export_dir) {
            (Some(d), Some(dir)) => (d.clone(), dir.clone()),
            (None, _) => {
                return Err(ProtocolError::PreconditionNotMet(
                    "patient ID and foot measurement have not been saved",
                ))
            }
            (_, None) => return Err(ProtocolError::PreconditionNotMet("export directory has not been set")),
        };
        if !dir.is_dir() {
            return Err(ProtocolError::InvalidExportPath(dir));
        }

        // El registro sólo sale del controlador cuando el archivo está escrito;
        // si la escritura falla se puede reintentar o descartar
        let record = self.controller.record()?;
        let file_name = generate_filename(&demographics.patient_id, record.trial_type, self.stimulator_setup);
        let path = available_path(&dir, &file_name);
        let metadata = TrialMetadata::now(demographics, self.stimulator_setup, notes);
        let rows = build_record(record, &metadata, &self.platform);
        write_record(&path, &rows)?;
        self.controller.take_record()?;
        self.trials_saved += 1;
        Ok(path)
    }

    /// Descarta el ensayo completo; no se escribe nada y el contador no cambia
    pub fn discard_trial(&mut self) -> Result<(), ProtocolError> {
        self.controller.discard()
    }

    /// La adquisición se detuvo (overrun o parada): se pierde la captura o el
    /// ensayo que estuviera tomando muestras. Un basal en revisión y un ensayo
    /// completo siguen pendientes de aceptar o descartar
    pub fn abort_sampling(&mut self) {
        self.baseline_awaiting_zero = false;
        if self.calibrator.is_recording() {
            self.calibrator.abort_capture();
        }
        self.controller.abort();
        self.streaming = false;
    }
}
