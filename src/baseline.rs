use std::collections::BTreeMap;

use crate::error::ProtocolError;
use crate::peaks::{find_peaks, find_valleys, PeakParams};
use crate::signal::mean;
use crate::types::Sample;

/// Resultado del análisis de un ensayo basal, pendiente de aceptar o rechazar
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineAnalysis {
    /// Fuerza mediolateral corregida por la bipedestación quieta
    pub delta: Vec<f64>,
    pub peaks: Vec<usize>,
    pub valleys: Vec<usize>,
    /// Magnitud con signo de la APA; `None` si falta el pico o el valle
    pub apa: Option<f64>,
}

/// Umbral derivado de los ensayos basales aceptados
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdSnapshot {
    pub value: f64,
    pub percentage: u8,
    pub trials: usize,
}

/// `Fx(t) - media(Fx)` durante las primeras `quiet_stance_len` muestras
pub fn mediolateral_delta(samples: &[Sample], quiet_stance_len: usize) -> Vec<f64> {
    let quiet = &samples[..quiet_stance_len.min(samples.len())];
    let reference = mean(quiet.iter().map(|s| s.fx())).unwrap_or(0.0);
    samples.iter().map(|s| s.fx() - reference).collect()
}

/// Durante un paso suele aparecer una fuerza M/L hacia la pierna que oscila
/// seguida de otra hacia la pierna de apoyo. Para servir a pasos con
/// cualquier pie se toma lo que llegue antes, pico o valle.
pub fn select_apa(delta: &[f64], peaks: &[usize], valleys: &[usize]) -> Option<f64> {
    let (&first_peak, &first_valley) = (peaks.first()?, valleys.first()?);
    if first_peak <= first_valley {
        Some(delta[first_peak])
    } else {
        Some(delta[first_valley])
    }
}

/// Analiza una captura completa (bipedestación quieta + paso)
pub fn analyze_capture(samples: &[Sample], quiet_stance_len: usize, params: PeakParams) -> BaselineAnalysis {
    let delta = mediolateral_delta(samples, quiet_stance_len);
    let peaks = find_peaks(&delta, params);
    let valleys = find_valleys(&delta, params);
    let apa = select_apa(&delta, &peaks, &valleys);
    BaselineAnalysis {
        delta,
        peaks,
        valleys,
        apa,
    }
}

/// `percentage * media(|APA|) / 100`; `None` sin ensayos
pub fn compute_threshold<'a>(magnitudes: impl IntoIterator<Item = &'a f64>, percentage: u8) -> Option<f64> {
    let mean_abs = mean(magnitudes.into_iter().map(|m| m.abs()))?;
    Some(percentage as f64 * mean_abs / 100.0)
}

/// Estados de la captura basal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    /// Sin captura en curso
    Idle,
    /// Acumulando muestras (bipedestación quieta y después el paso)
    Recording,
    /// Análisis listo, esperando que el operador lo acepte o rechace
    Review,
}

/// Calibrador basal: captura ensayos, extrae la APA de cada uno y deriva el umbral
pub struct BaselineCalibrator {
    params: PeakParams,
    quiet_stance_len: usize,
    percentage: u8,
    trials: BTreeMap<u32, f64>,
    next_trial_id: u32,
    threshold: Option<f64>,
    state: CaptureState,
    capture: Vec<Sample>,
    pending: Option<BaselineAnalysis>,
}

impl BaselineCalibrator {
    pub fn new(params: PeakParams, quiet_stance_len: usize, percentage: u8) -> Self {
        Self {
            params,
            quiet_stance_len,
            percentage: percentage.clamp(1, 100),
            trials: BTreeMap::new(),
            next_trial_id: 1,
            threshold: None,
            state: CaptureState::Idle,
            capture: Vec::new(),
            pending: None,
        }
    }

    /// Cambia el porcentaje (1..=100) y recalcula el umbral
    pub fn set_percentage(&mut self, percentage: u8) -> Result<(), ProtocolError> {
        if !(1..=100).contains(&percentage) {
            return Err(ProtocolError::PreconditionNotMet("threshold percentage must be within 1..=100"));
        }
        self.percentage = percentage;
        self.recompute_threshold();
        Ok(())
    }

    pub fn percentage(&self) -> u8 {
        self.percentage
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    /// Copia del umbral para un ensayo; no comparte estado con el calibrador
    pub fn snapshot(&self) -> Option<ThresholdSnapshot> {
        self.threshold.map(|value| ThresholdSnapshot {
            value,
            percentage: self.percentage,
            trials: self.trials.len(),
        })
    }

    /// Ensayos aceptados (id -> magnitud de la APA)
    pub fn trials(&self) -> &BTreeMap<u32, f64> {
        &self.trials
    }

    pub fn trial_count(&self) -> usize {
        self.trials.len()
    }

    pub fn is_recording(&self) -> bool {
        self.state == CaptureState::Recording
    }

    pub fn is_reviewing(&self) -> bool {
        self.state == CaptureState::Review
    }

    /// Muestras de la captura actual
    pub fn captured_len(&self) -> usize {
        self.capture.len()
    }

    /// La ventana de bipedestación quieta ya está completa
    pub fn quiet_stance_complete(&self) -> bool {
        self.capture.len() >= self.quiet_stance_len
    }

    /// Empieza a grabar un ensayo (bipedestación quieta + paso)
    pub fn begin_capture(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            CaptureState::Idle => {
                self.capture.clear();
                self.state = CaptureState::Recording;
                Ok(())
            }
            CaptureState::Recording => Err(ProtocolError::InvalidState {
                action: "start a baseline capture",
                state: "a capture is recording",
            }),
            CaptureState::Review => Err(ProtocolError::InvalidState {
                action: "start a baseline capture",
                state: "the previous capture awaits accept/reject",
            }),
        }
    }

    /// Alimenta la captura; se ignora fuera de `Recording`
    pub fn feed(&mut self, sample: Sample) {
        if self.state == CaptureState::Recording {
            self.capture.push(sample);
        }
    }

    /// Cierra la ventana del paso y analiza la captura
    pub fn finish_capture(&mut self) -> Result<&BaselineAnalysis, ProtocolError> {
        if self.state != CaptureState::Recording {
            return Err(ProtocolError::InvalidState {
                action: "finish a baseline step",
                state: "no capture is recording",
            });
        }
        if !self.quiet_stance_complete() {
            return Err(ProtocolError::PreconditionNotMet(
                "quiet stance window not complete: wait before finishing the step",
            ));
        }

        let samples = std::mem::take(&mut self.capture);
        let analysis = analyze_capture(&samples, self.quiet_stance_len, self.params);
        tracing::debug!(
            "Ensayo basal analizado: {} muestras, picos={:?} valles={:?} apa={:?}",
            samples.len(),
            analysis.peaks.first(),
            analysis.valleys.first(),
            analysis.apa
        );
        self.state = CaptureState::Review;
        Ok(&*self.pending.insert(analysis))
    }

    pub fn pending(&self) -> Option<&BaselineAnalysis> {
        self.pending.as_ref()
    }

    /// Guarda el ensayo pendiente y recalcula el umbral. Sin APA válida no se
    /// acepta y el ensayo sigue pendiente para poder rechazarlo
    pub fn accept_pending(&mut self) -> Result<u32, ProtocolError> {
        let apa = match (&self.pending, self.state) {
            (Some(analysis), CaptureState::Review) => analysis.apa.ok_or(ProtocolError::NoApaDetected)?,
            _ => {
                return Err(ProtocolError::InvalidState {
                    action: "accept a baseline trial",
                    state: "no trial is awaiting review",
                })
            }
        };

        let id = self.next_trial_id;
        self.next_trial_id += 1;
        self.trials.insert(id, apa);
        self.pending = None;
        self.state = CaptureState::Idle;
        self.recompute_threshold();
        tracing::info!(
            "Ensayo basal {} aceptado: APA={:.3} N, umbral={:?}",
            id,
            apa,
            self.threshold
        );
        Ok(id)
    }

    /// Descarta el ensayo pendiente sin tocar el conjunto
    pub fn reject_pending(&mut self) -> Result<(), ProtocolError> {
        if self.state != CaptureState::Review {
            return Err(ProtocolError::InvalidState {
                action: "reject a baseline trial",
                state: "no trial is awaiting review",
            });
        }
        self.pending = None;
        self.state = CaptureState::Idle;
        Ok(())
    }

    /// Interrumpe la captura en curso (parada o overrun); el conjunto no cambia
    pub fn abort_capture(&mut self) {
        self.capture.clear();
        self.pending = None;
        self.state = CaptureState::Idle;
    }

    /// Borra todos los ensayos y el umbral
    pub fn discard_all(&mut self) {
        self.abort_capture();
        self.trials.clear();
        self.next_trial_id = 1;
        self.threshold = None;
        tracing::info!("Ensayos basales descartados");
    }

    fn recompute_threshold(&mut self) {
        self.threshold = compute_threshold(self.trials.values(), self.percentage);
    }
}
