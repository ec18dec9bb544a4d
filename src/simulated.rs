use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::daq::{ChannelScaling, DaqBackend, TaskSpec};
use crate::error::DaqError;
use crate::types::{ChannelData, FX, FY, FZ, MX, MY, NUM_CHANNELS, EMG_1, EMG_2};

/// Parámetros del sujeto simulado sobre la plataforma
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectParams {
    /// Peso corporal (N) que aparece en Fz
    pub body_weight: f64,
    /// Amplitud del ruido uniforme en fuerzas (N)
    pub force_noise: f64,
    /// Amplitud del pico M/L de la APA (N); el valle es un 30% mayor
    pub apa_amplitude: f64,
    /// Muestras que ocupa cada mitad de la APA
    pub apa_half_len: usize,
    /// Paso automático cada N muestras; `None` solo con la señal manual
    pub step_period: Option<usize>,
    pub seed: u64,
}

impl Default for SubjectParams {
    fn default() -> Self {
        Self {
            body_weight: 700.0,
            force_noise: 0.5,
            apa_amplitude: 40.0,
            apa_half_len: 100,
            step_period: None,
            seed: 7,
        }
    }
}

/// Cómo avanza el reloj simulado
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Una muestra por periodo de reloj, como el hardware
    RealTime,
    /// Sin esperas; cada lectura entrega la siguiente muestra
    Unpaced,
}

/// Manejadores compartidos para observar y dirigir la simulación desde fuera
/// del hilo de adquisición
#[derive(Debug, Clone, Default)]
pub struct SimulationHandle {
    step_cue: Arc<AtomicBool>,
    pulses: Arc<AtomicUsize>,
    stall: Arc<AtomicUsize>,
}

impl SimulationHandle {
    /// Pide al sujeto que dé un paso en la siguiente muestra
    pub fn cue_step(&self) {
        self.step_cue.store(true, Ordering::SeqCst);
    }

    /// Pulsos de estímulo emitidos hasta ahora
    pub fn pulses(&self) -> usize {
        self.pulses.load(Ordering::SeqCst)
    }

    /// Simula que el consumidor se retrasa `samples` muestras
    pub fn stall(&self, samples: usize) {
        self.stall.fetch_add(samples, Ordering::SeqCst);
    }
}

/// Dispositivo simulado: plataforma con un sujeto en bipedestación que
/// ocasionalmente da un paso precedido de una APA
pub struct SimulatedDaq {
    params: SubjectParams,
    scaling: ChannelScaling,
    pacing: Pacing,
    buffer_capacity: usize,
    rng: StdRng,
    handle: SimulationHandle,

    sample_rate: f64,
    task_created: bool,
    started_at: Option<Instant>,
    delivered: u64,
    backlog: usize,
    /// Posición dentro de la forma de la APA en curso
    apa_cursor: Option<usize>,
    /// Pulsos que nunca terminan, para probar `PulseBusy`
    pub stuck_pulse: bool,
}

impl SimulatedDaq {
    pub fn new(params: SubjectParams, scaling: ChannelScaling, pacing: Pacing, buffer_capacity: usize) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            scaling,
            pacing,
            buffer_capacity,
            rng,
            handle: SimulationHandle::default(),
            sample_rate: 0.0,
            task_created: false,
            started_at: None,
            delivered: 0,
            backlog: 0,
            apa_cursor: None,
            stuck_pulse: false,
        }
    }

    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    /// Muestras pendientes en el buffer del hardware tras la última lectura
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Desplazamiento M/L (N) de la APA en la posición `cursor`: un pico
    /// triangular hacia la pierna que oscila y luego un valle hacia la de apoyo
    fn apa_shape(&self, cursor: usize) -> f64 {
        let half = self.params.apa_half_len.max(1);
        let triangle = |i: usize| {
            let center = half as f64 / 2.0;
            (1.0 - (i as f64 - center).abs() / center).max(0.0)
        };
        if cursor < half {
            self.params.apa_amplitude * triangle(cursor)
        } else {
            -1.3 * self.params.apa_amplitude * triangle(cursor - half)
        }
    }

    fn next_physical(&mut self) -> ChannelData {
        let tick = self.delivered;
        if let Some(period) = self.params.step_period {
            if period > 0 && tick > 0 && tick % period as u64 == 0 {
                self.handle.cue_step();
            }
        }
        if self.apa_cursor.is_none() && self.handle.step_cue.swap(false, Ordering::SeqCst) {
            self.apa_cursor = Some(0);
        }

        let apa = match self.apa_cursor {
            Some(c) => {
                let v = self.apa_shape(c);
                self.apa_cursor = if c + 1 < 2 * self.params.apa_half_len { Some(c + 1) } else { None };
                v
            }
            None => 0.0,
        };

        let noise = self.params.force_noise;
        let mut jitter = |scale: f64| {
            if noise > 0.0 {
                self.rng.gen_range(-noise..noise) * scale
            } else {
                0.0
            }
        };

        let mut out = [0.0; NUM_CHANNELS];
        out[FX] = apa + jitter(1.0);
        out[FY] = jitter(1.0);
        out[FZ] = self.params.body_weight + jitter(2.0);
        // Balanceo leve del CoP alrededor del centro
        out[MX] = jitter(0.5);
        out[MY] = jitter(0.5);
        out[EMG_1] = jitter(0.001);
        out[EMG_2] = jitter(0.001);
        out
    }

    /// Espera al siguiente tick y actualiza el atraso acumulado
    fn pace(&mut self) -> Result<(), DaqError> {
        let stalled = self.handle.stall.swap(0, Ordering::SeqCst);
        self.backlog += stalled;

        if self.pacing == Pacing::RealTime {
            let start = self.started_at.ok_or(DaqError::TaskNotRunning)?;
            let elapsed = start.elapsed().as_secs_f64();
            let due = (elapsed * self.sample_rate) as u64 + 1;
            if due > self.delivered {
                self.backlog = self.backlog.max((due - self.delivered - 1) as usize);
            } else {
                let next = Duration::from_secs_f64(self.delivered as f64 / self.sample_rate);
                std::thread::sleep(next.saturating_sub(start.elapsed()));
            }
        }

        if self.backlog > self.buffer_capacity {
            return Err(DaqError::AcquisitionOverrun {
                backlog: self.backlog,
                capacity: self.buffer_capacity,
            });
        }
        self.backlog = self.backlog.saturating_sub(1);
        Ok(())
    }
}

impl DaqBackend for SimulatedDaq {
    fn self_test(&mut self) -> Result<(), DaqError> {
        if self.buffer_capacity == 0 {
            return Err(DaqError::SelfTestFailed("hardware buffer has no room".into()));
        }
        Ok(())
    }

    fn create_task(&mut self, spec: &TaskSpec) -> Result<(), DaqError> {
        if !(spec.sample_rate > 0.0) {
            return Err(DaqError::Hardware(format!("invalid sample rate {}", spec.sample_rate)));
        }
        self.sample_rate = spec.sample_rate;
        self.task_created = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        if !self.task_created {
            return Err(DaqError::DeviceNotInitialized);
        }
        self.started_at = Some(Instant::now());
        self.delivered = 0;
        self.backlog = 0;
        self.apa_cursor = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        self.started_at = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DaqError> {
        self.started_at = None;
        self.task_created = false;
        Ok(())
    }

    fn read_one_sample_per_channel(&mut self) -> Result<ChannelData, DaqError> {
        if self.started_at.is_none() {
            return Err(DaqError::TaskNotRunning);
        }
        self.pace()?;
        let physical = self.next_physical();
        self.delivered += 1;
        Ok(self.scaling.to_volts(&physical))
    }

    fn start_pulse(&mut self, _low: Duration, _high: Duration) -> Result<(), DaqError> {
        self.handle.pulses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_pulse_done(&mut self, _timeout: Duration) -> Result<bool, DaqError> {
        Ok(!self.stuck_pulse)
    }
}
