use std::time::Duration;

use crate::daq::Daq;
use crate::error::DaqError;

/// Dispara el estímulo externo. Bloquea hasta que el pulso termina, de modo
/// que la muestra que se marque después queda alineada con el disparo
pub trait StimulusTrigger {
    fn trigger(&mut self) -> Result<(), DaqError>;
}

/// Forma del pulso digital que recibe la caja de retardo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseShape {
    pub low: Duration,
    pub high: Duration,
    pub timeout: Duration,
}

impl PulseShape {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            low: settings.pulse_low(),
            high: settings.pulse_high(),
            timeout: settings.pulse_timeout(),
        }
    }
}

/// Disparo real: un pulso finito en la salida del contador del dispositivo
pub struct PulseTrigger<'a> {
    daq: &'a mut Daq,
    shape: PulseShape,
    fired: usize,
}

impl<'a> PulseTrigger<'a> {
    pub fn new(daq: &'a mut Daq, shape: PulseShape) -> Self {
        Self { daq, shape, fired: 0 }
    }

    pub fn fired(&self) -> usize {
        self.fired
    }
}

impl StimulusTrigger for PulseTrigger<'_> {
    fn trigger(&mut self) -> Result<(), DaqError> {
        self.daq
            .emit_pulse(self.shape.low, self.shape.high, self.shape.timeout)?;
        self.fired += 1;
        tracing::debug!("Pulso de estímulo #{} emitido", self.fired);
        Ok(())
    }
}

/// Disparador que no hace nada; para ensayos sin estimulador conectado
#[derive(Debug, Default)]
pub struct NoTrigger;

impl StimulusTrigger for NoTrigger {
    fn trigger(&mut self) -> Result<(), DaqError> {
        Ok(())
    }
}
