use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{
    ms_to_samples, ChannelData, EMG_1, EMG_2, MINIMUM_VERTICAL_FORCE, QUIET_STANCE_DURATION_MS,
    SAMPLING_RATE, SECONDS_TO_SHOW, Z_OFFSET,
};

/// Sensibilidad por canal (unidad física por voltio) del amplificador AMTI Gen5.
/// Rango de ±5 V sobre los rangos de fuerza/momento; cambian con la ganancia y
/// la excitación. Los EMG pasan sin escalar.
pub const DEFAULT_SENSITIVITY: ChannelData = [
    192.73 / 5.0,  // Fx (N/V)
    193.55 / 5.0,  // Fy
    1504.76 / 5.0, // Fz
    155.80 / 5.0,  // Mx (N·m/V)
    154.96 / 5.0,  // My
    37.77 / 5.0,   // Mz
    1.0,           // EMG tibial (V)
    1.0,           // EMG sóleo (V)
];

/// Configuración completa de la sesión, leída desde JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Nombre del dispositivo DAQ (p. ej. "Dev1")
    pub device_name: String,
    /// Canales analógicos físicos, en orden ascendente
    pub analog_channels: String,
    /// Canal del contador que genera el pulso del estímulo
    pub pulse_channel: String,
    /// Frecuencia del reloj de muestreo (Hz)
    pub sample_rate: f64,
    /// Conversión voltio -> unidad física por canal
    pub sensitivity: ChannelData,
    /// Muestras que el buffer del hardware retiene antes de desbordar
    pub hardware_buffer_samples: usize,
    pub platform: PlatformSettings,
    pub protocol: ProtocolSettings,
    pub standing: StandingSettings,
    pub apa: ApaDetectionSettings,
    pub pulse: PulseSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub z_offset: f64,
    pub minimum_vertical_force: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub quiet_stance_ms: u64,
    /// Pausa entre la bipedestación quieta y el cuerpo del ensayo
    pub settle_ms: u64,
    pub seconds_to_show: f64,
    /// Porcentaje inicial del umbral
    pub threshold_percentage: u8,
    /// Periodo de refresco de la vista en vivo
    pub display_refresh_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandingSettings {
    pub duration_s: f64,
    pub stimulus_interval_s: f64,
    pub max_stimuli: usize,
}

/// Constantes de `find_peaks` para la APA. Ajustadas a una ganancia concreta
/// del amplificador; recalibrar si cambia la configuración del hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApaDetectionSettings {
    pub min_height: f64,
    pub min_prominence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseSettings {
    pub low_time_us: u64,
    pub high_time_us: u64,
    pub timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: "Dev1".to_string(),
            analog_channels: "ai1:8".to_string(),
            pulse_channel: "ctr0".to_string(),
            sample_rate: SAMPLING_RATE,
            sensitivity: DEFAULT_SENSITIVITY,
            hardware_buffer_samples: 2_000,
            platform: PlatformSettings::default(),
            protocol: ProtocolSettings::default(),
            standing: StandingSettings::default(),
            apa: ApaDetectionSettings::default(),
            pulse: PulseSettings::default(),
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            z_offset: Z_OFFSET,
            minimum_vertical_force: MINIMUM_VERTICAL_FORCE,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            quiet_stance_ms: QUIET_STANCE_DURATION_MS,
            settle_ms: 500,
            seconds_to_show: SECONDS_TO_SHOW,
            threshold_percentage: 5,
            display_refresh_ms: 50,
        }
    }
}

impl Default for StandingSettings {
    fn default() -> Self {
        Self {
            duration_s: 95.0,
            stimulus_interval_s: 10.0,
            max_stimuli: 10,
        }
    }
}

impl Default for ApaDetectionSettings {
    fn default() -> Self {
        Self {
            min_height: 10.0,
            min_prominence: 10.0,
        }
    }
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            low_time_us: 50,
            high_time_us: 50,
            timeout_ms: 100,
        }
    }
}

impl Settings {
    /// Carga la configuración desde un archivo JSON; las claves ausentes
    /// toman el valor por defecto
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("No se pudo leer la configuración {:?}", path))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("JSON inválido en {:?}", path))?;
        settings
            .validate()
            .with_context(|| format!("Configuración inconsistente en {:?}", path))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |msg: String| Err(ProtocolError::InvalidConfig(msg));

        if !(self.sample_rate > 0.0) {
            return invalid(format!("sample_rate must be positive, got {}", self.sample_rate));
        }
        if self.quiet_stance_samples() == 0 {
            return invalid("quiet stance window is shorter than one sample".into());
        }
        if self.display_capacity() == 0 {
            return invalid("display window is shorter than one sample".into());
        }
        if self.hardware_buffer_samples == 0 {
            return invalid("hardware_buffer_samples must be at least 1".into());
        }
        if !(1..=100).contains(&self.protocol.threshold_percentage) {
            return invalid(format!(
                "threshold_percentage must be within 1..=100, got {}",
                self.protocol.threshold_percentage
            ));
        }
        if self.sensitivity.iter().any(|s| !s.is_finite() || *s == 0.0) {
            return invalid("every channel sensitivity must be finite and non-zero".into());
        }
        // El EMG llega ya en voltios y se guarda sin escalar
        for channel in [EMG_1, EMG_2] {
            if self.sensitivity[channel] != 1.0 {
                return invalid(format!(
                    "EMG channel {} is recorded unscaled: sensitivity must be 1.0, got {}",
                    channel, self.sensitivity[channel]
                ));
            }
        }
        self.standing_protocol()?;
        Ok(())
    }

    pub fn quiet_stance_samples(&self) -> usize {
        ms_to_samples(self.protocol.quiet_stance_ms, self.sample_rate)
    }

    pub fn settle_samples(&self) -> usize {
        ms_to_samples(self.protocol.settle_ms, self.sample_rate)
    }

    /// Capacidad del buffer de visualización (segundos visibles × frecuencia)
    pub fn display_capacity(&self) -> usize {
        (self.protocol.seconds_to_show * self.sample_rate).round() as usize
    }

    pub fn display_refresh(&self) -> Duration {
        Duration::from_millis(self.protocol.display_refresh_ms.max(1))
    }

    pub fn pulse_low(&self) -> Duration {
        Duration::from_micros(self.pulse.low_time_us)
    }

    pub fn pulse_high(&self) -> Duration {
        Duration::from_micros(self.pulse.high_time_us)
    }

    pub fn pulse_timeout(&self) -> Duration {
        Duration::from_millis(self.pulse.timeout_ms)
    }

    /// Duración, intervalo y máximo de estímulos del ensayo de pie,
    /// validados como un único valor
    pub fn standing_protocol(&self) -> Result<StandingProtocol, ProtocolError> {
        let to_samples = |s: f64| (s * self.sample_rate).round() as usize;
        StandingProtocol::new(
            to_samples(self.standing.duration_s),
            to_samples(self.standing.stimulus_interval_s),
            self.standing.max_stimuli,
        )
    }
}

/// Temporización del ensayo de pie, en muestras
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandingProtocol {
    duration: usize,
    interval: usize,
    max_stimuli: usize,
}

impl StandingProtocol {
    /// La duración y el intervalo deben implicar como mucho `max_stimuli`
    /// estímulos; si no, la configuración se rechaza
    pub fn new(duration: usize, interval: usize, max_stimuli: usize) -> Result<Self, ProtocolError> {
        if interval == 0 || duration == 0 {
            return Err(ProtocolError::InvalidConfig(
                "standing trial duration and stimulus interval must be at least one sample".into(),
            ));
        }
        let implied = duration / interval;
        if implied > max_stimuli {
            return Err(ProtocolError::InvalidConfig(format!(
                "standing trial of {} samples every {} fires {} stimuli, above the maximum of {}",
                duration, interval, implied, max_stimuli
            )));
        }
        Ok(Self {
            duration,
            interval,
            max_stimuli,
        })
    }

    pub fn duration(&self) -> usize {
        self.duration
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    pub fn max_stimuli(&self) -> usize {
        self.max_stimuli
    }

    /// Estímulos que se dispararán en un ensayo completo
    pub fn expected_stimuli(&self) -> usize {
        (self.duration / self.interval).min(self.max_stimuli)
    }
}

/// Crea una configuración en disco con los valores por defecto
pub fn write_default(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(&Settings::default())?;
    fs::write(path, json).with_context(|| format!("No se pudo escribir {:?}", path))?;
    ensure!(path.exists(), "El archivo {:?} no quedó escrito", path);
    Ok(())
}
