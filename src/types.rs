use serde::{Deserialize, Serialize};

/// Número de canales analógicos leídos por tick: [Fx, Fy, Fz, Mx, My, Mz, EMG1, EMG2]
pub const NUM_CHANNELS: usize = 8;

// Índices de los ejes de la plataforma y de los canales EMG.
// Dependen de las entradas analógicas usadas en la DAQ, en orden ascendente.
pub const FX: usize = 0;
pub const FY: usize = 1;
pub const FZ: usize = 2;
pub const MX: usize = 3;
pub const MY: usize = 4;
pub const MZ: usize = 5;
pub const EMG_1: usize = 6; // EMG físico #7 (tibial)
pub const EMG_2: usize = 7; // EMG físico #6 (sóleo)

/// Offset en z de la plataforma de fuerza, en metros
pub const Z_OFFSET: f64 = -0.040934;

/// Fuerza vertical mínima (N) para que el CoP esté definido
pub const MINIMUM_VERTICAL_FORCE: f64 = 10.0;

/// Duración (ms) de la bipedestación quieta antes de indicar el paso
pub const QUIET_STANCE_DURATION_MS: u64 = 5_000;

/// Segundos visibles en las gráficas antes de "dar la vuelta"
pub const SECONDS_TO_SHOW: f64 = 5.0;

/// Frecuencia de muestreo por defecto (Hz)
pub const SAMPLING_RATE: f64 = 1_000.0;

/// Vector crudo de un tick, ya convertido a unidades físicas
pub type ChannelData = [f64; NUM_CHANNELS];

/// Una muestra de la plataforma + EMG, con la marca de estímulo
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    pub channels: ChannelData,
    pub stim: bool,
}

impl Sample {
    pub fn new(channels: ChannelData) -> Self {
        Self {
            channels,
            stim: false,
        }
    }

    pub fn fx(&self) -> f64 {
        self.channels[FX]
    }

    pub fn fy(&self) -> f64 {
        self.channels[FY]
    }

    pub fn fz(&self) -> f64 {
        self.channels[FZ]
    }

    pub fn mx(&self) -> f64 {
        self.channels[MX]
    }

    pub fn my(&self) -> f64 {
        self.channels[MY]
    }

    pub fn mz(&self) -> f64 {
        self.channels[MZ]
    }

    pub fn emg_tibialis(&self) -> f64 {
        self.channels[EMG_1]
    }

    pub fn emg_soleus(&self) -> f64 {
        self.channels[EMG_2]
    }

    /// Copia de la muestra marcada con el estímulo
    pub fn with_stim(mut self) -> Self {
        self.stim = true;
        self
    }
}

/// Tipo de ensayo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialType {
    /// El estímulo se dispara al detectar la APA
    Step,
    /// Estímulos periódicos sin depender de la fuerza
    Standing,
}

impl TrialType {
    pub fn label(&self) -> &'static str {
        match self {
            TrialType::Step => "Step Trial",
            TrialType::Standing => "Standing Trial",
        }
    }

    /// Fragmento usado en el nombre del archivo exportado
    pub fn file_tag(&self) -> &'static str {
        match self {
            TrialType::Step => "Stepping",
            TrialType::Standing => "Standing",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "Step Trial" => Some(TrialType::Step),
            "Standing Trial" => Some(TrialType::Standing),
            _ => None,
        }
    }
}

/// Configuración del estimulador conectado a la caja de retardo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimulatorSetup {
    None,
    Test,
    Conditioned,
}

impl StimulatorSetup {
    pub fn label(&self) -> &'static str {
        match self {
            StimulatorSetup::None => "None",
            StimulatorSetup::Test => "Test",
            StimulatorSetup::Conditioned => "Conditioned",
        }
    }

    /// Con "None" el ensayo corre sin estímulo
    pub fn stimulus_enabled(&self) -> bool {
        !matches!(self, StimulatorSetup::None)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "none" => Some(StimulatorSetup::None),
            "test" => Some(StimulatorSetup::Test),
            "conditioned" => Some(StimulatorSetup::Conditioned),
            _ => None,
        }
    }
}

/// Datos del paciente requeridos antes de cualquier captura
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demographics {
    pub patient_id: String,
    pub foot_measurement: String,
}

impl Demographics {
    /// Ambos campos deben quedar no vacíos tras recortar espacios
    pub fn new(patient_id: &str, foot_measurement: &str) -> Option<Self> {
        let patient_id = patient_id.trim();
        let foot_measurement = foot_measurement.trim();
        if patient_id.is_empty() || foot_measurement.is_empty() {
            return None;
        }
        Some(Self {
            patient_id: patient_id.to_string(),
            foot_measurement: foot_measurement.to_string(),
        })
    }
}

/// Convierte una duración en ms a número de muestras para una frecuencia dada
pub fn ms_to_samples(ms: u64, sample_rate: f64) -> usize {
    ((ms as f64) * sample_rate / 1_000.0).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demographics_trimmed() {
        let d = Demographics::new("  P001 ", " 27cm").unwrap();
        assert_eq!(d.patient_id, "P001");
        assert_eq!(d.foot_measurement, "27cm");
        assert!(Demographics::new("P001", "   ").is_none());
    }

    #[test]
    fn test_quiet_stance_samples_at_1khz() {
        assert_eq!(ms_to_samples(QUIET_STANCE_DURATION_MS, SAMPLING_RATE), 5_000);
        assert_eq!(ms_to_samples(500, 200.0), 100);
    }

    #[test]
    fn test_stimulator_setup_labels() {
        assert_eq!(StimulatorSetup::from_label("Conditioned"), Some(StimulatorSetup::Conditioned));
        assert!(!StimulatorSetup::None.stimulus_enabled());
        assert!(StimulatorSetup::Test.stimulus_enabled());
        assert_eq!(TrialType::from_label("Step Trial"), Some(TrialType::Step));
    }
}
