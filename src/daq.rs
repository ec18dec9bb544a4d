use std::time::Duration;

use crate::config::Settings;
use crate::error::DaqError;
use crate::types::{ChannelData, Sample, NUM_CHANNELS};

/// Descripción de la tarea de adquisición: canales físicos y reloj de muestreo
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub device_name: String,
    pub analog_channels: String,
    pub pulse_channel: String,
    pub sample_rate: f64,
    /// Rango de entrada en voltios (±)
    pub voltage_range: f64,
}

impl TaskSpec {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            device_name: settings.device_name.clone(),
            analog_channels: settings.analog_channels.clone(),
            pulse_channel: settings.pulse_channel.clone(),
            sample_rate: settings.sample_rate,
            voltage_range: 5.0,
        }
    }

    /// Nombre completo de los canales, p. ej. "Dev1/ai1:8"
    pub fn physical_channels(&self) -> String {
        format!("{}/{}", self.device_name, self.analog_channels)
    }
}

/// Frontera con el driver del hardware. Las implementaciones hablan con el
/// dispositivo real o lo simulan; el manejo de estados vive en [`Daq`]
pub trait DaqBackend: Send {
    /// Autotest del dispositivo al abrirlo
    fn self_test(&mut self) -> Result<(), DaqError>;

    fn create_task(&mut self, spec: &TaskSpec) -> Result<(), DaqError>;

    fn start(&mut self) -> Result<(), DaqError>;

    fn stop(&mut self) -> Result<(), DaqError>;

    fn close(&mut self) -> Result<(), DaqError>;

    /// Lee una muestra por canal, en voltios, bloqueando hasta el siguiente
    /// tick del reloj de hardware
    fn read_one_sample_per_channel(&mut self) -> Result<ChannelData, DaqError>;

    /// Arranca un pulso finito (bajo, alto) en la salida digital
    fn start_pulse(&mut self, low: Duration, high: Duration) -> Result<(), DaqError>;

    /// Espera a que el pulso en curso termine. `Ok(false)` si vence el plazo
    fn wait_pulse_done(&mut self, timeout: Duration) -> Result<bool, DaqError>;
}

/// Conversión voltio -> unidades físicas por canal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScaling {
    sensitivity: ChannelData,
}

impl ChannelScaling {
    pub fn new(sensitivity: ChannelData) -> Self {
        Self { sensitivity }
    }

    pub fn apply(&self, volts: &ChannelData) -> ChannelData {
        let mut out = [0.0; NUM_CHANNELS];
        for (i, v) in volts.iter().enumerate() {
            out[i] = v * self.sensitivity[i];
        }
        out
    }

    /// Inversa de `apply`, usada por el dispositivo simulado
    pub fn to_volts(&self, physical: &ChannelData) -> ChannelData {
        let mut out = [0.0; NUM_CHANNELS];
        for (i, v) in physical.iter().enumerate() {
            out[i] = v / self.sensitivity[i];
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    NoTask,
    Created,
    Running,
}

/// Manejador único del dispositivo. Solo existe una tarea activa por
/// manejador; se mueve al hilo de adquisición y vuelve a quien lo lanzó al
/// terminar, de modo que no puede cerrarse mientras el bucle sigue vivo
pub struct Daq {
    backend: Box<dyn DaqBackend>,
    scaling: ChannelScaling,
    task: TaskState,
    pulse_in_flight: bool,
    spec: Option<TaskSpec>,
}

impl Daq {
    /// Abre el dispositivo y ejecuta el autotest; un fallo aquí es fatal
    pub fn open(mut backend: Box<dyn DaqBackend>, scaling: ChannelScaling) -> Result<Self, DaqError> {
        backend.self_test()?;
        tracing::info!("Autotest del dispositivo superado");
        Ok(Self {
            backend,
            scaling,
            task: TaskState::NoTask,
            pulse_in_flight: false,
            spec: None,
        })
    }

    pub fn create_task(&mut self, spec: &TaskSpec) -> Result<(), DaqError> {
        if self.task != TaskState::NoTask {
            return Err(DaqError::TaskAlreadyActive);
        }
        self.backend.create_task(spec)?;
        self.task = TaskState::Created;
        self.spec = Some(spec.clone());
        tracing::info!(
            "Tarea creada en {} a {} Hz",
            spec.physical_channels(),
            spec.sample_rate
        );
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), DaqError> {
        match self.task {
            TaskState::NoTask => Err(DaqError::DeviceNotInitialized),
            TaskState::Running => Err(DaqError::TaskAlreadyRunning),
            TaskState::Created => {
                self.backend.start()?;
                self.task = TaskState::Running;
                Ok(())
            }
        }
    }

    pub fn stop(&mut self) -> Result<(), DaqError> {
        match self.task {
            TaskState::NoTask => Err(DaqError::DeviceNotInitialized),
            TaskState::Created => Err(DaqError::TaskNotRunning),
            TaskState::Running => {
                self.backend.stop()?;
                self.task = TaskState::Created;
                Ok(())
            }
        }
    }

    /// Cierra la tarea (parándola si hace falta). Sin tarea no hace nada
    pub fn close(&mut self) -> Result<(), DaqError> {
        if self.task == TaskState::NoTask {
            return Ok(());
        }
        if self.task == TaskState::Running {
            self.backend.stop()?;
        }
        self.backend.close()?;
        self.task = TaskState::NoTask;
        self.spec = None;
        tracing::info!("Tarea cerrada");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task == TaskState::Running
    }

    pub fn has_task(&self) -> bool {
        self.task != TaskState::NoTask
    }

    pub fn spec(&self) -> Option<&TaskSpec> {
        self.spec.as_ref()
    }

    /// Lee una muestra ya escalada a unidades físicas
    pub fn read(&mut self) -> Result<Sample, DaqError> {
        match self.task {
            TaskState::NoTask => Err(DaqError::DeviceNotInitialized),
            TaskState::Created => Err(DaqError::TaskNotRunning),
            TaskState::Running => {
                let volts = self.backend.read_one_sample_per_channel()?;
                Ok(Sample::new(self.scaling.apply(&volts)))
            }
        }
    }

    /// Emite un pulso y bloquea hasta que el hardware confirma que terminó.
    /// Si el pulso anterior no llegó a completarse se rechaza con `PulseBusy`
    pub fn emit_pulse(&mut self, low: Duration, high: Duration, timeout: Duration) -> Result<(), DaqError> {
        if self.task == TaskState::NoTask {
            return Err(DaqError::DeviceNotInitialized);
        }
        if self.pulse_in_flight {
            // Dar al pulso atascado una última oportunidad de terminar
            if !self.backend.wait_pulse_done(Duration::ZERO)? {
                return Err(DaqError::PulseBusy);
            }
            self.pulse_in_flight = false;
        }

        self.backend.start_pulse(low, high)?;
        self.pulse_in_flight = true;
        if self.backend.wait_pulse_done(timeout)? {
            self.pulse_in_flight = false;
            Ok(())
        } else {
            tracing::warn!("El pulso no terminó en {:?}", timeout);
            Err(DaqError::PulseBusy)
        }
    }
}
