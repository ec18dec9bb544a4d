use std::path::PathBuf;
use thiserror::Error;

/// Errores de la frontera con el hardware (tarea de adquisición + pulso)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    #[error("device not initialized: create a task before using it")]
    DeviceNotInitialized,

    #[error("a task is already active on this device: close it before creating another")]
    TaskAlreadyActive,

    #[error("task is not running: start the task first")]
    TaskNotRunning,

    #[error("task is already running")]
    TaskAlreadyRunning,

    #[error("acquisition overrun: {backlog} samples pending (hardware buffer holds {capacity})")]
    AcquisitionOverrun { backlog: usize, capacity: usize },

    #[error("pulse busy: the previous stimulus pulse has not completed")]
    PulseBusy,

    #[error("device self-test failed: {0}")]
    SelfTestFailed(String),

    #[error("hardware error: {0}")]
    Hardware(String),
}

/// Errores del protocolo (calibración, ensayos, exportación)
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("threshold not set: collect and accept at least one baseline trial first")]
    ThresholdNotSet,

    #[error("no APA detected: the trial has no peak or valley above height/prominence limits")]
    NoApaDetected,

    #[error("precondition not met: {0}")]
    PreconditionNotMet(&'static str),

    #[error("invalid export path: {0:?}")]
    InvalidExportPath(PathBuf),

    #[error("invalid state: cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DAQ error: {0}")]
    Daq(#[from] DaqError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ProtocolError {
    /// Un overrun invalida el ensayo en curso y exige rearmar la tarea
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Daq(DaqError::AcquisitionOverrun { .. })
                | ProtocolError::Daq(DaqError::SelfTestFailed(_))
        )
    }
}
