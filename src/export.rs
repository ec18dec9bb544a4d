use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Local};
use csv::{ReaderBuilder, WriterBuilder};

use crate::error::ProtocolError;
use crate::signal::{Cop, Platform};
use crate::trial::TrialRecord;
use crate::types::{Demographics, Sample, StimulatorSetup, TrialType, NUM_CHANNELS};

/// Cabecera de las columnas de datos, en el orden de exportación
pub const DATA_HEADER: [&str; 11] = [
    "Fx (N)",
    "Fy (N)",
    "Fz (N)",
    "Mx (N/m)",
    "My (N/m)",
    "Mz (N/m)",
    "EMG_Tibialis (V)",
    "EMG_Soleus (V)",
    "CoPx (m)",
    "CoPy (m)",
    "Stim",
];

const KEY_EXPORTED_AT: &str = "Date/Time of Export:";
const KEY_PATIENT: &str = "Patient ID:";
const KEY_FOOT: &str = "Foot Measurement:";
const KEY_TRIAL_TYPE: &str = "Trial Type:";
const KEY_THRESHOLD: &str = "APA Threshold:";
const KEY_PERCENTAGE: &str = "Threshold Percentage:";
const KEY_STIM_ENABLED: &str = "Stimulus Enabled:";
const KEY_SETUP: &str = "Stimulator Setup:";
const KEY_NOTES: &str = "Collection Notes:";

/// Datos de cabecera que no salen del propio ensayo
#[derive(Debug, Clone)]
pub struct TrialMetadata {
    pub exported_at: DateTime<Local>,
    pub demographics: Demographics,
    pub stimulator_setup: StimulatorSetup,
    pub notes: String,
}

impl TrialMetadata {
    pub fn now(demographics: Demographics, stimulator_setup: StimulatorSetup, notes: impl Into<String>) -> Self {
        Self {
            exported_at: Local::now(),
            demographics,
            stimulator_setup,
            notes: notes.into(),
        }
    }
}

fn bool_cell(v: bool) -> String {
    let text = if v { "True" } else { "False" };
    text.to_string()
}

/// Construye las filas del archivo: metadatos clave/valor, cabecera y una
/// fila por muestra (bipedestación quieta primero). El CoP se recalcula a
/// partir de los canales crudos; si es inválido la celda queda vacía
pub fn build_record(record: &TrialRecord, metadata: &TrialMetadata, platform: &Platform) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::with_capacity(record.len() + 10);

    let pairs = [
        (KEY_EXPORTED_AT, metadata.exported_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        (KEY_PATIENT, metadata.demographics.patient_id.clone()),
        (KEY_FOOT, metadata.demographics.foot_measurement.clone()),
        (KEY_TRIAL_TYPE, record.trial_type.label().to_string()),
        (KEY_THRESHOLD, record.threshold.value.to_string()),
        (KEY_PERCENTAGE, record.threshold.percentage.to_string()),
        (KEY_STIM_ENABLED, bool_cell(record.stimulus_enabled)),
        (KEY_SETUP, metadata.stimulator_setup.label().to_string()),
        (KEY_NOTES, metadata.notes.clone()),
    ];
    for (key, value) in pairs {
        rows.push(vec![key.to_string(), value]);
    }

    rows.push(DATA_HEADER.iter().map(|h| h.to_string()).collect());

    for sample in record.samples() {
        let mut row: Vec<String> = sample.channels.iter().map(|v| v.to_string()).collect();
        match platform.cop(sample) {
            Cop::Valid { x, y } => {
                row.push(x.to_string());
                row.push(y.to_string());
            }
            Cop::Invalid => {
                row.push(String::new());
                row.push(String::new());
            }
        }
        row.push(if sample.stim { "1" } else { "0" }.to_string());
        rows.push(row);
    }

    rows
}

/// Nombre estándar: `{paciente}_{Stepping|Standing}_{montaje|NoStimulus}.csv`
pub fn generate_filename(patient_id: &str, trial_type: TrialType, setup: StimulatorSetup) -> String {
    let setup = if setup.stimulus_enabled() {
        setup.label()
    } else {
        "NoStimulus"
    };
    format!("{}_{}_{}.csv", patient_id, trial_type.file_tag(), setup)
}

/// Ruta libre en `dir` para `file_name`; si ya existe añade `_2`, `_3`...
pub fn available_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{}", ext)),
        None => (file_name, String::new()),
    };
    (2..)
        .map(|n| dir.join(format!("{}_{}{}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Escribe las filas como CSV UTF-8
pub fn write_record(path: &Path, rows: &[Vec<String>]) -> Result<(), ProtocolError> {
    let parent_ok = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => true,
        Some(p) => p.is_dir(),
        None => false,
    };
    if !parent_ok || path.is_dir() {
        return Err(ProtocolError::InvalidExportPath(path.to_path_buf()));
    }

    let mut writer = WriterBuilder::new().flexible(true).from_path(path)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    tracing::info!("Ensayo exportado en {:?} ({} filas)", path, rows.len());
    Ok(())
}

/// Archivo exportado leído de vuelta
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecord {
    /// Metadatos en el orden del archivo (clave sin los dos puntos)
    pub metadata: Vec<(String, String)>,
    pub samples: Vec<Sample>,
    /// CoP tal y como quedó escrito; `None` para celdas vacías
    pub cop: Vec<Option<(f64, f64)>>,
}

impl LoadedRecord {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn trial_type(&self) -> Option<TrialType> {
        self.meta("Trial Type").and_then(TrialType::from_label)
    }
}

/// Lee un ensayo exportado con `write_record`
pub fn load_record(path: impl AsRef<Path>) -> Result<LoadedRecord> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("No se pudo abrir el CSV {:?}", path))?;

    let mut metadata = Vec::new();
    let mut samples = Vec::new();
    let mut cop = Vec::new();
    let mut in_data = false;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Fila {} inválida en {:?}", row_idx + 1, path))?;

        if !in_data {
            if record.get(0) == Some(DATA_HEADER[0]) {
                ensure!(
                    record.iter().eq(DATA_HEADER.iter().copied()),
                    "Cabecera inesperada en la fila {} de {:?}",
                    row_idx + 1,
                    path
                );
                in_data = true;
            } else {
                let key = record.get(0).unwrap_or("").trim_end_matches(':').to_string();
                let value = record.get(1).unwrap_or("").to_string();
                metadata.push((key, value));
            }
            continue;
        }

        if record.len() != DATA_HEADER.len() {
            bail!("La fila {} no tiene {} columnas", row_idx + 1, DATA_HEADER.len());
        }

        let mut channels = [0.0; NUM_CHANNELS];
        for (i, ch) in channels.iter_mut().enumerate() {
            *ch = record[i]
                .parse::<f64>()
                .with_context(|| format!("{} inválido en fila {}", DATA_HEADER[i], row_idx + 1))?;
        }

        let copx = &record[NUM_CHANNELS];
        let copy = &record[NUM_CHANNELS + 1];
        let point = if copx.is_empty() || copy.is_empty() {
            None
        } else {
            Some((copx.parse::<f64>()?, copy.parse::<f64>()?))
        };

        let stim = match &record[NUM_CHANNELS + 2] {
            "1" => true,
            "0" => false,
            other => bail!("Stim inválido '{}' en fila {}", other, row_idx + 1),
        };

        samples.push(Sample { channels, stim });
        cop.push(point);
    }

    ensure!(in_data, "El CSV {:?} no tiene la cabecera de datos", path);
    Ok(LoadedRecord {
        metadata,
        samples,
        cop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::ThresholdSnapshot;

    fn record() -> TrialRecord {
        let quiet = vec![
            Sample::new([1.0, 0.5, 700.0, 3.0, -2.0, 0.1, 0.001, 0.002]),
            Sample::new([1.2, 0.4, 701.5, 2.5, -1.5, 0.1, 0.0, 0.0]),
        ];
        let body = vec![
            Sample::new([25.0, -3.0, 650.0, 10.0, 7.5, 0.2, 0.01, -0.01]).with_stim(),
            // Pie fuera de la plataforma: CoP inválido
            Sample::new([0.1, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        ];
        TrialRecord {
            trial_type: TrialType::Step,
            threshold: ThresholdSnapshot {
                value: 2.5,
                percentage: 10,
                trials: 2,
            },
            stimulus_enabled: true,
            reference_force: 1.1,
            quiet_stance: quiet,
            body,
            apa_detected: true,
            stimuli: 1,
        }
    }

    fn metadata() -> TrialMetadata {
        TrialMetadata::now(
            Demographics::new("P001", "27").unwrap(),
            StimulatorSetup::Conditioned,
            "sin incidencias",
        )
    }

    #[test]
    fn test_layout() {
        let rows = build_record(&record(), &metadata(), &Platform::default());
        assert_eq!(rows.len(), 9 + 1 + 4);
        assert_eq!(rows[1], vec!["Patient ID:", "P001"]);
        assert_eq!(rows[3], vec!["Trial Type:", "Step Trial"]);
        assert_eq!(rows[4], vec!["APA Threshold:", "2.5"]);
        assert_eq!(rows[6], vec!["Stimulus Enabled:", "True"]);
        assert_eq!(rows[9], DATA_HEADER.to_vec());
        // Quieta primero
        assert_eq!(rows[10][0], "1");
        assert_eq!(rows[12][10], "1");
        assert_eq!(rows[13][8], "");
        assert_eq!(rows[13][10], "0");
    }

    #[test]
    fn test_round_trip_reproduces_cop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trial.csv");
        let platform = Platform::default();
        let original = record();
        write_record(&path, &build_record(&original, &metadata(), &platform)).unwrap();

        let loaded = load_record(&path).unwrap();
        assert_eq!(loaded.meta("Patient ID"), Some("P001"));
        assert_eq!(loaded.meta("Collection Notes"), Some("sin incidencias"));
        assert_eq!(loaded.trial_type(), Some(TrialType::Step));
        assert_eq!(loaded.samples.len(), 4);

        let expected: Vec<Sample> = original.samples().copied().collect();
        assert_eq!(loaded.samples, expected);
        for (sample, written) in loaded.samples.iter().zip(&loaded.cop) {
            assert_eq!(platform.cop(sample).as_option(), *written);
        }
        assert_eq!(loaded.cop[3], None);
    }

    #[test]
    fn test_missing_directory_is_invalid_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("trial.csv");
        let rows = build_record(&record(), &metadata(), &Platform::default());
        assert!(matches!(
            write_record(&path, &rows),
            Err(ProtocolError::InvalidExportPath(_))
        ));
        assert!(matches!(
            write_record(dir.path(), &rows),
            Err(ProtocolError::InvalidExportPath(_))
        ));
    }

    #[test]
    fn test_filenames() {
        assert_eq!(
            generate_filename("P001", TrialType::Step, StimulatorSetup::Test),
            "P001_Stepping_Test.csv"
        );
        assert_eq!(
            generate_filename("P001", TrialType::Standing, StimulatorSetup::None),
            "P001_Standing_NoStimulus.csv"
        );
    }

    #[test]
    fn test_available_path_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = available_path(dir.path(), "P001_Stepping_Test.csv");
        assert_eq!(first, dir.path().join("P001_Stepping_Test.csv"));
        std::fs::write(&first, "x").unwrap();
        let second = available_path(dir.path(), "P001_Stepping_Test.csv");
        assert_eq!(second, dir.path().join("P001_Stepping_Test_2.csv"));
    }
}
