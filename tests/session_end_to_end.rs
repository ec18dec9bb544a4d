use std::time::{Duration, Instant};

use psi_collect::acquisition::{Ack, Acquisition, Command, Event};
use psi_collect::config::Settings;
use psi_collect::daq::{ChannelScaling, Daq};
use psi_collect::error::{DaqError, ProtocolError};
use psi_collect::export::load_record;
use psi_collect::signal::Platform;
use psi_collect::simulated::{Pacing, SimulatedDaq, SimulationHandle, SubjectParams};
use psi_collect::trial::TrialState;
use psi_collect::types::StimulatorSetup;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.protocol.quiet_stance_ms = 200;
    settings.protocol.settle_ms = 50;
    settings
}

fn start(settings: &Settings) -> (Acquisition, SimulationHandle) {
    let scaling = ChannelScaling::new(settings.sensitivity);
    let sim = SimulatedDaq::new(
        SubjectParams::default(),
        scaling,
        Pacing::RealTime,
        settings.hardware_buffer_samples,
    );
    let handle = sim.handle();
    let daq = Daq::open(Box::new(sim), scaling).unwrap();
    (Acquisition::spawn(daq, settings).unwrap(), handle)
}

/// Espera un evento que cumpla `pred`, descartando los demás
fn wait_for(acquisition: &Acquisition, pred: impl Fn(&Event) -> bool) -> Event {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = acquisition
            .events()
            .recv_timeout(remaining)
            .expect("timed out waiting for event");
        if pred(&event) {
            return event;
        }
    }
}

fn ok(acquisition: &Acquisition, command: Command) -> Ack {
    acquisition.request(command).unwrap()
}

#[test]
fn baseline_then_step_trial_exports_one_stimulus() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings();
    let (acquisition, sim) = start(&settings);

    ok(
        &acquisition,
        Command::SetDemographics {
            patient_id: "P042".into(),
            foot_measurement: "26.5".into(),
        },
    );
    ok(&acquisition, Command::SetExportDir(dir.path().to_path_buf()));
    ok(&acquisition, Command::SetStimulatorSetup(StimulatorSetup::Test));
    ok(&acquisition, Command::StartStreaming);

    // Ensayo basal: quieta, paso, revisión
    ok(&acquisition, Command::StartBaseline);
    ok(&acquisition, Command::ConfirmZero);
    wait_for(&acquisition, |e| *e == Event::BaselineQuietStanceComplete);
    sim.cue_step();
    std::thread::sleep(Duration::from_millis(400));
    let review = match ok(&acquisition, Command::FinishBaselineStep) {
        Ack::BaselineReview(review) => review,
        other => panic!("unexpected ack {:?}", other),
    };
    let apa = review.apa.expect("simulated step must produce an APA");
    assert!((apa - 40.0).abs() < 2.0, "apa = {}", apa);

    let threshold = match ok(&acquisition, Command::AcceptBaseline) {
        Ack::BaselineAccepted(t) => t,
        other => panic!("unexpected ack {:?}", other),
    };
    assert_eq!(threshold.trials, 1);
    assert!((threshold.value - apa.abs() * 0.05).abs() < 1e-9);
    ok(&acquisition, Command::StopBaseline { save: true });

    // Ensayo de paso
    ok(&acquisition, Command::StartTrial);
    ok(&acquisition, Command::ConfirmZero);
    wait_for(&acquisition, |e| {
        *e == Event::TrialStateChanged {
            from: TrialState::QuietStance,
            to: TrialState::Streaming,
        }
    });
    sim.cue_step();
    wait_for(&acquisition, |e| matches!(e, Event::StimulusFired { count: 1, .. }));
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(ok(&acquisition, Command::Stop), Ack::TrialState(TrialState::Complete));
    let path = match ok(&acquisition, Command::AcceptTrial { notes: "end to end".into() }) {
        Ack::Exported(path) => path,
        other => panic!("unexpected ack {:?}", other),
    };
    assert_eq!(sim.pulses(), 1);
    acquisition.shutdown().unwrap();

    assert_eq!(path.file_name().unwrap(), "P042_Stepping_Test.csv");
    let record = load_record(&path).unwrap();
    assert_eq!(record.meta("Patient ID"), Some("P042"));
    assert_eq!(record.meta("Stimulus Enabled"), Some("True"));
    assert_eq!(record.samples.iter().filter(|s| s.stim).count(), 1);
    assert!(record.samples.len() > settings.quiet_stance_samples());

    let platform = Platform::default();
    for (sample, stored) in record.samples.iter().zip(&record.cop) {
        assert_eq!(platform.cop(sample).as_option(), *stored);
    }
}

#[test]
fn overrun_aborts_trial_and_requires_rearm() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings();
    let (acquisition, sim) = start(&settings);

    ok(
        &acquisition,
        Command::SetDemographics {
            patient_id: "P043".into(),
            foot_measurement: "25".into(),
        },
    );
    ok(&acquisition, Command::SetExportDir(dir.path().to_path_buf()));
    ok(&acquisition, Command::StartStreaming);
    ok(&acquisition, Command::StartBaseline);
    ok(&acquisition, Command::ConfirmZero);

    sim.stall(settings.hardware_buffer_samples + 1);
    let fatal = wait_for(&acquisition, |e| matches!(e, Event::Fatal(_)));
    assert!(matches!(fatal, Event::Fatal(DaqError::AcquisitionOverrun { .. })));

    // La captura se perdió y sin rearmar no se puede seguir
    let err = acquisition.request(Command::FinishBaselineStep).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidState { .. }));
    let err = acquisition.request(Command::StartBaseline).unwrap_err();
    assert!(matches!(err, ProtocolError::PreconditionNotMet(_)));

    ok(&acquisition, Command::StartStreaming);
    ok(&acquisition, Command::StartBaseline);
    acquisition.shutdown().unwrap();
}
