/*
Adquisición de plataforma de fuerza + EMG con detección de APA

Flujo de una sesión desde la consola:
1. paciente <id> <pie>, dir <carpeta>, grabar
2. basal, cero, (esperar aviso) paso del sujeto, fin, aceptar | rechazar
3. cerrar-basal guardar
4. ensayo, cero, ..., stop, guardar [notas] | descartar

Para ejecutar con el dispositivo simulado:
     ./target/release/psi-collect run --auto-step 8
*/

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, tick, unbounded, Receiver};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use psi_collect::acquisition::{Ack, Acquisition, Command, Event, SharedDisplay};
use psi_collect::config::{self, Settings};
use psi_collect::daq::{ChannelScaling, Daq, TaskSpec};
use psi_collect::signal::Platform;
use psi_collect::simulated::{Pacing, SimulatedDaq, SimulationHandle, SubjectParams};
use psi_collect::trial::TrialState;
use psi_collect::types::{Sample, StimulatorSetup, TrialType};

#[derive(Parser, Debug)]
#[command(name = "psi-collect")]
#[command(version, about = "Force platform + EMG acquisition with APA-triggered stimulus", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON settings file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive collection session (default)
    Run {
        /// Simulated subject steps every N seconds
        #[arg(long)]
        auto_step: Option<f64>,

        /// Seed for the simulated noise
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Open the device, read a few samples and emit one pulse
    SelfTest {
        #[arg(long, default_value = "1000")]
        samples: usize,
    },

    /// Print the effective settings as JSON
    PrintConfig {
        /// Write the defaults to this file instead of printing
        #[arg(long)]
        write_default: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.validate()?;

    match cli.command {
        None => run(&settings, None, 7),
        Some(Commands::Run { auto_step, seed }) => run(&settings, auto_step, seed),
        Some(Commands::SelfTest { samples }) => self_test(&settings, samples),
        Some(Commands::PrintConfig { write_default }) => match write_default {
            Some(path) => {
                config::write_default(&path)?;
                println!("✅ Configuración por defecto escrita en {:?}", path);
                Ok(())
            }
            None => {
                println!("{}", serde_json::to_string_pretty(&settings)?);
                Ok(())
            }
        },
    }
}

/// Abre el dispositivo simulado con la escala de la configuración
fn open_device(settings: &Settings, subject: SubjectParams, pacing: Pacing) -> Result<(Daq, SimulationHandle)> {
    let scaling = ChannelScaling::new(settings.sensitivity);
    let sim = SimulatedDaq::new(subject, scaling, pacing, settings.hardware_buffer_samples);
    let handle = sim.handle();
    let daq = Daq::open(Box::new(sim), scaling).context("Fallo en el autotest del dispositivo")?;
    Ok((daq, handle))
}

fn self_test(settings: &Settings, samples: usize) -> Result<()> {
    println!("🔧 Autotest del dispositivo {}", settings.device_name);
    let (mut daq, handle) = open_device(settings, SubjectParams::default(), Pacing::RealTime)?;
    let spec = TaskSpec::from_settings(settings);
    daq.create_task(&spec)?;
    daq.start()?;
    println!("📡 Leyendo {} muestras de {}", samples, spec.physical_channels());

    let platform = Platform::new(settings.platform.z_offset, settings.platform.minimum_vertical_force);
    let mut fz_sum = 0.0;
    let mut valid_cop = 0usize;
    for _ in 0..samples {
        let sample = daq.read()?;
        fz_sum += sample.fz();
        if platform.cop(&sample).is_valid() {
            valid_cop += 1;
        }
    }
    let mean_fz = if samples > 0 { fz_sum / samples as f64 } else { 0.0 };
    println!("   Fz medio: {:.1} N, CoP válido en {}/{} muestras", mean_fz, valid_cop, samples);

    daq.emit_pulse(settings.pulse_low(), settings.pulse_high(), settings.pulse_timeout())?;
    println!("⚡ Pulso emitido ({} confirmado)", handle.pulses());

    daq.stop()?;
    daq.close()?;
    println!("✅ Autotest completo");
    Ok(())
}

/// Acción de la consola ya interpretada
#[derive(Debug, PartialEq)]
enum ConsoleAction {
    Send(Command),
    CueStep,
    ToggleView,
    Help,
    Quit,
}

fn parse_line(line: &str) -> Result<ConsoleAction> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        bail!("Línea vacía");
    };
    let rest: Vec<&str> = words.collect();

    let action = match head {
        "paciente" => {
            if rest.len() < 2 {
                bail!("Uso: paciente <id> <medida del pie>");
            }
            ConsoleAction::Send(Command::SetDemographics {
                patient_id: rest[0].to_string(),
                foot_measurement: rest[1..].join(" "),
            })
        }
        "dir" => {
            if rest.is_empty() {
                bail!("Uso: dir <carpeta>");
            }
            ConsoleAction::Send(Command::SetExportDir(PathBuf::from(rest.join(" "))))
        }
        "tipo" => match rest.first().copied() {
            Some("step") | Some("paso") => ConsoleAction::Send(Command::SetTrialType(TrialType::Step)),
            Some("standing") | Some("pie") => ConsoleAction::Send(Command::SetTrialType(TrialType::Standing)),
            _ => bail!("Uso: tipo step|standing"),
        },
        "estimulador" => {
            let setup = rest
                .first()
                .and_then(|s| StimulatorSetup::from_label(s))
                .context("Uso: estimulador none|test|conditioned")?;
            ConsoleAction::Send(Command::SetStimulatorSetup(setup))
        }
        "porcentaje" => {
            let pct: u8 = rest
                .first()
                .context("Uso: porcentaje <1-100>")?
                .parse()
                .context("El porcentaje debe ser un entero entre 1 y 100")?;
            ConsoleAction::Send(Command::SetThresholdPercentage(pct))
        }
        "grabar" => ConsoleAction::Send(Command::StartStreaming),
        "pausa" => ConsoleAction::Send(Command::StopStreaming),
        "basal" => ConsoleAction::Send(Command::StartBaseline),
        "cero" => ConsoleAction::Send(Command::ConfirmZero),
        "fin" => ConsoleAction::Send(Command::FinishBaselineStep),
        "aceptar" => ConsoleAction::Send(Command::AcceptBaseline),
        "rechazar" => ConsoleAction::Send(Command::RejectBaseline),
        "cerrar-basal" => match rest.first().copied() {
            Some("guardar") => ConsoleAction::Send(Command::StopBaseline { save: true }),
            Some("descartar") => ConsoleAction::Send(Command::StopBaseline { save: false }),
            _ => bail!("Uso: cerrar-basal guardar|descartar"),
        },
        "ensayo" => ConsoleAction::Send(Command::StartTrial),
        "stop" => ConsoleAction::Send(Command::Stop),
        "guardar" => ConsoleAction::Send(Command::AcceptTrial { notes: rest.join(" ") }),
        "descartar" => ConsoleAction::Send(Command::DiscardTrial),
        "estado" => ConsoleAction::Send(Command::Status),
        "paso" => ConsoleAction::CueStep,
        "vista" => ConsoleAction::ToggleView,
        "ayuda" | "?" => ConsoleAction::Help,
        "salir" | "q" => ConsoleAction::Quit,
        other => bail!("Orden desconocida '{}' (escribe 'ayuda')", other),
    };
    Ok(action)
}

fn print_help() {
    println!("Órdenes:");
    println!("  paciente <id> <pie>        → datos del paciente");
    println!("  dir <carpeta>              → carpeta de exportación");
    println!("  tipo step|standing         → tipo de ensayo");
    println!("  estimulador none|test|conditioned");
    println!("  porcentaje <1-100>         → porcentaje del umbral");
    println!("  grabar / pausa             → arrancar (o rearmar) / parar la adquisición");
    println!("  basal, cero, fin           → ensayo basal");
    println!("  aceptar / rechazar         → revisar el ensayo basal");
    println!("  cerrar-basal guardar|descartar");
    println!("  ensayo, cero, stop         → ensayo de paso o de pie");
    println!("  guardar [notas] / descartar");
    println!("  paso                       → el sujeto simulado da un paso");
    println!("  vista                      → vista en vivo on/off");
    println!("  estado, ayuda, salir\n");
}

fn print_ack(ack: Ack) {
    match ack {
        Ack::Done => println!("✅ Hecho"),
        Ack::Threshold(Some(t)) => println!("🎚️  Umbral recalculado: {:.3} N", t),
        Ack::Threshold(None) => println!("🎚️  Porcentaje cambiado (sin umbral todavía)"),
        Ack::BaselineReview(review) => {
            println!(
                "📈 Ensayo basal: {} muestras, primer pico {:?}, primer valle {:?}",
                review.samples, review.first_peak, review.first_valley
            );
            match review.apa {
                Some(apa) => println!("   APA = {:.3} N → 'aceptar' o 'rechazar'", apa),
                None => println!("⚠️  Sin APA detectada: solo se puede 'rechazar'"),
            }
        }
        Ack::BaselineAccepted(t) => println!(
            "✅ Ensayo basal guardado ({} en total), umbral {:.3} N ({}%)",
            t.trials, t.value, t.percentage
        ),
        Ack::BaselineClosed(Some(t)) => println!("✅ Ensayos basales cerrados, umbral {:.3} N", t.value),
        Ack::BaselineClosed(None) => println!("🗑️  Ensayos basales descartados"),
        Ack::TrialState(state) => println!("⏹️  Ensayo: {}", state.name()),
        Ack::Exported(path) => println!("💾 Ensayo exportado en {}", path.display()),
        Ack::Status(s) => {
            println!("📋 Estado de la sesión");
            println!("   Paciente:      {}", s.patient_id.as_deref().unwrap_or("-"));
            println!(
                "   Exportación:   {}",
                s.export_dir.map(|d| d.display().to_string()).unwrap_or_else(|| "-".into())
            );
            println!("   Adquisición:   {}", if s.streaming { "en marcha" } else { "parada" });
            println!("   Tipo:          {}", s.trial_type.label());
            println!("   Estimulador:   {}", s.stimulator_setup.label());
            println!("   Ensayo:        {}", s.trial_state.name());
            match s.threshold {
                Some(t) => println!("   Umbral:        {:.3} N ({}%, {} basales)", t.value, s.percentage, t.trials),
                None => println!("   Umbral:        sin definir ({}%)", s.percentage),
            }
            println!("   Guardados:     {}", s.trials_saved);
        }
    }
}

fn print_event(event: Event) {
    match event {
        Event::StreamingChanged(true) => println!("📡 Adquisición en marcha"),
        Event::StreamingChanged(false) => println!("⏸️  Adquisición parada"),
        Event::BaselineQuietStanceComplete => {
            println!("🦶 Bipedestación quieta completa: el sujeto puede dar el paso ('fin' al terminar)")
        }
        Event::TrialStateChanged { to, .. } => match to {
            TrialState::AwaitingZero => println!("⚖️  Pon la plataforma a cero y escribe 'cero'"),
            TrialState::QuietStance => println!("🧍 Bipedestación quieta..."),
            TrialState::Streaming => println!("🚶 ¡Paso ahora! ('stop' para terminar)"),
            TrialState::Complete => println!("🏁 Ensayo completo: 'guardar [notas]' o 'descartar'"),
            TrialState::Idle => {}
        },
        Event::StimulusFired { body_index, count } => {
            println!("⚡ Estímulo #{} en la muestra {} del ensayo", count, body_index)
        }
        Event::Fatal(e) => {
            println!("❌ {}", e);
            println!("   El ensayo en curso se perdió; escribe 'grabar' para rearmar");
        }
    }
}

/// Línea de la vista en vivo para la última muestra de la ventana
fn live_view_line(latest: &Sample, len: usize, capacity: usize, platform: &Platform) -> String {
    let cop = match platform.cop(latest).as_option() {
        Some((x, y)) => format!("CoP=({:+.4}, {:+.4}) m", x, y),
        None => "CoP=sin carga".to_string(),
    };
    format!(
        "📊 Fx={:+8.2} N  Fz={:8.2} N  {}  [{}/{}]",
        latest.fx(),
        latest.fz(),
        cop,
        len,
        capacity
    )
}

fn print_live_view(display: &SharedDisplay, platform: &Platform) {
    // Sólo se copia la última muestra con el lock tomado; el bucle de
    // adquisición no espera al refresco
    let (latest, len, capacity) = {
        let buffer = display.lock().unwrap_or_else(|e| e.into_inner());
        match buffer.latest() {
            Some(latest) => (*latest, buffer.len(), buffer.capacity()),
            None => return,
        }
    };
    print!("\r{}   ", live_view_line(&latest, len, capacity, platform));
    let _ = io::stdout().flush();
}

/// Lee líneas de la entrada estándar en un hilo aparte
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("❌ Error leyendo la consola: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn run(settings: &Settings, auto_step: Option<f64>, seed: u64) -> Result<()> {
    println!("🎯 Adquisición de plataforma de fuerza + EMG\n");

    let subject = SubjectParams {
        step_period: auto_step.map(|s| (s * settings.sample_rate).round() as usize),
        seed,
        ..SubjectParams::default()
    };
    let (daq, sim) = open_device(settings, subject, Pacing::RealTime)?;
    println!("✅ Dispositivo {} abierto (simulado)", settings.device_name);

    let acquisition = Acquisition::spawn(daq, settings)?;
    info!(
        "Hilo de adquisición lanzado: {} Hz, ventana quieta {} muestras",
        settings.sample_rate,
        settings.quiet_stance_samples()
    );

    let platform = Platform::new(settings.platform.z_offset, settings.platform.minimum_vertical_force);
    let display = acquisition.display();
    let lines = spawn_stdin_reader();
    let ticker = tick(settings.display_refresh().max(Duration::from_millis(20)));
    let mut live_view = false;

    print_help();

    loop {
        select! {
            recv(acquisition.events()) -> msg => {
                if let Ok(event) = msg {
                    if live_view {
                        println!();
                    }
                    print_event(event);
                }
            }
            recv(lines) -> msg => {
                let Ok(line) = msg else {
                    println!("\n👋 Entrada cerrada, saliendo...");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(ConsoleAction::Send(command)) => match acquisition.request(command) {
                        Ok(ack) => print_ack(ack),
                        Err(e) => println!("⚠️  {}", e),
                    },
                    Ok(ConsoleAction::CueStep) => {
                        sim.cue_step();
                        println!("🦶 Paso simulado");
                    }
                    Ok(ConsoleAction::ToggleView) => {
                        live_view = !live_view;
                        if !live_view {
                            println!();
                        }
                    }
                    Ok(ConsoleAction::Help) => print_help(),
                    Ok(ConsoleAction::Quit) => {
                        println!("\n👋 Saliendo...");
                        break;
                    }
                    Err(e) => println!("⚠️  {}", e),
                }
            }
            recv(ticker) -> _ => {
                if live_view {
                    print_live_view(&display, &platform);
                }
            }
        }
    }

    acquisition.shutdown()?;
    println!("✅ Dispositivo cerrado");
    Ok(())
}
