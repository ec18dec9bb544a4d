use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use psi_collect::baseline::analyze_capture;
use psi_collect::config::Settings;
use psi_collect::export::load_record;
use psi_collect::peaks::PeakParams;
use psi_collect::signal::Platform;
use psi_collect::trial::first_crossing;
use psi_collect::types::TrialType;

/// Reproduce offline un ensayo exportado
#[derive(Parser, Debug)]
#[command(name = "replay_csv", about = "Recompute CoP and APA detection from an exported trial")]
struct Args {
    /// Exported trial file
    csv: PathBuf,

    /// Settings used during the collection (platform constants, timings)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print every row whose stored CoP differs from the recomputed one
    #[arg(long)]
    dump_mismatches: bool,

    /// Relative tolerance for CoP comparison
    #[arg(long, default_value = "1e-9")]
    tolerance: f64,
}

fn close_enough(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1e-12)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let platform = Platform::new(settings.platform.z_offset, settings.platform.minimum_vertical_force);

    println!("🎞️  Reproduciendo ensayo desde {:?}", args.csv);
    let record = load_record(&args.csv)?;
    for (key, value) in &record.metadata {
        println!("   {:<22} {}", format!("{}:", key), value);
    }
    println!("   {} muestras\n", record.samples.len());

    // CoP: lo escrito frente a lo recalculado desde los canales crudos
    let mut mismatches = 0usize;
    for (idx, (sample, stored)) in record.samples.iter().zip(&record.cop).enumerate() {
        let recomputed = platform.cop(sample).as_option();
        let matches = match (stored, recomputed) {
            (Some((sx, sy)), Some((rx, ry))) => {
                close_enough(*sx, rx, args.tolerance) && close_enough(*sy, ry, args.tolerance)
            }
            (None, None) => true,
            _ => false,
        };
        if !matches {
            mismatches += 1;
            if args.dump_mismatches {
                println!("  fila {:>6}: guardado {:?}, recalculado {:?}", idx, stored, recomputed);
            }
        }
    }
    if mismatches == 0 {
        println!("✅ CoP reproducido en todas las filas");
    } else {
        println!("⚠️  {} filas con CoP distinto al recalculado", mismatches);
    }

    let quiet_len = settings.quiet_stance_samples();
    if record.samples.len() <= quiet_len {
        println!("ℹ️  El registro no pasa de la bipedestación quieta ({} muestras)", quiet_len);
        return Ok(());
    }

    // Detección de APA como en los ensayos basales
    let params = PeakParams {
        min_height: settings.apa.min_height,
        min_prominence: settings.apa.min_prominence,
    };
    let analysis = analyze_capture(&record.samples, quiet_len, params);
    println!(
        "\n📈 Picos: {} (primero {:?}), valles: {} (primero {:?})",
        analysis.peaks.len(),
        analysis.peaks.first(),
        analysis.valleys.len(),
        analysis.valleys.first()
    );
    match analysis.apa {
        Some(apa) => println!("   APA = {:.3} N", apa),
        None => println!("   Sin APA detectada"),
    }

    let stims: Vec<usize> = record
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.stim)
        .map(|(i, _)| i)
        .collect();
    println!("⚡ Estímulos marcados: {} {:?}", stims.len(), stims);

    if record.trial_type() == Some(TrialType::Step) {
        let threshold: f64 = record
            .meta("APA Threshold")
            .ok_or_else(|| anyhow!("El archivo no incluye el umbral"))?
            .parse()?;
        let crossing = first_crossing(&record.samples, quiet_len, threshold);
        println!("🎯 Primer cruce del umbral ({:.3} N): {:?}", threshold, crossing);
        match (crossing, stims.first()) {
            (Some(c), Some(&s)) if c == s => println!("✅ El estímulo coincide con la detección"),
            (Some(c), Some(&s)) => println!(
                "⚠️  El estímulo ({}) no coincide con la detección ({})",
                s, c
            ),
            (Some(_), None) => println!("ℹ️  Cruce sin estímulo (estimulador desactivado o fallo del pulso)"),
            (None, _) => println!("ℹ️  Ninguna muestra supera el umbral"),
        }
    }

    Ok(())
}
