use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use biomotion::config::DetectorConfig;
use biomotion::csv_loader::load_window_from_csv;
use biomotion::detector::{ChannelListener, DetectorEvent, DirectoryModelSource, MotionDetector};
use biomotion::gesture_classifier::{Decision, OnnxEngineFactory};
use biomotion::types::DetectorState;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

struct ReplayOptions {
    dump_flat: bool,
}

fn parse_args() -> Result<(PathBuf, PathBuf, ReplayOptions)> {
    let mut dump_flat = false;
    let mut paths: Vec<PathBuf> = Vec::new();

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--dump-flat" => dump_flat = true,
            _ => paths.push(PathBuf::from(arg)),
        }
    }

    if paths.len() != 2 {
        bail!("Uso: replay_csv [--dump-flat] <config.json> <archivo.csv>");
    }
    let csv_path = paths.pop().ok_or_else(|| anyhow!("Debes especificar un archivo CSV"))?;
    let config_path = paths.pop().ok_or_else(|| anyhow!("Debes especificar la configuración"))?;
    Ok((config_path, csv_path, ReplayOptions { dump_flat }))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (config_path, csv_path, opts) = parse_args()?;
    let config = DetectorConfig::from_json_file(&config_path)
        .with_context(|| format!("No se pudo cargar {:?}", config_path))?;
    println!("🎞️  Reproduciendo gesto desde {:?}", csv_path);

    let tensor = load_window_from_csv(
        &csv_path,
        config.gesture_samples(),
        config.num_devices(),
        config.channels_per_device,
    )?;

    let detector = MotionDetector::new(
        config.clone(),
        Arc::new(DirectoryModelSource::new(&config.model_dir)),
        Arc::new(OnnxEngineFactory::default()),
    );
    let (listener, rx) = ChannelListener::new();
    detector.set_listener(Arc::new(listener));
    detector.start();

    loop {
        match rx.recv_timeout(ACQUIRE_TIMEOUT) {
            Ok(DetectorEvent::StateChanged(DetectorState::Ready)) => break,
            Ok(DetectorEvent::StateChanged(DetectorState::Stopped)) => {
                bail!("No se pudo adquirir el modelo {}", config.model_name())
            }
            Ok(_) => continue,
            Err(e) => bail!("Tiempo de espera agotado adquiriendo el modelo: {}", e),
        }
    }

    let decision = detector
        .classify_tensor(&tensor)
        .ok_or_else(|| anyhow!("El modelo no devolvió resultados"))?;

    match &decision {
        Decision::Classification(result) => {
            let target = detector.catalog().label(detector.catalog().correct_index()).unwrap_or("?");
            println!(
                "\n🎯 Objetivo {}: {:.1}% {}",
                target,
                result.target_probability,
                if result.is_target { "✅" } else { "❌" }
            );
            if !result.incorrect_label.is_empty() {
                println!("⚠️  Gesto ambiguo o incorrecto: {}", result.incorrect_label);
            }

            let mut ranked: Vec<(&str, f32)> = result
                .scores
                .iter()
                .enumerate()
                .map(|(i, &score)| (detector.catalog().label(i).unwrap_or("?"), score))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

            println!("\nTop-5 probabilidades:");
            for (idx, (label, score)) in ranked.iter().take(5).enumerate() {
                println!("  {:>2}. {:<25} {:>6.2}%", idx + 1, label, score);
            }
        }
        Decision::Regression(values) => {
            println!("\n📈 Salida de regresión: {:?}", values);
        }
    }

    if opts.dump_flat {
        println!("\n🧱 Tensor plano ({} valores):", tensor.data.len());
        for (idx, value) in tensor.data.iter().enumerate() {
            println!("  {:03}: {:>12.6}", idx, value);
        }
    }

    detector.stop();
    Ok(())
}
