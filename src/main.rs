/*
Detector de movimientos en tiempo real para sensores vestibles - Rust + ONNX

Sistema que:
1. Recibe notificaciones BLE ya capturadas (una por línea en stdin)
2. Decodifica IMU y electrodos por familia de sensor y filtra la envolvente EMG
3. Acumula ventanas de gesto de varios dispositivos entrelazados
4. Clasifica cada ventana con el modelo ONNX "mm_<id>" / "mmr_<id>"

Uso:
    RUST_LOG=info ./target/release/biomotion config.json < tramas.txt

Formato de cada línea:
    <dispositivo> <uuid-característica> <bytes-hex>
    <dispositivo> state <connecting|connected|disconnecting|disconnected>
    start | stop
*/

use std::env;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{info, warn};

use biomotion::config::DetectorConfig;
use biomotion::detector::{ChannelListener, DetectorEvent, DirectoryModelSource, MotionDetector};
use biomotion::device::SensorDevice;
use biomotion::gesture_classifier::{LabelCatalog, OnnxEngineFactory};
use biomotion::types::{ConnectionState, RawFrame};

#[derive(Debug, PartialEq)]
enum Command {
    Frame(RawFrame),
    Connection {
        device: usize,
        state: ConnectionState,
    },
    Start,
    Stop,
}

fn parse_connection_state(value: &str) -> Result<ConnectionState> {
    match value.to_ascii_lowercase().as_str() {
        "connecting" => Ok(ConnectionState::Connecting),
        "connected" => Ok(ConnectionState::Connected),
        "disconnecting" => Ok(ConnectionState::Disconnecting),
        "disconnected" => Ok(ConnectionState::Disconnected),
        other => bail!("Estado de conexión desconocido: {}", other),
    }
}

/// None para líneas vacías o comentarios (#)
fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let first = parts.next().unwrap_or_default();
    match first {
        "start" => return Ok(Some(Command::Start)),
        "stop" => return Ok(Some(Command::Stop)),
        _ => {}
    }

    let device: usize = first
        .parse()
        .with_context(|| format!("Índice de dispositivo inválido: {}", first))?;
    let second = parts
        .next()
        .ok_or_else(|| anyhow!("Falta la característica"))?;
    let third = parts.next().unwrap_or_default();

    if second == "state" {
        return Ok(Some(Command::Connection {
            device,
            state: parse_connection_state(third)?,
        }));
    }

    let bytes = hex::decode(third).with_context(|| format!("Bytes hex inválidos: {}", third))?;
    Ok(Some(Command::Frame(RawFrame {
        device_index: device,
        channel_id: second.to_string(),
        bytes,
    })))
}

fn format_scores(scores: &[f32], catalog: &LabelCatalog) -> String {
    scores
        .iter()
        .enumerate()
        .map(|(i, score)| format!("{}={:.1}%", catalog.label(i).unwrap_or("?"), score))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("Uso: biomotion <config.json>"))?;
    let config = DetectorConfig::from_json_file(&config_path)
        .with_context(|| format!("No se pudo cargar {}", config_path))?;
    ensure!(!config.devices.is_empty(), "La configuración no declara dispositivos");

    println!("🏋️  Detector de movimientos biomotion");
    println!(
        "   Modelo: {} | objetivo: {} | ventana: {} muestras x {} canales",
        config.model_name(),
        config.target_label,
        config.gesture_samples(),
        config.tensor_channels()
    );

    let mut devices = config
        .devices
        .iter()
        .enumerate()
        .map(|(index, device)| SensorDevice::new(index, device.family, config.cache_capacity))
        .collect::<Result<Vec<_>, _>>()?;
    for device in &mut devices {
        device.store_mut().enable_all_caches(true);
    }
    println!("✅ {} dispositivo(s) configurados", devices.len());

    let detector = MotionDetector::new(
        config.clone(),
        Arc::new(DirectoryModelSource::new(&config.model_dir)),
        Arc::new(OnnxEngineFactory::default()),
    );
    let (listener, rx_events) = ChannelListener::new();
    detector.set_listener(Arc::new(listener));

    let catalog = config.catalog();
    let target = config.target_label.clone();
    thread::spawn(move || {
        while let Ok(event) = rx_events.recv() {
            match event {
                DetectorEvent::StateChanged(state) => println!("🔄 Estado del detector: {:?}", state),
                DetectorEvent::TargetRecognized { probability, .. } => {
                    println!("[GESTO] {} ✅ ({:.1}%)", target, probability)
                }
                DetectorEvent::AmbiguousOrWrong(label) if !label.is_empty() => {
                    println!("⚠️  Gesto ambiguo o incorrecto: {}", label)
                }
                DetectorEvent::AmbiguousOrWrong(_) => {}
                DetectorEvent::ScoresUpdated(scores) => {
                    println!("📊 {}", format_scores(&scores, &catalog))
                }
            }
        }
    });

    detector.start();
    println!("🎬 Leyendo tramas desde stdin...\n");

    let channels = config.channels_per_device;
    let stdin = io::stdin();
    for (line_no, line) in stdin.lock().lines().enumerate() {
        let line = line.context("Error leyendo stdin")?;
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Línea ignorada");
                continue;
            }
        };

        match command {
            Command::Start => detector.start(),
            Command::Stop => detector.stop(),
            Command::Connection { device, state } => match devices.get_mut(device) {
                Some(sensor) => sensor.on_connection_state_changed(state),
                None => warn!(device, "Dispositivo desconocido"),
            },
            Command::Frame(frame) => {
                let device = frame.device_index;
                let Some(sensor) = devices.get_mut(device) else {
                    warn!(device, "Dispositivo desconocido");
                    continue;
                };
                let outcome = sensor.on_frame_received(&frame.channel_id, &frame.bytes);
                if outcome.row_complete {
                    detector.on_device_row(device, &sensor.latest_row(channels));
                }
            }
        }
    }

    detector.stop();
    println!("\n📈 Estadísticas de decodificación:");
    for device in &devices {
        let stats = device.stats();
        println!(
            "  #{} {:?}: {} tramas, {} cortas, {} desconocidas, {} electrodo inválido, {} grupos perdidos | batería {}%",
            device.index(),
            device.family(),
            stats.frames,
            stats.short_frames,
            stats.unknown_channel,
            stats.invalid_electrode,
            stats.dropped_groups,
            device.status().battery
        );
    }
    info!("👋 Saliendo...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_line() {
        let command = parse_line("1 0000ff36-0000-1000-8000-00805f9b34fb 0a00ff7f").unwrap();
        assert_eq!(
            command,
            Some(Command::Frame(RawFrame {
                device_index: 1,
                channel_id: "0000ff36-0000-1000-8000-00805f9b34fb".to_string(),
                bytes: vec![0x0a, 0x00, 0xff, 0x7f],
            }))
        );
    }

    #[test]
    fn test_parse_control_lines() {
        assert_eq!(parse_line("  ").unwrap(), None);
        assert_eq!(parse_line("# comentario").unwrap(), None);
        assert_eq!(parse_line("start").unwrap(), Some(Command::Start));
        assert_eq!(parse_line("stop").unwrap(), Some(Command::Stop));
        assert_eq!(
            parse_line("0 state Connected").unwrap(),
            Some(Command::Connection {
                device: 0,
                state: ConnectionState::Connected
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_line("x ff36 00").is_err());
        assert!(parse_line("0 ff36 zz").is_err());
        assert!(parse_line("0 state flying").is_err());
        assert!(parse_line("0").is_err());
    }
}
