use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use csv::ReaderBuilder;

use crate::gesture_buffer::SampleWindow;
use crate::types::{InputTensor, SAMPLES_PER_SECOND};

/// Una hora de grabación a 10 muestras por segundo
pub const MAX_CSV_SAMPLES: usize = 3600 * SAMPLES_PER_SECOND;

/// Carga filas entrelazadas desde un CSV `sample,device,c0,c1,...` ordenado por sample.
/// Cada fila devuelta tiene `num_devices * channels` valores (dispositivo mayor).
/// Los dispositivos ausentes en una muestra conservan su último valor.
pub fn load_rows_from_csv(
    path: impl AsRef<Path>,
    num_devices: usize,
    channels: usize,
) -> Result<Vec<Vec<f32>>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("No se pudo abrir el CSV {:?}", path))?;

    let row_len = num_devices * channels;
    let mut samples: BTreeMap<usize, Vec<Option<Vec<f32>>>> = BTreeMap::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record =
            result.with_context(|| format!("Fila {} inválida en {:?}", row_idx + 1, path))?;
        if record.len() < 2 + channels {
            bail!("La fila {} no tiene {} columnas", row_idx + 1, 2 + channels);
        }

        let sample: usize = record[0]
            .trim()
            .parse()
            .with_context(|| format!("sample inválido en fila {}", row_idx + 1))?;
        let device: usize = record[1]
            .trim()
            .parse()
            .with_context(|| format!("device inválido en fila {}", row_idx + 1))?;

        if device >= num_devices {
            bail!("Dispositivo {} fuera de rango (fila {})", device, row_idx + 1);
        }
        if sample >= MAX_CSV_SAMPLES {
            bail!(
                "sample={} supera el máximo de {} muestras (fila {})",
                sample,
                MAX_CSV_SAMPLES,
                row_idx + 1
            );
        }

        let values = (0..channels)
            .map(|channel| {
                record[2 + channel]
                    .trim()
                    .parse::<f32>()
                    .with_context(|| format!("canal {} inválido en fila {}", channel, row_idx + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        samples.entry(sample).or_insert_with(|| vec![None; num_devices])[device] = Some(values);
    }

    let (&min_sample, _) = samples
        .iter()
        .next()
        .ok_or_else(|| anyhow!("El CSV {:?} no contiene datos", path))?;
    ensure!(
        min_sample == 0,
        "El CSV debe iniciar en sample=0 (encontrado sample={})",
        min_sample
    );
    let max_sample = samples.keys().next_back().copied().unwrap_or(0);

    let mut rows = Vec::with_capacity(max_sample + 1);
    let mut last_row = vec![0.0; row_len];
    for sample_idx in 0..=max_sample {
        // Rellenar huecos repitiendo el último valor de cada dispositivo
        if let Some(devices) = samples.get(&sample_idx) {
            for (device, values) in devices.iter().enumerate() {
                if let Some(values) = values {
                    last_row[device * channels..(device + 1) * channels].copy_from_slice(values);
                }
            }
        }
        rows.push(last_row.clone());
    }

    Ok(rows)
}

/// Reconstruye un tensor de `gesture_samples` muestras: rellena con la última fila
/// o se queda con las más recientes.
pub fn load_window_from_csv(
    path: impl AsRef<Path>,
    gesture_samples: usize,
    num_devices: usize,
    channels: usize,
) -> Result<InputTensor> {
    let mut rows = load_rows_from_csv(path, num_devices, channels)?;
    if rows.len() < gesture_samples {
        let pad = rows.last().cloned().unwrap_or_else(|| vec![0.0; num_devices * channels]);
        rows.resize(gesture_samples, pad);
    }

    let mut window = SampleWindow::new(gesture_samples, channels, num_devices);
    for row in &rows {
        window.enqueue_row(row);
    }
    window
        .to_tensor()
        .ok_or_else(|| anyhow!("Ventana incompleta tras cargar {} filas", rows.len()))
}
