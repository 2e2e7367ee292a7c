use crate::types::InputTensor;

/// Buffer circular de una ventana de gesto: `gesture_samples x channels x devices` escalares
#[derive(Debug, Clone)]
pub struct SampleWindow {
    buffer: Vec<f32>,
    write_pos: usize,
    /// Escalares encolados desde el último reset
    filled: usize,
    gesture_samples: usize,
    channels_per_device: usize,
    num_devices: usize,
}

impl SampleWindow {
    pub fn new(gesture_samples: usize, channels_per_device: usize, num_devices: usize) -> Self {
        let capacity = gesture_samples * channels_per_device * num_devices.max(1);
        Self {
            buffer: vec![0.0; capacity],
            write_pos: 0,
            filled: 0,
            gesture_samples,
            channels_per_device,
            num_devices: num_devices.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Añade un escalar; al llenarse sobrescribe el más antiguo
    pub fn enqueue(&mut self, value: f32) {
        if self.buffer.is_empty() {
            return;
        }
        self.buffer[self.write_pos] = value;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
        self.filled = self.filled.saturating_add(1);
    }

    pub fn enqueue_row(&mut self, row: &[f32]) {
        for &value in row {
            self.enqueue(value);
        }
    }

    /// Hay `gesture_samples` filas completas desde el último reset
    pub fn is_ready(&self) -> bool {
        !self.buffer.is_empty() && self.filled >= self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.filled.min(self.buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Construye el tensor [1][muestra][dispositivo * C + canal][1] en orden cronológico.
    /// No vacía la ventana.
    pub fn to_tensor(&self) -> Option<InputTensor> {
        if !self.is_ready() {
            return None;
        }

        let row_len = self.num_devices * self.channels_per_device;
        let capacity = self.buffer.len();
        // con la ventana llena write_pos apunta al escalar más antiguo
        let start = self.write_pos;
        let mut data = vec![0.0f32; capacity];

        for sample in 0..self.gesture_samples {
            for device in 0..self.num_devices {
                for channel in 0..self.channels_per_device {
                    let flat = sample * row_len + device * self.channels_per_device + channel;
                    data[flat] = self.buffer[(start + flat) % capacity];
                }
            }
        }

        InputTensor::new(self.gesture_samples, row_len, data)
    }

    /// Extrae el tensor y deja la ventana lista para el siguiente gesto
    pub fn drain(&mut self) -> Option<InputTensor> {
        let tensor = self.to_tensor()?;
        self.reset();
        Some(tensor)
    }

    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.filled = 0;
    }
}

/// Junta las filas de varios dispositivos en una fila de la ventana.
/// Cada dispositivo se diezma desde su frecuencia nativa; una fila nueva de un
/// dispositivo que ya tenía una pendiente la reemplaza.
#[derive(Debug, Clone)]
pub struct Interleaver {
    pending: Vec<Option<Vec<f32>>>,
    decimation: Vec<usize>,
    counters: Vec<usize>,
    channels_per_device: usize,
}

impl Interleaver {
    pub fn new(channels_per_device: usize, decimation: Vec<usize>) -> Self {
        let devices = decimation.len().max(1);
        let mut decimation = decimation;
        decimation.resize(devices, 1);
        Self {
            pending: vec![None; devices],
            decimation: decimation.into_iter().map(|d| d.max(1)).collect(),
            counters: vec![0; devices],
            channels_per_device,
        }
    }

    pub fn num_devices(&self) -> usize {
        self.pending.len()
    }

    /// Devuelve la fila completa (dispositivo mayor) cuando todos han aportado la suya
    pub fn push(&mut self, device: usize, row: &[f32]) -> Option<Vec<f32>> {
        if device >= self.pending.len() {
            return None;
        }

        let tick = self.counters[device];
        self.counters[device] = tick.wrapping_add(1);
        if tick % self.decimation[device] != 0 {
            return None;
        }

        let mut row = row.to_vec();
        row.resize(self.channels_per_device, 0.0);
        self.pending[device] = Some(row);

        if self.pending.iter().any(Option::is_none) {
            return None;
        }

        let mut full = Vec::with_capacity(self.pending.len() * self.channels_per_device);
        for slot in &mut self.pending {
            if let Some(row) = slot.take() {
                full.extend(row);
            }
        }
        Some(full)
    }

    pub fn reset(&mut self) {
        self.pending.iter_mut().for_each(|slot| *slot = None);
        self.counters.iter_mut().for_each(|c| *c = 0);
    }
}
