use serde::Deserialize;

/// Muestras por segundo que espera el modelo (fijo en todos los modelos actuales)
pub const SAMPLES_PER_SECOND: usize = 10;

/// Canales inerciales por dispositivo: [ax, ay, az, gx, gy, gz]
pub const INERTIAL_CHANNELS: usize = 6;

/// Número de clases que devuelve la variante de regresión
pub const REGRESSION_OUTPUTS: usize = 4;

/// Escalas de fondo: ±4g y ±1000°/s sobre ±32767
pub const ACC_SCALE_4G: f32 = 4.0 / 32767.0;
pub const GYR_SCALE_1000: f32 = 1000.0 / 32767.0;

/// (3 * 2) / 2^24 / 6: voltios por LSB del ADC de 24 bits
pub const ELECTRODE_SCALE: f64 = 5.96046448e-8;

/// Orden de bytes de los enteros de 16 bits de cada familia
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn read_i16(self, bytes: [u8; 2]) -> i16 {
        match self {
            ByteOrder::Little => i16::from_le_bytes(bytes),
            ByteOrder::Big => i16::from_be_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Accelerometer,
    Gyroscope,
    Electrode,
}

/// Canal lógico de una familia: nombre, rol y frecuencia con la que llega a la caché
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub name: &'static str,
    pub role: ChannelRole,
    pub rate_hz: u32,
}

const INERTIAL_NAMES: [&str; INERTIAL_CHANNELS] = ["AccX", "AccY", "AccZ", "GyrX", "GyrY", "GyrZ"];
const ELECTRODE_NAMES: [&str; 4] = ["Emg1", "Emg2", "Emg3", "Emg4"];

/// Valores de la envolvente EMG que se promedian en cada muestra normalizada
pub const ENVELOPE_DECIMATION: u32 = 6;

/// Tipo físico de sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorFamily {
    Bio1,
    Bio2,
    Pikku,
    Croll,
}

impl SensorFamily {
    /// Característica de notificaciones de IMU
    pub fn motion_channel(self) -> &'static str {
        match self {
            SensorFamily::Bio1 | SensorFamily::Bio2 => "0000ff38-0000-1000-8000-00805f9b34fb",
            SensorFamily::Pikku => "0000ff36-0000-1000-8000-00805f9b34fb",
            SensorFamily::Croll => "0000ff3a-0000-1000-8000-00805f9b34fb",
        }
    }

    /// Característica de electrodos (Bio1 y Bio2 comparten UUID)
    pub fn electrode_channel(self) -> Option<&'static str> {
        match self {
            SensorFamily::Bio1 | SensorFamily::Bio2 => Some("0000ff39-0000-1000-8000-00805f9b34fb"),
            _ => None,
        }
    }

    /// Característica de estado (batería)
    pub fn status_channel(self) -> Option<&'static str> {
        match self {
            SensorFamily::Pikku => Some("0000ff35-0000-1000-8000-00805f9b34fb"),
            SensorFamily::Croll => Some("0000ff3b-0000-1000-8000-00805f9b34fb"),
            _ => None,
        }
    }

    pub fn byte_order(self) -> ByteOrder {
        ByteOrder::Little
    }

    /// Bytes previos a la carga útil de IMU (Croll antepone un id de acelerómetro)
    pub fn motion_prefix_len(self) -> usize {
        match self {
            SensorFamily::Croll => 1,
            _ => 0,
        }
    }

    pub fn inertial_rate_hz(self) -> u32 {
        50
    }

    pub fn electrode_rate_hz(self) -> u32 {
        match self {
            SensorFamily::Bio2 => 600,
            _ => 0,
        }
    }

    /// Electrodos que decodifica la familia. Bio1 anuncia la característica pero no la usa.
    pub fn electrode_count(self) -> usize {
        match self {
            SensorFamily::Bio2 => 2,
            _ => 0,
        }
    }

    /// Grupos de 3 bytes por notificación de electrodo
    pub fn grouped_samples(self) -> usize {
        match self {
            SensorFamily::Bio2 => 4,
            _ => 0,
        }
    }

    /// Sub-escalas que se aplican sobre ACC_SCALE_4G y GYR_SCALE_1000
    pub fn accel_sub_scale(self) -> f32 {
        4.0
    }

    pub fn gyro_sub_scale(self) -> f32 {
        1000.0
    }

    /// Canales lógicos: primero los 6 inerciales, después los electrodos
    pub fn channels(self) -> Vec<ChannelDescriptor> {
        let inertial_rate = self.inertial_rate_hz();
        let mut channels: Vec<ChannelDescriptor> = INERTIAL_NAMES
            .iter()
            .enumerate()
            .map(|(i, &name)| ChannelDescriptor {
                name,
                role: if i < 3 {
                    ChannelRole::Accelerometer
                } else {
                    ChannelRole::Gyroscope
                },
                rate_hz: inertial_rate,
            })
            .collect();

        let envelope_rate = self.electrode_rate_hz() / ENVELOPE_DECIMATION;
        channels.extend(
            ELECTRODE_NAMES
                .iter()
                .take(self.electrode_count())
                .map(|&name| ChannelDescriptor {
                    name,
                    role: ChannelRole::Electrode,
                    rate_hz: envelope_rate,
                }),
        );
        channels
    }

    pub fn channel_count(self) -> usize {
        INERTIAL_CHANNELS + self.electrode_count()
    }
}

/// Notificación cruda tal como la entrega el transporte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub device_index: usize,
    pub channel_id: String,
    pub bytes: Vec<u8>,
}

/// Valor decodificado de un canal lógico
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    pub channel: usize,
    pub value: f32,
    pub sample_index: i32,
}

/// Punto clave de pose: coordenadas y parte del cuerpo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub body_part: usize,
}

/// Tensor de entrada [lote=1][muestras][canales][1] en orden plano
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

impl InputTensor {
    /// Tensor [1][samples][channels][1]; None si el tamaño no cuadra
    pub fn new(samples: usize, channels: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == samples * channels).then_some(Self {
            shape: [1, samples, channels, 1],
            data,
        })
    }

    pub fn samples(&self) -> usize {
        self.shape[1]
    }

    pub fn channels(&self) -> usize {
        self.shape[2]
    }

    pub fn get(&self, sample: usize, channel: usize) -> Option<f32> {
        if sample >= self.samples() || channel >= self.channels() {
            return None;
        }
        self.data.get(sample * self.channels() + channel).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Stopped,
    Acquiring,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Discriminador del modelo: clasificador de gestos o salida continua de 4 valores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Classifier,
    Regression,
}

impl ModelKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ModelKind::Classifier => "mm_",
            ModelKind::Regression => "mmr_",
        }
    }

    /// Identificador del artefacto en el servicio de distribución
    pub fn model_name(self, model_id: u32) -> String {
        format!("{}{}", self.prefix(), model_id)
    }
}
