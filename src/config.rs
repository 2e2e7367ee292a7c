use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::channel_store::DEFAULT_CACHE_CAPACITY;
use crate::gesture_classifier::{AmbiguityRule, LabelCatalog};
use crate::types::{ModelKind, SensorFamily, INERTIAL_CHANNELS, SAMPLES_PER_SECOND};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuración inválida: {0}")]
    Invalid(String),
}

/// Dispositivo físico; `position_id` 0 significa sin posición corporal asignada
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub family: SensorFamily,
    #[serde(default)]
    pub position_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Movement {
    pub label: String,
}

/// Origen de los datos de inferencia
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Las muestras se acumulan en la ventana del detector
    #[default]
    Windowed,
    /// El llamante entrega el tensor ya formado
    Direct,
}

fn default_channels() -> usize {
    INERTIAL_CHANNELS
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

/// Configuración de un detector de movimiento (modelo + dispositivos + catálogo)
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    pub model_id: u32,
    /// Nombre del gesto objetivo, debe coincidir con una etiqueta del catálogo
    pub target_label: String,
    pub duration_secs: u32,
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default = "default_channels")]
    pub channels_per_device: usize,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub movements: Vec<Movement>,
    #[serde(default)]
    pub ambiguity_rule: AmbiguityRule,
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl DetectorConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_secs == 0 {
            return Err(ConfigError::Invalid("duration_secs debe ser mayor que 0".into()));
        }
        if self.channels_per_device == 0 {
            return Err(ConfigError::Invalid("channels_per_device debe ser mayor que 0".into()));
        }
        if self.kind == ModelKind::Classifier && self.movements.is_empty() {
            return Err(ConfigError::Invalid("el catálogo de movimientos está vacío".into()));
        }
        Ok(())
    }

    /// Muestras por ventana de gesto (10 por segundo)
    pub fn gesture_samples(&self) -> usize {
        self.duration_secs as usize * SAMPLES_PER_SECOND
    }

    /// Solo se entrelazan varios dispositivos si alguno tiene posición asignada
    pub fn num_devices(&self) -> usize {
        if self.devices.iter().any(|d| d.position_id != 0) {
            self.devices.len()
        } else {
            1
        }
    }

    pub fn tensor_channels(&self) -> usize {
        self.num_devices() * self.channels_per_device
    }

    pub fn window_capacity(&self) -> usize {
        self.gesture_samples() * self.tensor_channels()
    }

    pub fn model_name(&self) -> String {
        self.kind.model_name(self.model_id)
    }

    pub fn catalog(&self) -> LabelCatalog {
        LabelCatalog::new(self.movements.iter().map(|m| m.label.clone()), &self.target_label)
    }

    /// Posición en la ventana de las filas del dispositivo `device`. Sin posiciones
    /// asignadas solo el primer dispositivo alimenta la ventana.
    pub fn window_slot(&self, device: usize) -> Option<usize> {
        if self.num_devices() == 1 {
            (device == 0).then_some(0)
        } else {
            (device < self.devices.len()).then_some(device)
        }
    }

    /// Factor de diezmado de cada dispositivo hasta 10 muestras por segundo
    pub fn decimation(&self) -> Vec<usize> {
        (0..self.num_devices())
            .map(|i| {
                self.devices
                    .get(i)
                    .map(|d| d.family.inertial_rate_hz() as usize / SAMPLES_PER_SECOND)
                    .unwrap_or(1)
                    .max(1)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "model_id": 12,
        "target_label": "squat",
        "duration_secs": 2,
        "devices": [
            { "family": "bio2", "position_id": 3 },
            { "family": "pikku", "position_id": 4 }
        ],
        "movements": [{ "label": "squat" }, { "label": "other" }, { "label": "lunge" }]
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = DetectorConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.kind, ModelKind::Classifier);
        assert_eq!(config.input_mode, InputMode::Windowed);
        assert_eq!(config.ambiguity_rule, AmbiguityRule::ScoreRatio);
        assert_eq!(config.channels_per_device, 6);
        assert_eq!(config.gesture_samples(), 20);
        assert_eq!(config.num_devices(), 2);
        assert_eq!(config.window_capacity(), 240);
        assert_eq!(config.model_name(), "mm_12");
        assert_eq!(config.decimation(), vec![5, 5]);

        let catalog = config.catalog();
        assert_eq!(catalog.labels(), ["lunge", "other", "squat"]);
        assert_eq!(catalog.correct_index(), 2);
    }

    #[test]
    fn test_unpositioned_devices_count_as_one() {
        let config = DetectorConfig::from_json_str(
            r#"{
                "model_id": 1, "target_label": "a", "duration_secs": 1,
                "kind": "regression", "input_mode": "direct", "channels_per_device": 34,
                "ambiguity_rule": "legacy_index",
                "devices": [{ "family": "croll" }, { "family": "croll" }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.num_devices(), 1);
        assert_eq!(config.tensor_channels(), 34);
        assert_eq!(config.model_name(), "mmr_1");
        assert_eq!(config.ambiguity_rule, AmbiguityRule::LegacyIndex);
        assert_eq!(config.decimation(), vec![5]);
        assert_eq!(config.window_slot(0), Some(0));
        assert_eq!(config.window_slot(1), None);
    }

    #[test]
    fn test_positioned_devices_keep_their_slot() {
        let config = DetectorConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.window_slot(0), Some(0));
        assert_eq!(config.window_slot(1), Some(1));
        assert_eq!(config.window_slot(2), None);
    }

    #[test]
    fn test_validation() {
        let zero = SAMPLE.replace("\"duration_secs\": 2", "\"duration_secs\": 0");
        assert!(matches!(
            DetectorConfig::from_json_str(&zero),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            DetectorConfig::from_json_str("{"),
            Err(ConfigError::JsonError(_))
        ));
        assert!(matches!(
            DetectorConfig::from_json_file("/nonexistent/config.json"),
            Err(ConfigError::IoError(_))
        ));
    }
}
