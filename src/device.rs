use tracing::{debug, info, warn};

use crate::channel_store::ChannelStore;
use crate::filters::{EnvelopeConfig, FilterBank, FilterError};
use crate::frame_parser::{parse_frame, parse_status, DecodeStats, DeviceStatus, ParsedFrame};
use crate::types::{ChannelSample, ConnectionState, SensorFamily, INERTIAL_CHANNELS};

/// Resultado de procesar una notificación
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    /// Valores que han llegado a la caché (inerciales o envolvente normalizada)
    pub samples: Vec<ChannelSample>,
    /// La trama completó los 6 canales inerciales
    pub row_complete: bool,
}

/// Un sensor físico: decodificador, filtros EMG y caché propios
#[derive(Debug, Clone)]
pub struct SensorDevice {
    index: usize,
    family: SensorFamily,
    store: ChannelStore,
    filters: FilterBank,
    envelope: EnvelopeConfig,
    stats: DecodeStats,
    status: DeviceStatus,
    connection: ConnectionState,
    contact_good: Vec<bool>,
    /// Muestras de electrodo recibidas, usadas como sample_index de la envolvente
    electrode_counters: Vec<i32>,
}

impl SensorDevice {
    pub fn new(index: usize, family: SensorFamily, cache_capacity: usize) -> Result<Self, FilterError> {
        Self::with_envelope(index, family, cache_capacity, EnvelopeConfig::default())
    }

    pub fn with_envelope(
        index: usize,
        family: SensorFamily,
        cache_capacity: usize,
        envelope: EnvelopeConfig,
    ) -> Result<Self, FilterError> {
        let filters = FilterBank::activate(family, &envelope)?;
        let electrodes = family.electrode_count();
        Ok(Self {
            index,
            family,
            store: ChannelStore::new(&family.channels(), cache_capacity),
            filters,
            envelope,
            stats: DecodeStats::default(),
            status: DeviceStatus::default(),
            connection: ConnectionState::default(),
            contact_good: vec![true; electrodes],
            electrode_counters: vec![0; electrodes],
        })
    }

    /// Recalcula coeficientes y borra el estado de todos los filtros
    pub fn activate_filters(&mut self) -> Result<(), FilterError> {
        self.filters = FilterBank::activate(self.family, &self.envelope)?;
        self.electrode_counters.iter_mut().for_each(|c| *c = 0);
        Ok(())
    }

    pub fn on_frame_received(&mut self, channel_id: &str, bytes: &[u8]) -> FrameOutcome {
        match parse_frame(self.family, channel_id, bytes, self.status, &mut self.stats) {
            ParsedFrame::Motion(samples) => {
                for sample in &samples {
                    self.store.record(sample.channel, sample.value, sample.sample_index);
                }
                FrameOutcome {
                    row_complete: samples.len() == INERTIAL_CHANNELS,
                    samples,
                }
            }
            ParsedFrame::Electrode(frame) => {
                let electrode = frame.electrode;
                self.update_contact(electrode, frame.contact_good);

                let channel = INERTIAL_CHANNELS + electrode;
                let mut samples = Vec::new();
                for millivolts in frame.millivolts {
                    let counter = &mut self.electrode_counters[electrode];
                    *counter = counter.wrapping_add(1);
                    let sample_index = *counter;

                    if let Some(value) = self.filters.process(electrode, millivolts) {
                        self.store.record(channel, value, sample_index);
                        samples.push(ChannelSample {
                            channel,
                            value,
                            sample_index,
                        });
                    }
                }
                FrameOutcome {
                    samples,
                    row_complete: false,
                }
            }
            ParsedFrame::Status(status) => {
                self.set_status(status);
                FrameOutcome::default()
            }
            ParsedFrame::Ignored => FrameOutcome::default(),
        }
    }

    /// Trama de estado recibida fuera de la característica de notificaciones
    pub fn on_status_frame_received(&mut self, bytes: &[u8]) -> DeviceStatus {
        let status = parse_status(bytes, self.status);
        self.set_status(status);
        status
    }

    pub fn on_connection_state_changed(&mut self, state: ConnectionState) {
        if self.connection == state {
            return;
        }
        info!(device = self.index, family = ?self.family, from = ?self.connection, to = ?state, "Conexión");
        self.connection = state;

        if state == ConnectionState::Connected {
            if let Err(e) = self.activate_filters() {
                warn!(device = self.index, error = %e, "No se pudieron reactivar los filtros");
            }
        }
    }

    fn set_status(&mut self, status: DeviceStatus) {
        if status != self.status {
            debug!(device = self.index, battery = status.battery, charging = status.charging, "Estado");
        }
        if status.battery <= 10 && self.status.battery > 10 {
            warn!(device = self.index, battery = status.battery, "Batería baja");
        }
        self.status = status;
    }

    fn update_contact(&mut self, electrode: usize, good: bool) {
        let Some(previous) = self.contact_good.get_mut(electrode) else {
            return;
        };
        if *previous != good {
            if good {
                info!(device = self.index, electrode, "Electrodo en contacto");
            } else {
                warn!(device = self.index, electrode, "Electrodo sin contacto");
            }
            *previous = good;
        }
    }

    /// Últimos valores de los canales `0..channels`: inerciales y, a partir del 6, envolventes
    pub fn latest_row(&self, channels: usize) -> Vec<f32> {
        self.store.latest_row(channels)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn family(&self) -> SensorFamily {
        self.family
    }

    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChannelStore {
        &mut self.store
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_contact_good(&self, electrode: usize) -> Option<bool> {
        self.contact_good.get(electrode).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn motion_frame(sample: i16, values: [i16; 6]) -> Vec<u8> {
        let mut bytes = sample.to_le_bytes().to_vec();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_motion_frame_fills_row() {
        let mut device = SensorDevice::new(0, SensorFamily::Pikku, 100).unwrap();
        device.store_mut().enable_all_caches(true);
        let channel = SensorFamily::Pikku.motion_channel();

        let outcome = device.on_frame_received(channel, &motion_frame(7, [32767, 0, -32767, 0, 0, 32767]));
        assert!(outcome.row_complete);
        assert_eq!(outcome.samples.len(), 6);

        let row = device.latest_row(INERTIAL_CHANNELS);
        // 32767 * (4 / 32767) / 4
        assert_abs_diff_eq!(row[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(row[2], -row[0], epsilon = 1e-6);
        assert_eq!(device.store().cache_len(5), 1);
        assert_eq!(device.store().retrieve_window(0, 1)[0].1, 7);
    }

    #[test]
    fn test_short_motion_frame_is_partial() {
        let mut device = SensorDevice::new(0, SensorFamily::Bio1, 100).unwrap();
        let channel = SensorFamily::Bio1.motion_channel();
        let outcome = device.on_frame_received(channel, &motion_frame(1, [1, 2, 3, 4, 5, 6])[..10]);
        assert!(!outcome.row_complete);
        assert_eq!(outcome.samples.len(), 3);
        assert_eq!(device.stats().short_frames, 1);
    }

    #[test]
    fn test_electrode_frames_produce_envelope() {
        let mut device = SensorDevice::new(1, SensorFamily::Bio2, 100).unwrap();
        device.store_mut().enable_all_caches(true);
        let channel = SensorFamily::Bio2.electrode_channel().unwrap();

        // electrodo 1, contacto correcto, 4 grupos por trama
        let mut frame = vec![0x04];
        for _ in 0..4 {
            frame.extend_from_slice(&[0x00, 0x10, 0x00]);
        }

        let mut produced = 0;
        for _ in 0..3 {
            produced += device.on_frame_received(channel, &frame).samples.len();
        }
        // 12 muestras de electrodo → 2 valores normalizados
        assert_eq!(produced, 2);
        assert_eq!(device.store().cache_len(INERTIAL_CHANNELS + 1), 2);
        assert_eq!(device.store().cache_len(INERTIAL_CHANNELS), 0);
        let value = device.store().latest(INERTIAL_CHANNELS + 1).unwrap();
        assert!((-1.0..=1.0).contains(&value));
    }

    #[test]
    fn test_contact_tracking() {
        let mut device = SensorDevice::new(0, SensorFamily::Bio2, 10).unwrap();
        let channel = SensorFamily::Bio2.electrode_channel().unwrap();
        assert_eq!(device.is_contact_good(0), Some(true));
        device.on_frame_received(channel, &[0x01, 0, 0, 0]);
        assert_eq!(device.is_contact_good(0), Some(false));
        device.on_frame_received(channel, &[0x00, 0, 0, 0]);
        assert_eq!(device.is_contact_good(0), Some(true));
        assert_eq!(device.is_contact_good(5), None);
    }

    #[test]
    fn test_status_and_connection() {
        let mut device = SensorDevice::new(0, SensorFamily::Pikku, 10).unwrap();
        let status_channel = SensorFamily::Pikku.status_channel().unwrap();
        device.on_frame_received(status_channel, &[55, 1]);
        assert_eq!(device.status(), DeviceStatus { battery: 55, charging: true });

        let status = device.on_status_frame_received(&[40]);
        assert_eq!(status, DeviceStatus { battery: 40, charging: true });

        assert_eq!(device.connection(), ConnectionState::Disconnected);
        device.on_connection_state_changed(ConnectionState::Connected);
        assert_eq!(device.connection(), ConnectionState::Connected);
    }

    fn electrode_frames(seed: u8) -> Vec<Vec<u8>> {
        (0..3u8)
            .map(|f| {
                // electrodo 1, contacto correcto
                let mut frame = vec![0x04];
                for g in 0..4u8 {
                    frame.extend_from_slice(&[seed.wrapping_add(f * 4 + g).wrapping_mul(37), 0x10 + g, 0x00]);
                }
                frame
            })
            .collect()
    }

    fn feed(device: &mut SensorDevice, frames: &[Vec<u8>]) -> Vec<ChannelSample> {
        let channel = SensorFamily::Bio2.electrode_channel().unwrap();
        frames
            .iter()
            .flat_map(|frame| device.on_frame_received(channel, frame).samples)
            .collect()
    }

    #[test]
    fn test_filter_memory_survives_until_reactivation() {
        let mut fresh = SensorDevice::new(1, SensorFamily::Bio2, 100).unwrap();
        let expected = feed(&mut fresh, &electrode_frames(9));
        assert_eq!(expected.len(), 2);

        let mut device = SensorDevice::new(1, SensorFamily::Bio2, 100).unwrap();
        device.on_connection_state_changed(ConnectionState::Connected);
        feed(&mut device, &electrode_frames(200));

        // un Connected repetido no reinicia los filtros
        device.on_connection_state_changed(ConnectionState::Connected);
        let continued = feed(&mut device, &electrode_frames(9));
        assert_eq!(continued.len(), 2);
        assert_eq!(continued[0].sample_index, expected[0].sample_index + 12);

        device.on_connection_state_changed(ConnectionState::Disconnected);
        device.on_connection_state_changed(ConnectionState::Connected);
        assert_eq!(feed(&mut device, &electrode_frames(9)), expected);

        feed(&mut device, &electrode_frames(50));
        device.activate_filters().unwrap();
        assert_eq!(feed(&mut device, &electrode_frames(9)), expected);
    }

    #[test]
    fn test_unknown_channel_counted() {
        let mut device = SensorDevice::new(0, SensorFamily::Croll, 10).unwrap();
        let outcome = device.on_frame_received("0000ffff-0000-1000-8000-00805f9b34fb", &[1, 2, 3]);
        assert_eq!(outcome, FrameOutcome::default());
        assert_eq!(device.stats().unknown_channel, 1);
        assert_eq!(device.stats().frames, 1);
    }
}
