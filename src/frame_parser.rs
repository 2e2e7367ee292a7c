use tracing::debug;

use crate::types::{
    ChannelSample, SensorFamily, ACC_SCALE_4G, ELECTRODE_SCALE, GYR_SCALE_1000, INERTIAL_CHANNELS,
};

/// Bytes mínimos de carga útil para el grupo acelerómetro: contador + 3 ejes
const ACCEL_MIN_LEN: usize = 8;
/// Bytes mínimos para el grupo giroscopio: acelerómetro + 3 ejes
const GYRO_MIN_LEN: usize = 14;
const I24_MAX: i32 = 0x7F_FFFF;
const I24_CORRECTION: i32 = 0xFF_FFFF;

/// Contadores de decodificación por dispositivo.
/// Las tramas defectuosas nunca abortan el flujo, solo quedan contadas aquí.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames: u32,
    pub short_frames: u32,
    pub unknown_channel: u32,
    pub invalid_electrode: u32,
    pub dropped_groups: u32,
}

/// Notificación de electrodo ya convertida a milivoltios (sin filtrar)
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeFrame {
    pub electrode: usize,
    pub contact_good: bool,
    pub millivolts: Vec<f64>,
}

/// Telemetría de estado del dispositivo
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub battery: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Motion(Vec<ChannelSample>),
    Electrode(ElectrodeFrame),
    Status(DeviceStatus),
    Ignored,
}

fn same_channel(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Decodifica una notificación según la característica por la que llegó
pub fn parse_frame(
    family: SensorFamily,
    channel_id: &str,
    bytes: &[u8],
    previous_status: DeviceStatus,
    stats: &mut DecodeStats,
) -> ParsedFrame {
    stats.frames += 1;

    if same_channel(channel_id, family.motion_channel()) {
        return ParsedFrame::Motion(parse_motion(family, bytes, stats));
    }

    if let Some(electrode_channel) = family.electrode_channel() {
        if same_channel(channel_id, electrode_channel) {
            if family.electrode_count() == 0 {
                return ParsedFrame::Ignored;
            }
            return match parse_electrode(family, bytes, stats) {
                Some(frame) => ParsedFrame::Electrode(frame),
                None => ParsedFrame::Ignored,
            };
        }
    }

    if let Some(status_channel) = family.status_channel() {
        if same_channel(channel_id, status_channel) {
            return ParsedFrame::Status(parse_status(bytes, previous_status));
        }
    }

    stats.unknown_channel += 1;
    debug!(?family, channel_id, "Característica desconocida, trama ignorada");
    ParsedFrame::Ignored
}

/// Trama IMU: [prefijo][sample:i16][ax][ay][az][gx][gy][gz]
/// Los grupos incompletos se omiten sin error.
pub fn parse_motion(family: SensorFamily, bytes: &[u8], stats: &mut DecodeStats) -> Vec<ChannelSample> {
    let payload = bytes.get(family.motion_prefix_len()..).unwrap_or(&[]);
    let mut samples = Vec::with_capacity(INERTIAL_CHANNELS);

    if payload.len() < GYRO_MIN_LEN {
        stats.short_frames += 1;
        debug!(?family, len = bytes.len(), "Trama IMU corta");
    }
    if payload.len() < ACCEL_MIN_LEN {
        return samples;
    }

    let order = family.byte_order();
    let read = |offset: usize| order.read_i16([payload[offset], payload[offset + 1]]);
    let sample_index = read(0) as i32;

    let acc_scale = ACC_SCALE_4G / family.accel_sub_scale();
    for axis in 0..3 {
        samples.push(ChannelSample {
            channel: axis,
            value: read(2 + axis * 2) as f32 * acc_scale,
            sample_index,
        });
    }

    if payload.len() >= GYRO_MIN_LEN {
        let gyr_scale = GYR_SCALE_1000 / family.gyro_sub_scale();
        for axis in 0..3 {
            samples.push(ChannelSample {
                channel: 3 + axis,
                value: read(8 + axis * 2) as f32 * gyr_scale,
                sample_index,
            });
        }
    }

    samples
}

/// Entero de 24 bits big-endian con la corrección de signo del firmware
pub fn decode_i24(bytes: [u8; 3]) -> i32 {
    let value = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    if value > I24_MAX {
        value - I24_CORRECTION
    } else {
        value
    }
}

/// Trama de electrodo: byte 0 = [.. | electrodo (bits 2-3) | lead-off P N (bits 1-0)]
/// seguido de grupos de 3 bytes.
pub fn parse_electrode(
    family: SensorFamily,
    bytes: &[u8],
    stats: &mut DecodeStats,
) -> Option<ElectrodeFrame> {
    let Some(&header) = bytes.first() else {
        stats.short_frames += 1;
        return None;
    };

    let electrode = ((header & 0x0C) >> 2) as usize;
    if electrode >= family.electrode_count() {
        stats.invalid_electrode += 1;
        debug!(?family, electrode, "Índice de electrodo fuera de rango");
        return None;
    }
    let contact_good = header & 0x03 == 0;

    let groups = family.grouped_samples();
    let mut millivolts = Vec::with_capacity(groups);
    for i in 0..groups {
        let start = 1 + 3 * i;
        let Some(chunk) = bytes.get(start..start + 3) else {
            stats.dropped_groups += (groups - i) as u32;
            stats.short_frames += 1;
            break;
        };
        let raw = decode_i24([chunk[0], chunk[1], chunk[2]]);
        millivolts.push(raw as f64 * ELECTRODE_SCALE * 1000.0);
    }

    Some(ElectrodeFrame {
        electrode,
        contact_good,
        millivolts,
    })
}

/// Trama de estado: byte 0 batería (%), byte 1 bit 0 cargando.
/// Los campos ausentes conservan el valor anterior.
pub fn parse_status(bytes: &[u8], previous: DeviceStatus) -> DeviceStatus {
    let mut status = previous;
    if let Some(&battery) = bytes.first() {
        status.battery = battery.min(100);
    }
    if let Some(&flags) = bytes.get(1) {
        status.charging = flags & 0x01 != 0;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn motion_frame(prefix: &[u8], sample: i16, values: &[i16]) -> Vec<u8> {
        let mut bytes = prefix.to_vec();
        bytes.extend_from_slice(&sample.to_le_bytes());
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_full_motion_frame() {
        let mut stats = DecodeStats::default();
        let bytes = motion_frame(&[], 42, &[32767, -32767, 0, 32767, 0, -16384]);
        let samples = parse_motion(SensorFamily::Pikku, &bytes, &mut stats);

        assert_eq!(samples.len(), 6);
        assert!(samples.iter().all(|s| s.sample_index == 42));
        assert_abs_diff_eq!(samples[0].value, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(samples[1].value, -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(samples[3].value, 1.0, epsilon = 1e-6);
        assert_eq!(stats.short_frames, 0);
    }

    #[test]
    fn test_inertial_scaling_is_reversible() {
        let mut stats = DecodeStats::default();
        let acc_step = ACC_SCALE_4G / 4.0;
        let gyr_step = GYR_SCALE_1000 / 1000.0;
        for expected in [-0.9f32, -0.25, 0.0, 0.1234, 0.5, 0.999] {
            let acc_raw = (expected / acc_step).round() as i16;
            let gyr_raw = (expected / gyr_step).round() as i16;
            let bytes = motion_frame(&[], 1, &[acc_raw, acc_raw, acc_raw, gyr_raw, gyr_raw, gyr_raw]);
            let samples = parse_motion(SensorFamily::Bio2, &bytes, &mut stats);
            assert_abs_diff_eq!(samples[0].value, expected, epsilon = acc_step);
            assert_abs_diff_eq!(samples[4].value, expected, epsilon = gyr_step);
        }
    }

    #[test]
    fn test_short_frames_skip_groups() {
        let mut stats = DecodeStats::default();
        let accel_only = motion_frame(&[], 3, &[100, 200, 300]);
        assert_eq!(accel_only.len(), 8);
        let samples = parse_motion(SensorFamily::Bio1, &accel_only, &mut stats);
        assert_eq!(samples.len(), 3);

        let too_short = motion_frame(&[], 3, &[100, 200]);
        assert!(parse_motion(SensorFamily::Bio1, &too_short, &mut stats).is_empty());
        assert!(parse_motion(SensorFamily::Bio1, &[], &mut stats).is_empty());
        assert_eq!(stats.short_frames, 3);
    }

    #[test]
    fn test_croll_prefix_skipped() {
        let mut stats = DecodeStats::default();
        let bytes = motion_frame(&[0xAA], 7, &[32767, 0, 0, 0, 0, 0]);
        let samples = parse_motion(SensorFamily::Croll, &bytes, &mut stats);
        assert_eq!(samples.len(), 6);
        assert_eq!(samples[0].sample_index, 7);
        assert_abs_diff_eq!(samples[0].value, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_decode_i24_sign_correction() {
        assert_eq!(decode_i24([0x00, 0x00, 0x01]), 1);
        assert_eq!(decode_i24([0x7F, 0xFF, 0xFF]), 0x7F_FFFF);
        assert_eq!(decode_i24([0x80, 0x00, 0x00]), 0x80_0000 - 0xFF_FFFF);
        assert_eq!(decode_i24([0xFF, 0xFF, 0xFF]), 0);
    }

    #[test]
    fn test_electrode_frame() {
        let mut stats = DecodeStats::default();
        // electrodo 1, contacto correcto
        let bytes = [0b0000_0100, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7F, 0xFF, 0xFF];
        let frame = parse_electrode(SensorFamily::Bio2, &bytes, &mut stats).unwrap();
        assert_eq!(frame.electrode, 1);
        assert!(frame.contact_good);
        assert_eq!(frame.millivolts.len(), 4);
        assert_abs_diff_eq!(frame.millivolts[0], 16.0 * ELECTRODE_SCALE * 1000.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            frame.millivolts[1],
            (0x80_0000 - 0xFF_FFFF) as f64 * ELECTRODE_SCALE * 1000.0,
            epsilon = 1e-9
        );
        assert_eq!(frame.millivolts[2], 0.0);
    }

    #[test]
    fn test_electrode_lead_off_and_truncation() {
        let mut stats = DecodeStats::default();
        let bytes = [0b0000_0001, 0x00, 0x00, 0x01, 0x00, 0x00];
        let frame = parse_electrode(SensorFamily::Bio2, &bytes, &mut stats).unwrap();
        assert_eq!(frame.electrode, 0);
        assert!(!frame.contact_good);
        assert_eq!(frame.millivolts.len(), 1);
        assert_eq!(stats.dropped_groups, 3);

        // electrodo 3 no existe en Bio2
        assert!(parse_electrode(SensorFamily::Bio2, &[0b0000_1100], &mut stats).is_none());
        assert_eq!(stats.invalid_electrode, 1);
    }

    #[test]
    fn test_dispatch_by_channel() {
        let mut stats = DecodeStats::default();
        let family = SensorFamily::Pikku;
        let status = parse_frame(
            family,
            &family.status_channel().unwrap().to_uppercase(),
            &[87, 1],
            DeviceStatus::default(),
            &mut stats,
        );
        assert_eq!(
            status,
            ParsedFrame::Status(DeviceStatus {
                battery: 87,
                charging: true
            })
        );

        let ignored = parse_frame(family, "unknown", &[1, 2, 3], DeviceStatus::default(), &mut stats);
        assert_eq!(ignored, ParsedFrame::Ignored);
        assert_eq!(stats.unknown_channel, 1);
        assert_eq!(stats.frames, 2);
    }

    #[test]
    fn test_status_keeps_previous_fields() {
        let previous = DeviceStatus {
            battery: 50,
            charging: true,
        };
        assert_eq!(parse_status(&[], previous), previous);
        assert_eq!(parse_status(&[40], previous).battery, 40);
        assert!(parse_status(&[40], previous).charging);
    }
}
