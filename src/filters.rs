//! Filtros IIR Butterworth y cadena de envolvente EMG.
//!
//! Cada electrodo tiene su propia cascada: rechazo de banda (red eléctrica),
//! pasa-banda y pasa-bajos sobre la señal rectificada. Los coeficientes se
//! calculan una sola vez al activar; la memoria de los filtros persiste entre
//! muestras hasta la siguiente activación.

use std::f64::consts::PI;

use num_complex::Complex64;
use thiserror::Error;

use crate::types::{SensorFamily, ENVELOPE_DECIMATION};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Frecuencia de muestreo inválida: {0} Hz")]
    InvalidSampleRate(f64),

    #[error("Orden de filtro inválido: {0}")]
    InvalidOrder(usize),

    #[error("Frecuencia {freq} Hz fuera de (0, {nyquist}) Hz")]
    OutOfRange { freq: f64, nyquist: f64 },
}

/// Sección de segundo orden, forma directa II transpuesta
#[derive(Debug, Clone, Copy, Default)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    s1: f64,
    s2: f64,
}

impl Biquad {
    /// Construye la sección a partir de sus polos y ceros digitales.
    /// Sin segundo polo/cero queda como sección de primer orden.
    fn from_roots(
        poles: (Complex64, Option<Complex64>),
        zeros: (Complex64, Option<Complex64>),
        reference: Complex64,
    ) -> Self {
        let (b1, b2) = Self::polynomial(zeros);
        let (a1, a2) = Self::polynomial(poles);
        let mut section = Self {
            b0: 1.0,
            b1,
            b2,
            a1,
            a2,
            ..Self::default()
        };

        // Ganancia unitaria en la frecuencia de referencia
        let z_inv = reference.inv();
        let num = Complex64::new(section.b0, 0.0) + z_inv * section.b1 + z_inv * z_inv * section.b2;
        let den = Complex64::new(1.0, 0.0) + z_inv * section.a1 + z_inv * z_inv * section.a2;
        let gain = den.norm() / num.norm().max(f64::MIN_POSITIVE);
        section.b0 *= gain;
        section.b1 *= gain;
        section.b2 *= gain;
        section
    }

    fn polynomial(roots: (Complex64, Option<Complex64>)) -> (f64, f64) {
        match roots {
            (r1, Some(r2)) => (-(r1 + r2).re, (r1 * r2).re),
            (r1, None) => (-r1.re, 0.0),
        }
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.s1;
        self.s1 = self.b1 * x - self.a1 * y + self.s2;
        self.s2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.s1 = 0.0;
        self.s2 = 0.0;
    }
}

/// Filtro Butterworth de orden arbitrario como cascada de biquads
#[derive(Debug, Clone)]
pub struct Butterworth {
    sections: Vec<Biquad>,
}

/// Polos del prototipo analógico normalizado: semiplano superior más el polo real si el orden es impar
fn prototype_poles(order: usize) -> (Vec<Complex64>, Option<f64>) {
    let upper = (0..order / 2)
        .map(|k| {
            let theta = PI / 2.0 + PI * (2 * k + 1) as f64 / (2 * order) as f64;
            Complex64::from_polar(1.0, theta)
        })
        .collect();
    let real = (order % 2 == 1).then_some(-1.0);
    (upper, real)
}

fn prewarp(freq: f64, fs: f64) -> f64 {
    2.0 * fs * (PI * freq / fs).tan()
}

fn bilinear(s: Complex64, fs: f64) -> Complex64 {
    let two_fs = Complex64::new(2.0 * fs, 0.0);
    (two_fs + s) / (two_fs - s)
}

fn validate(order: usize, fs: f64, freqs: &[f64]) -> Result<(), FilterError> {
    if !(fs.is_finite() && fs > 0.0) {
        return Err(FilterError::InvalidSampleRate(fs));
    }
    if order == 0 {
        return Err(FilterError::InvalidOrder(order));
    }
    let nyquist = fs / 2.0;
    for &freq in freqs {
        if !(freq > 0.0 && freq < nyquist) {
            return Err(FilterError::OutOfRange { freq, nyquist });
        }
    }
    Ok(())
}

impl Butterworth {
    pub fn low_pass(order: usize, fs: f64, cutoff: f64) -> Result<Self, FilterError> {
        validate(order, fs, &[cutoff])?;
        let wc = prewarp(cutoff, fs);
        let minus_one = Complex64::new(-1.0, 0.0);
        let dc = Complex64::new(1.0, 0.0);

        let (upper, real) = prototype_poles(order);
        let mut sections: Vec<Biquad> = upper
            .into_iter()
            .map(|p| {
                let zd = bilinear(p * wc, fs);
                Biquad::from_roots((zd, Some(zd.conj())), (minus_one, Some(minus_one)), dc)
            })
            .collect();
        if let Some(p) = real {
            let zd = bilinear(Complex64::new(p * wc, 0.0), fs);
            sections.push(Biquad::from_roots((zd, None), (minus_one, None), dc));
        }
        Ok(Self { sections })
    }

    /// Pasa-banda centrado en `center` con ancho `width` (bordes center ± width/2)
    pub fn band_pass(order: usize, fs: f64, center: f64, width: f64) -> Result<Self, FilterError> {
        let (f1, f2) = (center - width / 2.0, center + width / 2.0);
        validate(order, fs, &[f1, f2])?;
        let (w1, w2) = (prewarp(f1, fs), prewarp(f2, fs));
        let w0 = (w1 * w2).sqrt();
        let bw = w2 - w1;
        let zeros = (Complex64::new(1.0, 0.0), Some(Complex64::new(-1.0, 0.0)));
        let reference = Complex64::from_polar(1.0, 2.0 * (w0 / (2.0 * fs)).atan());

        let transform = |p: Complex64| {
            let half = p * (bw / 2.0);
            let d = (half * half - w0 * w0).sqrt();
            (bilinear(half + d, fs), bilinear(half - d, fs))
        };

        let (upper, real) = prototype_poles(order);
        let mut sections = Vec::with_capacity(order);
        for p in upper {
            let (z1, z2) = transform(p);
            sections.push(Biquad::from_roots((z1, Some(z1.conj())), zeros, reference));
            sections.push(Biquad::from_roots((z2, Some(z2.conj())), zeros, reference));
        }
        if let Some(p) = real {
            let (z1, z2) = transform(Complex64::new(p, 0.0));
            sections.push(Biquad::from_roots((z1, Some(z2)), zeros, reference));
        }
        Ok(Self { sections })
    }

    /// Rechazo de banda centrado en `center` con ancho `width`
    pub fn band_stop(order: usize, fs: f64, center: f64, width: f64) -> Result<Self, FilterError> {
        let (f1, f2) = (center - width / 2.0, center + width / 2.0);
        validate(order, fs, &[f1, f2])?;
        let (w1, w2) = (prewarp(f1, fs), prewarp(f2, fs));
        let w0 = (w1 * w2).sqrt();
        let bw = w2 - w1;
        let notch = bilinear(Complex64::new(0.0, w0), fs);
        let zeros = (notch, Some(notch.conj()));
        let dc = Complex64::new(1.0, 0.0);

        let transform = |p: Complex64| {
            let half = Complex64::new(bw / 2.0, 0.0) / p;
            let d = (half * half - w0 * w0).sqrt();
            (bilinear(half + d, fs), bilinear(half - d, fs))
        };

        let (upper, real) = prototype_poles(order);
        let mut sections = Vec::with_capacity(order);
        for p in upper {
            let (z1, z2) = transform(p);
            sections.push(Biquad::from_roots((z1, Some(z1.conj())), zeros, dc));
            sections.push(Biquad::from_roots((z2, Some(z2.conj())), zeros, dc));
        }
        if let Some(p) = real {
            let (z1, z2) = transform(Complex64::new(p, 0.0));
            sections.push(Biquad::from_roots((z1, Some(z2)), zeros, dc));
        }
        Ok(Self { sections })
    }

    pub fn filter(&mut self, x: f64) -> f64 {
        self.sections.iter_mut().fold(x, |acc, s| s.process(acc))
    }

    pub fn reset(&mut self) {
        self.sections.iter_mut().for_each(Biquad::reset);
    }
}

/// Parámetros de la cadena EMG
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeConfig {
    pub order: usize,
    pub notch_center: f64,
    pub notch_width: f64,
    pub band_center: f64,
    pub band_width: f64,
    pub envelope_cutoff: f64,
    /// Ganancia aplicada tras rectificar
    pub rectifier_gain: f64,
    pub average_len: usize,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            order: 2,
            notch_center: 50.0,
            notch_width: 10.0,
            band_center: 30.0,
            band_width: 40.0,
            envelope_cutoff: 4.0,
            rectifier_gain: 2.0,
            average_len: ENVELOPE_DECIMATION as usize,
        }
    }
}

/// Promedio de N valores de envolvente normalizado por el máximo histórico del canal
#[derive(Debug, Clone)]
pub struct EnvelopeNormalizer {
    cache: Vec<f64>,
    len: usize,
    max_scale: f32,
}

impl EnvelopeNormalizer {
    pub fn new(len: usize) -> Self {
        Self {
            cache: Vec::with_capacity(len),
            len: len.max(1),
            max_scale: 1.0,
        }
    }

    /// Devuelve un valor en [-1, 1] cada `len` entradas
    pub fn push(&mut self, value: f64) -> Option<f32> {
        self.cache.push(value);
        if self.cache.len() < self.len {
            return None;
        }

        let mean = (self.cache.iter().sum::<f64>() / self.cache.len() as f64) as f32;
        self.cache.clear();
        if self.max_scale < mean {
            self.max_scale = mean;
        }
        Some((mean / self.max_scale).clamp(-1.0, 1.0))
    }

    pub fn max_scale(&self) -> f32 {
        self.max_scale
    }
}

/// Cascada completa de un electrodo
#[derive(Debug, Clone)]
pub struct EnvelopeFilter {
    band_stop: Butterworth,
    band_pass: Butterworth,
    low_pass: Butterworth,
    rectifier_gain: f64,
    normalizer: EnvelopeNormalizer,
}

impl EnvelopeFilter {
    pub fn new(fs: f64, config: &EnvelopeConfig) -> Result<Self, FilterError> {
        Ok(Self {
            band_stop: Butterworth::band_stop(config.order, fs, config.notch_center, config.notch_width)?,
            band_pass: Butterworth::band_pass(config.order, fs, config.band_center, config.band_width)?,
            low_pass: Butterworth::low_pass(config.order, fs, config.envelope_cutoff)?,
            rectifier_gain: config.rectifier_gain,
            normalizer: EnvelopeNormalizer::new(config.average_len),
        })
    }

    /// Envolvente sin normalizar de una muestra en milivoltios
    pub fn envelope(&mut self, millivolts: f64) -> f64 {
        let x = self.band_stop.filter(millivolts);
        let x = self.band_pass.filter(x);
        self.low_pass.filter(x.abs() * self.rectifier_gain)
    }

    pub fn process(&mut self, millivolts: f64) -> Option<f32> {
        let envelope = self.envelope(millivolts);
        self.normalizer.push(envelope)
    }
}

/// Arena de filtros indexada por electrodo; nunca compartida entre dispositivos
#[derive(Debug, Clone)]
pub struct FilterBank {
    channels: Vec<EnvelopeFilter>,
}

impl FilterBank {
    /// Calcula los coeficientes para todos los electrodos de la familia
    pub fn activate(family: SensorFamily, config: &EnvelopeConfig) -> Result<Self, FilterError> {
        let count = family.electrode_count();
        if count == 0 {
            return Ok(Self { channels: Vec::new() });
        }
        let fs = family.electrode_rate_hz() as f64;
        let channels = (0..count)
            .map(|_| EnvelopeFilter::new(fs, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { channels })
    }

    pub fn process(&mut self, electrode: usize, millivolts: f64) -> Option<f32> {
        self.channels.get_mut(electrode)?.process(millivolts)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
