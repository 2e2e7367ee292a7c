use std::collections::VecDeque;

use crate::types::ChannelDescriptor;

/// Capacidad por defecto de la caché de cada canal
pub const DEFAULT_CACHE_CAPACITY: usize = 6000;

/// Último valor y caché acotada de un canal lógico
#[derive(Debug, Clone)]
struct ChannelData {
    descriptor: ChannelDescriptor,
    latest: Option<(f32, i32)>,
    cache: VecDeque<(f32, i32)>,
    cache_enabled: bool,
}

/// Valores decodificados por canal, indexados por el índice de sensor de la familia
#[derive(Debug, Clone)]
pub struct ChannelStore {
    channels: Vec<ChannelData>,
    capacity: usize,
}

impl ChannelStore {
    pub fn new(descriptors: &[ChannelDescriptor], capacity: usize) -> Self {
        let channels = descriptors
            .iter()
            .map(|&descriptor| ChannelData {
                descriptor,
                latest: None,
                cache: VecDeque::with_capacity(capacity.min(1024)),
                cache_enabled: false,
            })
            .collect();
        Self { channels, capacity }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.descriptor.name == name)
    }

    /// Guarda el último valor y, si la caché está activa, lo añade descartando el más antiguo
    pub fn record(&mut self, channel: usize, value: f32, sample_index: i32) {
        let capacity = self.capacity;
        let Some(data) = self.channels.get_mut(channel) else {
            return;
        };
        data.latest = Some((value, sample_index));

        if !data.cache_enabled || capacity == 0 {
            return;
        }
        data.cache.push_back((value, sample_index));
        while data.cache.len() > capacity {
            data.cache.pop_front();
        }
    }

    pub fn enable_cache(&mut self, channel: usize, enable: bool) {
        if let Some(data) = self.channels.get_mut(channel) {
            data.cache_enabled = enable;
        }
    }

    pub fn enable_cache_by_name(&mut self, name: &str, enable: bool) {
        if let Some(index) = self.index_of(name) {
            self.enable_cache(index, enable);
        }
    }

    pub fn enable_all_caches(&mut self, enable: bool) {
        for data in &mut self.channels {
            data.cache_enabled = enable;
        }
    }

    pub fn is_cache_enabled(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(|c| c.cache_enabled)
    }

    /// Últimos `seconds * rate_hz` valores del canal, o los que haya.
    /// Un índice inválido devuelve una lista vacía.
    pub fn retrieve_window(&self, channel: usize, seconds: u32) -> Vec<(f32, i32)> {
        let Some(data) = self.channels.get(channel) else {
            return Vec::new();
        };
        let requested = seconds as usize * data.descriptor.rate_hz as usize;
        let skip = data.cache.len().saturating_sub(requested);
        data.cache.iter().skip(skip).copied().collect()
    }

    pub fn retrieve_window_by_name(&self, name: &str, seconds: u32) -> Vec<(f32, i32)> {
        match self.index_of(name) {
            Some(index) => self.retrieve_window(index, seconds),
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self, channel: usize) {
        if let Some(data) = self.channels.get_mut(channel) {
            data.cache.clear();
        }
    }

    pub fn clear_by_name(&mut self, name: &str) {
        if let Some(index) = self.index_of(name) {
            self.clear(index);
        }
    }

    pub fn latest(&self, channel: usize) -> Option<f32> {
        self.channels.get(channel)?.latest.map(|(value, _)| value)
    }

    /// Últimos valores de los canales `0..n` (0.0 si un canal aún no ha llegado)
    pub fn latest_row(&self, n: usize) -> Vec<f32> {
        (0..n).map(|c| self.latest(c).unwrap_or(0.0)).collect()
    }

    pub fn cache_len(&self, channel: usize) -> usize {
        self.channels.get(channel).map_or(0, |c| c.cache.len())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
