use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DetectorConfig, InputMode};
use crate::gesture_buffer::{Interleaver, SampleWindow};
use crate::gesture_classifier::{
    interpret, output_len, ClassifierError, Decision, EngineFactory, InferenceEngine, LabelCatalog,
};
use crate::types::{DetectorState, InputTensor, Keypoint};

/// Receptor de los resultados del detector. Se invoca desde hilos de inferencia,
/// nunca con un lock interno tomado.
pub trait MotionListener: Send + Sync {
    fn on_scores_updated(&self, scores: &[f32]);
    fn on_target_gesture_recognized(&self, probability: f32, tensor: &InputTensor);
    /// Etiqueta vacía cuando el error no es atribuible a un gesto concreto
    fn on_ambiguous_or_wrong_gesture(&self, label: &str);
    fn on_state_changed(&self, _state: DetectorState) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    ScoresUpdated(Vec<f32>),
    TargetRecognized { probability: f32, tensor: InputTensor },
    AmbiguousOrWrong(String),
    StateChanged(DetectorState),
}

/// Reenvía los callbacks como eventos por un canal crossbeam
pub struct ChannelListener {
    tx: Sender<DetectorEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<DetectorEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: DetectorEvent) {
        // sin receptor no hay nadie a quien avisar
        let _ = self.tx.send(event);
    }
}

impl MotionListener for ChannelListener {
    fn on_scores_updated(&self, scores: &[f32]) {
        self.send(DetectorEvent::ScoresUpdated(scores.to_vec()));
    }

    fn on_target_gesture_recognized(&self, probability: f32, tensor: &InputTensor) {
        self.send(DetectorEvent::TargetRecognized {
            probability,
            tensor: tensor.clone(),
        });
    }

    fn on_ambiguous_or_wrong_gesture(&self, label: &str) {
        self.send(DetectorEvent::AmbiguousOrWrong(label.to_string()));
    }

    fn on_state_changed(&self, state: DetectorState) {
        self.send(DetectorEvent::StateChanged(state));
    }
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Modelo no encontrado: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No se pudo construir el motor: {0}")]
    Engine(#[from] ClassifierError),

    #[error("Servicio de modelos no disponible: {0}")]
    Unavailable(String),
}

/// Origen de los artefactos de modelo, identificados por nombre ("mm_12", "mmr_3")
pub trait ModelSource: Send + Sync {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, AcquisitionError>;
}

/// Modelos en disco: `<root>/<name>.onnx`
#[derive(Debug, Clone)]
pub struct DirectoryModelSource {
    root: PathBuf,
}

impl DirectoryModelSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.onnx"))
    }
}

impl ModelSource for DirectoryModelSource {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, AcquisitionError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(AcquisitionError::NotFound(path.display().to_string()));
        }
        Ok(fs::read(&path)?)
    }
}

pub enum AcquisitionOutcome {
    Ready(Box<dyn InferenceEngine>),
    Failed(AcquisitionError),
    Cancelled,
}

struct EngineSlot {
    state: DetectorState,
    engine: Option<Box<dyn InferenceEngine>>,
    output: Vec<f32>,
    /// Se incrementa en cada start/stop; una adquisición solo se instala si sigue vigente
    generation: u64,
    cancel: Option<Arc<AtomicBool>>,
}

struct WindowSlot {
    window: SampleWindow,
    interleaver: Interleaver,
}

struct Inner {
    config: DetectorConfig,
    catalog: LabelCatalog,
    engine: Mutex<EngineSlot>,
    window: Mutex<WindowSlot>,
    listener: RwLock<Option<Arc<dyn MotionListener>>>,
    source: Arc<dyn ModelSource>,
    factory: Arc<dyn EngineFactory>,
}

/// Detector de movimiento: adquiere el modelo, acumula ventanas y clasifica.
/// Clonar comparte el mismo detector.
#[derive(Clone)]
pub struct MotionDetector {
    inner: Arc<Inner>,
}

impl MotionDetector {
    pub fn new(config: DetectorConfig, source: Arc<dyn ModelSource>, factory: Arc<dyn EngineFactory>) -> Self {
        let catalog = config.catalog();
        let window = WindowSlot {
            window: SampleWindow::new(config.gesture_samples(), config.channels_per_device, config.num_devices()),
            interleaver: Interleaver::new(config.channels_per_device, config.decimation()),
        };
        let output = vec![0.0; output_len(config.kind, &catalog)];

        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                engine: Mutex::new(EngineSlot {
                    state: DetectorState::Stopped,
                    engine: None,
                    output,
                    generation: 0,
                    cancel: None,
                }),
                window: Mutex::new(window),
                listener: RwLock::new(None),
                source,
                factory,
            }),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn MotionListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.inner.listener.write() = None;
    }

    pub fn state(&self) -> DetectorState {
        self.inner.engine.lock().state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &LabelCatalog {
        &self.inner.catalog
    }

    /// Escalares acumulados en la ventana actual
    pub fn buffered_values(&self) -> usize {
        self.inner.window.lock().window.len()
    }

    /// Lanza la adquisición del modelo. Sin efecto salvo en Stopped.
    pub fn start(&self) {
        let (generation, cancel) = {
            let mut slot = self.inner.engine.lock();
            if slot.state != DetectorState::Stopped {
                trace!(state = ?slot.state, "start ignorado");
                return;
            }
            slot.state = DetectorState::Acquiring;
            slot.generation += 1;
            let cancel = Arc::new(AtomicBool::new(false));
            slot.cancel = Some(Arc::clone(&cancel));
            (slot.generation, cancel)
        };

        let model_name = self.inner.config.model_name();
        info!(model = %model_name, "📥 Adquiriendo modelo");
        self.inner.notify_state(DetectorState::Acquiring);

        let (tx, rx) = bounded::<AcquisitionOutcome>(1);
        let source = Arc::clone(&self.inner.source);
        let factory = Arc::clone(&self.inner.factory);
        thread::spawn(move || {
            let outcome = acquire(source.as_ref(), factory.as_ref(), &model_name, &cancel);
            let _ = tx.send(outcome);
        });

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let outcome = rx.recv().unwrap_or(AcquisitionOutcome::Cancelled);
            inner.complete_acquisition(generation, outcome);
        });
    }

    /// Cancela la adquisición en curso y libera el motor. Sin efecto en Stopped.
    pub fn stop(&self) {
        {
            let mut slot = self.inner.engine.lock();
            if slot.state == DetectorState::Stopped {
                trace!("stop ignorado");
                return;
            }
            if let Some(cancel) = slot.cancel.take() {
                cancel.store(true, Ordering::SeqCst);
            }
            slot.state = DetectorState::Stopped;
            slot.generation += 1;
            slot.engine = None;
        }
        self.inner.reset_window();
        info!("⏹️  Detector detenido");
        self.inner.notify_state(DetectorState::Stopped);
    }

    fn accepts_samples(&self) -> bool {
        self.inner.config.input_mode == InputMode::Windowed && self.state() == DetectorState::Ready
    }

    /// Fila del dispositivo físico `device` de la configuración. Las filas de
    /// dispositivos sin hueco en la ventana se descartan.
    pub fn on_device_row(&self, device: usize, row: &[f32]) {
        match self.inner.config.window_slot(device) {
            Some(slot) => self.on_sample_arrived(slot, row),
            None => trace!(device, "Dispositivo sin hueco en la ventana"),
        }
    }

    /// Fila de un dispositivo (ya en su frecuencia nativa). Al completarse la
    /// ventana se clasifica en un hilo aparte.
    pub fn on_sample_arrived(&self, device: usize, row: &[f32]) {
        if !self.accepts_samples() {
            trace!(device, "Muestra ignorada, detector no listo");
            return;
        }

        let tensor = {
            let mut slot = self.inner.window.lock();
            let Some(full_row) = slot.interleaver.push(device, row) else {
                return;
            };
            slot.window.enqueue_row(&full_row);
            slot.window.drain()
        };

        if let Some(tensor) = tensor {
            self.spawn_inference(tensor);
        }
    }

    /// Muestra de pose: se encolan x, y de cada keypoint
    pub fn on_external_sample(&self, keypoints: &[Keypoint], sample: i32) {
        if !self.accepts_samples() {
            trace!(sample, "Keypoints ignorados, detector no listo");
            return;
        }

        let tensor = {
            let mut slot = self.inner.window.lock();
            for keypoint in keypoints {
                slot.window.enqueue(keypoint.x);
                slot.window.enqueue(keypoint.y);
            }
            slot.window.drain()
        };

        if let Some(tensor) = tensor {
            self.spawn_inference(tensor);
        }
    }

    fn spawn_inference(&self, tensor: InputTensor) {
        let detector = self.clone();
        thread::spawn(move || {
            detector.classify_tensor(&tensor);
        });
    }

    /// Inferencia síncrona sobre un tensor [1][muestras][canales][1].
    /// Devuelve None si el detector no está listo o el tensor no cuadra.
    pub fn classify_tensor(&self, tensor: &InputTensor) -> Option<Decision> {
        let expected = [1, self.inner.config.gesture_samples(), self.inner.config.tensor_channels(), 1];
        if tensor.shape != expected {
            warn!(expected = ?expected, actual = ?tensor.shape, "Forma de tensor inválida");
            return None;
        }

        let decision = {
            let mut guard = self.inner.engine.lock();
            if guard.state != DetectorState::Ready {
                trace!(state = ?guard.state, "Clasificación ignorada");
                return None;
            }
            let slot = &mut *guard;
            let engine = slot.engine.as_mut()?;
            if let Err(e) = engine.run(tensor, &mut slot.output) {
                error!(error = %e, "❌ Error en inferencia");
                return None;
            }
            interpret(
                self.inner.config.kind,
                &slot.output,
                &self.inner.catalog,
                self.inner.config.ambiguity_rule,
            )
        };

        self.inner.dispatch(&decision, tensor);
        Some(decision)
    }
}

fn acquire(
    source: &dyn ModelSource,
    factory: &dyn EngineFactory,
    model_name: &str,
    cancel: &AtomicBool,
) -> AcquisitionOutcome {
    if cancel.load(Ordering::SeqCst) {
        return AcquisitionOutcome::Cancelled;
    }
    let artifact = match source.fetch(model_name) {
        Ok(bytes) => bytes,
        Err(e) => return AcquisitionOutcome::Failed(e),
    };

    if cancel.load(Ordering::SeqCst) {
        return AcquisitionOutcome::Cancelled;
    }
    debug!(model = model_name, bytes = artifact.len(), "Artefacto descargado");

    match factory.build(&artifact) {
        Ok(_) if cancel.load(Ordering::SeqCst) => AcquisitionOutcome::Cancelled,
        Ok(engine) => AcquisitionOutcome::Ready(engine),
        Err(e) => AcquisitionOutcome::Failed(e.into()),
    }
}

impl Inner {
    fn complete_acquisition(&self, generation: u64, outcome: AcquisitionOutcome) {
        let state = {
            let mut slot = self.engine.lock();
            if slot.generation != generation || slot.state != DetectorState::Acquiring {
                debug!(generation, current = slot.generation, "Adquisición obsoleta descartada");
                return;
            }
            slot.cancel = None;

            match outcome {
                AcquisitionOutcome::Ready(engine) => {
                    slot.engine = Some(engine);
                    slot.output.iter_mut().for_each(|v| *v = 0.0);
                    slot.state = DetectorState::Ready;
                    info!(model = %self.config.model_name(), "✅ Modelo listo");
                }
                AcquisitionOutcome::Failed(e) => {
                    error!(model = %self.config.model_name(), error = %e, "❌ Error adquiriendo modelo");
                    slot.state = DetectorState::Stopped;
                }
                AcquisitionOutcome::Cancelled => {
                    slot.state = DetectorState::Stopped;
                }
            }
            slot.state
        };

        if state == DetectorState::Ready {
            self.reset_window();
        }
        self.notify_state(state);
    }

    fn reset_window(&self) {
        let mut slot = self.window.lock();
        slot.window.reset();
        slot.interleaver.reset();
    }

    fn listener(&self) -> Option<Arc<dyn MotionListener>> {
        self.listener.read().clone()
    }

    fn notify_state(&self, state: DetectorState) {
        if let Some(listener) = self.listener() {
            listener.on_state_changed(state);
        }
    }

    fn dispatch(&self, decision: &Decision, tensor: &InputTensor) {
        let Some(listener) = self.listener() else {
            return;
        };

        match decision {
            Decision::Classification(result) => {
                listener.on_ambiguous_or_wrong_gesture(&result.incorrect_label);
                if result.is_target {
                    info!(probability = result.target_probability, "🎯 Gesto objetivo reconocido");
                    listener.on_target_gesture_recognized(result.target_probability, tensor);
                }
                listener.on_scores_updated(&result.scores);
            }
            Decision::Regression(values) => listener.on_scores_updated(values),
        }
    }
}
