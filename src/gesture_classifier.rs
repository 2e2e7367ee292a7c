use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{InputTensor, ModelKind, REGRESSION_OUTPUTS};

/// Porcentaje mínimo de la clase objetivo para dar el gesto por correcto
pub const TARGET_THRESHOLD: f32 = 80.0;

/// El segundo máximo debe quedar dentro de este ratio del máximo para considerarse ambiguo
pub const AMBIGUITY_RATIO: f32 = 0.8;

/// Hilos de CPU cuando no hay aceleración hardware
pub const NUM_LITE_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("ONNX Runtime error: {0}")]
    OnnxError(#[from] ort::Error),

    #[error("Invalid input shape: expected {expected:?}, got {actual:?}")]
    InvalidShape { expected: [usize; 4], actual: [usize; 4] },

    #[error("Invalid output size: expected {expected}, got {actual}")]
    InvalidOutputSize { expected: usize, actual: usize },

    #[error("Missing ONNX {kind}")]
    MissingIo { kind: &'static str },
}

/// Motor de inferencia opaco: tensor de entrada, vector de puntuaciones de salida
pub trait InferenceEngine: Send {
    fn run(&mut self, input: &InputTensor, output: &mut [f32]) -> Result<(), ClassifierError>;
}

/// Construye un motor a partir del artefacto descargado
pub trait EngineFactory: Send + Sync {
    fn build(&self, artifact: &[u8]) -> Result<Box<dyn InferenceEngine>, ClassifierError>;
}

pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxEngine {
    pub fn from_session(session: Session) -> Result<Self, ClassifierError> {
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or(ClassifierError::MissingIo { kind: "input" })?;

        let output_name = session
            .outputs
            .iter()
            .find(|output| {
                matches!(
                    output.output_type,
                    ValueType::Tensor {
                        ty: TensorElementType::Float32,
                        ..
                    }
                )
            })
            .or_else(|| session.outputs.first())
            .map(|output| output.name.clone())
            .ok_or(ClassifierError::MissingIo { kind: "output" })?;

        info!(input = %input_name, output = %output_name, "Modelo ONNX cargado");

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn run(&mut self, input: &InputTensor, output: &mut [f32]) -> Result<(), ClassifierError> {
        let value = Tensor::from_array((input.shape.to_vec(), input.data.clone()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => value])?;

        let (_shape, scores) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        copy_scores(scores, output)
    }
}

/// La salida del modelo debe tener exactamente una puntuación por etiqueta
fn copy_scores(scores: &[f32], output: &mut [f32]) -> Result<(), ClassifierError> {
    if scores.len() != output.len() {
        return Err(ClassifierError::InvalidOutputSize {
            expected: output.len(),
            actual: scores.len(),
        });
    }
    output.copy_from_slice(scores);
    Ok(())
}

/// Intenta primero la aceleración hardware (CUDA) y si no, CPU con hilos fijos
#[derive(Debug, Clone)]
pub struct OnnxEngineFactory {
    pub threads: usize,
}

impl Default for OnnxEngineFactory {
    fn default() -> Self {
        Self {
            threads: NUM_LITE_THREADS,
        }
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn build(&self, artifact: &[u8]) -> Result<Box<dyn InferenceEngine>, ClassifierError> {
        let accelerated = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
            .and_then(|builder| builder.commit_from_memory(artifact));

        let session = match accelerated {
            Ok(session) => {
                info!("Aceleración hardware disponible");
                session
            }
            Err(e) => {
                info!(reason = %e, threads = self.threads, "Aceleración hardware no disponible, usando CPU");
                Session::builder()?
                    .with_intra_threads(self.threads)?
                    .commit_from_memory(artifact)?
            }
        };

        Ok(Box::new(OnnxEngine::from_session(session)?))
    }
}

/// Criterio de ambigüedad entre el máximo y el segundo máximo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityRule {
    /// `max * 0.8 <= segundo`: el segundo está demasiado cerca del primero
    #[default]
    ScoreRatio,
    /// `indice_max * 0.8 <= segundo`: comparación histórica del índice con la puntuación
    LegacyIndex,
}

impl AmbiguityRule {
    pub fn is_ambiguous(self, best_index: usize, best: f32, second: f32) -> bool {
        match self {
            AmbiguityRule::ScoreRatio => best * AMBIGUITY_RATIO <= second,
            AmbiguityRule::LegacyIndex => best_index as f32 * AMBIGUITY_RATIO <= second,
        }
    }
}

/// Etiquetas de movimientos ordenadas alfabéticamente, igual que las salidas del modelo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCatalog {
    labels: Vec<String>,
    correct_index: usize,
    other_index: usize,
}

impl LabelCatalog {
    pub fn new<I, S>(labels: I, target: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        let correct_index = labels.iter().position(|l| l == target).unwrap_or(0);
        let other_index = labels
            .iter()
            .position(|l| l == "Other" || l == "other")
            .unwrap_or(0);
        Self {
            labels,
            correct_index,
            other_index,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn correct_index(&self) -> usize {
        self.correct_index
    }

    pub fn other_index(&self) -> usize {
        self.other_index
    }
}

/// Resultado de una ventana clasificada
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    /// Porcentajes sobre la suma de las salidas
    pub scores: Vec<f32>,
    pub best_index: usize,
    /// Diferencia entre el máximo y el segundo máximo
    pub margin: f32,
    pub target_probability: f32,
    pub is_target: bool,
    /// Etiqueta del gesto incorrecto; vacía si no es atribuible
    pub incorrect_label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Classification(ClassificationResult),
    /// Salida continua de 4 valores, sin normalizar
    Regression(Vec<f32>),
}

impl Decision {
    pub fn scores(&self) -> &[f32] {
        match self {
            Decision::Classification(result) => &result.scores,
            Decision::Regression(values) => values,
        }
    }
}

/// Normalización proporcional (no softmax). Suma no positiva o no finita → ceros.
pub fn normalize_scores(raw: &[f32]) -> Vec<f32> {
    let total: f32 = raw.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return vec![0.0; raw.len()];
    }
    raw.iter().map(|&score| score * 100.0 / total).collect()
}

/// Índice del máximo (primero en caso de empate), máximo y segundo máximo
fn top_two(scores: &[f32]) -> (usize, f32, f32) {
    let mut best_index = 0;
    let mut best = f32::MIN;
    for (i, &score) in scores.iter().enumerate() {
        if score > best {
            best = score;
            best_index = i;
        }
    }
    let second = scores
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != best_index)
        .map(|(_, &score)| score)
        .fold(f32::MIN, f32::max);

    let best = if scores.is_empty() { 0.0 } else { best };
    let second = if scores.len() < 2 { 0.0 } else { second };
    (best_index, best, second)
}

pub fn postprocess_scores(raw: &[f32], catalog: &LabelCatalog, rule: AmbiguityRule) -> ClassificationResult {
    let scores = normalize_scores(raw);
    let target_probability = scores.get(catalog.correct_index()).copied().unwrap_or(0.0);
    let (best_index, best, second) = top_two(&scores);

    let incorrect_label = if best_index != catalog.correct_index()
        && best_index != catalog.other_index()
        && rule.is_ambiguous(best_index, best, second)
    {
        catalog.label(best_index).unwrap_or_default().to_string()
    } else {
        String::new()
    };

    debug!(
        ?scores,
        best = catalog.label(best_index).unwrap_or_default(),
        target_probability,
        "Resultados inferencia"
    );

    ClassificationResult {
        is_target: target_probability > TARGET_THRESHOLD,
        scores,
        best_index,
        margin: best - second,
        target_probability,
        incorrect_label,
    }
}

/// Interpreta la salida cruda del motor según el tipo de modelo
pub fn interpret(kind: ModelKind, raw: &[f32], catalog: &LabelCatalog, rule: AmbiguityRule) -> Decision {
    match kind {
        ModelKind::Classifier => Decision::Classification(postprocess_scores(raw, catalog, rule)),
        ModelKind::Regression => Decision::Regression(raw.iter().copied().take(REGRESSION_OUTPUTS).collect()),
    }
}

/// Tamaño del buffer de salida [1][N] según el tipo de modelo
pub fn output_len(kind: ModelKind, catalog: &LabelCatalog) -> usize {
    match kind {
        ModelKind::Classifier => catalog.len(),
        ModelKind::Regression => REGRESSION_OUTPUTS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn catalog(target: &str) -> LabelCatalog {
        // ordenadas: [curl, other, squat]
        LabelCatalog::new(["squat", "curl", "other"], target)
    }

    #[test]
    fn test_output_size_must_match() {
        let mut output = [0.0; 3];
        copy_scores(&[0.1, 0.2, 0.7], &mut output).unwrap();
        assert_eq!(output, [0.1, 0.2, 0.7]);

        assert!(matches!(
            copy_scores(&[0.1, 0.2], &mut output),
            Err(ClassifierError::InvalidOutputSize { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            copy_scores(&[0.1, 0.2, 0.3, 0.4], &mut output),
            Err(ClassifierError::InvalidOutputSize { expected: 3, actual: 4 })
        ));
        // sin modificar tras el error
        assert_eq!(output, [0.1, 0.2, 0.7]);
    }

    #[test]
    fn test_catalog_indices() {
        let catalog = catalog("squat");
        assert_eq!(catalog.labels(), ["curl", "other", "squat"]);
        assert_eq!(catalog.correct_index(), 2);
        assert_eq!(catalog.other_index(), 1);

        let missing = LabelCatalog::new(["b", "a"], "zzz");
        assert_eq!(missing.correct_index(), 0);
        assert_eq!(missing.other_index(), 0);
    }

    #[test]
    fn test_normalize_percentages() {
        let scores = normalize_scores(&[10.0, 70.0, 20.0]);
        assert_abs_diff_eq!(scores[0], 10.0, epsilon = 1e-4);
        assert_abs_diff_eq!(scores[1], 70.0, epsilon = 1e-4);
        assert_abs_diff_eq!(scores[2], 20.0, epsilon = 1e-4);

        let probs = normalize_scores(&[0.25, 0.75]);
        assert_abs_diff_eq!(probs[1], 75.0, epsilon = 1e-4);

        assert_eq!(normalize_scores(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(normalize_scores(&[f32::NAN, 1.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_below_threshold_still_emits_scores() {
        // objetivo en el índice 1 con 70%
        let catalog = LabelCatalog::new(["a", "b", "other"], "b");
        let result = postprocess_scores(&[10.0, 70.0, 20.0], &catalog, AmbiguityRule::ScoreRatio);
        assert_abs_diff_eq!(result.target_probability, 70.0, epsilon = 1e-4);
        assert!(!result.is_target);
        assert_eq!(result.scores.len(), 3);
        assert_eq!(result.best_index, 1);
        assert_eq!(result.incorrect_label, "");
    }

    #[test]
    fn test_target_recognized_above_threshold() {
        let catalog = catalog("squat");
        let result = postprocess_scores(&[0.05, 0.05, 0.9], &catalog, AmbiguityRule::ScoreRatio);
        assert!(result.is_target);
        assert_abs_diff_eq!(result.margin, 85.0, epsilon = 1e-3);
    }

    #[test]
    fn test_ambiguous_wrong_gesture_reports_label() {
        // ordenadas: [other, wrong, x_target]
        let catalog = LabelCatalog::new(["other", "wrong", "x_target"], "x_target");
        let result = postprocess_scores(&[5.0, 48.0, 47.0], &catalog, AmbiguityRule::ScoreRatio);
        assert_eq!(result.best_index, 1);
        assert_eq!(result.incorrect_label, "wrong");
        assert!(!result.is_target);
    }

    #[test]
    fn test_confident_wrong_gesture_is_empty() {
        let catalog = LabelCatalog::new(["other", "wrong", "x_target"], "x_target");
        let result = postprocess_scores(&[5.0, 90.0, 5.0], &catalog, AmbiguityRule::ScoreRatio);
        assert_eq!(result.best_index, 1);
        assert_eq!(result.incorrect_label, "");
    }

    #[test]
    fn test_legacy_index_rule() {
        let catalog = LabelCatalog::new(["other", "wrong", "x_target"], "x_target");
        // índice 1 * 0.8 = 0.8 <= 5: la regla histórica lo marca ambiguo
        let result = postprocess_scores(&[5.0, 90.0, 5.0], &catalog, AmbiguityRule::LegacyIndex);
        assert_eq!(result.incorrect_label, "wrong");
    }

    #[test]
    fn test_other_class_never_reported() {
        let catalog = LabelCatalog::new(["other", "wrong", "x_target"], "x_target");
        let result = postprocess_scores(&[50.0, 45.0, 5.0], &catalog, AmbiguityRule::ScoreRatio);
        assert_eq!(result.best_index, 0);
        assert_eq!(result.incorrect_label, "");
    }

    #[test]
    fn test_regression_passthrough() {
        let catalog = catalog("squat");
        let decision = interpret(ModelKind::Regression, &[0.1, -2.0, 3.5, 7.0], &catalog, AmbiguityRule::ScoreRatio);
        assert_eq!(decision, Decision::Regression(vec![0.1, -2.0, 3.5, 7.0]));
        assert_eq!(output_len(ModelKind::Regression, &catalog), 4);
        assert_eq!(output_len(ModelKind::Classifier, &catalog), 3);
    }

    #[test]
    fn test_single_class() {
        let catalog = LabelCatalog::new(["only"], "only");
        let result = postprocess_scores(&[3.0], &catalog, AmbiguityRule::ScoreRatio);
        assert_abs_diff_eq!(result.scores[0], 100.0, epsilon = 1e-4);
        assert!(result.is_target);
        assert_abs_diff_eq!(result.margin, 100.0, epsilon = 1e-4);
    }
}
