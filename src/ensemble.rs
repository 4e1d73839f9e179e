//! Pluggable sequence-imputation models and the selection policy over them.
//!
//! Models see a normalized `(1, time, width)` tensor with `NaN` marking the
//! cells to reconstruct. A [`ModelRegistry`] is built once per run and shared
//! read-only by every worker.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Axis};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::matrix::ImputationMatrix;

pub const LERP_MODEL: &str = "Lerp";
const MODEL_FILE_EXTENSION: &str = "pypots";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("no model available for imputation")]
    Unavailable,
    #[error("failed to load model {name} from {path}: {reason}")]
    Load {
        name: String,
        path: String,
        reason: String,
    },
    #[error("model {name} failed during inference: {reason}")]
    Inference { name: String, reason: String },
    #[error("model {name} returned shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
}

pub trait ImputationModel: Send + Sync {
    fn name(&self) -> &str;

    /// Fixed feature width the model was trained on; narrower inputs are
    /// padded with missing columns. `None` accepts any width.
    fn input_width(&self) -> Option<usize> {
        None
    }

    /// `input` is `(1, time, width)` in `[0, 1]` with `NaN` gaps. The output
    /// must have the same shape.
    fn impute(&self, input: &Array3<f64>) -> Result<Array3<f64>, ModelError>;
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, name: &str, path: &Path) -> Result<Arc<dyn ImputationModel>, ModelError>;
}

/// Resolves the built-in interpolation model. Serialized network weights need
/// an external runtime, so every other name fails to load and its slot stays
/// unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinModelLoader;

impl ModelLoader for BuiltinModelLoader {
    fn load(&self, name: &str, path: &Path) -> Result<Arc<dyn ImputationModel>, ModelError> {
        if name.eq_ignore_ascii_case(LERP_MODEL) {
            return Ok(Arc::new(LinearInterpolation));
        }
        Err(ModelError::Load {
            name: name.to_string(),
            path: path.display().to_string(),
            reason: "no runtime registered for serialized model weights".to_string(),
        })
    }
}

/// Per-column linear interpolation. Leading and trailing gaps take the nearest
/// observed value; a column with no observation stays missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearInterpolation;

impl ImputationModel for LinearInterpolation {
    fn name(&self) -> &str {
        LERP_MODEL
    }

    fn impute(&self, input: &Array3<f64>) -> Result<Array3<f64>, ModelError> {
        let mut output = input.clone();
        for mut sample in output.axis_iter_mut(Axis(0)) {
            for mut column in sample.axis_iter_mut(Axis(1)) {
                let values: Vec<f64> = column.iter().copied().collect();
                for (slot, value) in column.iter_mut().zip(interpolate_series(&values)) {
                    *slot = value;
                }
            }
        }
        Ok(output)
    }
}

/// Fills `NaN` gaps by linear interpolation between observed neighbours,
/// holding the edges at the nearest observation.
pub fn interpolate_series(values: &[f64]) -> Vec<f64> {
    let known: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(i, v)| (i, *v))
        .collect();

    let (Some(&(first_idx, first_val)), Some(&(last_idx, last_val))) = (known.first(), known.last())
    else {
        return values.to_vec();
    };

    let mut out = values.to_vec();
    for (i, slot) in out.iter_mut().enumerate() {
        if !slot.is_nan() {
            continue;
        }
        *slot = if i < first_idx {
            first_val
        } else if i > last_idx {
            last_val
        } else {
            let right = known.partition_point(|(k, _)| *k < i);
            let (x1, y1) = known[right];
            let (x0, y0) = known[right - 1];
            y0 + (y1 - y0) * (i - x0) as f64 / (x1 - x0) as f64
        };
    }
    out
}

#[derive(Clone)]
pub struct ModelSlot {
    pub name: String,
    pub path: Option<PathBuf>,
    model: Option<Arc<dyn ImputationModel>>,
}

impl ModelSlot {
    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&Arc<dyn ImputationModel>> {
        self.model.as_ref()
    }
}

impl fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSlot")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Models in priority order. Slots whose load failed are kept so the run
/// can report them.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    slots: Vec<ModelSlot>,
}

impl ModelRegistry {
    /// Loads `<dir>/<name lowercase>.pypots` for every name in `priority`.
    pub fn load(dir: &Path, priority: &[String], loader: &dyn ModelLoader) -> Self {
        let slots = priority
            .iter()
            .map(|name| {
                let path = dir.join(format!("{}.{MODEL_FILE_EXTENSION}", name.to_lowercase()));
                let model = match loader.load(name, &path) {
                    Ok(model) => {
                        info!(
                            component = "ensemble",
                            event = "ensemble.model.loaded",
                            model = %name,
                            path = %path.display()
                        );
                        Some(model)
                    }
                    Err(err) => {
                        warn!(
                            component = "ensemble",
                            event = "ensemble.model.unavailable",
                            model = %name,
                            path = %path.display(),
                            error = %err
                        );
                        None
                    }
                };
                ModelSlot {
                    name: name.clone(),
                    path: Some(path),
                    model,
                }
            })
            .collect();
        Self { slots }
    }

    /// Registry over already-constructed models, all available.
    pub fn from_models(models: Vec<Arc<dyn ImputationModel>>) -> Self {
        let slots = models
            .into_iter()
            .map(|model| ModelSlot {
                name: model.name().to_string(),
                path: None,
                model: Some(model),
            })
            .collect();
        Self { slots }
    }

    pub fn slots(&self) -> &[ModelSlot] {
        &self.slots
    }

    pub fn available(&self) -> Vec<Arc<dyn ImputationModel>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.model.clone())
            .collect()
    }

    pub fn available_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|slot| slot.is_available())
            .map(|slot| slot.name.clone())
            .collect()
    }

    pub fn has_available(&self) -> bool {
        self.slots.iter().any(ModelSlot::is_available)
    }
}

/// A chosen reconstruction, still normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub model: String,
    pub values: Array2<f64>,
}

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Picks a reconstruction of `normalized` from `models` (priority order),
    /// or `None` when no model produced one.
    fn select(
        &self,
        models: &[Arc<dyn ImputationModel>],
        normalized: &Array2<f64>,
    ) -> Option<Selection>;
}

/// The first model, in priority order, that produces a result wins. Later
/// models are never invoked.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl SelectionStrategy for FirstAvailable {
    fn name(&self) -> &str {
        "first_available"
    }

    fn select(
        &self,
        models: &[Arc<dyn ImputationModel>],
        normalized: &Array2<f64>,
    ) -> Option<Selection> {
        models.iter().find_map(|model| match run_model(model.as_ref(), normalized) {
            Ok(values) => Some(Selection {
                model: model.name().to_string(),
                values,
            }),
            Err(err) => {
                warn!(
                    component = "ensemble",
                    event = "ensemble.model.failed",
                    model = model.name(),
                    error = %err
                );
                None
            }
        })
    }
}

/// Runs every model and averages their outputs cell by cell, ignoring cells a
/// model left missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct CandidateMean;

impl SelectionStrategy for CandidateMean {
    fn name(&self) -> &str {
        "candidate_mean"
    }

    fn select(
        &self,
        models: &[Arc<dyn ImputationModel>],
        normalized: &Array2<f64>,
    ) -> Option<Selection> {
        let mut names = Vec::new();
        let mut outputs = Vec::new();
        for model in models {
            match run_model(model.as_ref(), normalized) {
                Ok(values) => {
                    names.push(model.name().to_string());
                    outputs.push(values);
                }
                Err(err) => warn!(
                    component = "ensemble",
                    event = "ensemble.model.failed",
                    model = model.name(),
                    error = %err
                ),
            }
        }
        if outputs.is_empty() {
            return None;
        }

        let values = Array2::from_shape_fn(normalized.dim(), |idx| {
            let (sum, n) = outputs
                .iter()
                .map(|out| out[idx])
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        });
        Some(Selection {
            model: format!("mean({})", names.join("+")),
            values,
        })
    }
}

/// Invokes one model on a `(time, k)` matrix, padding to the model's width
/// and truncating back to `k` columns.
pub fn run_model(
    model: &dyn ImputationModel,
    normalized: &Array2<f64>,
) -> Result<Array2<f64>, ModelError> {
    let (steps, k) = normalized.dim();
    let width = match model.input_width() {
        Some(width) if width < k => {
            return Err(ModelError::ShapeMismatch {
                name: model.name().to_string(),
                expected: (1, steps, width),
                actual: (1, steps, k),
            })
        }
        Some(width) => width,
        None => k,
    };

    let mut input = Array3::from_elem((1, steps, width), f64::NAN);
    input.slice_mut(s![0, .., ..k]).assign(normalized);

    let output = model.impute(&input)?;
    if output.dim() != (1, steps, width) {
        return Err(ModelError::ShapeMismatch {
            name: model.name().to_string(),
            expected: (1, steps, width),
            actual: output.dim(),
        });
    }
    Ok(output.slice(s![0, .., ..k]).to_owned())
}

/// Result of filling one matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// No missing cells; no model was called.
    Unchanged,
    /// Every cell missing; no model was called. Carries the all-zero matrix.
    Degenerate(Array2<f64>),
    /// Denormalized, clamped to `>= 0`.
    Filled { model: String, values: Array2<f64> },
    /// No model produced a result.
    Unavailable,
}

impl FillOutcome {
    /// Values usable for reconciliation. A degenerate matrix yields none.
    pub fn filled_values(&self) -> Option<&Array2<f64>> {
        match self {
            Self::Filled { values, .. } => Some(values),
            _ => None,
        }
    }
}

/// A model's reconstruction of one matrix, denormalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub model: String,
    pub values: Array2<f64>,
}

pub struct ImputationEnsemble<'a> {
    registry: &'a ModelRegistry,
    strategy: &'a dyn SelectionStrategy,
}

impl<'a> ImputationEnsemble<'a> {
    pub fn new(registry: &'a ModelRegistry, strategy: &'a dyn SelectionStrategy) -> Self {
        Self { registry, strategy }
    }

    pub fn fill(&self, matrix: &ImputationMatrix, norm_max: f64) -> FillOutcome {
        if matrix.is_complete() {
            return FillOutcome::Unchanged;
        }
        if matrix.is_all_missing() {
            return FillOutcome::Degenerate(Array2::zeros(matrix.values.dim()));
        }

        let models = self.registry.available();
        let normalized = normalize(&matrix.values, norm_max);
        match self.strategy.select(&models, &normalized) {
            Some(selection) => {
                debug!(
                    component = "ensemble",
                    event = "ensemble.fill.selected",
                    strategy = self.strategy.name(),
                    model = %selection.model,
                    signal = matrix.signal.as_str(),
                    width = matrix.width()
                );
                FillOutcome::Filled {
                    model: selection.model,
                    values: denormalize(&selection.values, norm_max),
                }
            }
            None => {
                warn!(
                    component = "ensemble",
                    event = "ensemble.fill.unavailable",
                    error = %ModelError::Unavailable,
                    signal = matrix.signal.as_str(),
                    width = matrix.width()
                );
                FillOutcome::Unavailable
            }
        }
    }

    /// Every available model's reconstruction, in priority order, at most
    /// `limit` of them. Failing models are skipped. Complete and all-missing
    /// matrices never reach a model.
    pub fn candidates(&self, matrix: &ImputationMatrix, norm_max: f64, limit: usize) -> Vec<Candidate> {
        if matrix.is_complete() || matrix.is_all_missing() {
            return Vec::new();
        }
        let normalized = normalize(&matrix.values, norm_max);
        let mut out = Vec::new();
        for model in self.registry.available() {
            if out.len() >= limit {
                break;
            }
            match run_model(model.as_ref(), &normalized) {
                Ok(values) => out.push(Candidate {
                    model: model.name().to_string(),
                    values: denormalize(&values, norm_max),
                }),
                Err(err) => warn!(
                    component = "ensemble",
                    event = "ensemble.model.failed",
                    model = model.name(),
                    error = %err
                ),
            }
        }
        out
    }
}

pub fn normalize(values: &Array2<f64>, norm_max: f64) -> Array2<f64> {
    values.mapv(|v| v / norm_max)
}

/// Scales back and clamps at zero; missing cells stay missing.
pub fn denormalize(values: &Array2<f64>, norm_max: f64) -> Array2<f64> {
    values.mapv(|v| if v.is_nan() { v } else { (v * norm_max).max(0.0) })
}
