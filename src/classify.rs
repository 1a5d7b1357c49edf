//! Classification engine and model provider abstraction.
//!
//! A [`ModelProvider`] is an external, swappable capability: anything that
//! can turn a feature vector into a `(label, confidence)` pair for a given
//! model version. The built-in [`LocalModelProvider`] scores with a linear
//! per-label model deserialized from a versioned JSON snapshot; it is
//! loaded once and shared read-only across workers, so inference needs no
//! locking. Training and snapshot production live elsewhere entirely.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::cache::{ClassificationKey, PredictionCache};
use crate::error::StageError;
use crate::models::{ClassificationResult, FeatureVector, Label};

/// Inference capability: vector in, (label, confidence) out.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Version of the snapshot this provider serves.
    fn version(&self) -> &str;

    /// Predict a label with a raw confidence. Implementations report
    /// `ModelUnavailable` for load problems (retryable) and
    /// `InferenceError` for malformed input (terminal).
    async fn predict(&self, features: &FeatureVector) -> Result<(Label, f64), StageError>;
}

/// JSON snapshot layout: per-label bias + term weights.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    pub version: String,
    pub labels: BTreeMap<String, LabelWeights>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelWeights {
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl LinearModel {
    pub fn from_json(json: &str) -> Result<Self, StageError> {
        let model: LinearModel = serde_json::from_str(json)
            .map_err(|e| StageError::ModelUnavailable(format!("snapshot parse: {}", e)))?;
        if model.labels.is_empty() {
            return Err(StageError::ModelUnavailable(
                "snapshot defines no labels".to_string(),
            ));
        }
        for name in model.labels.keys() {
            if Label::from_str_opt(name).is_none() {
                return Err(StageError::ModelUnavailable(format!(
                    "snapshot label '{}' is not in the category set",
                    name
                )));
            }
        }
        Ok(model)
    }

    /// Score every label and softmax into a confidence.
    pub fn predict(&self, features: &FeatureVector) -> Result<(Label, f64), StageError> {
        if features.token_count == 0 || features.terms.is_empty() {
            return Err(StageError::InferenceError(
                "empty feature vector".to_string(),
            ));
        }

        let mut scores: Vec<(Label, f64)> = Vec::with_capacity(self.labels.len());
        for (name, lw) in &self.labels {
            let label = Label::from_str_opt(name)
                .ok_or_else(|| StageError::InferenceError(format!("unknown label '{}'", name)))?;
            let dot: f64 = features
                .terms
                .iter()
                .filter_map(|(term, w)| lw.weights.get(term).map(|mw| mw * w))
                .sum();
            let score = lw.bias + dot;
            if !score.is_finite() {
                return Err(StageError::InferenceError(format!(
                    "non-finite score for label '{}'",
                    label
                )));
            }
            scores.push((label, score));
        }

        // Softmax, shifted by the max score for stability
        let max = scores
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let denom: f64 = scores.iter().map(|(_, s)| (s - max).exp()).sum();
        let (best, best_score) = scores
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .copied()
            .ok_or_else(|| StageError::InferenceError("no labels scored".to_string()))?;

        let confidence = (best_score - max).exp() / denom;
        Ok((best, confidence))
    }
}

/// Lazily loads a [`LinearModel`] snapshot from disk. Load failures are
/// retryable (`ModelUnavailable`): the snapshot may appear later, e.g.
/// mid-deploy. Once loaded the model is immutable and shared.
pub struct LocalModelProvider {
    version: String,
    path: PathBuf,
    loaded: RwLock<Option<Arc<LinearModel>>>,
}

impl LocalModelProvider {
    pub fn new(version: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            path: path.into(),
            loaded: RwLock::new(None),
        }
    }

    async fn model(&self) -> Result<Arc<LinearModel>, StageError> {
        if let Some(model) = self.loaded.read().await.as_ref() {
            return Ok(Arc::clone(model));
        }

        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            StageError::ModelUnavailable(format!("read {}: {}", self.path.display(), e))
        })?;
        let model = LinearModel::from_json(&json)?;
        if model.version != self.version {
            return Err(StageError::ModelUnavailable(format!(
                "snapshot is '{}', expected '{}'",
                model.version, self.version
            )));
        }

        let model = Arc::new(model);
        let mut slot = self.loaded.write().await;
        // Another worker may have loaded concurrently; both copies are identical
        if slot.is_none() {
            *slot = Some(Arc::clone(&model));
        }
        Ok(model)
    }
}

#[async_trait]
impl ModelProvider for LocalModelProvider {
    fn version(&self) -> &str {
        &self.version
    }

    async fn predict(&self, features: &FeatureVector) -> Result<(Label, f64), StageError> {
        let model = self.model().await?;
        model.predict(features)
    }
}

/// Applies a versioned model to feature vectors, memoizing through the
/// prediction cache.
pub struct ClassificationEngine {
    provider: Arc<dyn ModelProvider>,
    cache: Arc<PredictionCache>,
    review_threshold: f64,
}

impl ClassificationEngine {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        cache: Arc<PredictionCache>,
        review_threshold: f64,
    ) -> Self {
        Self {
            provider,
            cache,
            review_threshold,
        }
    }

    /// Classify under `model_version`, consulting the cache first.
    pub async fn classify(
        &self,
        features: &FeatureVector,
        model_version: &str,
    ) -> Result<ClassificationResult, StageError> {
        if self.provider.version() != model_version {
            return Err(StageError::ModelUnavailable(format!(
                "no provider loaded for model version '{}'",
                model_version
            )));
        }

        let key = ClassificationKey {
            content_hash: features.content_hash.clone(),
            feature_version: features.feature_version.clone(),
            model_version: model_version.to_string(),
        };
        if let Some(cached) = self.cache.get_classification(&key) {
            return Ok(cached);
        }

        let (label, raw_confidence) = self.provider.predict(features).await?;
        let confidence = raw_confidence.clamp(0.0, 1.0);

        let result = ClassificationResult {
            content_hash: features.content_hash.clone(),
            feature_version: features.feature_version.clone(),
            model_version: model_version.to_string(),
            label,
            confidence,
            needs_review: confidence < self.review_threshold,
            classified_at: crate::models::now_ts(),
        };
        self.cache.put_classification(key, result.clone());
        Ok(result)
    }
}
