//! Feature extraction: normalized text → sparse term-weighted vector.
//!
//! Tokenization is language-aware in the same way the upstream corpus is:
//! a CJK codepoint scan decides between English word tokens (lowercased,
//! alphanumeric, stop-words removed) and Chinese unigram tokens. Term
//! weights are log-scaled frequencies, L2-normalized; with a [`BTreeMap`]
//! underneath, repeated extraction of the same input is bit-identical.
//!
//! The extractor consults the prediction cache by
//! `(content_hash, feature_version)` before computing and populates it on
//! a miss.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{FeatureKey, PredictionCache};
use crate::config::FeaturesConfig;
use crate::error::StageError;
use crate::models::{FeatureVector, ParsedContent};

/// English stop words filtered before weighting. Compact subset of the
/// usual corpus list; extending it is a feature_version bump.
const STOP_WORDS_EN: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have",
    "he", "her", "his", "if", "in", "into", "is", "it", "its", "no", "not", "of", "on", "or",
    "our", "she", "so", "such", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "was", "we", "were", "which", "will", "with", "you", "your",
];

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectedLanguage {
    English,
    Chinese,
}

/// Per-version extractor configuration.
#[derive(Debug, Clone)]
struct ExtractorProfile {
    version: String,
    min_token_len: usize,
}

/// Versioned feature extractor. Only the profiles registered at startup
/// are available; requesting any other version is a terminal
/// `VocabularyMismatch`.
pub struct FeatureExtractor {
    profiles: Vec<ExtractorProfile>,
    cache: Arc<PredictionCache>,
}

impl FeatureExtractor {
    pub fn new(config: &FeaturesConfig, cache: Arc<PredictionCache>) -> Self {
        Self {
            profiles: vec![ExtractorProfile {
                version: config.version.clone(),
                min_token_len: config.min_token_len,
            }],
            cache,
        }
    }

    /// Extract a feature vector, consulting the cache first.
    pub fn extract(
        &self,
        parsed: &ParsedContent,
        feature_version: &str,
    ) -> Result<FeatureVector, StageError> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.version == feature_version)
            .ok_or_else(|| StageError::VocabularyMismatch(feature_version.to_string()))?;

        let key = FeatureKey {
            content_hash: parsed.content_hash.clone(),
            feature_version: feature_version.to_string(),
        };
        if let Some(cached) = self.cache.get_features(&key) {
            return Ok(cached);
        }

        let vector = compute_vector(parsed, profile)?;
        self.cache.put_features(key, vector.clone());
        Ok(vector)
    }
}

fn compute_vector(
    parsed: &ParsedContent,
    profile: &ExtractorProfile,
) -> Result<FeatureVector, StageError> {
    let tokens = tokenize(&parsed.text, profile.min_token_len)?;

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for token in &tokens {
        *counts.entry(token.clone()).or_insert(0) += 1;
    }

    // Log-scaled term frequency, L2-normalized
    let mut terms: BTreeMap<String, f64> = counts
        .into_iter()
        .map(|(term, tf)| (term, 1.0 + (tf as f64).ln()))
        .collect();
    let norm = terms.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for weight in terms.values_mut() {
            *weight /= norm;
        }
    }

    Ok(FeatureVector {
        content_hash: parsed.content_hash.clone(),
        feature_version: profile.version.clone(),
        terms,
        token_count: tokens.len() as u64,
    })
}

fn tokenize(text: &str, min_token_len: usize) -> Result<Vec<String>, StageError> {
    let language = if text.chars().any(is_cjk) {
        DetectedLanguage::Chinese
    } else {
        DetectedLanguage::English
    };

    let tokens = match language {
        DetectedLanguage::English => tokenize_english(text, min_token_len),
        DetectedLanguage::Chinese => tokenize_chinese(text, min_token_len),
    };

    if tokens.is_empty() {
        return Err(StageError::LanguageUnsupported(
            "no tokenizable text in a supported script".to_string(),
        ));
    }
    Ok(tokens)
}

fn tokenize_english(text: &str, min_token_len: usize) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= min_token_len)
        .filter(|w| !STOP_WORDS_EN.contains(&w.as_str()))
        .collect()
}

/// Unigram tokens for Chinese text; interleaved Latin words are kept too.
fn tokenize_chinese(text: &str, min_token_len: usize) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut latin = String::new();
    for c in text.chars() {
        if is_cjk(c) {
            if latin.len() >= min_token_len {
                tokens.push(latin.to_lowercase());
            }
            latin.clear();
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            latin.push(c);
        } else {
            if latin.len() >= min_token_len {
                tokens.push(latin.to_lowercase());
            }
            latin.clear();
        }
    }
    if latin.len() >= min_token_len {
        tokens.push(latin.to_lowercase());
    }
    tokens
}
