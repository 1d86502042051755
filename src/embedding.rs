use std::{
    sync::Arc,
    time::Duration,
};

use crate::{
    error::{Error, Result},
    form::stable_hash,
    model_manager::ColbertEmbedder,
    search_index,
    settings::{EmbedderKind, Settings},
};

/// Turns text into a fixed-length vector. Implementations may be slow or
/// fail; callers run them off the async runtime with a timeout.
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier of the model behind the vectors.
    fn model_id(&self) -> &str;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the provider selected by `settings.embedder`.
pub fn provider_from_settings(
    settings: &Settings,
) -> Arc<dyn EmbeddingProvider> {
    match settings.embedder {
        EmbedderKind::Colbert => {
            Arc::new(ColbertEmbedder::with_model_id(settings.model.clone()))
        }
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::default()),
    }
}

/// Run `provider.embed` on the blocking pool, giving up after `timeout`.
///
/// A timed-out call keeps running on its blocking thread; its result is
/// dropped.
pub async fn embed_with_timeout(
    provider: Arc<dyn EmbeddingProvider>,
    text: String,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let task = tokio::task::spawn_blocking(move || provider.embed(&text));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::EmbeddingUnavailable(format!(
            "embedding task failed: {join_error}"
        ))),
        Err(_) => Err(Error::EmbeddingUnavailable(format!(
            "embedding timed out after {timeout:?}"
        ))),
    }
}

/// Deterministic feature-hashing embedder over the lexical token stream.
///
/// Each stemmed token and each adjacent token pair is hashed into one of
/// `dimension` buckets with a hashed sign. Needs no model download, so it
/// serves offline installs and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = stable_hash(feature.as_bytes());
        let bucket = (h % self.dimension as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        "hashing"
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = search_index::tokenize(text);
        let mut vector = vec![0.0; self.dimension];

        for token in &tokens {
            self.add_feature(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, &bigram, 0.5);
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

/// Scale `vector` to unit length in place. Zero vectors stay zero.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Cosine similarity in `[-1, 1]`; 0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
