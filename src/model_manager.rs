use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::{EmbeddingProvider, l2_normalize},
    error::{Error, Result},
};

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Manages the ColBERT model lifecycle, supporting lazy loading on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl ModelManager {
    /// The model is not loaded until the first call to `encode_document`.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: None,
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            let device = default_device();
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(device)
                .try_into()
                .map_err(|e| {
                    Error::EmbeddingUnavailable(format!(
                        "failed to load model {}: {e}",
                        self.model_id
                    ))
                })?;
            tracing::info!(model = %self.model_id, "loaded ColBERT model");
            self.model = Some(colbert);
        }

        self.model.as_mut().ok_or_else(|| {
            Error::EmbeddingUnavailable("model not loaded".to_string())
        })
    }

    /// Encodes one text into ColBERT token-level embeddings `[T, D]`.
    pub fn encode_document(&mut self, text: &str) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        let embeddings =
            model.encode(&[text.to_string()], false).map_err(|e| {
                Error::EmbeddingUnavailable(format!("encoding failed: {e}"))
            })?;
        // Squeeze the batch dimension: [1, T, D] -> [T, D]
        embeddings.squeeze(0).map_err(map_candle_err)
    }
}

/// Single-vector embeddings from a ColBERT model: the mean of the token
/// embeddings, normalized to unit length.
pub struct ColbertEmbedder {
    model_id: String,
    manager: Mutex<ModelManager>,
}

impl ColbertEmbedder {
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            manager: Mutex::new(ModelManager::with_model_id(model_id.clone())),
            model_id,
        }
    }
}

impl EmbeddingProvider for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut manager = self.manager.lock().map_err(|_| {
            Error::EmbeddingUnavailable("model lock poisoned".to_string())
        })?;
        let tokens = manager.encode_document(text)?;
        let mut pooled = mean_pool(&tokens)?;
        l2_normalize(&mut pooled);
        Ok(pooled)
    }
}

/// Average a `[T, D]` token matrix into one `D`-dimensional vector.
fn mean_pool(tokens: &Tensor) -> Result<Vec<f32>> {
    tokens
        .mean(0)
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(map_candle_err)
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::EmbeddingUnavailable(format!("tensor computation error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::DEFAULT_MODEL_ID;

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::with_model_id("custom/model".to_string());
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!manager.is_loaded());
    }

    #[test]
    fn embedder_reports_model_without_loading() {
        let embedder = ColbertEmbedder::with_model_id(DEFAULT_MODEL_ID.into());
        assert_eq!(embedder.model_id(), DEFAULT_MODEL_ID);
        assert!(!embedder.manager.lock().unwrap().is_loaded());
    }

    #[test]
    fn mean_pool_averages_tokens() {
        let t = Tensor::from_vec(
            vec![1.0f32, 2.0, 3.0, 5.0, 6.0, 7.0],
            (2, 3),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(mean_pool(&t).unwrap(), vec![3.0, 4.0, 5.0]);
    }
}
