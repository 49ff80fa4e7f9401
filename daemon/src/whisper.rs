use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// Process-lifetime cache of loaded models keyed by model size.
///
/// Concurrent first users of a key wait on the same load. A failed load
/// leaves the slot empty so the next caller tries again.
pub struct ModelCache<M> {
    slots: Mutex<HashMap<String, Arc<OnceCell<Arc<M>>>>>,
}

impl<M> Default for ModelCache<M> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> ModelCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<Arc<M>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<M, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key.to_string()).or_default().clone()
        };

        slot.get_or_try_init(|| async move { load().await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    #[cfg(test)]
    async fn is_loaded(&self, key: &str) -> bool {
        let slots = self.slots.lock().await;
        slots.get(key).map(|slot| slot.initialized()).unwrap_or(false)
    }
}

/// Linear resampling to the 16 kHz input whisper expects.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(feature = "whisper")]
pub use self::backend::WhisperTranscriber;

#[cfg(feature = "whisper")]
mod backend {
    use super::{resample_linear, ModelCache};
    use crate::audio::decode_wav_f32;
    use crate::transcribe::{TranscribeError, Transcriber};
    use async_trait::async_trait;
    use log::{error, info};
    use shared::WhisperConfig;
    use std::sync::Arc;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    const WHISPER_SAMPLE_RATE: u32 = 16000;

    pub struct WhisperTranscriber {
        config: WhisperConfig,
        models: ModelCache<WhisperContext>,
    }

    impl WhisperTranscriber {
        pub fn new(config: &WhisperConfig) -> Self {
            Self {
                config: config.clone(),
                models: ModelCache::new(),
            }
        }

        async fn model(&self) -> Result<Arc<WhisperContext>, TranscribeError> {
            let size = self.config.model_size.as_str();
            let model_path = self.config.model_path(size);

            self.models
                .get_or_load(size, || async move {
                    if !model_path.exists() {
                        return Err(TranscribeError::Unavailable(
                            "Whisper",
                            format!("model not found at {:?}", model_path),
                        ));
                    }

                    info!("[Whisper] Loading model from {:?}", model_path);
                    let ctx = tokio::task::spawn_blocking(move || {
                        let params = WhisperContextParameters::default();
                        WhisperContext::new_with_params(&model_path.to_string_lossy(), params)
                    })
                    .await
                    .map_err(|e| TranscribeError::Backend(format!("model load task failed: {}", e)))?
                    .map_err(|e| TranscribeError::Backend(e.to_string()))?;

                    info!("[Whisper] Model '{}' loaded", size);
                    Ok(ctx)
                })
                .await
        }
    }

    #[async_trait]
    impl Transcriber for WhisperTranscriber {
        async fn transcribe(&self, wav: &[u8]) -> Result<String, TranscribeError> {
            let (samples, rate) = decode_wav_f32(wav).map_err(|e| TranscribeError::Audio(e.to_string()))?;
            let audio = resample_linear(&samples, rate, WHISPER_SAMPLE_RATE);

            let ctx = self.model().await?;
            let language = self.config.language.clone();

            // whisper-rs is synchronous
            let result = tokio::task::spawn_blocking(move || {
                let mut state = ctx.create_state()?;

                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                if let Some(ref lang) = language {
                    params.set_language(Some(lang.as_str()));
                }
                params.set_print_special(false);
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_print_timestamps(false);

                state.full(params, &audio)?;

                let num_segments = state.full_n_segments()?;
                let mut transcription = String::new();
                for i in 0..num_segments {
                    transcription.push_str(&state.full_get_segment_text(i)?);
                }
                Ok::<_, whisper_rs::WhisperError>(transcription)
            })
            .await
            .map_err(|e| TranscribeError::Backend(format!("transcription task failed: {}", e)))?;

            match result {
                Ok(text) => {
                    let text = text.trim().to_string();
                    info!("[Whisper] Transcription result: '{}'", text);
                    Ok(text)
                }
                Err(e) => {
                    error!("[Whisper] Transcription failed: {:?}", e);
                    Err(TranscribeError::Backend(e.to_string()))
                }
            }
        }
    }
}
