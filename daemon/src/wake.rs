use crate::audio::AudioError;

/// Output of feeding one frame to a streaming recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    /// Nothing decoded yet.
    Silence,
    /// Interim hypothesis. Never used to trigger.
    Partial(String),
    /// Finalized utterance.
    Final(String),
}

/// Low-latency streaming recognizer used while idle.
pub trait WakeRecognizer {
    fn accept(&mut self, samples: &[i16]) -> Result<Recognition, AudioError>;

    fn reset(&mut self);
}

impl<T: WakeRecognizer + ?Sized> WakeRecognizer for Box<T> {
    fn accept(&mut self, samples: &[i16]) -> Result<Recognition, AudioError> {
        (**self).accept(samples)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Configured trigger phrases, matched case-insensitively anywhere in a
/// finalized transcript.
#[derive(Debug, Clone)]
pub struct WakePhrases {
    phrases: Vec<String>,
}

impl WakePhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn find_in<'a>(&'a self, transcript: &str) -> Option<&'a str> {
        let lower = transcript.to_lowercase();
        self.phrases
            .iter()
            .find(|p| lower.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Only finalized results can trigger.
    pub fn triggered_by(&self, recognition: &Recognition) -> Option<&str> {
        match recognition {
            Recognition::Final(text) => self.find_in(text),
            _ => None,
        }
    }
}

#[cfg(feature = "vosk")]
pub use self::vosk_backend::VoskRecognizer;

#[cfg(feature = "vosk")]
mod vosk_backend {
    use super::{Recognition, WakeRecognizer};
    use crate::audio::AudioError;
    use log::info;
    use std::path::Path;
    use vosk::{DecodingState, Model, Recognizer};

    /// Vosk recognizer restricted to a grammar of the wake phrases plus
    /// `[unk]`, which keeps idle scanning cheap.
    pub struct VoskRecognizer {
        recognizer: Recognizer,
        _model: Model,
    }

    impl VoskRecognizer {
        pub fn new(model_path: &Path, sample_rate: u32, phrases: &[String]) -> Result<Self, AudioError> {
            if !model_path.exists() {
                return Err(AudioError::Recognizer(format!(
                    "Vosk model not found at: {}",
                    model_path.display()
                )));
            }
            let model = Model::new(model_path.to_string_lossy()).ok_or_else(|| {
                AudioError::Recognizer(format!("Failed to load Vosk model from {}", model_path.display()))
            })?;

            let mut grammar: Vec<&str> = phrases.iter().map(String::as_str).collect();
            grammar.push("[unk]");
            let recognizer = Recognizer::new_with_grammar(&model, sample_rate as f32, &grammar)
                .ok_or_else(|| AudioError::Recognizer("Failed to create Vosk recognizer".to_string()))?;

            info!("Vosk recognizer initialized for wake words: {:?}", phrases);
            Ok(Self {
                recognizer,
                _model: model,
            })
        }
    }

    impl WakeRecognizer for VoskRecognizer {
        fn accept(&mut self, samples: &[i16]) -> Result<Recognition, AudioError> {
            let state = self
                .recognizer
                .accept_waveform(samples)
                .map_err(|e| AudioError::Recognizer(e.to_string()))?;
            match state {
                DecodingState::Finalized => {
                    let text = self
                        .recognizer
                        .result()
                        .single()
                        .map(|r| r.text.to_string())
                        .unwrap_or_default();
                    Ok(Recognition::Final(text))
                }
                DecodingState::Running => {
                    Ok(Recognition::Partial(self.recognizer.partial_result().partial.to_string()))
                }
                DecodingState::Failed => Err(AudioError::Recognizer("Vosk decoding failed".to_string())),
            }
        }

        fn reset(&mut self) {
            self.recognizer.reset();
        }
    }
}
