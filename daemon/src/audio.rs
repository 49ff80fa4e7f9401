use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("recognizer error: {0}")]
    Recognizer(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// Blocking source of 16-bit mono PCM frames.
///
/// Implementations are created on the audio worker thread and never leave it,
/// so they do not need to be `Send`.
pub trait AudioSource {
    fn sample_rate(&self) -> u32;

    /// Wait up to `timeout` for the next frame. `Ok(None)` means no audio
    /// arrived in time.
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError>;

    /// Drop any audio buffered while the caller was not reading.
    fn clear(&mut self);
}

impl<T: AudioSource + ?Sized> AudioSource for Box<T> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError> {
        (**self).read(timeout)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}

/// Root-mean-square amplitude of a frame.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Number of samples covering `duration` at `sample_rate`.
pub fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_millis() as u64 * sample_rate as u64 / 1000) as usize
}

pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV file into mono f32 samples in `[-1, 1]`, averaging channels.
pub fn decode_wav_f32(bytes: &[u8]) -> Result<(Vec<f32>, u32), AudioError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

pub fn wav_sample_rate(bytes: &[u8]) -> Result<u32, AudioError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    Ok(reader.spec().sample_rate)
}

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneSource;

#[cfg(feature = "microphone")]
mod microphone {
    use super::{AudioError, AudioSource};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
    use log::{error, info, warn};
    use shared::CaptureConfig;
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
    use std::time::Duration;

    /// Default input device streamed as 16 kHz mono i16 frames.
    pub struct MicrophoneSource {
        sample_rate: u32,
        rx: Receiver<Vec<i16>>,
        // Dropping the stream stops capture.
        _stream: cpal::Stream,
    }

    impl MicrophoneSource {
        pub fn open(config: &CaptureConfig) -> Result<Self, AudioError> {
            let host = cpal::default_host();

            let device = if let Some(device_name) = &config.device {
                host.input_devices()
                    .map_err(|e| AudioError::Device(e.to_string()))?
                    .find(|d| d.name().map(|n| n == *device_name).unwrap_or(false))
                    .ok_or_else(|| AudioError::Device(format!("Audio device '{}' not found", device_name)))?
            } else {
                host.default_input_device()
                    .ok_or_else(|| AudioError::Device("No default input device available".to_string()))?
            };

            info!("Using audio device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

            let supported = device
                .supported_input_configs()
                .map_err(|e| AudioError::Device(e.to_string()))?
                .find(|c| {
                    c.channels() == 1
                        && c.min_sample_rate().0 <= config.sample_rate
                        && c.max_sample_rate().0 >= config.sample_rate
                })
                .ok_or_else(|| {
                    AudioError::Device(format!("No mono input config at {} Hz", config.sample_rate))
                })?;

            let stream_config = StreamConfig {
                channels: 1,
                sample_rate: SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(config.chunk_samples() as u32),
            };

            // About ten seconds of frames; older audio is dropped if nobody reads.
            let (tx, rx) = mpsc::sync_channel(100);

            let stream = match supported.sample_format() {
                SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, tx)?,
                SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, tx)?,
                SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, tx)?,
                SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, tx)?,
                other => {
                    return Err(AudioError::Device(format!("Unsupported sample format: {:?}", other)));
                }
            };

            stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;

            Ok(Self {
                sample_rate: config.sample_rate,
                rx,
                _stream: stream,
            })
        }
    }

    fn build_stream<T>(
        device: &Device,
        config: &StreamConfig,
        tx: SyncSender<Vec<i16>>,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: cpal::Sample + cpal::SizedSample + Send + 'static,
        i16: cpal::FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let frame: Vec<i16> = data.iter().map(|&s| cpal::Sample::to_sample(s)).collect();
                    if let Err(mpsc::TrySendError::Full(_)) = tx.try_send(frame) {
                        warn!("Audio buffer full, dropping frame");
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))
    }

    impl AudioSource for MicrophoneSource {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn read(&mut self, timeout: Duration) -> Result<Option<Vec<i16>>, AudioError> {
            match self.rx.recv_timeout(timeout) {
                Ok(frame) => Ok(Some(frame)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(AudioError::Stream("microphone stream closed".to_string()))
                }
            }
        }

        fn clear(&mut self) {
            while self.rx.try_recv().is_ok() {}
        }
    }
}
