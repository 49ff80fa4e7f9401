use crate::audio::{rms, samples_for, AudioError, AudioSource};
use log::debug;
use shared::CaptureConfig;
use std::collections::VecDeque;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ListenSettings {
    pub energy_floor: f32,
    pub dynamic_energy_ratio: f32,
    pub calibration: Duration,
    pub pause_threshold: Duration,
    pub phrase_time_limit: Duration,
    pub wait_timeout: Duration,
    pub pre_roll: Duration,
}

impl From<&CaptureConfig> for ListenSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            energy_floor: config.energy_threshold,
            dynamic_energy_ratio: config.dynamic_energy_ratio,
            calibration: Duration::from_millis(config.calibration_ms),
            pause_threshold: Duration::from_millis(config.pause_threshold_ms),
            phrase_time_limit: Duration::from_secs(config.phrase_time_limit_secs),
            wait_timeout: Duration::from_secs(config.listen_timeout_secs),
            pre_roll: Duration::from_millis(config.pre_roll_ms),
        }
    }
}

/// Energy-gated capture of a single spoken command.
///
/// All limits are counted in samples read rather than wall-clock time, so a
/// source that delivers audio faster than real time still behaves the same.
/// Reads that time out count as `READ_TIMEOUT` of silence.
pub struct UtteranceRecorder {
    settings: ListenSettings,
    threshold: f32,
}

impl UtteranceRecorder {
    pub fn new(settings: ListenSettings) -> Self {
        let threshold = settings.energy_floor;
        Self { settings, threshold }
    }

    /// Measure ambient noise and raise the speech threshold above it.
    pub fn calibrate(
        &mut self,
        source: &mut dyn AudioSource,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<f32, AudioError> {
        let rate = source.sample_rate();
        let target = samples_for(self.settings.calibration, rate);
        let mut consumed = 0usize;
        let mut energy_sum = 0f64;
        let mut frames = 0usize;

        while consumed < target && !should_stop() {
            match source.read(READ_TIMEOUT)? {
                Some(frame) => {
                    consumed += frame.len().max(1);
                    energy_sum += rms(&frame) as f64;
                    frames += 1;
                }
                None => consumed += samples_for(READ_TIMEOUT, rate),
            }
        }

        let ambient = if frames == 0 { 0.0 } else { (energy_sum / frames as f64) as f32 };
        self.threshold = self
            .settings
            .energy_floor
            .max(ambient * self.settings.dynamic_energy_ratio);
        debug!("Ambient energy {:.1}, speech threshold {:.1}", ambient, self.threshold);
        Ok(self.threshold)
    }

    /// Wait for speech, then record until a pause or the phrase limit.
    ///
    /// Returns `Ok(None)` if no speech starts before the wait timeout or the
    /// stop flag is raised.
    pub fn listen(
        &mut self,
        source: &mut dyn AudioSource,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<Option<Vec<i16>>, AudioError> {
        let rate = source.sample_rate();
        let wait_limit = samples_for(self.settings.wait_timeout, rate);
        let pre_roll_limit = samples_for(self.settings.pre_roll, rate);
        let pause_limit = samples_for(self.settings.pause_threshold, rate).max(1);
        let phrase_limit = samples_for(self.settings.phrase_time_limit, rate).max(1);
        let timeout_samples = samples_for(READ_TIMEOUT, rate);

        let mut waited = 0usize;
        let mut pre_roll: VecDeque<Vec<i16>> = VecDeque::new();
        let mut pre_roll_len = 0usize;

        let first = loop {
            if should_stop() {
                return Ok(None);
            }
            match source.read(READ_TIMEOUT)? {
                Some(frame) if rms(&frame) > self.threshold => break frame,
                Some(frame) => {
                    waited += frame.len().max(1);
                    pre_roll_len += frame.len();
                    pre_roll.push_back(frame);
                    while pre_roll_len > pre_roll_limit {
                        match pre_roll.pop_front() {
                            Some(old) => pre_roll_len -= old.len(),
                            None => break,
                        }
                    }
                }
                None => waited += timeout_samples,
            }
            if waited >= wait_limit {
                debug!("No speech within {:?}", self.settings.wait_timeout);
                return Ok(None);
            }
        };

        let mut recorded: Vec<i16> = pre_roll.into_iter().flatten().collect();
        let mut phrase = first.len();
        let mut silence = 0usize;
        recorded.extend_from_slice(&first);

        while silence < pause_limit && phrase < phrase_limit {
            if should_stop() {
                return Ok(None);
            }
            match source.read(READ_TIMEOUT)? {
                Some(frame) => {
                    if rms(&frame) > self.threshold {
                        silence = 0;
                    } else {
                        silence += frame.len();
                    }
                    phrase += frame.len();
                    recorded.extend_from_slice(&frame);
                }
                None => {
                    silence += timeout_samples;
                    phrase += timeout_samples;
                }
            }
        }

        debug!(
            "Captured utterance: {} samples ({} speech, ended by {})",
            recorded.len(),
            phrase,
            if phrase >= phrase_limit { "phrase limit" } else { "pause" }
        );
        Ok(Some(recorded))
    }
}
