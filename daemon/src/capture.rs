use crate::audio::{encode_wav, AudioError, AudioSource};
use crate::utterance::UtteranceRecorder;
use crate::wake::{WakePhrases, WakeRecognizer};
use log::{debug, info, warn};
use std::time::Duration;

pub const LISTENING_FOR_WAKE_WORD: &str = "Listening for wake word...";
pub const WAKE_WORD_DETECTED: &str = "Wake word detected, listening for command...";
pub const ADJUSTING_NOISE: &str = "Adjusting noise...";
pub const LISTENING: &str = "Listening...";

const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    ListeningCommand,
    Processing,
}

/// Callbacks from the audio worker back into the connection.
///
/// Every method is called on the worker thread and may block.
pub trait CaptureEvents {
    /// Status narration for the client.
    fn notify(&mut self, message: &str);

    /// A full command utterance as 16-bit mono WAV. Returns once the command
    /// has been answered or definitively failed.
    fn command_captured(&mut self, wav: Vec<u8>);

    /// Whether the worker should stop at the next opportunity.
    fn should_stop(&self) -> bool;
}

/// Wake-word scanning followed by command capture, one cycle at a time.
pub struct CaptureWorker<S, R> {
    source: S,
    recognizer: R,
    phrases: WakePhrases,
    recorder: UtteranceRecorder,
    state: CaptureState,
}

impl<S: AudioSource, R: WakeRecognizer> CaptureWorker<S, R> {
    pub fn new(source: S, recognizer: R, phrases: WakePhrases, recorder: UtteranceRecorder) -> Self {
        Self {
            source,
            recognizer,
            phrases,
            recorder,
            state: CaptureState::Idle,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Run until asked to stop. An error here means the microphone or the
    /// recognizer is gone and the worker cannot continue.
    pub fn run(&mut self, events: &mut dyn CaptureEvents) -> Result<(), AudioError> {
        events.notify(LISTENING_FOR_WAKE_WORD);
        while !events.should_stop() {
            self.poll(events)?;
        }
        debug!("Capture worker stopping");
        Ok(())
    }

    /// Feed one idle frame to the recognizer and, on a wake phrase, run a full
    /// capture cycle before returning.
    pub fn poll(&mut self, events: &mut dyn CaptureEvents) -> Result<(), AudioError> {
        let frame = match self.source.read(IDLE_READ_TIMEOUT)? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        let recognition = self.recognizer.accept(&frame)?;
        let phrase = match self.phrases.triggered_by(&recognition) {
            Some(phrase) => phrase.to_string(),
            None => return Ok(()),
        };

        info!("Wake word detected: '{}'", phrase);
        self.state = CaptureState::ListeningCommand;
        events.notify(WAKE_WORD_DETECTED);

        match self.capture_command(events) {
            Ok(Some(wav)) => {
                self.state = CaptureState::Processing;
                events.command_captured(wav);
            }
            Ok(None) => debug!("No command captured, returning to idle"),
            // A failed capture only costs this cycle.
            Err(e) => warn!("Command capture failed: {}", e),
        }

        self.state = CaptureState::Idle;
        self.source.clear();
        self.recognizer.reset();
        if !events.should_stop() {
            events.notify(LISTENING_FOR_WAKE_WORD);
        }
        Ok(())
    }

    fn capture_command(&mut self, events: &mut dyn CaptureEvents) -> Result<Option<Vec<u8>>, AudioError> {
        // The recognizer sees no audio while the command is captured.
        events.notify(ADJUSTING_NOISE);
        let stop = || events.should_stop();
        self.recorder.calibrate(&mut self.source, &stop)?;

        events.notify(LISTENING);
        let stop = || events.should_stop();
        let samples = match self.recorder.listen(&mut self.source, &stop)? {
            Some(samples) => samples,
            None => {
                warn!("No command heard after wake word");
                return Ok(None);
            }
        };

        let wav = encode_wav(&samples, self.source.sample_rate())?;
        info!("Command captured ({} bytes)", wav.len());
        Ok(Some(wav))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{silence, tone, ScriptedSource};
    use crate::utterance::ListenSettings;
    use crate::wake::testing::ScriptedRecognizer;
    use crate::wake::Recognition;

    const FRAME: usize = 1600;

    #[derive(Default)]
    struct RecordingEvents {
        messages: Vec<String>,
        commands: Vec<Vec<u8>>,
    }

    impl CaptureEvents for RecordingEvents {
        fn notify(&mut self, message: &str) {
            self.messages.push(message.to_string());
        }

        fn command_captured(&mut self, wav: Vec<u8>) {
            self.commands.push(wav);
        }

        fn should_stop(&self) -> bool {
            false
        }
    }

    fn recorder() -> UtteranceRecorder {
        UtteranceRecorder::new(ListenSettings {
            energy_floor: 300.0,
            dynamic_energy_ratio: 1.5,
            calibration: Duration::from_millis(200),
            pause_threshold: Duration::from_millis(300),
            phrase_time_limit: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(1),
            pre_roll: Duration::from_millis(100),
        })
    }

    fn worker(
        frames: Vec<Vec<i16>>,
        results: Vec<Recognition>,
    ) -> CaptureWorker<ScriptedSource, ScriptedRecognizer> {
        CaptureWorker::new(
            ScriptedSource::new(frames, Some(silence(FRAME))),
            ScriptedRecognizer::new(results),
            WakePhrases::new(["okay blender"]),
            recorder(),
        )
    }

    #[test]
    fn partial_hypothesis_does_not_leave_idle() {
        let mut worker = worker(vec![], vec![Recognition::Partial("okay blender".into())]);
        let mut events = RecordingEvents::default();

        worker.poll(&mut events).unwrap();
        assert_eq!(worker.state(), CaptureState::Idle);
        assert!(events.messages.is_empty());
        assert_eq!(worker.recognizer.resets, 0);
    }

    #[test]
    fn wake_phrase_then_silence_returns_to_idle_without_command() {
        let mut worker = worker(vec![], vec![Recognition::Final("okay blender".into())]);
        let mut events = RecordingEvents::default();

        worker.poll(&mut events).unwrap();

        assert_eq!(worker.state(), CaptureState::Idle);
        assert!(events.commands.is_empty());
        assert_eq!(
            events.messages,
            vec![WAKE_WORD_DETECTED, ADJUSTING_NOISE, LISTENING, LISTENING_FOR_WAKE_WORD]
        );
        assert_eq!(worker.source.cleared, 1);
        assert_eq!(worker.recognizer.resets, 1);
        // Only the triggering frame reached the recognizer.
        assert_eq!(worker.recognizer.accepted, 1);
    }

    #[test]
    fn spoken_command_is_delivered_as_wav() {
        // Trigger frame, two quiet calibration frames, then speech.
        let mut frames = vec![silence(FRAME); 3];
        frames.extend(vec![tone(FRAME, 4000); 5]);
        let mut worker = worker(frames, vec![Recognition::Final("OKAY BLENDER".into())]);
        let mut events = RecordingEvents::default();

        worker.poll(&mut events).unwrap();

        assert_eq!(events.commands.len(), 1);
        let wav = &events.commands[0];
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(crate::audio::wav_sample_rate(wav).unwrap(), 16000);
        assert_eq!(worker.state(), CaptureState::Idle);
    }

    #[test]
    fn run_returns_immediately_when_stopped() {
        struct Stopped;
        impl CaptureEvents for Stopped {
            fn notify(&mut self, _message: &str) {}
            fn command_captured(&mut self, _wav: Vec<u8>) {
                panic!("no command expected");
            }
            fn should_stop(&self) -> bool {
                true
            }
        }

        let mut worker = worker(vec![], vec![Recognition::Final("okay blender".into())]);
        worker.run(&mut Stopped).unwrap();
        assert_eq!(worker.recognizer.accepted, 0);
    }
}
