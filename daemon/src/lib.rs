pub mod audio;
pub mod capture;
pub mod cloud_stt;
pub mod connection;
pub mod correlator;
pub mod daemon;
pub mod error;
pub mod gemini;
pub mod listener;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod server;
pub mod transcribe;
pub mod utterance;
pub mod wake;
pub mod whisper;

pub use daemon::Daemon;
pub use error::DaemonError;
pub use server::{shutdown_channel, Server, Shutdown, ShutdownTrigger};
