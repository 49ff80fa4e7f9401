use anyhow::{Context, Result};
use articulate_daemon::cloud_stt::{GoogleSttTranscriber, SttCredentials};
use articulate_daemon::gemini::{self, GeminiClient};
use articulate_daemon::listener::{AudioPipeline, LiveAudio};
use articulate_daemon::transcribe::{Transcriber, Transcribers};
use articulate_daemon::{shutdown_channel, Daemon, DaemonError, Server};
use clap::Parser;
use log::{error, info};
use secrecy::SecretString;
use shared::{Config, WhisperConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "articulate-daemon")]
#[command(about = "Turns spoken and typed commands into scripts for a 3D host application")]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not start an audio worker per connection
    #[arg(long)]
    no_audio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Starting articulate daemon");

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    config.apply_env().context("invalid environment override")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let api_key = std::env::var(gemini::API_KEY_ENV)
        .map(SecretString::from)
        .map_err(|_| DaemonError::MissingEnv(gemini::API_KEY_ENV))?;
    let model = GeminiClient::new(&config.gemini, api_key).map_err(DaemonError::from)?;
    info!("Default model: {}", config.gemini.default_model);

    let cloud = GoogleSttTranscriber::new(
        &config.cloud_stt,
        SttCredentials::from_env(),
        Duration::from_secs(config.gemini.request_timeout_secs),
    )
    .map_err(DaemonError::from)?;
    let transcribers = Transcribers::new(local_transcriber(&config.whisper), Arc::new(cloud));

    let daemon = Arc::new(Daemon::new(&config, Arc::new(model), transcribers));
    let audio = (!args.no_audio).then(|| AudioPipeline::new(Arc::new(LiveAudio::new(&config)), &config));
    let server = Server::bind(&config, daemon, audio).await?;

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            // Dropping the trigger would stop the server.
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C, shutting down");
        trigger.trigger();
    });

    server.run(shutdown).await?;
    info!("Articulate daemon stopped");
    Ok(())
}

#[cfg(feature = "whisper")]
fn local_transcriber(config: &WhisperConfig) -> Arc<dyn Transcriber> {
    Arc::new(articulate_daemon::whisper::WhisperTranscriber::new(config))
}

#[cfg(not(feature = "whisper"))]
fn local_transcriber(config: &WhisperConfig) -> Arc<dyn Transcriber> {
    use articulate_daemon::transcribe::UnavailableTranscriber;
    Arc::new(UnavailableTranscriber::new(
        "Whisper",
        format!(
            "built without the `whisper` feature (model '{}' not loaded)",
            config.model_size
        ),
    ))
}
