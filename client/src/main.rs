use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::protocol::{receive_message, send_message, MessageBuffer};
use shared::{Config, DaemonMessage, SceneContext, TranscriptionMethod};
use std::path::PathBuf;
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "articulate-client")]
#[command(about = "Send commands to the articulate daemon and print the scripts it returns")]
struct Args {
    /// Daemon address (defaults to the configured server host)
    #[arg(long)]
    host: Option<String>,

    /// Daemon port (defaults to the configured server port)
    #[arg(short, long)]
    port: Option<u16>,

    /// AI model to configure (defaults to the configured default model)
    #[arg(short, long)]
    model: Option<String>,

    /// Transcription method for voice commands: gemini, whisper or google_stt
    #[arg(long, default_value = "whisper")]
    method: String,

    /// JSON file with the scene context sent along with commands
    #[arg(short, long)]
    context: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one text command and print the generated script
    Text {
        /// The command, e.g. "add a red cube"
        command: String,
    },
    /// Answer context requests for voice commands and print every script
    Listen,
}

struct Session {
    stream: TcpStream,
    buffer: MessageBuffer,
}

impl Session {
    async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("failed to connect to daemon at {}", address))?;
        info!("Connected to {}", address);
        Ok(Self {
            stream,
            buffer: MessageBuffer::default(),
        })
    }

    async fn send(&mut self, message: Value) -> Result<()> {
        debug!("-> {}", message);
        send_message(&mut self.stream, &message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<DaemonMessage> {
        match receive_message(&mut self.stream, &mut self.buffer).await? {
            Some(message) => {
                debug!("<- {:?}", message);
                Ok(message)
            }
            None => bail!("daemon closed the connection"),
        }
    }

    /// Send `configure` and wait for its acknowledgement.
    async fn configure(&mut self, model: &str, method: TranscriptionMethod) -> Result<()> {
        self.send(json!({"type": "configure", "model": model, "method": method}))
            .await?;
        loop {
            match self.recv().await? {
                DaemonMessage::Info { message } if message.starts_with("Configuration received") => {
                    info!("{}", message);
                    return Ok(());
                }
                DaemonMessage::Error { message, .. } => bail!("configuration rejected: {}", message),
                other => report_status(&other),
            }
        }
    }
}

fn report_status(message: &DaemonMessage) {
    match message {
        DaemonMessage::Ready { message } | DaemonMessage::Info { message } => info!("{}", message),
        DaemonMessage::Error { message, .. } => warn!("{}", message),
        DaemonMessage::Stopped { message } => info!("{}", message),
        other => debug!("Ignoring {:?}", other),
    }
}

fn print_script(request_id: &str, original_text: Option<&str>, script: &str) {
    match original_text {
        Some(text) => println!("# {} ({})", text, request_id),
        None => println!("# voice command ({})", request_id),
    }
    println!("{}", script);
}

fn load_context(path: Option<&PathBuf>) -> Result<SceneContext> {
    let Some(path) = path else {
        return Ok(SceneContext::empty());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(SceneContext(value))
}

async fn run_text(session: &mut Session, command: &str, context: &SceneContext) -> Result<()> {
    session
        .send(json!({"type": "process_text", "text": command, "context": context}))
        .await?;
    loop {
        match session.recv().await? {
            DaemonMessage::Script {
                request_id,
                script,
                original_text,
                ..
            } => {
                print_script(request_id.as_str(), original_text.as_deref(), &script);
                return Ok(());
            }
            DaemonMessage::Error {
                message,
                request_id: Some(_),
                ..
            } => bail!("{}", message),
            DaemonMessage::Stopped { message } => bail!("{}", message),
            other => report_status(&other),
        }
    }
}

async fn run_listen(session: &mut Session, context: &SceneContext) -> Result<()> {
    info!("Waiting for voice commands, press Ctrl-C to stop");
    loop {
        let message = tokio::select! {
            message = session.recv() => message?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        };

        match message {
            DaemonMessage::RequestContext { request_id, message } => {
                info!("{}", message);
                session
                    .send(json!({"type": "context_response", "request_id": request_id, "context": context}))
                    .await?;
            }
            DaemonMessage::Script {
                request_id,
                script,
                original_text,
                ..
            } => print_script(request_id.as_str(), original_text.as_deref(), &script),
            DaemonMessage::Stopped { message } => {
                info!("{}", message);
                return Ok(());
            }
            other => report_status(&other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    config.apply_env()?;
    let host = args.host.unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);
    let model = args.model.unwrap_or(config.gemini.default_model);
    let method: TranscriptionMethod = serde_json::from_value(Value::String(args.method.clone()))
        .with_context(|| format!("unknown transcription method '{}'", args.method))?;
    let context = load_context(args.context.as_ref())?;

    let mut session = Session::connect(&format!("{}:{}", host, port)).await?;
    session.configure(&model, method).await?;

    match args.command {
        Command::Text { command } => run_text(&mut session, &command, &context).await,
        Command::Listen => run_listen(&mut session, &context).await,
    }
}
