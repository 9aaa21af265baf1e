use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use kiosk_voice_core::{
    format, AudioError, AudioInput, EngineConfig, GestureEvent, GestureKind, LipSyncOptions,
    VoiceEngine,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> kiosk_voice_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Detect { source } => run_detect(&source),
        Commands::Analyze { source, output } => run_analyze(config, &source, &output).await,
        Commands::Play { source, lip_sync } => run_play(config, &source, lip_sync).await,
    }
}

fn run_detect(source: &SourceArgs) -> kiosk_voice_core::Result<()> {
    let input = source.read()?;
    let normalized = format::normalize(&input)?;
    tracing::info!(bytes = normalized.len(), "inspected audio input");

    println!("format:   {:?}", normalized.detected);
    println!("mime:     {}", normalized.detected.mime_type());
    println!("bytes:    {}", normalized.len());
    println!("prefix:   {}", format::diagnostic_prefix(&normalized.bytes));
    if let Some(declared) = normalized.declared_type {
        println!("declared: {declared}");
    }
    Ok(())
}

async fn run_analyze(
    config: EngineConfig,
    source: &SourceArgs,
    output: &Path,
) -> kiosk_voice_core::Result<()> {
    tracing::info!(input = ?source.input, ?output, "precomputing lip-sync frames");

    let engine = VoiceEngine::clocked(config);
    let result = engine.analyzer().analyze(&source.read()?).await?;

    let json = serde_json::to_string_pretty(result.as_ref()).map_err(|err| {
        AudioError::invalid_data("could not serialise lip-sync frames").with_cause(err)
    })?;
    std::fs::write(output, json)?;
    tracing::info!(frames = result.len(), duration = result.duration(), "lip-sync cache written");
    Ok(())
}

async fn run_play(
    config: EngineConfig,
    source: &SourceArgs,
    lip_sync: bool,
) -> kiosk_voice_core::Result<()> {
    let engine = build_engine(config);

    // Launching the command is the operator's gesture.
    engine
        .gate()
        .handle_gesture(GestureEvent::trusted(GestureKind::KeyDown))
        .await?;

    let options = LipSyncOptions::new()
        .with_lip_sync(lip_sync)
        .on_viseme(|shape, open| tracing::debug!(shape = shape.as_str(), open, "viseme"))
        .on_error(|err| tracing::warn!(%err, "playback error"));

    let ticket = engine.queue().submit(source.read()?, options);
    let outcome = ticket.wait().await;
    engine.shutdown().await?;

    let summary = outcome.into_result()?;
    let json = serde_json::to_string_pretty(&summary).map_err(|err| {
        AudioError::invalid_data("could not serialise playback summary").with_cause(err)
    })?;
    println!("{json}");
    Ok(())
}

#[cfg(feature = "hardware-audio")]
fn build_engine(config: EngineConfig) -> VoiceEngine {
    VoiceEngine::with_output_device(config)
}

#[cfg(not(feature = "hardware-audio"))]
fn build_engine(config: EngineConfig) -> VoiceEngine {
    VoiceEngine::clocked(config)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Kiosk speech playback and lip-sync engine", long_about = None)]
struct Cli {
    /// Optional JSON engine configuration.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Audio file to read.
    input: PathBuf,
    /// Treat the file as base64 text (optionally a data URL) instead of raw bytes.
    #[arg(long)]
    text: bool,
}

impl SourceArgs {
    fn read(&self) -> kiosk_voice_core::Result<AudioInput> {
        if self.text {
            Ok(AudioInput::text(std::fs::read_to_string(&self.input)?))
        } else {
            Ok(AudioInput::binary(std::fs::read(&self.input)?))
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report the container format of an audio input.
    Detect {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Analyse an audio file ahead of time and persist the viseme frames.
    Analyze {
        #[command(flatten)]
        source: SourceArgs,
        /// Output path for the generated lip-sync cache.
        output: PathBuf,
    },
    /// Play an audio file through the utterance queue.
    Play {
        #[command(flatten)]
        source: SourceArgs,
        /// Drive mouth-shape callbacks while playing.
        #[arg(long)]
        lip_sync: bool,
    },
}
