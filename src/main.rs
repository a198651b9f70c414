//! Command-line interface for the streaming TTS engine.
//!
//! Wraps the engine to provide speech synthesis, voice listing, model
//! prefetching, status reporting, and a small audio conversion utility.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use stimme::audio::io::WavIo;
use stimme::audio::resample::resample_linear;
use stimme::config::{load_config, EngineConfig, SAMPLE_RATE};
use stimme::runtime::TtsEngine;

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "stimme")]
#[command(about = "Streaming text-to-speech over Mimi/FlowLM ONNX graphs", long_about = None)]
struct Cli {
    /// Optional engine configuration YAML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Generate speech from text.
    Say {
        /// Text prompt to synthesize.
        text: String,
        /// Voice name from the voices table, or a reference-audio stem.
        #[arg(long)]
        voice: Option<String>,
        /// Output WAV file path.
        #[arg(long)]
        output: PathBuf,
        /// Write audio incrementally as chunks arrive.
        #[arg(long)]
        stream: bool,
        /// Print per-chunk progress while streaming.
        #[arg(long)]
        progress: bool,
    },
    /// List available voices.
    Voices {
        /// Additional directories to scan for reference audio.
        #[arg(long)]
        voice_dir: Vec<PathBuf>,
    },
    /// Download model assets without synthesizing.
    Download,
    /// Report engine load status.
    Status,
    /// Audio utility subcommands.
    Audio {
        /// Audio subcommand to execute.
        #[command(subcommand)]
        command: AudioCommands,
    },
}

/// Audio utility commands.
#[derive(Subcommand)]
enum AudioCommands {
    /// Convert a WAV file's sample rate (mono output).
    Convert {
        /// Input audio file path.
        #[arg(long)]
        input: PathBuf,
        /// Output WAV path.
        #[arg(long)]
        output: PathBuf,
        /// Target sample rate in Hz.
        #[arg(long)]
        to_rate: u32,
    },
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Say {
            text,
            voice,
            output,
            stream,
            progress,
        } => run_say(config, &text, voice.as_deref(), &output, stream, progress),
        Commands::Voices { voice_dir } => {
            let engine = TtsEngine::new(config);
            for voice in engine.list_voices(&voice_dir) {
                println!("{voice}");
            }
            Ok(())
        }
        Commands::Download => run_download(config),
        Commands::Status => {
            let engine = TtsEngine::new(config);
            if let Err(error) = engine.preload() {
                log::debug!("preload failed: {error}");
            }
            let status = engine.status();
            println!("ready: {}", status.ready);
            println!("models_dir: {}", status.models_dir.display());
            if let Some(error) = status.last_error {
                println!("last_error: {error}");
            }
            Ok(())
        }
        Commands::Audio { command } => match command {
            AudioCommands::Convert {
                input,
                output,
                to_rate,
            } => {
                let (samples, sample_rate) = WavIo::read_wav_mono(&input)?;
                let converted = resample_linear(&samples, sample_rate, to_rate);
                WavIo::write_wav(&output, &converted, to_rate)?;
                Ok(())
            }
        },
    }
}

fn run_say(
    config: EngineConfig,
    text: &str,
    voice: Option<&str>,
    output: &PathBuf,
    stream: bool,
    progress: bool,
) -> Result<()> {
    let engine = TtsEngine::new(config);

    if stream {
        let chunks = engine.synthesize_stream(text, voice)?;
        let handle = chunks.cancel_handle();
        ctrlc::set_handler(move || {
            eprintln!("interrupted, finishing current chunk");
            handle.cancel();
        })?;

        let mut samples = Vec::new();
        for (chunk_idx, chunk) in chunks.enumerate() {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(error) if error.is_cancelled() => break,
                Err(error) => return Err(error.into()),
            };
            let (pcm, _) = WavIo::decode_wav_bytes(&bytes)?;
            samples.extend(pcm);
            if progress {
                eprintln!("chunk {chunk_idx}: {} samples", samples.len());
            }
        }
        if samples.is_empty() {
            anyhow::bail!("no audio produced");
        }
        WavIo::write_wav(output, &samples, SAMPLE_RATE)?;
    } else {
        let wav = engine.synthesize(text, voice)?;
        std::fs::write(output, wav)?;
    }

    eprintln!("wrote {}", output.display());
    Ok(())
}

fn run_download(config: EngineConfig) -> Result<()> {
    let engine = std::sync::Arc::new(TtsEngine::new(config));
    let monitor = std::sync::Arc::clone(&engine);

    let worker = std::thread::spawn(move || engine.preload());

    // Poll the observable download progress until the load settles.
    loop {
        if worker.is_finished() {
            break;
        }
        if let Some(progress) = monitor.download_progress() {
            for asset in progress {
                let (bytes, total) = asset.snapshot();
                match total {
                    Some(total) if total > 0 => {
                        eprintln!("{}: {bytes}/{total} bytes", asset.name)
                    }
                    _ => eprintln!("{}: {bytes} bytes", asset.name),
                }
            }
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    worker
        .join()
        .map_err(|_| anyhow::anyhow!("download worker panicked"))??;
    println!("model assets ready");
    Ok(())
}
