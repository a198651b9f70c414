//! Engine configuration.
//!
//! Every knob has a production default; a YAML file may override any subset
//! of fields. Load with [`load_config`] or start from
//! [`EngineConfig::default`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Output sample rate of the decoder graph, in Hz.
pub const SAMPLE_RATE: u32 = 24_000;

/// Width of a latent audio frame.
pub const LATENT_DIM: usize = 32;

/// Width of the backbone's text-embedding input.
pub const TEXT_EMBED_DIM: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Tunable settings for a [`crate::runtime::TtsEngine`].
pub struct EngineConfig {
    /// Directory holding the model assets (graphs, tokenizer, voices table).
    pub models_dir: PathBuf,
    /// Directories scanned, in order, for reference-audio voices.
    pub voice_dirs: Vec<PathBuf>,
    /// Base URL the asset manager downloads from. Hugging Face `resolve/`
    /// URLs redirect to a CDN, which the downloader follows.
    pub asset_base_url: String,
    /// Latent frames accumulated before each decoder call.
    pub decode_batch: usize,
    /// Hard cap on latent frames per sentence.
    pub max_frames: usize,
    /// Euler integration steps per generated frame.
    pub flow_steps: usize,
    /// Generation stops once `eos_logit` exceeds this value.
    pub eos_threshold: f32,
    /// Variance of the Gaussian the flow refiner starts from.
    pub temperature: f32,
    /// Voice name used when the caller does not pick one.
    pub default_voice: String,
    /// Bounded size of the speaker-embedding cache.
    pub voice_cache_entries: usize,
    /// Download attempts per asset before giving up.
    pub download_retries: u32,
    /// Base of the exponential download backoff, in seconds.
    pub download_backoff_secs: u64,
    /// TCP connect timeout for asset downloads, in seconds.
    pub connect_timeout_secs: u64,
    /// Overall per-file timeout for asset downloads, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            voice_dirs: Vec::new(),
            asset_base_url: "https://huggingface.co/kyutai/pocket-tts-onnx/resolve/main"
                .to_string(),
            decode_batch: 12,
            max_frames: 500,
            flow_steps: 10,
            eos_threshold: -4.0,
            temperature: 0.7,
            default_voice: "cosette".to_string(),
            voice_cache_entries: 16,
            download_retries: 3,
            download_backoff_secs: 1,
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    pub fn download_backoff_base(&self) -> Duration {
        Duration::from_secs(self.download_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Platform cache directory for downloaded assets (`~/.cache/stimme`).
fn default_models_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    Path::new(&home).join(".cache").join("stimme")
}

/// Load a configuration from a YAML file, filling unset fields from the
/// defaults.
///
/// # Errors
///
/// Returns an error if the file doesn't exist or contains invalid YAML.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<EngineConfig> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: EngineConfig = serde_yaml::from_str(&data)?;
    Ok(config)
}
