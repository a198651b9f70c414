//! # stimme - Local Streaming Text-to-Speech
//!
//! A streaming TTS engine driving five quantized ONNX graphs from the
//! Mimi/FlowLM family on the CPU. Given text and a voice identity, it emits
//! 24 kHz mono WAV chunks as they are decoded rather than after the full
//! utterance is complete.
//!
//! ## Architecture Overview
//!
//! A synthesis flows through four stages:
//!
//! 1. **Text conditioning** ([`conditioner::text`]): sentences are split
//!    off, terminal punctuation repaired, and tokens produced by a
//!    SentencePiece model, then embedded by the text-conditioner graph.
//!
//! 2. **Voice identity** ([`voice`]): a speaker embedding comes from the
//!    packed `voices.bin` table, or from reference audio pushed through the
//!    voice-encoder graph (decoded, resampled to 24 kHz, LRU-cached by
//!    source path).
//!
//! 3. **Autoregressive backbone** ([`model::tts`]): the stateful
//!    `flow_lm_main` transformer emits a conditioning vector and an EOS
//!    logit per frame, threading a heterogeneous state bundle through every
//!    run. Each frame's latent is refined by Euler-integrating the flow
//!    graph's velocity field ([`flow`]).
//!
//! 4. **Audio decode** ([`model::tts`] + [`audio`]): accumulated latents
//!    are batch-decoded to PCM by the Mimi decoder graph and framed as
//!    self-contained WAV payloads.
//!
//! Model files are fetched and integrity-checked by the asset manager
//! ([`assets`]), with concurrent loads coalesced process-wide.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stimme::{EngineConfig, TtsEngine};
//!
//! let engine = TtsEngine::new(EngineConfig::default());
//! let stream = engine.synthesize_stream("Hello world.", Some("cosette")).unwrap();
//! for chunk in stream {
//!     let wav_bytes = chunk.unwrap();
//!     // Each item is a complete 16-bit PCM mono 24 kHz WAV payload.
//!     println!("got {} bytes", wav_bytes.len());
//! }
//! ```
//!
//! ## Cancellation
//!
//! ```no_run
//! # use stimme::{EngineConfig, TtsEngine};
//! # let engine = TtsEngine::new(EngineConfig::default());
//! let stream = engine.synthesize_stream("A very long story.", None).unwrap();
//! let handle = stream.cancel_handle();
//! // From any thread: stops between generation steps, never mid-chunk.
//! handle.cancel();
//! ```

// Public modules - these are part of the stable API
pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod runtime;

// Internal modules - exposed for integration tests but not part of stable API.
// These may change without notice between versions.
#[doc(hidden)]
pub mod conditioner;
#[doc(hidden)]
pub mod flow;
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod session;
#[doc(hidden)]
pub mod state;
#[doc(hidden)]
pub mod tensor;
#[doc(hidden)]
pub mod voice;

// Re-exports forming the public API
pub use config::{load_config, EngineConfig};
pub use error::{EngineError, Result};
pub use runtime::{CancelHandle, EngineStatus, ModelParts, SynthesisStream, TtsEngine};
