//! Error taxonomy for the synthesis engine.
//!
//! Every fallible operation in the library surfaces an [`EngineError`]. The
//! CLI wraps these in `anyhow` at its boundary; inside the library the
//! variants stay typed so callers can distinguish a missing voice from a
//! truncated download.

use std::fmt;
use thiserror::Error;

/// What went wrong while fetching or validating a model asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetErrorKind {
    /// Transport-level failure (DNS, TLS, connect, read).
    Network,
    /// The final HTTP response carried a non-success status.
    Http(u16),
    /// Local filesystem failure while writing or renaming.
    Disk,
    /// The file on disk is smaller than the integrity threshold.
    Integrity,
}

impl fmt::Display for AssetErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetErrorKind::Network => write!(f, "network"),
            AssetErrorKind::Http(status) => write!(f, "http {status}"),
            AssetErrorKind::Disk => write!(f, "disk"),
            AssetErrorKind::Integrity => write!(f, "integrity"),
        }
    }
}

/// Why a voice could not be resolved into a speaker embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceErrorKind {
    NotFound,
    DecodeFailed,
    ShapeMismatch,
}

/// Rejected caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputErrorKind {
    EmptyText,
    AudioTooShort,
}

/// A single asset that could not be brought to a valid on-disk state.
#[derive(Debug, Clone)]
pub struct AssetFailure {
    pub asset: String,
    pub kind: AssetErrorKind,
    pub detail: String,
}

impl fmt::Display for AssetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.asset, self.kind, self.detail)
    }
}

/// Unified error type for the whole engine.
///
/// Variants mirror the failure domains of the pipeline: asset management,
/// session construction, voice resolution, graph execution, caller input,
/// and cooperative cancellation. The type is `Clone` so that a single load
/// outcome can be shared across coalesced callers.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A model asset failed its download or integrity check.
    #[error("asset {asset} failed ({kind}): {detail}")]
    Asset {
        asset: String,
        kind: AssetErrorKind,
        detail: String,
    },

    /// One or more assets in a set could not be ensured.
    #[error("{} asset(s) failed: {}", .failures.len(), format_failures(.failures))]
    AssetSet { failures: Vec<AssetFailure> },

    /// A graph session could not be constructed.
    #[error("failed to load {session} session: {cause}")]
    ModelLoad { session: &'static str, cause: String },

    /// Voice resolution or reference-audio encoding failed.
    #[error("voice '{voice}' ({kind:?}): {detail}")]
    Voice {
        voice: String,
        kind: VoiceErrorKind,
        detail: String,
    },

    /// A graph run was invoked with inputs the session cannot accept, or the
    /// runtime itself failed.
    #[error("session {session}: {cause}")]
    Session { session: &'static str, cause: String },

    /// The caller handed us input we refuse to synthesize.
    #[error("invalid input ({kind:?}): {detail}")]
    Input { kind: InputErrorKind, detail: String },

    /// The synthesis was cancelled between generation steps.
    #[error("synthesis cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn session(session: &'static str, cause: impl fmt::Display) -> Self {
        EngineError::Session {
            session,
            cause: cause.to_string(),
        }
    }

    pub fn model_load(session: &'static str, cause: impl fmt::Display) -> Self {
        EngineError::ModelLoad {
            session,
            cause: cause.to_string(),
        }
    }

    pub fn voice(voice: impl Into<String>, kind: VoiceErrorKind, detail: impl fmt::Display) -> Self {
        EngineError::Voice {
            voice: voice.into(),
            kind,
            detail: detail.to_string(),
        }
    }

    pub fn input(kind: InputErrorKind, detail: impl fmt::Display) -> Self {
        EngineError::Input {
            kind,
            detail: detail.to_string(),
        }
    }

    /// True when this error is the cooperative-cancellation signal rather
    /// than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

fn format_failures(failures: &[AssetFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
