//! Text tokenization and sentence handling.
//!
//! Tokenization defers entirely to the SentencePiece model; the only text
//! processing owned here is sentence segmentation and terminal-punctuation
//! repair, which run before tokenization.

use crate::error::{EngineError, InputErrorKind, Result};
use sentencepiece::SentencePieceProcessor;

const TERMINALS: [char; 3] = ['.', '!', '?'];

/// Seam between the engine and the concrete tokenizer.
///
/// Production uses [`TextTokenizer`]; tests substitute scripted encoders.
pub trait Tokenize: Send + Sync {
    /// Encode text into the i64 ids the conditioner graph consumes.
    fn encode_ids(&self, text: &str) -> Result<Vec<i64>>;
}

impl Tokenize for TextTokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<i64>> {
        TextTokenizer::encode_ids(self, text)
    }
}

/// SentencePiece-based tokenizer for the text conditioner.
#[derive(Debug)]
pub struct TextTokenizer {
    sp: SentencePieceProcessor,
}

impl TextTokenizer {
    /// Load a SentencePiece model from disk.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let sp = SentencePieceProcessor::open(path)
            .map_err(|e| EngineError::model_load("tokenizer", e))?;
        Ok(Self { sp })
    }

    /// Encode text into token IDs.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let pieces = self
            .sp
            .encode(text)
            .map_err(|e| EngineError::session("tokenizer", e))?;
        Ok(pieces.into_iter().map(|piece| piece.id).collect())
    }

    /// Encode text into the i64 ids the conditioner graph consumes.
    pub fn encode_ids(&self, text: &str) -> Result<Vec<i64>> {
        Ok(self
            .encode(text)?
            .into_iter()
            .map(i64::from)
            .collect())
    }
}

/// Reject empty or whitespace-only input before any tokenization happens.
pub fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngineError::input(
            InputErrorKind::EmptyText,
            "text prompt is empty",
        ));
    }
    Ok(())
}

/// Split text into sentences on runs of `.`/`!`/`?`.
///
/// A terminal run only closes a sentence when followed by whitespace or the
/// end of input, so dotted names like `server.js` stay in one piece.
/// Segments are trimmed and empties dropped; input without any terminal
/// punctuation comes back as a single sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if !TERMINALS.contains(&c) {
            continue;
        }
        while let Some(&next) = chars.peek() {
            if !TERMINALS.contains(&next) {
                break;
            }
            current.push(next);
            chars.next();
        }
        let at_boundary = chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Trim a sentence and append `.` when it lacks terminal punctuation.
pub fn ensure_terminal_punctuation(sentence: &str) -> String {
    let trimmed = sentence.trim();
    match trimmed.chars().last() {
        Some(last) if TERMINALS.contains(&last) => trimmed.to_string(),
        Some(_) => format!("{trimmed}."),
        None => String::new(),
    }
}
