//! Voice identities: the packed `voices.bin` table, reference-audio
//! encoding, and the bounded speaker-embedding cache.

use crate::audio::io::WavIo;
use crate::audio::resample::resample_linear;
use crate::config::SAMPLE_RATE;
use crate::error::{EngineError, InputErrorKind, Result, VoiceErrorKind};
use crate::session::Graph;
use crate::tensor::{Dtype, TensorValue};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Shortest reference clip the voice encoder accepts: 0.25 s at 24 kHz.
pub const MIN_REFERENCE_SAMPLES: usize = 6_000;

/// Fixed width of a NUL-padded voice name in `voices.bin`.
const VOICE_NAME_BYTES: usize = 32;

/// Reference-audio extensions, scanned in preference order.
const REFERENCE_EXTENSIONS: [&str; 5] = ["wav", "mp3", "ogg", "flac", "m4a"];

/// A speaker identity as the backbone consumes it: f32 `[1, frames, dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEmbedding {
    tensor: TensorValue,
}

impl SpeakerEmbedding {
    /// Wrap a tensor, normalizing rank 2 to `[1, frames, dim]` and
    /// rejecting anything else.
    pub fn new(voice: &str, tensor: TensorValue) -> Result<Self> {
        if tensor.dtype() != Dtype::F32 {
            return Err(EngineError::voice(
                voice,
                VoiceErrorKind::ShapeMismatch,
                format!("embedding dtype is {}, expected f32", tensor.dtype()),
            ));
        }
        let dims = tensor.dims().to_vec();
        let tensor = match dims.as_slice() {
            [frames, dim] => tensor.reshaped(&[1, *frames, *dim]),
            [1, _, _] => tensor,
            other => {
                return Err(EngineError::voice(
                    voice,
                    VoiceErrorKind::ShapeMismatch,
                    format!("embedding shape {other:?} is not [1, frames, dim]"),
                ));
            }
        };
        let (frames, dim) = (tensor.dims()[1], tensor.dims()[2]);
        if frames == 0 || dim == 0 {
            return Err(EngineError::voice(
                voice,
                VoiceErrorKind::ShapeMismatch,
                format!("embedding has degenerate shape [1, {frames}, {dim}]"),
            ));
        }
        Ok(Self { tensor })
    }

    pub fn num_frames(&self) -> usize {
        self.tensor.dims()[1]
    }

    pub fn emb_dim(&self) -> usize {
        self.tensor.dims()[2]
    }

    pub fn tensor(&self) -> &TensorValue {
        &self.tensor
    }
}

/// Parsed `voices.bin`: ordered, named speaker embeddings.
#[derive(Debug, Clone, Default)]
pub struct VoicesTable {
    names: Vec<String>,
    embeddings: HashMap<String, SpeakerEmbedding>,
}

impl VoicesTable {
    /// Parse the packed table layout:
    /// u32 record count, then per record a 32-byte NUL-padded ASCII name,
    /// u32 `num_frames`, u32 `emb_dim`, and `frames * dim` LE f32 values.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, offset: 0 };
        let count = cursor.read_u32()?;
        let mut names = Vec::with_capacity(count as usize);
        let mut embeddings = HashMap::with_capacity(count as usize);

        for record in 0..count {
            let raw_name = cursor.read_bytes(VOICE_NAME_BYTES)?;
            let end = raw_name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(VOICE_NAME_BYTES);
            let name = std::str::from_utf8(&raw_name[..end])
                .map_err(|_| table_error(format!("record {record} has a non-ASCII name")))?
                .trim()
                .to_string();

            let num_frames = cursor.read_u32()? as usize;
            let emb_dim = cursor.read_u32()? as usize;
            if num_frames == 0 || emb_dim == 0 {
                return Err(table_error(format!(
                    "record '{name}' declares shape [{num_frames}, {emb_dim}]"
                )));
            }

            let payload = cursor.read_bytes(num_frames * emb_dim * 4)?;
            let mut data = Vec::with_capacity(num_frames * emb_dim);
            for chunk in payload.chunks_exact(4) {
                data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }

            let embedding = SpeakerEmbedding::new(
                &name,
                TensorValue::from_f32(&[1, num_frames, emb_dim], data),
            )?;
            if embeddings.insert(name.clone(), embedding).is_none() {
                names.push(name);
            }
        }

        Ok(Self { names, embeddings })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            table_error(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&bytes)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<&SpeakerEmbedding> {
        self.embeddings.get(name)
    }

    /// The configured default voice, or the first record when absent.
    pub fn default_embedding(&self, preferred: &str) -> Option<(&str, &SpeakerEmbedding)> {
        if let Some(embedding) = self.embeddings.get(preferred) {
            return Some((preferred, embedding));
        }
        let first = self.names.first()?;
        self.embeddings
            .get(first)
            .map(|embedding| (first.as_str(), embedding))
    }
}

fn table_error(detail: String) -> EngineError {
    EngineError::model_load("voices_table", detail)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset.checked_add(len).ok_or_else(|| {
            table_error("record length overflows".to_string())
        })?;
        if end > self.bytes.len() {
            return Err(table_error(format!(
                "truncated table: needed {end} bytes, have {}",
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// How a voice id resolved.
#[derive(Debug, Clone)]
pub enum ResolvedVoice {
    /// Found in the voices table (or fell back to the default record).
    Embedded(SpeakerEmbedding),
    /// A reference-audio file that still needs encoding.
    Reference(PathBuf),
}

/// Resolve a voice id against the table and the reference directories.
///
/// Order: exact table entry, then `voice_id.<ext>` in each voice dir
/// (`.wav` preferred), then the table's default record. Only an empty table
/// with no file match is `NotFound`.
pub fn resolve_voice(
    voice_id: &str,
    table: &VoicesTable,
    voice_dirs: &[PathBuf],
    default_name: &str,
) -> Result<ResolvedVoice> {
    if let Some(embedding) = table.get(voice_id) {
        return Ok(ResolvedVoice::Embedded(embedding.clone()));
    }

    for dir in voice_dirs {
        for ext in REFERENCE_EXTENSIONS {
            let candidate = dir.join(format!("{voice_id}.{ext}"));
            if candidate.is_file() {
                return Ok(ResolvedVoice::Reference(candidate));
            }
        }
    }

    if let Some((name, embedding)) = table.default_embedding(default_name) {
        log::debug!("voice '{voice_id}' not found, using '{name}'");
        return Ok(ResolvedVoice::Embedded(embedding.clone()));
    }

    Err(EngineError::voice(
        voice_id,
        VoiceErrorKind::NotFound,
        "not in voices table and no reference audio found",
    ))
}

/// Voice ids available as reference audio in the given directories.
pub fn list_reference_voices(dirs: &[PathBuf]) -> Vec<String> {
    let mut voices = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let has_known_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| REFERENCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !has_known_ext {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !voices.iter().any(|v| v == stem) {
                    voices.push(stem.to_string());
                }
            }
        }
    }
    voices
}

/// Encode reference audio into a speaker embedding:
/// decode → channel 0 → resample to 24 kHz → `[1, 1, N]` → voice encoder.
pub fn encode_reference(encoder: &Graph, voice: &str, path: &Path) -> Result<SpeakerEmbedding> {
    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    if !is_wav {
        return Err(EngineError::voice(
            voice,
            VoiceErrorKind::DecodeFailed,
            format!("no decoder registered for {}", path.display()),
        ));
    }

    let (samples, sample_rate) = WavIo::read_wav_mono(path)
        .map_err(|e| EngineError::voice(voice, VoiceErrorKind::DecodeFailed, e))?;
    let samples = resample_linear(&samples, sample_rate, SAMPLE_RATE);
    if samples.len() < MIN_REFERENCE_SAMPLES {
        return Err(EngineError::input(
            InputErrorKind::AudioTooShort,
            format!(
                "{} has {} samples at {SAMPLE_RATE} Hz, need {MIN_REFERENCE_SAMPLES}",
                path.display(),
                samples.len()
            ),
        ));
    }

    let input_name = encoder
        .input_names()
        .first()
        .cloned()
        .ok_or_else(|| EngineError::session(encoder.label(), "graph declares no inputs"))?;
    let sample_count = samples.len();
    let mut inputs = HashMap::with_capacity(1);
    inputs.insert(
        input_name,
        TensorValue::from_f32(&[1, 1, sample_count], samples),
    );
    let outputs = encoder.run(inputs)?;

    let first_output = encoder
        .output_names()
        .first()
        .and_then(|name| outputs.get(name))
        .ok_or_else(|| EngineError::session(encoder.label(), "graph produced no outputs"))?;
    SpeakerEmbedding::new(voice, first_output.clone())
}

/// Bounded LRU cache from reference-audio path to speaker embedding.
pub struct VoiceCache {
    cache: LruCache<PathBuf, SpeakerEmbedding>,
}

impl VoiceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Look up an embedding by source path, encoding on miss.
    pub fn get_or_encode(
        &mut self,
        encoder: &Graph,
        voice: &str,
        path: &Path,
    ) -> Result<SpeakerEmbedding> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Some(embedding) = self.cache.get(&key) {
            return Ok(embedding.clone());
        }
        let embedding = encode_reference(encoder, voice, path)?;
        self.cache.put(key, embedding.clone());
        Ok(embedding)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize a table the way `voices.bin` lays it out.
    fn table_bytes(records: &[(&str, usize, usize)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(records.len() as u32).to_le_bytes());
        for (name, frames, dim) in records {
            let mut padded = [0_u8; VOICE_NAME_BYTES];
            padded[..name.len()].copy_from_slice(name.as_bytes());
            bytes.extend_from_slice(&padded);
            bytes.extend_from_slice(&(*frames as u32).to_le_bytes());
            bytes.extend_from_slice(&(*dim as u32).to_le_bytes());
            for i in 0..(frames * dim) {
                bytes.extend_from_slice(&(i as f32).to_le_bytes());
            }
        }
        bytes
    }

    #[test]
    fn parse_reads_names_and_shapes() {
        let table = VoicesTable::parse(&table_bytes(&[
            ("cosette", 32, 8),
            ("eponine", 4, 8),
        ]))
        .expect("parse");

        assert_eq!(table.len(), 2);
        assert_eq!(table.names(), &["cosette", "eponine"]);
        let cosette = table.get("cosette").expect("cosette");
        assert_eq!(cosette.num_frames(), 32);
        assert_eq!(cosette.emb_dim(), 8);
        assert_eq!(cosette.tensor().dims(), &[1, 32, 8]);
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let mut bytes = table_bytes(&[("cosette", 4, 4)]);
        bytes.truncate(bytes.len() - 8);
        let err = VoicesTable::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn parse_rejects_zero_shape() {
        let err = VoicesTable::parse(&table_bytes(&[("broken", 0, 8)])).unwrap_err();
        assert!(err.to_string().contains("[0, 8]"));
    }

    #[test]
    fn default_prefers_configured_name_then_first_record() {
        let table =
            VoicesTable::parse(&table_bytes(&[("alba", 2, 4), ("cosette", 2, 4)])).expect("parse");

        let (name, _) = table.default_embedding("cosette").expect("default");
        assert_eq!(name, "cosette");

        let (name, _) = table.default_embedding("nobody").expect("fallback");
        assert_eq!(name, "alba");

        assert!(VoicesTable::default().default_embedding("cosette").is_none());
    }

    #[test]
    fn resolve_prefers_table_over_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cosette.wav"), b"not real audio").expect("write");

        let table = VoicesTable::parse(&table_bytes(&[("cosette", 2, 4)])).expect("parse");
        let resolved = resolve_voice(
            "cosette",
            &table,
            &[dir.path().to_path_buf()],
            "cosette",
        )
        .expect("resolve");
        assert!(matches!(resolved, ResolvedVoice::Embedded(_)));
    }

    #[test]
    fn resolve_finds_reference_audio_preferring_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marius.mp3"), b"x").expect("write mp3");
        std::fs::write(dir.path().join("marius.wav"), b"x").expect("write wav");

        let resolved = resolve_voice(
            "marius",
            &VoicesTable::default(),
            &[dir.path().to_path_buf()],
            "cosette",
        )
        .expect("resolve");
        match resolved {
            ResolvedVoice::Reference(path) => {
                assert_eq!(path.extension().and_then(|e| e.to_str()), Some("wav"));
            }
            other => panic!("expected reference, got {other:?}"),
        }
    }

    #[test]
    fn resolve_falls_back_to_default_then_errors() {
        let table = VoicesTable::parse(&table_bytes(&[("alba", 2, 4)])).expect("parse");
        let resolved = resolve_voice("missing", &table, &[], "cosette").expect("fallback");
        assert!(matches!(resolved, ResolvedVoice::Embedded(_)));

        let err = resolve_voice("missing", &VoicesTable::default(), &[], "cosette").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Voice {
                kind: VoiceErrorKind::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn embedding_normalizes_rank_two() {
        let embedding =
            SpeakerEmbedding::new("test", TensorValue::from_f32(&[3, 4], vec![0.0; 12]))
                .expect("rank 2 accepted");
        assert_eq!(embedding.tensor().dims(), &[1, 3, 4]);

        let err = SpeakerEmbedding::new("test", TensorValue::from_f32(&[12], vec![0.0; 12]))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Voice {
                kind: VoiceErrorKind::ShapeMismatch,
                ..
            }
        ));
    }

    #[test]
    fn non_wav_reference_reports_decode_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("javert.mp3");
        std::fs::write(&path, b"mp3 bytes").expect("write");

        let (encoder, _) = NullEncoder::graph();
        let err = encode_reference(&encoder, "javert", &path).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Voice {
                kind: VoiceErrorKind::DecodeFailed,
                ..
            }
        ));
    }

    #[test]
    fn short_reference_audio_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.wav");
        crate::audio::io::WavIo::write_wav(&path, &vec![0.1_f32; 100], SAMPLE_RATE)
            .expect("write wav");

        let (encoder, _) = NullEncoder::graph();
        let err = encode_reference(&encoder, "short", &path).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Input {
                kind: InputErrorKind::AudioTooShort,
                ..
            }
        ));
    }

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Minimal encoder stub: counts calls, returns a fixed-size embedding.
    struct NullEncoder {
        calls: Arc<AtomicUsize>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    }

    impl NullEncoder {
        fn graph() -> (crate::session::Graph, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let graph = crate::session::Graph::new(Box::new(Self {
                calls: Arc::clone(&calls),
                inputs: vec!["audio".to_string()],
                outputs: vec!["embedding".to_string()],
            }));
            (graph, calls)
        }
    }

    impl crate::session::GraphSession for NullEncoder {
        fn label(&self) -> &'static str {
            "voice_encoder"
        }

        fn input_names(&self) -> &[String] {
            &self.inputs
        }

        fn output_names(&self) -> &[String] {
            &self.outputs
        }

        fn input_dtype(&self, _input: &str) -> Option<Dtype> {
            Some(Dtype::F32)
        }

        fn input_dims(&self, _input: &str) -> Option<Vec<usize>> {
            None
        }

        fn run(
            &self,
            _inputs: HashMap<String, TensorValue>,
        ) -> Result<HashMap<String, TensorValue>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outputs = HashMap::new();
            outputs.insert(
                "embedding".to_string(),
                TensorValue::from_f32(&[1, 2, 4], vec![0.5; 8]),
            );
            Ok(outputs)
        }
    }

    #[test]
    fn cache_hits_skip_the_encoder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ref.wav");
        crate::audio::io::WavIo::write_wav(&path, &vec![0.1_f32; 12_000], SAMPLE_RATE)
            .expect("write wav");

        let (encoder, calls) = NullEncoder::graph();
        let mut cache = VoiceCache::new(16);

        let first = cache.get_or_encode(&encoder, "ref", &path).expect("encode");
        let second = cache.get_or_encode(&encoder, "ref", &path).expect("hit");
        assert_eq!(first, second);
        // One encoder invocation across both lookups.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (encoder, _) = NullEncoder::graph();
        let mut cache = VoiceCache::new(2);

        for name in ["a", "b", "c"] {
            let path = dir.path().join(format!("{name}.wav"));
            crate::audio::io::WavIo::write_wav(&path, &vec![0.1_f32; 12_000], SAMPLE_RATE)
                .expect("write wav");
            cache
                .get_or_encode(&encoder, name, &path)
                .expect("encode");
        }
        assert_eq!(cache.len(), 2);
    }
}
