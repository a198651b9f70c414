//! The engine facade and streaming orchestrator.
//!
//! [`TtsEngine`] owns the lazy load lifecycle (assets → sessions → voices →
//! flow schedule) behind a single-flight state machine, and turns text into
//! a stream of self-contained WAV chunks. Synthesis runs on a background
//! thread; the bounded chunk channel is the back-pressure point between the
//! driver and the consumer.

use crate::assets::{self, default_assets, DownloadHub, DownloadPolicy};
use crate::audio::io::WavIo;
use crate::conditioner::text::{
    ensure_terminal_punctuation, split_sentences, validate_text, TextTokenizer, Tokenize,
};
use crate::config::{EngineConfig, SAMPLE_RATE};
use crate::error::{EngineError, Result};
use crate::flow::FlowSchedule;
use crate::model::tts::{GenerationParams, SentenceOutcome, TtsModel};
use crate::session::SessionHost;
use crate::state::StateSpec;
use crate::voice::{
    list_reference_voices, resolve_voice, ResolvedVoice, SpeakerEmbedding, VoiceCache, VoicesTable,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Condvar, Mutex};

/// Chunks buffered between producer and consumer before the driver blocks.
const CHUNK_CHANNEL_DEPTH: usize = 2;

/// Pre-assembled model components, for embedders and tests that bypass the
/// on-disk load path.
pub struct ModelParts {
    pub host: SessionHost,
    pub tokenizer: Box<dyn Tokenize>,
    pub voices: VoicesTable,
}

/// Everything a synthesis needs once loading finished.
struct LoadedModel {
    host: SessionHost,
    tokenizer: Box<dyn Tokenize>,
    voices: VoicesTable,
    voice_cache: Mutex<VoiceCache>,
    schedule: FlowSchedule,
    state_spec: StateSpec,
}

enum LoadState {
    Unloaded,
    Loading,
    Ready(Arc<LoadedModel>),
    Failed(EngineError),
}

struct EngineShared {
    load: Mutex<LoadState>,
    load_done: Condvar,
    /// One synthesis at a time per engine instance.
    synthesis: Mutex<()>,
}

/// Snapshot of the engine's load state.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub ready: bool,
    pub last_error: Option<String>,
    pub models_dir: PathBuf,
}

/// A local streaming TTS engine over the five Mimi/FlowLM graphs.
///
/// Create once; the first synthesis (or an explicit [`preload`]) triggers
/// the model load. Concurrent callers arriving while a load is in flight
/// share its outcome, and a failed load is retried by the next caller.
///
/// [`preload`]: TtsEngine::preload
pub struct TtsEngine {
    config: EngineConfig,
    hub: Arc<DownloadHub>,
    shared: Arc<EngineShared>,
}

impl TtsEngine {
    /// Engines created here share the process-wide download hub, so two
    /// instances loading the same models dir coalesce into one flight.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_hub(config, assets::global_hub())
    }

    /// Use a private download hub instead of the process-wide one (tests,
    /// sandboxed embedders).
    pub fn with_hub(config: EngineConfig, hub: Arc<DownloadHub>) -> Self {
        Self {
            config,
            hub,
            shared: Arc::new(EngineShared {
                load: Mutex::new(LoadState::Unloaded),
                load_done: Condvar::new(),
                synthesis: Mutex::new(()),
            }),
        }
    }

    /// Build an engine that is immediately `Ready` from pre-assembled parts.
    pub fn with_parts(config: EngineConfig, parts: ModelParts) -> Self {
        let schedule = FlowSchedule::build(config.flow_steps.max(1));
        let state_spec = StateSpec::discover(&parts.host.backbone);
        let model = Arc::new(LoadedModel {
            host: parts.host,
            tokenizer: parts.tokenizer,
            voices: parts.voices,
            voice_cache: Mutex::new(VoiceCache::new(config.voice_cache_entries)),
            schedule,
            state_spec,
        });
        let engine = Self::new(config);
        *engine.shared.load.lock().expect("load state mutex poisoned") = LoadState::Ready(model);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Force the load now instead of on first synthesis.
    pub fn preload(&self) -> Result<()> {
        self.ensure_loaded().map(|_| ())
    }

    /// Current load state, the most recent load error, and the models dir.
    pub fn status(&self) -> EngineStatus {
        let state = self.shared.load.lock().expect("load state mutex poisoned");
        let (ready, last_error) = match &*state {
            LoadState::Ready(_) => (true, None),
            LoadState::Failed(error) => (false, Some(error.to_string())),
            LoadState::Unloaded | LoadState::Loading => (false, None),
        };
        EngineStatus {
            ready,
            last_error,
            models_dir: self.config.models_dir.clone(),
        }
    }

    /// Voice ids available right now: the voices table (when loaded or
    /// parseable from disk) plus reference audio in the voice dirs and any
    /// extra dirs.
    pub fn list_voices(&self, extra_dirs: &[PathBuf]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        {
            let state = self.shared.load.lock().expect("load state mutex poisoned");
            if let LoadState::Ready(model) = &*state {
                names.extend(model.voices.names().iter().cloned());
            }
        }
        if names.is_empty() {
            let table_path = self.config.models_dir.join(assets::VOICES_FILE);
            if table_path.is_file() {
                if let Ok(table) = VoicesTable::load(&table_path) {
                    names.extend(table.names().iter().cloned());
                }
            }
        }

        let mut dirs = self.config.voice_dirs.clone();
        dirs.extend(extra_dirs.iter().cloned());
        for voice in list_reference_voices(&dirs) {
            if !names.contains(&voice) {
                names.push(voice);
            }
        }
        names
    }

    /// Progress of an active asset download for this engine's model set.
    pub fn download_progress(&self) -> Option<Vec<Arc<assets::AssetProgress>>> {
        self.hub.progress(&self.asset_set_label())
    }

    /// Synthesize `text` as a lazy stream of WAV payloads.
    ///
    /// Sentences are synthesized in order; each yielded item is a complete
    /// 16-bit PCM mono 24 kHz WAV. The stream ends cleanly after the last
    /// chunk, or with one terminal error. Dropping the stream cancels the
    /// producer.
    pub fn synthesize_stream(
        &self,
        text: &str,
        voice_id: Option<&str>,
    ) -> Result<SynthesisStream> {
        validate_text(text)?;
        let model = self.ensure_loaded()?;

        let sentences: Vec<String> = split_sentences(text)
            .into_iter()
            .map(|sentence| ensure_terminal_punctuation(&sentence))
            .collect();
        let voice_id = voice_id.unwrap_or(&self.config.default_voice).to_string();
        let params = GenerationParams::from_config(&self.config);
        let voice_dirs = self.config.voice_dirs.clone();
        let default_voice = self.config.default_voice.clone();

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_worker = Arc::clone(&cancel);
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = mpsc::sync_channel(CHUNK_CHANNEL_DEPTH);

        std::thread::spawn(move || {
            let _one_at_a_time = shared.synthesis.lock().expect("synthesis mutex poisoned");
            let outcome = run_synthesis(
                &model,
                &params,
                &voice_dirs,
                &default_voice,
                &voice_id,
                &sentences,
                &cancel_worker,
                &tx,
            );
            match outcome {
                Ok(()) => {}
                Err(error) if error.is_cancelled() => {
                    log::debug!("synthesis cancelled");
                    let _ = tx.send(Err(error));
                }
                Err(error) => {
                    log::warn!("synthesis failed: {error}");
                    let _ = tx.send(Err(error));
                }
            }
        });

        Ok(SynthesisStream { rx, cancel })
    }

    /// Buffer a whole synthesis into one WAV payload.
    pub fn synthesize(&self, text: &str, voice_id: Option<&str>) -> Result<Vec<u8>> {
        let stream = self.synthesize_stream(text, voice_id)?;
        let mut samples = Vec::new();
        for chunk in stream {
            let bytes = chunk?;
            let (pcm, _) = WavIo::decode_wav_bytes(&bytes)
                .map_err(|e| EngineError::session("decoder", format!("chunk reframe failed: {e}")))?;
            samples.extend(pcm);
        }
        WavIo::encode_wav_bytes(&samples, SAMPLE_RATE)
            .map_err(|e| EngineError::session("decoder", format!("wav encode failed: {e}")))
    }

    fn asset_set_label(&self) -> String {
        format!("models:{}", self.config.models_dir.display())
    }

    fn ensure_loaded(&self) -> Result<Arc<LoadedModel>> {
        {
            let mut state = self.shared.load.lock().expect("load state mutex poisoned");
            let mut joined_pending_load = false;
            loop {
                match &*state {
                    LoadState::Ready(model) => return Ok(Arc::clone(model)),
                    LoadState::Failed(error) if joined_pending_load => {
                        return Err(error.clone());
                    }
                    LoadState::Loading => {
                        joined_pending_load = true;
                        state = self
                            .shared
                            .load_done
                            .wait(state)
                            .expect("load state mutex poisoned");
                    }
                    LoadState::Unloaded | LoadState::Failed(_) => {
                        *state = LoadState::Loading;
                        break;
                    }
                }
            }
        }

        let outcome = self.load_model();
        {
            let mut state = self.shared.load.lock().expect("load state mutex poisoned");
            *state = match &outcome {
                Ok(model) => LoadState::Ready(Arc::clone(model)),
                Err(error) => LoadState::Failed(error.clone()),
            };
        }
        self.shared.load_done.notify_all();
        outcome
    }

    fn load_model(&self) -> Result<Arc<LoadedModel>> {
        let assets = default_assets(&self.config.asset_base_url);
        let policy = DownloadPolicy::from_config(&self.config);
        self.hub.ensure(
            &self.asset_set_label(),
            &assets,
            &self.config.models_dir,
            &policy,
        )?;

        let host = SessionHost::open(&self.config.models_dir)?;
        let tokenizer =
            TextTokenizer::open(self.config.models_dir.join(assets::TOKENIZER_FILE))?;
        let voices = VoicesTable::load(&self.config.models_dir.join(assets::VOICES_FILE))?;
        let schedule = FlowSchedule::build(self.config.flow_steps.max(1));
        let state_spec = StateSpec::discover(&host.backbone);
        log::info!(
            "model loaded: {} voices, {} state slots",
            voices.len(),
            state_spec.len()
        );

        Ok(Arc::new(LoadedModel {
            host,
            tokenizer: Box::new(tokenizer),
            voices,
            voice_cache: Mutex::new(VoiceCache::new(self.config.voice_cache_entries)),
            schedule,
            state_spec,
        }))
    }
}

#[allow(clippy::too_many_arguments)]
fn run_synthesis(
    model: &LoadedModel,
    params: &GenerationParams,
    voice_dirs: &[PathBuf],
    default_voice: &str,
    voice_id: &str,
    sentences: &[String],
    cancel: &AtomicBool,
    tx: &SyncSender<Result<Vec<u8>>>,
) -> Result<()> {
    let embedding = resolve_embedding(model, voice_dirs, default_voice, voice_id)?;
    let driver = TtsModel::new(&model.host, &model.schedule, *params);
    let mut rng = StdRng::from_entropy();

    for sentence in sentences {
        if cancel.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }

        let token_ids = model.tokenizer.encode_ids(sentence)?;
        let mut state = model.state_spec.init_bundle();
        driver.condition_on_voice(&embedding, &mut state)?;
        driver.condition_on_text(&token_ids, &mut state)?;

        let mut frame_error: Option<EngineError> = None;
        let mut sink = |chunk: &[f32]| -> bool {
            match WavIo::encode_wav_bytes(chunk, SAMPLE_RATE) {
                Ok(bytes) => tx.send(Ok(bytes)).is_ok(),
                Err(e) => {
                    frame_error =
                        Some(EngineError::session("decoder", format!("wav framing failed: {e}")));
                    false
                }
            }
        };
        let outcome = driver.generate(&mut state, &mut rng, cancel, &mut sink)?;
        if let Some(error) = frame_error {
            return Err(error);
        }
        match outcome {
            SentenceOutcome::Finished => {}
            SentenceOutcome::Cancelled => return Err(EngineError::Cancelled),
            // The receiver is gone; nobody is listening for more sentences.
            SentenceOutcome::ConsumerGone => return Ok(()),
        }
    }
    Ok(())
}

fn resolve_embedding(
    model: &LoadedModel,
    voice_dirs: &[PathBuf],
    default_voice: &str,
    voice_id: &str,
) -> Result<SpeakerEmbedding> {
    match resolve_voice(voice_id, &model.voices, voice_dirs, default_voice)? {
        ResolvedVoice::Embedded(embedding) => Ok(embedding),
        ResolvedVoice::Reference(path) => model
            .voice_cache
            .lock()
            .expect("voice cache mutex poisoned")
            .get_or_encode(&model.host.voice_encoder, voice_id, &path),
    }
}

/// Cancels a running synthesis from another thread.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Lazy, finite, non-restartable sequence of WAV payloads.
///
/// Iteration blocks on the producer; dropping the stream cancels it.
pub struct SynthesisStream {
    rx: Receiver<Result<Vec<u8>>>,
    cancel: Arc<AtomicBool>,
}

impl SynthesisStream {
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }
}

impl Iterator for SynthesisStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for SynthesisStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}
