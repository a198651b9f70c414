//! The autoregressive synthesis driver.
//!
//! One sentence flows through three phases against the backbone graph:
//! voice conditioning (speaker embedding as `text_embeddings`), text
//! conditioning (embedded token ids), then the frame loop. Every backbone
//! run threads the full state bundle; every generated latent is refined by
//! the flow graph before it becomes the next step's `sequence` input.
//! Latents accumulate until the decode batch fills or EOS fires, then the
//! decoder turns them into PCM and the chunk is handed to the sink.

use crate::config::{EngineConfig, LATENT_DIM, TEXT_EMBED_DIM};
use crate::error::{EngineError, Result};
use crate::flow::{self, FlowSchedule};
use crate::session::SessionHost;
use crate::state::{StateBundle, StateSpec};
use crate::tensor::TensorValue;
use crate::voice::SpeakerEmbedding;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Backbone input carrying the previous latent frame (or the NaN sentinel).
pub const INPUT_SEQUENCE: &str = "sequence";
/// Backbone input carrying conditioning embeddings.
pub const INPUT_TEXT_EMBEDDINGS: &str = "text_embeddings";
/// Backbone output feeding the flow refiner.
pub const OUTPUT_CONDITIONING: &str = "conditioning";
/// Backbone output signalling end of speech.
pub const OUTPUT_EOS_LOGIT: &str = "eos_logit";

/// Per-sentence generation limits.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub decode_batch: usize,
    pub max_frames: usize,
    pub flow_steps: usize,
    pub eos_threshold: f32,
    pub temperature: f32,
}

impl GenerationParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            decode_batch: config.decode_batch.max(1),
            max_frames: config.max_frames.max(1),
            flow_steps: config.flow_steps.max(1),
            eos_threshold: config.eos_threshold,
            temperature: config.temperature,
        }
    }
}

/// How a sentence's frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceOutcome {
    /// EOS fired or the frame cap was reached; all audio emitted.
    Finished,
    /// The cancellation flag was observed between iterations.
    Cancelled,
    /// The sink refused a chunk (consumer went away).
    ConsumerGone,
}

/// Stateless driver over a session host; all mutable state lives in the
/// caller's [`StateBundle`].
pub struct TtsModel<'a> {
    host: &'a SessionHost,
    schedule: &'a FlowSchedule,
    params: GenerationParams,
}

impl<'a> TtsModel<'a> {
    pub fn new(host: &'a SessionHost, schedule: &'a FlowSchedule, params: GenerationParams) -> Self {
        Self {
            host,
            schedule,
            params,
        }
    }

    /// Fresh zero state for one utterance.
    pub fn init_state(&self, spec: &StateSpec) -> StateBundle {
        spec.init_bundle()
    }

    /// Phase A: feed the speaker embedding through the backbone.
    pub fn condition_on_voice(
        &self,
        embedding: &SpeakerEmbedding,
        state: &mut StateBundle,
    ) -> Result<()> {
        self.run_backbone(
            TensorValue::empty_f32(1, LATENT_DIM),
            embedding.tensor().clone(),
            state,
        )?;
        Ok(())
    }

    /// Phase B: embed the token ids and feed them through the backbone.
    pub fn condition_on_text(&self, token_ids: &[i64], state: &mut StateBundle) -> Result<()> {
        let conditioner = &self.host.text_conditioner;
        let input_name = conditioner
            .input_names()
            .first()
            .cloned()
            .ok_or_else(|| EngineError::session(conditioner.label(), "graph declares no inputs"))?;

        let mut inputs = HashMap::with_capacity(1);
        inputs.insert(
            input_name,
            TensorValue::from_i64(&[1, token_ids.len()], token_ids.to_vec()),
        );
        let outputs = conditioner.run(inputs)?;
        let embedded = conditioner
            .output_names()
            .first()
            .and_then(|name| outputs.get(name))
            .ok_or_else(|| EngineError::session(conditioner.label(), "graph produced no outputs"))?
            .clone();

        let dims = embedded.dims().to_vec();
        let embedded = match dims.as_slice() {
            [rows, cols] => embedded.reshaped(&[1, *rows, *cols]),
            _ => embedded,
        };

        self.run_backbone(TensorValue::empty_f32(1, LATENT_DIM), embedded, state)?;
        Ok(())
    }

    /// Phase C: the frame loop.
    ///
    /// Decoded chunks go to `sink`; a `false` return stops generation the
    /// same way a dropped consumer would. Cancellation is honored between
    /// iterations only, and never leaves a partially-decoded chunk behind.
    pub fn generate(
        &self,
        state: &mut StateBundle,
        rng: &mut impl Rng,
        cancel: &AtomicBool,
        sink: &mut dyn FnMut(&[f32]) -> bool,
    ) -> Result<SentenceOutcome> {
        // NaN marks "no prior frame" for the backbone's first step.
        let mut current = TensorValue::full_f32(&[1, 1, LATENT_DIM], f32::NAN);
        let mut latents: Vec<Vec<f32>> = Vec::new();

        for _step in 0..self.params.max_frames {
            if cancel.load(Ordering::SeqCst) {
                return Ok(SentenceOutcome::Cancelled);
            }

            let outputs = self.run_backbone(
                current,
                TensorValue::empty_f32(1, TEXT_EMBED_DIM),
                state,
            )?;
            let conditioning = required_output(&outputs, OUTPUT_CONDITIONING)?;
            let eos_logit = required_output(&outputs, OUTPUT_EOS_LOGIT)?
                .first_f32()
                .ok_or_else(|| {
                    EngineError::session(self.host.backbone.label(), "eos_logit is empty")
                })?;

            let latent = flow::refine(
                &self.host.flow,
                self.schedule,
                conditioning,
                self.params.flow_steps,
                self.params.temperature,
                rng,
            )?;
            latents.push(latent.clone());
            current = TensorValue::from_f32(&[1, 1, LATENT_DIM], latent);

            let eos = eos_logit > self.params.eos_threshold;
            if latents.len() >= self.params.decode_batch || eos {
                if !self.decode_and_emit(&mut latents, sink)? {
                    return Ok(SentenceOutcome::ConsumerGone);
                }
            }
            if eos {
                return Ok(SentenceOutcome::Finished);
            }
        }

        if !latents.is_empty() && !self.decode_and_emit(&mut latents, sink)? {
            return Ok(SentenceOutcome::ConsumerGone);
        }
        Ok(SentenceOutcome::Finished)
    }

    /// One backbone run with full state read-modify-write.
    fn run_backbone(
        &self,
        sequence: TensorValue,
        text_embeddings: TensorValue,
        state: &mut StateBundle,
    ) -> Result<HashMap<String, TensorValue>> {
        let mut inputs = HashMap::with_capacity(2 + state.len());
        inputs.insert(INPUT_SEQUENCE.to_string(), sequence);
        inputs.insert(INPUT_TEXT_EMBEDDINGS.to_string(), text_embeddings);
        state.fill_inputs(&mut inputs);

        let outputs = self.host.backbone.run(inputs)?;
        state.absorb_outputs(&outputs)?;
        Ok(outputs)
    }

    /// Decode the accumulated latents into one PCM chunk and hand it to the
    /// sink. Returns whether the sink accepted it.
    fn decode_and_emit(
        &self,
        latents: &mut Vec<Vec<f32>>,
        sink: &mut dyn FnMut(&[f32]) -> bool,
    ) -> Result<bool> {
        let decoder = &self.host.decoder;
        let frames = latents.len();
        let mut flat = Vec::with_capacity(frames * LATENT_DIM);
        for latent in latents.iter() {
            flat.extend_from_slice(latent);
        }
        latents.clear();

        let input_name = decoder
            .input_names()
            .first()
            .cloned()
            .ok_or_else(|| EngineError::session(decoder.label(), "graph declares no inputs"))?;
        let mut inputs = HashMap::with_capacity(1);
        inputs.insert(
            input_name,
            TensorValue::from_f32(&[1, frames, LATENT_DIM], flat),
        );
        let outputs = decoder.run(inputs)?;

        let audio = decoder
            .output_names()
            .first()
            .and_then(|name| outputs.get(name))
            .ok_or_else(|| EngineError::session(decoder.label(), "graph produced no outputs"))?
            .to_f32_vec();
        log::debug!("decoded {frames} frames into {} samples", audio.len());
        Ok(sink(&audio))
    }
}

fn required_output<'v>(
    outputs: &'v HashMap<String, TensorValue>,
    name: &str,
) -> Result<&'v TensorValue> {
    outputs
        .get(name)
        .ok_or_else(|| EngineError::session(crate::session::BACKBONE, format!("missing output '{name}'")))
}
