//! Shared stub graphs and helpers for the integration suites.
//!
//! The stubs script the five graph sessions well enough to run the whole
//! engine without ONNX Runtime: the backbone counts frame steps and fires
//! EOS on schedule, the flow graph returns a flat velocity field, and the
//! decoder emits a fixed number of samples per latent frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stimme::conditioner::text::Tokenize;
use stimme::error::Result;
use stimme::session::{GraphSession, SessionHost};
use stimme::tensor::{Dtype, TensorValue};

pub const LATENT_DIM: usize = 32;
/// Samples the stub decoder produces per latent frame.
pub const SAMPLES_PER_FRAME: usize = 10;

/// Call counters shared with the stub sessions.
#[derive(Default)]
pub struct SessionCounters {
    pub voice_encoder: Arc<AtomicUsize>,
    pub text_conditioner: Arc<AtomicUsize>,
    pub backbone: Arc<AtomicUsize>,
    pub flow: Arc<AtomicUsize>,
    pub decoder: Arc<AtomicUsize>,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Whitespace tokenizer standing in for SentencePiece.
pub struct StubTokenizer;

impl Tokenize for StubTokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<i64>> {
        Ok(text
            .split_whitespace()
            .enumerate()
            .map(|(idx, word)| (word.len() + idx) as i64)
            .collect())
    }
}

enum Behavior {
    VoiceEncoder,
    TextConditioner,
    Backbone {
        /// Fire EOS every this many frame steps (per-sentence when each
        /// sentence generates exactly this many frames).
        eos_every: usize,
        frame_steps: Arc<AtomicUsize>,
    },
    Flow,
    Decoder,
}

struct StubGraph {
    label: &'static str,
    inputs: Vec<String>,
    outputs: Vec<String>,
    i64_inputs: Vec<&'static str>,
    calls: Arc<AtomicUsize>,
    behavior: Behavior,
}

impl GraphSession for StubGraph {
    fn label(&self) -> &'static str {
        self.label
    }

    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn input_dtype(&self, input: &str) -> Option<Dtype> {
        if self.i64_inputs.contains(&input) {
            Some(Dtype::I64)
        } else {
            Some(Dtype::F32)
        }
    }

    fn input_dims(&self, input: &str) -> Option<Vec<usize>> {
        // Scalar state slots report their shape; everything else is dynamic.
        (input == "state_0" || input == "state_1").then(|| vec![1])
    }

    fn run(&self, inputs: HashMap<String, TensorValue>) -> Result<HashMap<String, TensorValue>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outputs = HashMap::new();
        match &self.behavior {
            Behavior::VoiceEncoder => {
                outputs.insert(
                    "embedding".to_string(),
                    TensorValue::from_f32(&[1, 4, 16], vec![0.01; 64]),
                );
            }
            Behavior::TextConditioner => {
                let tokens = inputs["token_ids"].len().max(1);
                // Rank 2 on purpose: the driver lifts it to [1, rows, cols].
                outputs.insert(
                    "embedded".to_string(),
                    TensorValue::from_f32(&[tokens, 16], vec![0.5; tokens * 16]),
                );
            }
            Behavior::Backbone {
                eos_every,
                frame_steps,
            } => {
                let counter = inputs["state_0"]
                    .as_i64()
                    .map(|slot| slot[0])
                    .unwrap_or_default();
                let is_frame_step = inputs["sequence"].dims()[1] == 1;

                let mut eos_logit = -10.0_f32;
                if is_frame_step {
                    let step = frame_steps.fetch_add(1, Ordering::SeqCst);
                    if (step + 1) % eos_every == 0 {
                        eos_logit = 0.0;
                    }
                }

                outputs.insert(
                    "conditioning".to_string(),
                    TensorValue::from_f32(&[1, 16], vec![0.1; 16]),
                );
                outputs.insert(
                    "eos_logit".to_string(),
                    TensorValue::from_f32(&[1, 1], vec![eos_logit]),
                );
                outputs.insert(
                    "out_state_0".to_string(),
                    TensorValue::from_i64(&[1], vec![counter + 1]),
                );
                // Emits f32 for an i64-declared slot: the bundle must coerce.
                outputs.insert(
                    "out_state_1".to_string(),
                    TensorValue::from_f32(&[1], vec![counter as f32 + 0.7]),
                );
            }
            Behavior::Flow => {
                outputs.insert(
                    "flow_dir".to_string(),
                    TensorValue::from_f32(&[1, LATENT_DIM], vec![0.05; LATENT_DIM]),
                );
            }
            Behavior::Decoder => {
                let frames = inputs["latents"].dims()[1];
                let samples = frames * SAMPLES_PER_FRAME;
                let wave: Vec<f32> = (0..samples)
                    .map(|i| ((i % 20) as f32 - 10.0) / 20.0)
                    .collect();
                outputs.insert(
                    "audio".to_string(),
                    TensorValue::from_f32(&[1, samples], wave),
                );
            }
        }
        Ok(outputs)
    }
}

/// A full stub host whose backbone fires EOS every `eos_every` frame steps.
pub fn stub_host(eos_every: usize, counters: &SessionCounters) -> SessionHost {
    let names = |items: &[&str]| -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    };

    SessionHost::from_graphs(
        Box::new(StubGraph {
            label: "voice_encoder",
            inputs: names(&["audio"]),
            outputs: names(&["embedding"]),
            i64_inputs: vec![],
            calls: Arc::clone(&counters.voice_encoder),
            behavior: Behavior::VoiceEncoder,
        }),
        Box::new(StubGraph {
            label: "text_conditioner",
            inputs: names(&["token_ids"]),
            outputs: names(&["embedded"]),
            i64_inputs: vec!["token_ids"],
            calls: Arc::clone(&counters.text_conditioner),
            behavior: Behavior::TextConditioner,
        }),
        Box::new(StubGraph {
            label: "backbone",
            inputs: names(&["sequence", "text_embeddings", "state_0", "state_1"]),
            outputs: names(&[
                "conditioning",
                "eos_logit",
                "out_state_0",
                "out_state_1",
            ]),
            i64_inputs: vec!["state_0", "state_1"],
            calls: Arc::clone(&counters.backbone),
            behavior: Behavior::Backbone {
                eos_every,
                frame_steps: Arc::new(AtomicUsize::new(0)),
            },
        }),
        Box::new(StubGraph {
            label: "flow",
            inputs: names(&["conditioning", "s", "t", "x"]),
            outputs: names(&["flow_dir"]),
            i64_inputs: vec![],
            calls: Arc::clone(&counters.flow),
            behavior: Behavior::Flow,
        }),
        Box::new(StubGraph {
            label: "decoder",
            inputs: names(&["latents"]),
            outputs: names(&["audio"]),
            i64_inputs: vec![],
            calls: Arc::clone(&counters.decoder),
            behavior: Behavior::Decoder,
        }),
    )
}
