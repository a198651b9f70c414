//! Recurrent state threaded through every backbone run.
//!
//! The backbone declares its state inputs as `state_0 .. state_{S-1}` and
//! returns matching `out_state_i` outputs. Slot count, dtypes, and shapes
//! are discovered from the session at load; the bundle then owns the
//! dtype/shape invariants for the lifetime of one utterance.

use crate::error::{EngineError, Result};
use crate::session::Graph;
use crate::tensor::{Dtype, TensorValue};
use std::collections::HashMap;

/// Backbone inputs with this prefix are recurrent state slots.
pub const STATE_INPUT_PREFIX: &str = "state_";
/// Backbone outputs with this prefix carry the next step's state.
pub const STATE_OUTPUT_PREFIX: &str = "out_state_";

/// Fallback dims for rank-5 transformer KV caches when the graph omits
/// shape metadata. The 1000 is the export's max context length; it is a
/// constant of the model family, not something to shrink.
const FALLBACK_KV_DIMS: [usize; 5] = [2, 1, 1000, 16, 64];
/// Fallback dims for scalar marker slots (step counters and the like).
const FALLBACK_MARKER_DIMS: [usize; 1] = [1];
/// Fallback dims for slots whose element type the session host cannot
/// classify: a zero-element placeholder.
const FALLBACK_EMPTY_DIMS: [usize; 1] = [0];

/// Declared metadata for one state slot.
#[derive(Debug, Clone)]
pub struct SlotSpec {
    pub name: String,
    pub dtype: Dtype,
    pub dims: Vec<usize>,
}

/// State-slot layout discovered from the backbone session.
#[derive(Debug, Clone, Default)]
pub struct StateSpec {
    slots: Vec<SlotSpec>,
}

impl StateSpec {
    /// Enumerate the backbone's `state_*` inputs.
    ///
    /// Session-reported dtype and dims win; when dims are dynamic or absent
    /// the fallback table applies: i64 slots are scalar markers `[1]`,
    /// f32 slots are KV caches `[2, 1, 1000, 16, 64]`, and slots whose
    /// element type cannot be classified become zero-element `[0]`
    /// placeholders rather than a wrongly-shaped cache.
    pub fn discover(backbone: &Graph) -> Self {
        let mut slots = Vec::new();
        for name in backbone.input_names() {
            if !name.starts_with(STATE_INPUT_PREFIX) {
                continue;
            }
            let (dtype, dims) = match backbone.input_dtype(name) {
                Some(dtype) => {
                    let dims = backbone.input_dims(name).unwrap_or_else(|| match dtype {
                        Dtype::I64 => FALLBACK_MARKER_DIMS.to_vec(),
                        Dtype::F32 => FALLBACK_KV_DIMS.to_vec(),
                    });
                    (dtype, dims)
                }
                None => (Dtype::F32, FALLBACK_EMPTY_DIMS.to_vec()),
            };
            slots.push(SlotSpec {
                name: name.clone(),
                dtype,
                dims,
            });
        }
        log::debug!("discovered {} state slots", slots.len());
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Zero-initialized bundle for a fresh utterance.
    pub fn init_bundle(&self) -> StateBundle {
        let slots = self
            .slots
            .iter()
            .map(|spec| SlotState {
                name: spec.name.clone(),
                dtype: spec.dtype,
                value: TensorValue::zeros(spec.dtype, &spec.dims),
            })
            .collect();
        StateBundle { slots }
    }
}

#[derive(Debug, Clone)]
struct SlotState {
    name: String,
    dtype: Dtype,
    value: TensorValue,
}

/// The live recurrent state for one utterance.
///
/// Created zero-filled before voice conditioning, replaced slot-by-slot
/// after every backbone run, dropped when the utterance ends.
#[derive(Debug, Clone)]
pub struct StateBundle {
    slots: Vec<SlotState>,
}

impl StateBundle {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copy every slot into a backbone input map.
    pub fn fill_inputs(&self, inputs: &mut HashMap<String, TensorValue>) {
        for slot in &self.slots {
            inputs.insert(slot.name.clone(), slot.value.clone());
        }
    }

    /// Replace slots from a backbone run's `out_state_*` outputs.
    ///
    /// The output's dims become the next step's input dims; a dtype mismatch
    /// converts element-wise (f32 → i64 rounds, i64 → f32 widens). Outputs
    /// that name a slot the backbone never declared are a schema bug.
    pub fn absorb_outputs(&mut self, outputs: &HashMap<String, TensorValue>) -> Result<()> {
        for (name, value) in outputs {
            let Some(index) = name.strip_prefix(STATE_OUTPUT_PREFIX) else {
                continue;
            };
            let slot_name = format!("{STATE_INPUT_PREFIX}{index}");
            let slot = self
                .slots
                .iter_mut()
                .find(|slot| slot.name == slot_name)
                .ok_or_else(|| {
                    EngineError::session(
                        crate::session::BACKBONE,
                        format!("output '{name}' has no matching state input"),
                    )
                })?;
            slot.value = value.clone().coerced(slot.dtype);
        }
        Ok(())
    }

    /// Dtype of a slot, if present.
    pub fn slot_dtype(&self, name: &str) -> Option<Dtype> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.dtype)
    }

    /// Current value of a slot, if present.
    pub fn slot_value(&self, name: &str) -> Option<&TensorValue> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| &slot.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Graph, GraphSession};

    struct MetadataOnly {
        inputs: Vec<String>,
        outputs: Vec<String>,
    }

    impl GraphSession for MetadataOnly {
        fn label(&self) -> &'static str {
            "backbone"
        }

        fn input_names(&self) -> &[String] {
            &self.inputs
        }

        fn output_names(&self) -> &[String] {
            &self.outputs
        }

        fn input_dtype(&self, input: &str) -> Option<Dtype> {
            // state_3 reports no classifiable element type at all.
            match input {
                "state_0" => Some(Dtype::F32),
                "state_1" => Some(Dtype::I64),
                "state_2" => Some(Dtype::I64),
                _ => None,
            }
        }

        fn input_dims(&self, input: &str) -> Option<Vec<usize>> {
            // Only state_1 reports a concrete shape; the rest exercise the
            // fallback table.
            (input == "state_1").then(|| vec![2])
        }

        fn run(
            &self,
            _inputs: HashMap<String, TensorValue>,
        ) -> Result<HashMap<String, TensorValue>> {
            Ok(HashMap::new())
        }
    }

    fn backbone() -> Graph {
        Graph::new(Box::new(MetadataOnly {
            inputs: vec![
                "sequence".into(),
                "text_embeddings".into(),
                "state_0".into(),
                "state_1".into(),
                "state_2".into(),
                "state_3".into(),
            ],
            outputs: vec![],
        }))
    }

    #[test]
    fn discovery_enumerates_only_state_inputs() {
        let spec = StateSpec::discover(&backbone());
        assert_eq!(spec.len(), 4);
    }

    #[test]
    fn fallback_table_applies_when_dims_are_missing() {
        let spec = StateSpec::discover(&backbone());
        let bundle = spec.init_bundle();

        // f32 without dims -> KV cache fallback.
        let kv = bundle.slot_value("state_0").expect("state_0");
        assert_eq!(kv.dims(), &[2, 1, 1000, 16, 64]);
        assert_eq!(kv.dtype(), Dtype::F32);

        // Reported dims win over the fallback.
        let reported = bundle.slot_value("state_1").expect("state_1");
        assert_eq!(reported.dims(), &[2]);

        // i64 without dims -> scalar marker fallback.
        let marker = bundle.slot_value("state_2").expect("state_2");
        assert_eq!(marker.dims(), &[1]);
        assert_eq!(marker.dtype(), Dtype::I64);
    }

    #[test]
    fn unclassifiable_dtype_becomes_an_empty_slot() {
        let spec = StateSpec::discover(&backbone());
        let bundle = spec.init_bundle();

        // No classifiable element type: a zero-element placeholder, not a
        // fabricated KV cache.
        let empty = bundle.slot_value("state_3").expect("state_3");
        assert_eq!(empty.dims(), &[0]);
        assert_eq!(empty.len(), 0);
        assert!(empty.is_empty());
        assert_eq!(empty.dtype(), Dtype::F32);
    }

    #[test]
    fn init_bundle_is_zero_filled() {
        let spec = StateSpec::discover(&backbone());
        let bundle = spec.init_bundle();
        let marker = bundle.slot_value("state_2").expect("state_2");
        assert_eq!(marker.as_i64(), Some(&[0_i64][..]));
    }

    #[test]
    fn absorb_coerces_f32_output_into_i64_slot() {
        let spec = StateSpec::discover(&backbone());
        let mut bundle = spec.init_bundle();

        let mut outputs = HashMap::new();
        outputs.insert(
            "out_state_2".to_string(),
            TensorValue::from_f32(&[1], vec![3.7]),
        );
        bundle.absorb_outputs(&outputs).expect("absorb");

        let slot = bundle.slot_value("state_2").expect("state_2");
        assert_eq!(slot.dtype(), Dtype::I64);
        assert_eq!(slot.as_i64(), Some(&[4_i64][..]));
    }

    #[test]
    fn absorb_adopts_output_dims() {
        let spec = StateSpec::discover(&backbone());
        let mut bundle = spec.init_bundle();

        let mut outputs = HashMap::new();
        outputs.insert(
            "out_state_1".to_string(),
            TensorValue::from_i64(&[5], vec![1, 2, 3, 4, 5]),
        );
        bundle.absorb_outputs(&outputs).expect("absorb");
        assert_eq!(bundle.slot_value("state_1").expect("slot").dims(), &[5]);
    }

    #[test]
    fn absorb_rejects_unknown_state_output() {
        let spec = StateSpec::discover(&backbone());
        let mut bundle = spec.init_bundle();

        let mut outputs = HashMap::new();
        outputs.insert(
            "out_state_9".to_string(),
            TensorValue::from_f32(&[1], vec![0.0]),
        );
        let err = bundle.absorb_outputs(&outputs).unwrap_err();
        assert!(err.to_string().contains("out_state_9"));
    }

    #[test]
    fn non_state_outputs_are_ignored() {
        let spec = StateSpec::discover(&backbone());
        let mut bundle = spec.init_bundle();

        let mut outputs = HashMap::new();
        outputs.insert("conditioning".to_string(), TensorValue::scalar_f32(1.0));
        outputs.insert("eos_logit".to_string(), TensorValue::scalar_f32(-9.0));
        bundle.absorb_outputs(&outputs).expect("absorb");
        assert_eq!(bundle.len(), 4);
    }
}
