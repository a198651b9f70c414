//! Graph-session hosting.
//!
//! The pipeline drives five ONNX graphs. Each is held behind the
//! [`GraphSession`] trait so the autoregressive driver and the tests can
//! treat a real ONNX Runtime session and a scripted stub identically. The
//! [`Graph`] wrapper enforces the run contract — every declared input
//! present exactly once, with the declared dtype and rank — before the
//! session ever sees the call.

use crate::error::{EngineError, Result};
use crate::tensor::{Dtype, TensorValue};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::{Tensor as OrtTensor, Value, ValueType};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Logical names of the five graphs, used in error reporting.
pub const VOICE_ENCODER: &str = "voice_encoder";
pub const TEXT_CONDITIONER: &str = "text_conditioner";
pub const BACKBONE: &str = "backbone";
pub const FLOW: &str = "flow";
pub const DECODER: &str = "decoder";

/// A loaded graph session.
///
/// Implementations must return exactly one tensor per declared output name
/// from [`GraphSession::run`].
pub trait GraphSession: Send + Sync {
    /// Logical session name for error reporting.
    fn label(&self) -> &'static str;
    fn input_names(&self) -> &[String];
    fn output_names(&self) -> &[String];
    /// Declared element type of an input, when the graph reports one.
    fn input_dtype(&self, input: &str) -> Option<Dtype>;
    /// Declared dims of an input; `None` when absent or dynamic.
    fn input_dims(&self, input: &str) -> Option<Vec<usize>>;
    fn run(&self, inputs: HashMap<String, TensorValue>) -> Result<HashMap<String, TensorValue>>;
}

/// Validating wrapper around a [`GraphSession`].
pub struct Graph {
    inner: Box<dyn GraphSession>,
}

impl Graph {
    pub fn new(inner: Box<dyn GraphSession>) -> Self {
        Self { inner }
    }

    pub fn label(&self) -> &'static str {
        self.inner.label()
    }

    pub fn input_names(&self) -> &[String] {
        self.inner.input_names()
    }

    pub fn output_names(&self) -> &[String] {
        self.inner.output_names()
    }

    pub fn input_dtype(&self, input: &str) -> Option<Dtype> {
        self.inner.input_dtype(input)
    }

    pub fn input_dims(&self, input: &str) -> Option<Vec<usize>> {
        self.inner.input_dims(input)
    }

    /// Run the graph after checking the input map against the session's
    /// declared schema. A missing input, an unexpected input, a dtype
    /// mismatch, or a rank mismatch is a programmer error and surfaces as
    /// [`EngineError::Session`].
    pub fn run(
        &self,
        inputs: HashMap<String, TensorValue>,
    ) -> Result<HashMap<String, TensorValue>> {
        let label = self.label();
        for name in self.inner.input_names() {
            let value = inputs.get(name).ok_or_else(|| {
                EngineError::session(label, format!("missing input '{name}'"))
            })?;
            if let Some(declared) = self.inner.input_dtype(name) {
                if declared != value.dtype() {
                    return Err(EngineError::session(
                        label,
                        format!(
                            "input '{name}' has dtype {}, session declares {declared}",
                            value.dtype()
                        ),
                    ));
                }
            }
            if let Some(declared_dims) = self.inner.input_dims(name) {
                if declared_dims.len() != value.dims().len() {
                    return Err(EngineError::session(
                        label,
                        format!(
                            "input '{name}' has rank {}, session declares rank {}",
                            value.dims().len(),
                            declared_dims.len()
                        ),
                    ));
                }
            }
        }
        if inputs.len() != self.inner.input_names().len() {
            let unexpected: Vec<&str> = inputs
                .keys()
                .filter(|k| !self.inner.input_names().contains(k))
                .map(String::as_str)
                .collect();
            return Err(EngineError::session(
                label,
                format!("unexpected inputs: {unexpected:?}"),
            ));
        }
        self.inner.run(inputs)
    }
}

struct InputMeta {
    name: String,
    dtype: Option<Dtype>,
    dims: Option<Vec<usize>>,
}

/// ONNX Runtime-backed [`GraphSession`].
pub struct OnnxGraph {
    label: &'static str,
    session: Mutex<Session>,
    inputs: Vec<InputMeta>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxGraph {
    /// Load a graph from disk and extract its input/output metadata.
    pub fn open(label: &'static str, model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(EngineError::model_load(
                label,
                format!("model file not found: {}", model_path.display()),
            ));
        }

        // Environment init is a process-wide singleton; repeat calls are cheap.
        let _ = ort::init().commit();

        let session = SessionBuilder::new()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.with_intra_threads(4))
            .and_then(|builder| builder.commit_from_file(model_path))
            .map_err(|e| EngineError::model_load(label, e))?;

        let mut inputs = Vec::with_capacity(session.inputs.len());
        for input in &session.inputs {
            let (dtype, dims) = match &input.input_type {
                ValueType::Tensor { ty, shape, .. } => {
                    (element_dtype(ty), concrete_dims(shape.iter().copied()))
                }
                _ => (None, None),
            };
            inputs.push(InputMeta {
                name: input.name.clone(),
                dtype,
                dims,
            });
        }
        let input_names: Vec<String> = inputs.iter().map(|meta| meta.name.clone()).collect();
        let output_names: Vec<String> =
            session.outputs.iter().map(|output| output.name.clone()).collect();

        log::debug!(
            "{label}: {} inputs, {} outputs",
            input_names.len(),
            output_names.len()
        );

        Ok(Self {
            label,
            session: Mutex::new(session),
            inputs,
            input_names,
            output_names,
        })
    }
}

impl GraphSession for OnnxGraph {
    fn label(&self) -> &'static str {
        self.label
    }

    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    fn input_dtype(&self, input: &str) -> Option<Dtype> {
        self.inputs
            .iter()
            .find(|meta| meta.name == input)
            .and_then(|meta| meta.dtype)
    }

    fn input_dims(&self, input: &str) -> Option<Vec<usize>> {
        self.inputs
            .iter()
            .find(|meta| meta.name == input)
            .and_then(|meta| meta.dims.clone())
    }

    fn run(&self, inputs: HashMap<String, TensorValue>) -> Result<HashMap<String, TensorValue>> {
        let mut pairs: Vec<(Cow<'static, str>, SessionInputValue<'static>)> =
            Vec::with_capacity(inputs.len());
        for (name, value) in inputs {
            let tensor = to_ort_value(&value).map_err(|e| EngineError::session(self.label, e))?;
            pairs.push((Cow::Owned(name), SessionInputValue::Owned(tensor)));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| EngineError::session(self.label, "session mutex poisoned"))?;
        let outputs = session
            .run(SessionInputs::from(pairs))
            .map_err(|e| EngineError::session(self.label, e))?;

        let mut result = HashMap::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = &outputs[name.as_str()];
            let extracted = if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
                let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
                TensorValue::from_f32(&dims, data.to_vec())
            } else if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
                let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
                TensorValue::from_i64(&dims, data.to_vec())
            } else {
                return Err(EngineError::session(
                    self.label,
                    format!("output '{name}' is neither f32 nor i64"),
                ));
            };
            result.insert(name.clone(), extracted);
        }
        Ok(result)
    }
}

fn element_dtype(ty: &ort::tensor::TensorElementType) -> Option<Dtype> {
    use ort::tensor::TensorElementType;
    match ty {
        TensorElementType::Float32 => Some(Dtype::F32),
        TensorElementType::Int64 => Some(Dtype::I64),
        _ => None,
    }
}

/// Collapse a reported shape to concrete dims; any dynamic (negative)
/// dimension makes the whole shape unavailable so the fallback table applies.
fn concrete_dims(dims: impl Iterator<Item = i64>) -> Option<Vec<usize>> {
    let mut out = Vec::new();
    for dim in dims {
        if dim < 0 {
            return None;
        }
        out.push(dim as usize);
    }
    Some(out)
}

fn to_ort_value(value: &TensorValue) -> std::result::Result<Value, ort::Error> {
    match value {
        TensorValue::F32(array) => {
            let data: Vec<f32> = array.iter().copied().collect();
            Ok(OrtTensor::from_array((array.shape().to_vec(), data))?.into())
        }
        TensorValue::I64(array) => {
            let data: Vec<i64> = array.iter().copied().collect();
            Ok(OrtTensor::from_array((array.shape().to_vec(), data))?.into())
        }
    }
}

/// The five graph sessions the engine drives.
pub struct SessionHost {
    pub voice_encoder: Graph,
    pub text_conditioner: Graph,
    pub backbone: Graph,
    pub flow: Graph,
    pub decoder: Graph,
}

impl SessionHost {
    /// Open all five graphs from a models directory.
    pub fn open(models_dir: &Path) -> Result<Self> {
        Ok(Self {
            voice_encoder: Graph::new(Box::new(OnnxGraph::open(
                VOICE_ENCODER,
                &models_dir.join(crate::assets::VOICE_ENCODER_FILE),
            )?)),
            text_conditioner: Graph::new(Box::new(OnnxGraph::open(
                TEXT_CONDITIONER,
                &models_dir.join(crate::assets::TEXT_CONDITIONER_FILE),
            )?)),
            backbone: Graph::new(Box::new(OnnxGraph::open(
                BACKBONE,
                &models_dir.join(crate::assets::BACKBONE_FILE),
            )?)),
            flow: Graph::new(Box::new(OnnxGraph::open(
                FLOW,
                &models_dir.join(crate::assets::FLOW_FILE),
            )?)),
            decoder: Graph::new(Box::new(OnnxGraph::open(
                DECODER,
                &models_dir.join(crate::assets::DECODER_FILE),
            )?)),
        })
    }

    /// Assemble a host from pre-built sessions (stub graphs in tests).
    pub fn from_graphs(
        voice_encoder: Box<dyn GraphSession>,
        text_conditioner: Box<dyn GraphSession>,
        backbone: Box<dyn GraphSession>,
        flow: Box<dyn GraphSession>,
        decoder: Box<dyn GraphSession>,
    ) -> Self {
        Self {
            voice_encoder: Graph::new(voice_encoder),
            text_conditioner: Graph::new(text_conditioner),
            backbone: Graph::new(backbone),
            flow: Graph::new(flow),
            decoder: Graph::new(decoder),
        }
    }
}
