//! Flow-matching refinement of latent audio frames.
//!
//! Each autoregressive step samples a Gaussian latent and integrates the
//! learned velocity field with a fixed number of Euler steps. The `(s, t)`
//! schedule for every step count is precomputed once at load.

use crate::config::LATENT_DIM;
use crate::error::{EngineError, Result};
use crate::session::Graph;
use crate::tensor::TensorValue;
use rand::Rng;
use std::collections::HashMap;

/// Flow-graph input carrying the backbone conditioning vector.
pub const INPUT_CONDITIONING: &str = "conditioning";
/// Flow-graph inputs carrying the integration interval `[s, t]`.
pub const INPUT_S: &str = "s";
pub const INPUT_T: &str = "t";
/// Flow-graph input carrying the current latent estimate.
pub const INPUT_X: &str = "x";
/// Flow-graph output carrying the velocity field.
pub const OUTPUT_FLOW_DIR: &str = "flow_dir";

/// Precomputed `(s, t)` pairs for every Euler step count in `1..=l_max`.
///
/// For a step count `L`, pair `j` is `(j/L, j/L + 1/L)` as scalar `[1, 1]`
/// tensors, ready to feed the flow graph.
#[derive(Debug, Clone)]
pub struct FlowSchedule {
    table: Vec<Vec<(TensorValue, TensorValue)>>,
}

impl FlowSchedule {
    pub fn build(l_max: usize) -> Self {
        let mut table = Vec::with_capacity(l_max);
        for steps in 1..=l_max {
            let mut pairs = Vec::with_capacity(steps);
            for j in 0..steps {
                let s = j as f32 / steps as f32;
                let t = s + 1.0 / steps as f32;
                pairs.push((TensorValue::scalar_f32(s), TensorValue::scalar_f32(t)));
            }
            table.push(pairs);
        }
        Self { table }
    }

    pub fn max_steps(&self) -> usize {
        self.table.len()
    }

    fn pairs(&self, steps: usize) -> Option<&[(TensorValue, TensorValue)]> {
        if steps == 0 || steps > self.table.len() {
            return None;
        }
        Some(&self.table[steps - 1])
    }
}

/// Draw a latent from `N(0, temperature * I)` by Box–Muller.
///
/// One normal per `(u, v)` uniform pair, guarding against `u = 0`.
pub fn sample_gaussian_latent(rng: &mut impl Rng, dim: usize, temperature: f32) -> Vec<f32> {
    let std = f64::from(temperature).sqrt();
    let mut latent = Vec::with_capacity(dim);
    for _ in 0..dim {
        let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let v: f64 = rng.gen();
        let normal = (-2.0 * u.ln()).sqrt() * (2.0 * std::f64::consts::PI * v).cos();
        latent.push((normal * std) as f32);
    }
    latent
}

/// Refine a sampled latent with `steps` Euler integrations of the flow
/// graph's velocity field. Returns the final `LATENT_DIM`-element latent.
pub fn refine(
    flow: &Graph,
    schedule: &FlowSchedule,
    conditioning: &TensorValue,
    steps: usize,
    temperature: f32,
    rng: &mut impl Rng,
) -> Result<Vec<f32>> {
    let pairs = schedule.pairs(steps).ok_or_else(|| {
        EngineError::session(
            flow.label(),
            format!("{steps} flow steps outside schedule 1..={}", schedule.max_steps()),
        )
    })?;

    let mut latent = sample_gaussian_latent(rng, LATENT_DIM, temperature);
    let scale = 1.0 / steps as f32;

    for (s, t) in pairs {
        let mut inputs = HashMap::with_capacity(4);
        inputs.insert(INPUT_CONDITIONING.to_string(), conditioning.clone());
        inputs.insert(INPUT_S.to_string(), s.clone());
        inputs.insert(INPUT_T.to_string(), t.clone());
        inputs.insert(
            INPUT_X.to_string(),
            TensorValue::from_f32(&[1, LATENT_DIM], latent.clone()),
        );

        let outputs = flow.run(inputs)?;
        let velocity = outputs
            .get(OUTPUT_FLOW_DIR)
            .or_else(|| flow.output_names().first().and_then(|name| outputs.get(name)))
            .ok_or_else(|| EngineError::session(flow.label(), "flow graph produced no output"))?;
        let velocity = velocity.as_f32().ok_or_else(|| {
            EngineError::session(flow.label(), "flow_dir output is not a contiguous f32 tensor")
        })?;
        if velocity.len() != LATENT_DIM {
            return Err(EngineError::session(
                flow.label(),
                format!("flow_dir has {} elements, expected {LATENT_DIM}", velocity.len()),
            ));
        }

        for (value, delta) in latent.iter_mut().zip(velocity) {
            *value += delta * scale;
        }
    }

    Ok(latent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GraphSession;
    use crate::tensor::Dtype;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn schedule_covers_the_unit_interval() {
        let schedule = FlowSchedule::build(10);
        assert_eq!(schedule.max_steps(), 10);

        for steps in 1..=10 {
            let pairs = schedule.pairs(steps).expect("pairs");
            assert_eq!(pairs.len(), steps);
            for (j, (s, t)) in pairs.iter().enumerate() {
                let s = s.first_f32().expect("s");
                let t = t.first_f32().expect("t");
                assert!((s - j as f32 / steps as f32).abs() < 1e-6);
                assert!((t - s - 1.0 / steps as f32).abs() < 1e-6);
                assert_eq!(pairs[j].0.dims(), &[1, 1]);
            }
            let (_, last_t) = &pairs[steps - 1];
            assert!((last_t.first_f32().expect("t") - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn schedule_rejects_out_of_range_steps() {
        let schedule = FlowSchedule::build(4);
        assert!(schedule.pairs(0).is_none());
        assert!(schedule.pairs(5).is_none());
    }

    #[test]
    fn sampled_latent_matches_temperature() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples = sample_gaussian_latent(&mut rng, 20_000, 0.7);
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.02, "mean {mean} too far from 0");
        assert!((var - 0.7).abs() < 0.05, "variance {var} too far from 0.7");
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let a = sample_gaussian_latent(&mut StdRng::seed_from_u64(99), 32, 0.7);
        let b = sample_gaussian_latent(&mut StdRng::seed_from_u64(99), 32, 0.7);
        assert_eq!(a, b);
    }

    /// Flow stub returning a constant velocity field.
    struct ConstantFlow {
        inputs: Vec<String>,
        outputs: Vec<String>,
        velocity: f32,
    }

    impl ConstantFlow {
        fn graph(velocity: f32) -> Graph {
            Graph::new(Box::new(Self {
                inputs: vec![
                    INPUT_CONDITIONING.to_string(),
                    INPUT_S.to_string(),
                    INPUT_T.to_string(),
                    INPUT_X.to_string(),
                ],
                outputs: vec![OUTPUT_FLOW_DIR.to_string()],
                velocity,
            }))
        }
    }

    impl GraphSession for ConstantFlow {
        fn label(&self) -> &'static str {
            "flow"
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
            let mut outputs = HashMap::new();
            outputs.insert(
                OUTPUT_FLOW_DIR.to_string(),
                TensorValue::from_f32(&[1, LATENT_DIM], vec![self.velocity; LATENT_DIM]),
            );
            Ok(outputs)
        }
    }

    #[test]
    fn euler_integration_accumulates_one_full_velocity_unit() {
        // With a constant velocity field the integral over [0, 1] equals the
        // velocity itself, independent of the step count.
        let schedule = FlowSchedule::build(10);
        let conditioning = TensorValue::from_f32(&[1, 4], vec![0.0; 4]);
        let flow = ConstantFlow::graph(2.0);

        for steps in [1, 4, 10] {
            let mut rng = StdRng::seed_from_u64(3);
            let baseline = sample_gaussian_latent(&mut StdRng::seed_from_u64(3), LATENT_DIM, 0.0);
            let refined =
                refine(&flow, &schedule, &conditioning, steps, 0.0, &mut rng).expect("refine");
            assert_eq!(refined.len(), LATENT_DIM);
            for (out, start) in refined.iter().zip(&baseline) {
                assert!((out - start - 2.0).abs() < 1e-5);
            }
        }
    }
}
