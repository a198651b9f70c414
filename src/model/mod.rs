//! Model-level orchestration.
//!
//! `tts` drives the backbone, flow refiner, and decoder graphs through the
//! conditioning phases and the autoregressive frame loop.

pub mod tts;
