//! Text conditioning for the backbone.
//!
//! Turns raw text into the token sequences the text-conditioner graph
//! embeds for the transformer.

pub mod text;
