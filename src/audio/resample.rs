//! Sample-rate conversion by linear interpolation.
//!
//! Reference audio only feeds the voice encoder, so a two-tap interpolator
//! is enough; the output length contract is `round(len * to / from)`.

/// Resample `input` from `from_rate` to `to_rate`.
///
/// Equal rates and empty input are identity cases. Positions past the last
/// input sample clamp to it.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let out_len = ((input.len() as f64) * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = input.len() - 1;

    let mut output = Vec::with_capacity(out_len);
    for idx in 0..out_len {
        let position = idx as f64 * step;
        let lo = (position.floor() as usize).min(last);
        let hi = (lo + 1).min(last);
        let frac = (position - position.floor()) as f32;
        output.push(input[lo] * (1.0 - frac) + input[hi] * frac);
    }
    output
}
