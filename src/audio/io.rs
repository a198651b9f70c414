//! WAV reading and writing.
//!
//! Reference audio arrives at arbitrary channel counts and bit depths;
//! decoding reduces it to mono f32 in `[-1, 1)` by taking channel 0.
//! Output is always 16-bit PCM mono at the engine sample rate, either on
//! disk or as a self-contained in-memory RIFF payload per streamed chunk.

use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::path::Path;

#[derive(Debug, Default)]
pub struct WavIo;

impl WavIo {
    /// Decode a WAV file to mono f32 samples plus its sample rate.
    ///
    /// Integer PCM (8/16/24/32-bit) is normalized by `2^(bits-1)`; float WAV
    /// passes through. Multi-channel files contribute channel 0 only.
    pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
        let mut reader = WavReader::open(path)?;
        Self::decode_mono(&mut reader)
    }

    /// Decode an in-memory WAV payload to mono f32 samples.
    pub fn decode_wav_bytes(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
        let mut reader = WavReader::new(Cursor::new(bytes))?;
        Self::decode_mono(&mut reader)
    }

    fn decode_mono<R: std::io::Read>(reader: &mut WavReader<R>) -> Result<(Vec<f32>, u32)> {
        let spec = reader.spec();
        let channels = spec.channels as usize;
        if channels == 0 {
            anyhow::bail!("WAV declares zero channels");
        }
        let sample_rate = spec.sample_rate;
        let mut samples = Vec::new();

        match spec.sample_format {
            SampleFormat::Float => {
                for (idx, sample) in reader.samples::<f32>().enumerate() {
                    let value = sample?;
                    if idx % channels == 0 {
                        samples.push(value);
                    }
                }
            }
            SampleFormat::Int => {
                let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                for (idx, sample) in reader.samples::<i32>().enumerate() {
                    let value = sample? as f32 / max;
                    if idx % channels == 0 {
                        samples.push(value);
                    }
                }
            }
        }

        Ok((samples, sample_rate))
    }

    /// Write mono samples to a 16-bit PCM WAV file.
    pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
        let mut writer = WavWriter::create(path, Self::output_spec(sample_rate))?;
        for &sample in samples {
            writer.write_sample(quantize(sample))?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Encode mono samples as a complete in-memory WAV payload
    /// (44-byte RIFF header plus one `data` chunk).
    pub fn encode_wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, Self::output_spec(sample_rate))?;
            for &sample in samples {
                writer.write_sample(quantize(sample))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    fn output_spec(sample_rate: u32) -> WavSpec {
        WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }
}

/// Clip to `[-1, 1]` and scale asymmetrically so both rails are reachable.
fn quantize(sample: f32) -> i16 {
    let value = sample.clamp(-1.0, 1.0);
    let scaled = if value < 0.0 {
        value * 32768.0
    } else {
        value * 32767.0
    };
    scaled.round() as i16
}
