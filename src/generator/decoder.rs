//! Decoder capability consumed by generators.

use crate::backend::PcmFormat;
use crate::error::Result;

/// A PCM decoder over some encoded media.
///
/// Decoders produce interleaved `f32` frames into a caller-provided buffer;
/// a return of 0 frames signals end of stream. Seeking is optional and
/// reported by [`Decoder::can_seek`].
pub trait Decoder: Send {
    fn format(&self) -> PcmFormat;
    /// Total duration in seconds, when the container reports one.
    fn duration(&self) -> Option<f64>;
    fn can_seek(&self) -> bool;
    /// Decode up to `out.len() / channels` frames; returns frames produced.
    fn decode(&mut self, out: &mut [f32]) -> Result<usize>;
    fn seek(&mut self, seconds: f64) -> Result<()>;
}

/// Run a decoder to exhaustion, collecting every interleaved sample.
pub(crate) fn decode_all(decoder: &mut dyn Decoder) -> Result<Vec<f32>> {
    let channels = decoder.format().channels.max(1) as usize;
    let mut chunk = vec![0.0f32; 8192 * channels];
    let mut samples = Vec::new();
    loop {
        let frames = decoder.decode(&mut chunk)?;
        if frames == 0 {
            break;
        }
        samples.extend_from_slice(&chunk[..frames * channels]);
    }
    Ok(samples)
}
