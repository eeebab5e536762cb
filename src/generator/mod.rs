//! PCM generators.
//!
//! A [`Generator`] produces the PCM a voice plays: either a static sound
//! (one whole decoded buffer, shareable between voices) or a streaming
//! sound (a ring of buffers refilled by a background decoder, exclusive to
//! one voice). The two variants are a closed enum; voice hydration and the
//! streaming pump match on it explicitly.
//!
//! Generators are reference counted and shared between attached voices and
//! provider caches; backend buffers are created and destroyed on the audio
//! thread via deferred jobs, and freed when the last reference drops.

mod decoder;
mod static_sound;
mod streaming;
mod symphonia_decoder;

pub use decoder::Decoder;
pub use symphonia_decoder::SymphoniaDecoder;

pub(crate) use decoder::decode_all;
pub(crate) use static_sound::StaticSound;
pub(crate) use streaming::StreamingSound;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::PcmFormat;
use crate::dispatch::JobSender;
use crate::error::{Result, SonaraError};

pub(crate) enum GeneratorKind {
    Static(StaticSound),
    Streaming(StreamingSound),
}

pub(crate) struct GeneratorInner {
    pub format: PcmFormat,
    pub duration: Option<f64>,
    pub exclusive: bool,
    pub kind: GeneratorKind,
    attached: AtomicUsize,
    jobs: JobSender,
}

impl Drop for GeneratorInner {
    fn drop(&mut self) {
        match &self.kind {
            GeneratorKind::Static(sound) => {
                if let Some(buffer) = sound.take_buffer() {
                    self.jobs.post(move |core| {
                        core.backend.destroy_buffer(buffer);
                        Ok(())
                    });
                }
            }
            GeneratorKind::Streaming(sound) => {
                sound.shutdown();
                sound.post_destroy(&self.jobs);
            }
        }
    }
}

/// Snapshot of a streaming generator's ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub free: usize,
    pub filled: usize,
    /// Buffers being decoded or awaiting upload on the audio thread.
    pub in_flight: usize,
    pub buffer_count: usize,
    pub end_of_stream: bool,
}

/// Reference-counted handle to a PCM generator.
#[derive(Clone)]
pub struct Generator {
    pub(crate) inner: Arc<GeneratorInner>,
}

impl Generator {
    /// Build a static generator from decoded interleaved samples. The
    /// backend buffer is uploaded by a deferred job on the audio thread.
    pub(crate) fn new_static(jobs: &JobSender, format: PcmFormat, samples: Vec<f32>) -> Generator {
        let frames = samples.len() / format.channels.max(1) as usize;
        let generator = Generator {
            inner: Arc::new(GeneratorInner {
                format,
                duration: Some(format.frames_to_seconds(frames)),
                exclusive: false,
                kind: GeneratorKind::Static(StaticSound::new(samples)),
                attached: AtomicUsize::new(0),
                jobs: jobs.clone(),
            }),
        };
        let early = generator.clone();
        jobs.post(move |core| {
            if let GeneratorKind::Static(sound) = &early.inner.kind {
                sound.ensure_buffer(core.backend.as_mut(), &early.inner.format)?;
            }
            Ok(())
        });
        generator
    }

    /// Build a streaming generator around a decoder.
    pub(crate) fn new_streaming(
        jobs: &JobSender,
        decoder: Box<dyn Decoder>,
        buffer_count: usize,
        chunk_frames: usize,
    ) -> Generator {
        let format = decoder.format();
        let duration = decoder.duration();
        Generator {
            inner: Arc::new(GeneratorInner {
                format,
                duration,
                exclusive: true,
                kind: GeneratorKind::Streaming(StreamingSound::spawn(
                    jobs,
                    decoder,
                    buffer_count,
                    chunk_frames,
                )),
                attached: AtomicUsize::new(0),
                jobs: jobs.clone(),
            }),
        }
    }

    pub fn format(&self) -> &PcmFormat {
        &self.inner.format
    }

    /// Duration in seconds; `None` when the material length is unknown.
    pub fn duration(&self) -> Option<f64> {
        self.inner.duration
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.inner.kind, GeneratorKind::Streaming(_))
    }

    /// Buffering state of a streaming generator; `None` for static ones.
    pub fn stream_stats(&self) -> Option<StreamStats> {
        let GeneratorKind::Streaming(stream) = &self.inner.kind else {
            return None;
        };
        let (free, filled, in_flight) = stream.counts();
        Some(StreamStats {
            free,
            filled,
            in_flight,
            buffer_count: stream.buffer_count(),
            end_of_stream: stream.end_of_stream(),
        })
    }

    /// Exclusive generators (streamers) cannot be shared between voices.
    pub fn is_exclusive(&self) -> bool {
        self.inner.exclusive
    }

    pub(crate) fn kind(&self) -> &GeneratorKind {
        &self.inner.kind
    }

    /// Register a voice attachment, enforcing exclusivity.
    pub(crate) fn attach(&self) -> Result<()> {
        if self.inner.exclusive {
            self.inner
                .attached
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| SonaraError::GeneratorBusy)?;
        } else {
            self.inner.attached.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub(crate) fn detach(&self) {
        self.inner.attached.fetch_sub(1, Ordering::AcqRel);
    }
}
