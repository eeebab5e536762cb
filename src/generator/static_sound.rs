//! Static generator: one immutable, lazily uploaded backend buffer.

use std::sync::Mutex;

use crate::backend::{Backend, BufferHandle, PcmFormat};
use crate::error::Result;

pub(crate) struct StaticSound {
    state: Mutex<StaticState>,
}

struct StaticState {
    /// Decoded PCM held until the first upload on the audio thread.
    pcm: Option<Vec<f32>>,
    buffer: Option<BufferHandle>,
}

impl StaticSound {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                pcm: Some(samples),
                buffer: None,
            }),
        }
    }

    /// Create and upload the backend buffer if it does not exist yet.
    /// Audio thread only.
    pub fn ensure_buffer(
        &self,
        backend: &mut dyn Backend,
        format: &PcmFormat,
    ) -> Result<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        if let Some(buffer) = state.buffer {
            return Ok(buffer);
        }
        let buffer = backend.create_buffer()?;
        let pcm = state.pcm.take().unwrap_or_default();
        if let Err(e) = backend.upload(buffer, format, &pcm) {
            state.pcm = Some(pcm);
            backend.destroy_buffer(buffer);
            return Err(e);
        }
        state.buffer = Some(buffer);
        Ok(buffer)
    }

    /// Remove and return the buffer handle for destruction.
    pub fn take_buffer(&self) -> Option<BufferHandle> {
        self.state.lock().unwrap().buffer.take()
    }
}
