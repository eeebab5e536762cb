//! Configuration for Sonara

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SonaraConfig {
    /// Capacity of the backend source pool. Voices beyond this budget play
    /// virtually until a source frees up.
    pub max_sources: usize,
    /// Number of backend buffers in each streaming generator's ring.
    pub stream_buffer_count: usize,
    /// Frames decoded per streaming chunk.
    pub stream_chunk_frames: usize,
    /// Filesystem roots searched by the built-in file provider, first match
    /// wins.
    pub search_paths: Vec<PathBuf>,
    /// Treat absolute URI paths as relative to the search roots.
    pub absolute_paths_relative: bool,
    /// Scheme assumed for bare paths without one.
    pub default_scheme: String,
}

impl Default for SonaraConfig {
    fn default() -> Self {
        Self {
            max_sources: 256,
            stream_buffer_count: 4,
            stream_chunk_frames: 8192,
            search_paths: Vec::new(),
            absolute_paths_relative: true,
            default_scheme: "file".to_string(),
        }
    }
}

impl SonaraConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_sources(mut self, max: usize) -> Self {
        self.max_sources = max;
        self
    }

    pub fn stream_buffer_count(mut self, count: usize) -> Self {
        self.stream_buffer_count = count;
        self
    }

    pub fn stream_chunk_frames(mut self, frames: usize) -> Self {
        self.stream_chunk_frames = frames;
        self
    }

    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn absolute_paths_relative(mut self, relative: bool) -> Self {
        self.absolute_paths_relative = relative;
        self
    }

    pub fn default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.max_sources == 0 {
            return Err(crate::error::SonaraError::Configuration(
                "max_sources must be greater than 0".to_string(),
            ));
        }
        if self.stream_buffer_count < 2 {
            return Err(crate::error::SonaraError::Configuration(
                "stream_buffer_count must be at least 2".to_string(),
            ));
        }
        if self.stream_chunk_frames == 0 {
            return Err(crate::error::SonaraError::Configuration(
                "stream_chunk_frames must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
