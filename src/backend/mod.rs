//! Capability surface over the spatialized audio driver.
//!
//! The engine talks to the driver exclusively through the [`Backend`] trait:
//! sources and buffers are opaque handles, parameters are written through
//! small enums, and optional driver features are reported by
//! [`BackendCaps`]. Concrete OpenAL-family bindings live outside this crate;
//! [`MockBackend`] is the in-tree implementation used for tests and headless
//! runs.

mod mock;

pub use mock::MockBackend;

use crate::error::Result;
use crate::math::Vec3;

/// Opaque handle to a driver playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

/// Opaque handle to a driver PCM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Driver-side playback state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Interleaved integer PCM.
    Int,
    /// Interleaved IEEE float PCM.
    Float,
}

/// PCM format descriptor for generators and buffer uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    pub fn float(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            bits_per_sample: 32,
            encoding: SampleEncoding::Float,
        }
    }

    /// Duration in seconds of `frames` frames at this format's rate.
    pub fn frames_to_seconds(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

/// Scalar float source parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceParamF {
    Gain,
    Pitch,
    RolloffFactor,
    ReferenceDistance,
    MaxDistance,
}

/// Boolean source parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceParamB {
    Looping,
    RelativeToListener,
    /// Driver-side spatialization toggle, present when
    /// [`BackendCaps::spatialization`] is set.
    Spatialize,
    /// Direct-channel remix, bypassing the spatializer entirely.
    DirectChannels,
}

/// 3-vector source parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceParamV {
    Position,
    Velocity,
}

/// World-space listener frame, committed once per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerFrame {
    pub position: Vec3,
    pub velocity: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
}

impl Default for ListenerFrame {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            forward: -Vec3::Z,
            up: Vec3::Y,
        }
    }
}

/// Optional driver extensions probed at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCaps {
    pub spatialization: bool,
    pub direct_channels: bool,
    pub hrtf: bool,
}

/// Minimum driver capability set the engine expects.
///
/// All methods are invoked from the audio thread only. Buffer uploads carry
/// interleaved `f32` samples; `format` describes their channel count and
/// rate. `queued_count` reports buffers queued and not yet processed, and
/// `unqueue_processed` removes and returns every processed buffer.
pub trait Backend: Send {
    fn device_name(&self) -> String;
    fn enumerate_devices(&self) -> Vec<String>;
    fn reset_device(&mut self, device: Option<&str>) -> Result<()>;
    fn capabilities(&self) -> BackendCaps;

    fn create_sources(&mut self, count: usize) -> Result<Vec<SourceHandle>>;
    fn destroy_sources(&mut self, sources: &[SourceHandle]);
    fn create_buffer(&mut self) -> Result<BufferHandle>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn upload(&mut self, buffer: BufferHandle, format: &PcmFormat, data: &[f32]) -> Result<()>;

    fn set_source_f32(&mut self, source: SourceHandle, param: SourceParamF, value: f32)
        -> Result<()>;
    fn set_source_bool(&mut self, source: SourceHandle, param: SourceParamB, value: bool)
        -> Result<()>;
    fn set_source_vec3(&mut self, source: SourceHandle, param: SourceParamV, value: Vec3)
        -> Result<()>;
    /// Read back a scalar parameter; the driver default when never written.
    fn get_source_f32(&mut self, source: SourceHandle, param: SourceParamF) -> Result<f32>;

    /// Attach (or clear, with `None`) the single static buffer of a source.
    fn attach_buffer(&mut self, source: SourceHandle, buffer: Option<BufferHandle>) -> Result<()>;
    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<()>;
    fn unqueue_processed(&mut self, source: SourceHandle) -> Result<Vec<BufferHandle>>;
    fn queued_count(&mut self, source: SourceHandle) -> Result<usize>;

    fn play(&mut self, source: SourceHandle) -> Result<()>;
    fn pause(&mut self, source: SourceHandle) -> Result<()>;
    fn stop(&mut self, source: SourceHandle) -> Result<()>;
    fn rewind(&mut self, source: SourceHandle) -> Result<()>;
    fn source_state(&mut self, source: SourceHandle) -> Result<SourceState>;
    /// Playhead within the currently attached/queued material, in seconds.
    fn playhead(&mut self, source: SourceHandle) -> Result<f64>;
    fn seek(&mut self, source: SourceHandle, seconds: f64) -> Result<()>;

    fn set_listener(&mut self, frame: &ListenerFrame) -> Result<()>;
}
