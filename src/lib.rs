//! Sonara - Runtime Game Audio Engine
//!
//! A middleware-style layer over a spatialized audio driver: hierarchical
//! mix buses, prioritized voice management with virtualization against a
//! finite source pool, positional emitters, static and streaming PCM
//! generators, and URI-based resource resolution, all coordinated by a
//! single per-frame tick.
//!
//! # Architecture
//!
//! - **Audio thread**: the thread calling [`SonaraEngine::tick`] owns every
//!   mutable piece of engine state.
//! - **Any other thread**: talks through [`SonaraHandle`] (and the [`Bus`],
//!   [`Voice`], [`Emitter`] handles it produces); mutations are marshalled
//!   onto the audio thread, reads return last-committed values.

mod atomic;
pub mod backend;
mod bus;
mod config;
mod dispatch;
mod emitter;
mod engine;
mod error;
mod events;
pub mod generator;
mod listener;
mod math;
mod pool;
pub mod resolver;
mod voice;

pub use backend::{Backend, BackendCaps, MockBackend, PcmFormat, SampleEncoding, SourceState};
pub use bus::Bus;
pub use config::SonaraConfig;
pub use dispatch::Ticket;
pub use emitter::Emitter;
pub use engine::{SonaraEngine, SonaraHandle};
pub use error::{Result, SonaraError};
pub use events::SonaraEvent;
pub use generator::{Decoder, Generator, StreamStats, SymphoniaDecoder};
pub use math::{Orientation, Quat, Vec3};
pub use resolver::{FileProvider, Provider, ProviderContext, Resolver, Uri};
pub use voice::{MixMode, Voice, VoiceDesc, VoiceState};
