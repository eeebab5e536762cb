//! Voices: playable instances of a generator.
//!
//! A voice is **physical** while it holds a backend source and **virtual**
//! otherwise; virtual voices keep advancing a logical playback clock so
//! they resume in the right place when the scheduler promotes them.
//! Parameter changes set dirty bits that the per-tick update commits to the
//! backend, writing only what changed; hydration (renting a source) forces
//! a full commit.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::atomic::{AtomicF32, AtomicF64};
use crate::backend::{SourceParamB, SourceParamF, SourceParamV, SourceState};
use crate::bus::Bus;
use crate::dispatch::JobSender;
use crate::engine::EngineCore;
use crate::error::Result;
use crate::events::SonaraEvent;
use crate::generator::{Generator, GeneratorKind, StreamingSound};
use crate::math::Vec3;

/// Committed scalar writes within this distance of the last applied value
/// are skipped.
const SCALAR_EPSILON: f32 = 1e-3;

const MIN_PITCH: f32 = 1e-3;

/// How a voice is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMode {
    /// No spatialization; direct-channel remix.
    Direct,
    /// Coordinates are interpreted relative to the listener.
    Relative,
    /// World-space 3D.
    #[default]
    Spatialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Stopped,
    PlayingPhysical,
    PausedPhysical,
    PlayingVirtual,
    PausedVirtual,
    Disposed,
}

impl VoiceState {
    pub fn is_physical(self) -> bool {
        matches!(self, Self::PlayingPhysical | Self::PausedPhysical)
    }

    pub fn is_virtual(self) -> bool {
        matches!(self, Self::PlayingVirtual | Self::PausedVirtual)
    }

    pub fn is_playing(self) -> bool {
        matches!(self, Self::PlayingPhysical | Self::PlayingVirtual)
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::PlayingPhysical => 1,
            Self::PausedPhysical => 2,
            Self::PlayingVirtual => 3,
            Self::PausedVirtual => 4,
            Self::Disposed => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::PlayingPhysical,
            2 => Self::PausedPhysical,
            3 => Self::PlayingVirtual,
            4 => Self::PausedVirtual,
            5 => Self::Disposed,
            _ => Self::Stopped,
        }
    }
}

/// Per-voice dirty bitset; each bit is a parameter category that needs to
/// be re-committed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DirtyFlags(u16);

impl DirtyFlags {
    pub const GAIN: DirtyFlags = DirtyFlags(1 << 0);
    pub const PITCH: DirtyFlags = DirtyFlags(1 << 1);
    pub const TRANSFORM: DirtyFlags = DirtyFlags(1 << 2);
    pub const LOOPING: DirtyFlags = DirtyFlags(1 << 3);
    pub const MIX_MODE: DirtyFlags = DirtyFlags(1 << 4);
    pub const ATTENUATION: DirtyFlags = DirtyFlags(1 << 5);
    pub const PRIORITY: DirtyFlags = DirtyFlags(1 << 6);

    pub fn empty() -> DirtyFlags {
        DirtyFlags(0)
    }

    pub fn all() -> DirtyFlags {
        DirtyFlags(0x7f)
    }

    pub fn insert(&mut self, other: DirtyFlags) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: DirtyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DirtyFlags {
    type Output = DirtyFlags;

    fn bitor(self, rhs: DirtyFlags) -> DirtyFlags {
        DirtyFlags(self.0 | rhs.0)
    }
}

/// Initial parameters for a voice.
#[derive(Clone)]
pub struct VoiceDesc {
    /// Target bus; defaults to the emitter's bus override, then Master.
    pub bus: Option<Bus>,
    pub gain: f32,
    pub pitch: f32,
    pub looping: bool,
    pub position: Vec3,
    pub velocity: Vec3,
    pub priority: i32,
    pub mix_mode: MixMode,
    pub rolloff: f32,
    pub reference_distance: f32,
    /// 0 leaves the backend default in place.
    pub max_distance: f32,
}

impl VoiceDesc {
    pub fn new() -> Self {
        Self {
            bus: None,
            gain: 1.0,
            pitch: 1.0,
            looping: false,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            priority: 0,
            mix_mode: MixMode::Spatialized,
            rolloff: 1.0,
            reference_distance: 1.0,
            max_distance: 0.0,
        }
    }
}

impl Default for VoiceDesc {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VoiceParams {
    pub gain: f32,
    pub pitch: f32,
    pub looping: bool,
    pub position: Vec3,
    pub velocity: Vec3,
    pub priority: i32,
    pub mix_mode: MixMode,
    pub rolloff: f32,
    pub reference_distance: f32,
    pub max_distance: f32,
}

impl VoiceParams {
    fn from_desc(desc: &VoiceDesc) -> Self {
        Self {
            gain: desc.gain.max(0.0),
            pitch: desc.pitch.max(MIN_PITCH),
            looping: desc.looping,
            position: desc.position,
            velocity: desc.velocity,
            priority: desc.priority,
            mix_mode: desc.mix_mode,
            rolloff: desc.rolloff.max(0.0),
            reference_distance: desc.reference_distance.max(0.0),
            max_distance: desc.max_distance.max(0.0),
        }
    }
}

/// Cross-thread mirror of a voice's committed values.
pub(crate) struct VoiceShared {
    state: AtomicU8,
    time: AtomicF64,
    gain: AtomicF32,
    pitch: AtomicF32,
    looping: AtomicBool,
    priority: AtomicI32,
    effective_priority: AtomicI32,
}

impl VoiceShared {
    fn new(params: &VoiceParams) -> Self {
        Self {
            state: AtomicU8::new(VoiceState::Stopped.to_u8()),
            time: AtomicF64::new(0.0),
            gain: AtomicF32::new(params.gain),
            pitch: AtomicF32::new(params.pitch),
            looping: AtomicBool::new(params.looping),
            priority: AtomicI32::new(params.priority),
            effective_priority: AtomicI32::new(params.priority),
        }
    }
}

pub(crate) struct VoiceNode {
    pub generator: Generator,
    pub bus: Uuid,
    pub emitter: Option<Uuid>,
    pub params: VoiceParams,
    pub state: VoiceState,
    pub source: Option<crate::backend::SourceHandle>,
    /// Logical playback time in seconds of source material; the canonical
    /// playhead across virtualization transitions.
    pub time: f64,
    pub one_shot: bool,
    pub dirty: DirtyFlags,
    pub effective_priority: i32,
    pub last_bus_version: u64,
    pub last_emitter_version: u64,
    last_gain: Option<f32>,
    last_pitch: Option<f32>,
    last_rolloff: Option<f32>,
    last_reference_distance: Option<f32>,
    last_max_distance: Option<f32>,
    pub shared: Arc<VoiceShared>,
}

impl VoiceNode {
    fn publish(&self) {
        self.shared.state.store(self.state.to_u8(), Ordering::Relaxed);
        self.shared.time.set(self.time);
        self.shared.gain.set(self.params.gain);
        self.shared.pitch.set(self.params.pitch);
        self.shared.looping.store(self.params.looping, Ordering::Relaxed);
        self.shared.priority.store(self.params.priority, Ordering::Relaxed);
        self.shared
            .effective_priority
            .store(self.effective_priority, Ordering::Relaxed);
    }

    fn reset_commit_cache(&mut self) {
        self.last_gain = None;
        self.last_pitch = None;
        self.last_rolloff = None;
        self.last_reference_distance = None;
        self.last_max_distance = None;
    }
}

/// Create a persistent voice, owned by the caller through the returned
/// handle. Registration is deferred; handle operations enqueue behind it.
pub(crate) fn spawn_voice(
    jobs: &JobSender,
    generator: &Generator,
    desc: VoiceDesc,
    emitter: Option<Uuid>,
) -> Result<Voice> {
    generator.attach()?;
    let id = Uuid::new_v4();
    let params = VoiceParams::from_desc(&desc);
    let shared = Arc::new(VoiceShared::new(&params));

    let generator = generator.clone();
    let node_shared = shared.clone();
    let bus = desc.bus.as_ref().map(|b| b.id);
    jobs.post(move |core| {
        core.register_voice(id, generator, params, bus, emitter, false, node_shared);
        Ok(())
    });

    Ok(Voice {
        id,
        shared,
        jobs: jobs.clone(),
    })
}

/// Create an engine-owned one-shot voice and start it. It is disposed by
/// the reaper once it reaches Stopped.
pub(crate) fn spawn_oneshot(
    jobs: &JobSender,
    generator: &Generator,
    desc: VoiceDesc,
    emitter: Option<Uuid>,
) -> Result<()> {
    generator.attach()?;
    let id = Uuid::new_v4();
    let params = VoiceParams::from_desc(&desc);
    let shared = Arc::new(VoiceShared::new(&params));
    let generator = generator.clone();
    let bus = desc.bus.as_ref().map(|b| b.id);
    jobs.post(move |core| {
        core.register_voice(id, generator, params, bus, emitter, true, shared);
        core.voice_play(id);
        Ok(())
    });
    Ok(())
}

/// Handle to a persistent voice.
///
/// The caller owns the voice: dropping the handle disposes it. Setters are
/// deferred to the audio thread; getters return the last committed value
/// and may be called from any thread.
pub struct Voice {
    pub(crate) id: Uuid,
    pub(crate) shared: Arc<VoiceShared>,
    pub(crate) jobs: JobSender,
}

impl Voice {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn play(&self) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_play(id);
            Ok(())
        });
    }

    pub fn pause(&self) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_pause(id);
            Ok(())
        });
    }

    pub fn stop(&self) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_stop(id);
            Ok(())
        });
    }

    pub fn rewind(&self) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_rewind(id);
            Ok(())
        });
    }

    pub fn set_gain(&self, gain: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::GAIN, |p| p.gain = gain.max(0.0));
            Ok(())
        });
    }

    pub fn set_pitch(&self, pitch: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::PITCH, |p| p.pitch = pitch.max(MIN_PITCH));
            Ok(())
        });
    }

    pub fn set_looping(&self, looping: bool) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::LOOPING, |p| p.looping = looping);
            Ok(())
        });
    }

    pub fn set_position(&self, position: Vec3) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::TRANSFORM, |p| p.position = position);
            Ok(())
        });
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::TRANSFORM, |p| p.velocity = velocity);
            Ok(())
        });
    }

    pub fn set_transform(&self, position: Vec3, velocity: Vec3) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::TRANSFORM, |p| {
                p.position = position;
                p.velocity = velocity;
            });
            Ok(())
        });
    }

    pub fn set_priority(&self, priority: i32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::PRIORITY, |p| p.priority = priority);
            Ok(())
        });
    }

    pub fn set_mix_mode(&self, mode: MixMode) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::MIX_MODE, |p| p.mix_mode = mode);
            Ok(())
        });
    }

    pub fn set_rolloff(&self, rolloff: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::ATTENUATION, |p| p.rolloff = rolloff.max(0.0));
            Ok(())
        });
    }

    pub fn set_reference_distance(&self, distance: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::ATTENUATION, |p| {
                p.reference_distance = distance.max(0.0)
            });
            Ok(())
        });
    }

    pub fn set_max_distance(&self, distance: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_set(id, DirtyFlags::ATTENUATION, |p| {
                p.max_distance = distance.max(0.0)
            });
            Ok(())
        });
    }

    /// Rebind the voice to an emitter (or detach with `None`).
    pub fn attach_emitter(&self, emitter: Option<&crate::emitter::Emitter>) {
        let id = self.id;
        let emitter = emitter.map(|e| e.id);
        self.jobs.post(move |core| {
            core.voice_attach_emitter(id, emitter);
            Ok(())
        });
    }

    pub fn state(&self) -> VoiceState {
        VoiceState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    /// Logical playback time in seconds.
    pub fn playback_time(&self) -> f64 {
        self.shared.time.get()
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain.get()
    }

    pub fn pitch(&self) -> f32 {
        self.shared.pitch.get()
    }

    pub fn looping(&self) -> bool {
        self.shared.looping.load(Ordering::Relaxed)
    }

    pub fn priority(&self) -> i32 {
        self.shared.priority.load(Ordering::Relaxed)
    }

    pub fn effective_priority(&self) -> i32 {
        self.shared.effective_priority.load(Ordering::Relaxed)
    }

    /// Dispose the voice now instead of at drop.
    pub fn dispose(self) {}
}

impl Drop for Voice {
    fn drop(&mut self) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.voice_dispose(id);
            Ok(())
        });
    }
}

// Voice operations run on the audio thread with the node temporarily taken
// out of the registry, so they can borrow the backend, pool and bus tree
// freely alongside the node.
impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_voice(
        &mut self,
        id: Uuid,
        generator: Generator,
        params: VoiceParams,
        bus: Option<Uuid>,
        emitter: Option<Uuid>,
        one_shot: bool,
        shared: Arc<VoiceShared>,
    ) {
        let bus = bus
            .filter(|b| self.buses.contains(*b))
            .or_else(|| {
                emitter
                    .and_then(|e| self.emitters.get(&e))
                    .and_then(|e| e.bus_override)
            })
            .unwrap_or_else(|| self.buses.master_id());

        let mut node = VoiceNode {
            generator,
            bus,
            emitter,
            params,
            state: VoiceState::Stopped,
            source: None,
            time: 0.0,
            one_shot,
            dirty: DirtyFlags::empty(),
            effective_priority: params.priority,
            last_bus_version: self.buses.version(bus).unwrap_or(0),
            last_emitter_version: 0,
            last_gain: None,
            last_pitch: None,
            last_rolloff: None,
            last_reference_distance: None,
            last_max_distance: None,
            shared,
        };
        node.effective_priority = self.effective_priority_of(&node);
        if let Some(e) = emitter.and_then(|e| self.emitters.get(&e)) {
            node.last_emitter_version = e.version;
        }
        node.publish();
        self.voices.insert(id, node);
        if one_shot {
            self.oneshots.push(id);
        }
    }

    /// Run `f` with the node detached from the registry; afterwards the
    /// node is reinserted (unless disposed), the physical/virtual sets are
    /// retagged and the mirror republished.
    pub(crate) fn with_voice<R>(
        &mut self,
        id: Uuid,
        f: impl FnOnce(&mut Self, &mut VoiceNode) -> R,
    ) -> Option<R> {
        let mut node = self.voices.remove(&id)?;
        let result = f(self, &mut node);
        node.publish();
        if node.state == VoiceState::Disposed {
            node.generator.detach();
            self.physical.remove(&id);
            self.virtual_voices.remove(&id);
            self.oneshots.retain(|o| *o != id);
        } else {
            match node.state {
                VoiceState::PlayingPhysical | VoiceState::PausedPhysical => {
                    self.virtual_voices.remove(&id);
                    self.physical.insert(id);
                }
                VoiceState::PlayingVirtual | VoiceState::PausedVirtual => {
                    self.physical.remove(&id);
                    self.virtual_voices.insert(id);
                }
                _ => {
                    self.physical.remove(&id);
                    self.virtual_voices.remove(&id);
                }
            }
            self.voices.insert(id, node);
        }
        Some(result)
    }

    pub(crate) fn voice_set(
        &mut self,
        id: Uuid,
        dirty: DirtyFlags,
        f: impl FnOnce(&mut VoiceParams),
    ) {
        self.with_voice(id, |_, node| {
            f(&mut node.params);
            node.dirty.insert(dirty);
        });
    }

    pub(crate) fn voice_attach_emitter(&mut self, id: Uuid, emitter: Option<Uuid>) {
        self.with_voice(id, |core, node| {
            node.emitter = emitter;
            node.last_emitter_version = emitter
                .and_then(|e| core.emitters.get(&e))
                .map(|e| e.version)
                .unwrap_or(0);
            node.dirty
                .insert(DirtyFlags::TRANSFORM | DirtyFlags::PRIORITY);
        });
    }

    pub(crate) fn voice_play(&mut self, id: Uuid) {
        self.with_voice(id, |core, node| match node.state {
            VoiceState::Stopped => {
                if let Some(source) = core.pool.rent() {
                    node.source = Some(source);
                    node.state = VoiceState::PlayingPhysical;
                    if let Err(e) = core.hydrate(node) {
                        log::warn!("hydration failed, voice goes virtual: {}", e);
                        core.disconnect(node);
                        node.state = VoiceState::PlayingVirtual;
                    }
                } else {
                    node.state = VoiceState::PlayingVirtual;
                }
            }
            VoiceState::PausedPhysical => {
                let resumed = node
                    .source
                    .map(|s| core.backend.play(s).is_ok())
                    .unwrap_or(false);
                if resumed {
                    node.state = VoiceState::PlayingPhysical;
                } else {
                    core.disconnect(node);
                    node.state = VoiceState::PlayingVirtual;
                }
            }
            VoiceState::PausedVirtual => node.state = VoiceState::PlayingVirtual,
            // play on a playing voice is a no-op
            _ => {}
        });
    }

    pub(crate) fn voice_pause(&mut self, id: Uuid) {
        self.with_voice(id, |core, node| match node.state {
            VoiceState::PlayingPhysical => {
                let paused = node
                    .source
                    .map(|s| core.backend.pause(s).is_ok())
                    .unwrap_or(false);
                if paused {
                    node.state = VoiceState::PausedPhysical;
                } else {
                    core.disconnect(node);
                    node.state = VoiceState::PausedVirtual;
                }
            }
            VoiceState::PlayingVirtual => node.state = VoiceState::PausedVirtual,
            _ => {}
        });
    }

    pub(crate) fn voice_stop(&mut self, id: Uuid) {
        self.with_voice(id, |core, node| {
            if matches!(node.state, VoiceState::Stopped | VoiceState::Disposed) {
                return;
            }
            core.halt_voice(node);
        });
    }

    pub(crate) fn voice_rewind(&mut self, id: Uuid) {
        self.with_voice(id, |core, node| {
            if node.state == VoiceState::Disposed {
                return;
            }
            node.time = 0.0;
            match (node.source, node.generator.kind()) {
                (Some(source), GeneratorKind::Static(_)) => {
                    let was_playing = node.state == VoiceState::PlayingPhysical;
                    if core.backend.rewind(source).is_err() {
                        log::warn!("backend rewind failed");
                    } else if was_playing {
                        let _ = core.backend.play(source);
                    }
                }
                (Some(source), GeneratorKind::Streaming(_)) => {
                    // Recycle queued data and restart from the top of the
                    // stream; the pump restarts the source once the ring
                    // refills.
                    let _ = core.backend.stop(source);
                    let unqueued = core.backend.unqueue_processed(source).unwrap_or_default();
                    if let GeneratorKind::Streaming(stream) = node.generator.kind() {
                        for buffer in unqueued {
                            stream.release_buffer(buffer);
                        }
                        core.rewind_stream(stream);
                    }
                }
                (None, GeneratorKind::Streaming(stream)) => {
                    core.rewind_stream(stream);
                }
                (None, GeneratorKind::Static(_)) => {}
            }
        });
    }

    pub(crate) fn voice_dispose(&mut self, id: Uuid) {
        self.with_voice(id, |core, node| {
            if node.state == VoiceState::Disposed {
                return;
            }
            core.disconnect(node);
            node.state = VoiceState::Disposed;
        });
    }

    /// Per-voice update, once per tick.
    pub(crate) fn update_voice(&mut self, id: Uuid, dt: f32) {
        self.with_voice(id, |core, node| {
            match node.state {
                VoiceState::Stopped | VoiceState::Disposed => return,
                VoiceState::PlayingVirtual => {
                    let pitch = node.params.pitch
                        * core.buses.values(node.bus).map(|v| v.pitch).unwrap_or(1.0);
                    node.time += dt as f64 * pitch as f64;
                    if let Some(duration) = node.generator.duration() {
                        if duration > 0.0 && node.time >= duration {
                            if node.params.looping {
                                node.time %= duration;
                            } else {
                                core.complete_voice(id, node);
                            }
                        }
                    }
                    return;
                }
                _ => {}
            }

            if node.state == VoiceState::PlayingPhysical {
                match node.generator.kind() {
                    GeneratorKind::Streaming(_) => {
                        if let Err(e) = core.pump_stream(id, node) {
                            log::warn!("stream pump failed: {}", e);
                        }
                        if node.state == VoiceState::PlayingPhysical {
                            let pitch = node.params.pitch
                                * core.buses.values(node.bus).map(|v| v.pitch).unwrap_or(1.0);
                            node.time += dt as f64 * pitch as f64;
                        }
                    }
                    GeneratorKind::Static(_) => {
                        if let Some(source) = node.source {
                            match core.backend.source_state(source) {
                                Ok(SourceState::Stopped) if !node.params.looping => {
                                    core.complete_voice(id, node);
                                }
                                Ok(_) => {
                                    // The backend position is authoritative
                                    // while the voice is physical.
                                    if let Ok(playhead) = core.backend.playhead(source) {
                                        node.time = playhead;
                                    }
                                }
                                Err(e) => log::warn!("source state query failed: {}", e),
                            }
                        }
                    }
                }
            }
            if matches!(node.state, VoiceState::Stopped | VoiceState::Disposed) {
                return;
            }

            // Dependency versions: bus first, then emitter.
            match core.buses.version(node.bus) {
                Some(version) => {
                    if version != node.last_bus_version {
                        node.dirty.insert(
                            DirtyFlags::GAIN | DirtyFlags::PITCH | DirtyFlags::PRIORITY,
                        );
                        node.last_bus_version = version;
                    }
                }
                None => {
                    // The bus was deleted under the voice; fall back to
                    // Master.
                    node.bus = core.buses.master_id();
                    node.last_bus_version = core.buses.version(node.bus).unwrap_or(0);
                    node.dirty
                        .insert(DirtyFlags::GAIN | DirtyFlags::PITCH | DirtyFlags::PRIORITY);
                }
            }
            if let Some(emitter) = node.emitter {
                match core.emitters.get(&emitter) {
                    Some(e) => {
                        if e.version != node.last_emitter_version {
                            node.dirty
                                .insert(DirtyFlags::TRANSFORM | DirtyFlags::PRIORITY);
                            node.last_emitter_version = e.version;
                        }
                    }
                    None => {
                        node.emitter = None;
                        node.last_emitter_version = 0;
                        node.dirty
                            .insert(DirtyFlags::TRANSFORM | DirtyFlags::PRIORITY);
                    }
                }
            }

            if !node.dirty.is_empty() {
                core.apply_dirty(node, false);
            }
        });
    }

    /// Streaming pump: recycle processed buffers, queue filled ones, and
    /// recover from underruns or end-of-stream.
    fn pump_stream(&mut self, id: Uuid, node: &mut VoiceNode) -> Result<()> {
        let Some(source) = node.source else {
            return Ok(());
        };
        let GeneratorKind::Streaming(stream) = node.generator.kind() else {
            return Ok(());
        };

        for buffer in self.backend.unqueue_processed(source)? {
            stream.release_buffer(buffer);
        }

        while let Some(buffer) = stream.take_filled() {
            if let Err(e) = self.backend.queue_buffer(source, buffer) {
                stream.release_buffer(buffer);
                return Err(e);
            }
        }

        let state = self.backend.source_state(source)?;
        if state != SourceState::Playing && node.state == VoiceState::PlayingPhysical {
            if self.backend.queued_count(source)? > 0 {
                // Underrun: data arrived after the source ran dry.
                self.backend.play(source)?;
                let _ = self.events.send(SonaraEvent::StreamUnderrun { voice: id });
            } else if stream.end_of_stream() {
                if node.params.looping {
                    node.time = 0.0;
                    self.rewind_stream(stream);
                } else {
                    self.complete_voice(id, node);
                }
            }
        }
        Ok(())
    }

    /// Hydration: commit every parameter, connect the generator, seek to
    /// the logical playback time and start the source if the voice is
    /// playing.
    pub(crate) fn hydrate(&mut self, node: &mut VoiceNode) -> Result<()> {
        let Some(source) = node.source else {
            return Ok(());
        };
        node.dirty = DirtyFlags::all();
        node.reset_commit_cache();
        self.apply_dirty(node, true);

        match node.generator.kind() {
            GeneratorKind::Static(sound) => {
                let format = *node.generator.format();
                let buffer = sound.ensure_buffer(self.backend.as_mut(), &format)?;
                self.backend.attach_buffer(source, Some(buffer))?;
                if node.time > 0.0 {
                    self.backend.seek(source, node.time)?;
                }
            }
            GeneratorKind::Streaming(stream) => {
                while let Some(buffer) = stream.take_filled() {
                    if let Err(e) = self.backend.queue_buffer(source, buffer) {
                        stream.release_buffer(buffer);
                        return Err(e);
                    }
                }
            }
        }

        if node.state == VoiceState::PlayingPhysical {
            self.backend.play(source)?;
        }
        Ok(())
    }

    /// Commit dirty parameter categories, writing only values that moved
    /// beyond the hysteresis window unless `force` is set. Bits whose
    /// backend write fails stay dirty and are retried next tick.
    pub(crate) fn apply_dirty(&mut self, node: &mut VoiceNode, force: bool) {
        let master = self.buses.master_id();
        let bus = *self
            .buses
            .values(node.bus)
            .or_else(|| self.buses.values(master))
            .expect("master bus always exists");

        if node.dirty.contains(DirtyFlags::PRIORITY) {
            node.effective_priority = self.effective_priority_of(node);
        }

        let Some(source) = node.source else {
            // Virtual voices have nothing to commit; hydration re-marks
            // every category.
            node.dirty = DirtyFlags::empty();
            return;
        };

        let mut remaining = DirtyFlags::empty();

        if node.dirty.contains(DirtyFlags::GAIN) {
            let gain = node.params.gain * bus.gain;
            if !Self::write_scalar(
                self.backend.as_mut(),
                source,
                SourceParamF::Gain,
                gain,
                &mut node.last_gain,
                force,
            ) {
                remaining.insert(DirtyFlags::GAIN);
            }
        }

        if node.dirty.contains(DirtyFlags::PITCH) {
            let pitch = node.params.pitch * bus.pitch;
            if !Self::write_scalar(
                self.backend.as_mut(),
                source,
                SourceParamF::Pitch,
                pitch,
                &mut node.last_pitch,
                force,
            ) {
                remaining.insert(DirtyFlags::PITCH);
            }
        }

        if node.dirty.contains(DirtyFlags::TRANSFORM) {
            let (emitter_position, emitter_velocity) = node
                .emitter
                .and_then(|e| self.emitters.get(&e))
                .map(|e| (e.position, e.velocity))
                .unwrap_or((Vec3::ZERO, Vec3::ZERO));
            let position = emitter_position + node.params.position;
            let velocity = emitter_velocity + node.params.velocity;
            let ok = self
                .backend
                .set_source_vec3(source, SourceParamV::Position, position)
                .and_then(|_| {
                    self.backend
                        .set_source_vec3(source, SourceParamV::Velocity, velocity)
                })
                .is_ok();
            if !ok {
                remaining.insert(DirtyFlags::TRANSFORM);
            }
        }

        if node.dirty.contains(DirtyFlags::LOOPING) {
            match node.generator.kind() {
                GeneratorKind::Static(_) => {
                    if self
                        .backend
                        .set_source_bool(source, SourceParamB::Looping, node.params.looping)
                        .is_err()
                    {
                        remaining.insert(DirtyFlags::LOOPING);
                    }
                }
                GeneratorKind::Streaming(stream) => {
                    // Looping is realized by the producer's rewind; the
                    // backend flag would loop a single ring buffer.
                    stream.set_looping(node.params.looping);
                }
            }
        }

        if node.dirty.contains(DirtyFlags::MIX_MODE) {
            let caps = self.backend.capabilities();
            let (spatialize, relative, direct) = match node.params.mix_mode {
                MixMode::Direct => (false, false, true),
                MixMode::Relative => (true, true, false),
                MixMode::Spatialized => (true, false, false),
            };
            let mut ok = self
                .backend
                .set_source_bool(source, SourceParamB::RelativeToListener, relative)
                .is_ok();
            if caps.spatialization {
                ok &= self
                    .backend
                    .set_source_bool(source, SourceParamB::Spatialize, spatialize)
                    .is_ok();
            }
            if caps.direct_channels {
                ok &= self
                    .backend
                    .set_source_bool(source, SourceParamB::DirectChannels, direct)
                    .is_ok();
            }
            if !ok {
                remaining.insert(DirtyFlags::MIX_MODE);
            }
        }

        if node.dirty.contains(DirtyFlags::ATTENUATION) {
            let mut ok = Self::write_scalar(
                self.backend.as_mut(),
                source,
                SourceParamF::RolloffFactor,
                node.params.rolloff,
                &mut node.last_rolloff,
                force,
            );
            ok &= Self::write_scalar(
                self.backend.as_mut(),
                source,
                SourceParamF::ReferenceDistance,
                node.params.reference_distance,
                &mut node.last_reference_distance,
                force,
            );
            if node.params.max_distance > 0.0 {
                ok &= Self::write_scalar(
                    self.backend.as_mut(),
                    source,
                    SourceParamF::MaxDistance,
                    node.params.max_distance,
                    &mut node.last_max_distance,
                    force,
                );
            }
            if !ok {
                remaining.insert(DirtyFlags::ATTENUATION);
            }
        }

        node.dirty = remaining;
    }

    fn write_scalar(
        backend: &mut dyn crate::backend::Backend,
        source: crate::backend::SourceHandle,
        param: SourceParamF,
        value: f32,
        last: &mut Option<f32>,
        force: bool,
    ) -> bool {
        if !force {
            if let Some(previous) = *last {
                if (previous - value).abs() <= SCALAR_EPSILON {
                    return true;
                }
            }
        }
        match backend.set_source_f32(source, param, value) {
            Ok(()) => {
                *last = Some(value);
                true
            }
            Err(e) => {
                log::warn!("parameter write failed, will retry: {}", e);
                false
            }
        }
    }

    pub(crate) fn effective_priority_of(&self, node: &VoiceNode) -> i32 {
        let emitter_bias = node
            .emitter
            .and_then(|e| self.emitters.get(&e))
            .map(|e| e.priority_bias)
            .unwrap_or(0);
        let bus_bias = self
            .buses
            .values(node.bus)
            .map(|v| v.priority_bias)
            .unwrap_or(0);
        node.params.priority + emitter_bias + bus_bias
    }

    /// Release the backend source: stop it, detach or recycle the
    /// generator's buffers, return the source to the pool.
    pub(crate) fn disconnect(&mut self, node: &mut VoiceNode) {
        let Some(source) = node.source.take() else {
            return;
        };
        if let Err(e) = self.backend.stop(source) {
            log::warn!("source stop failed during disconnect: {}", e);
        }
        match node.generator.kind() {
            GeneratorKind::Static(_) => {
                let _ = self.backend.attach_buffer(source, None);
            }
            GeneratorKind::Streaming(stream) => {
                match self.backend.unqueue_processed(source) {
                    Ok(buffers) => {
                        for buffer in buffers {
                            stream.release_buffer(buffer);
                        }
                    }
                    Err(e) => log::warn!("unqueue failed during disconnect: {}", e),
                }
            }
        }
        node.reset_commit_cache();
        self.pool.release(source);
    }

    /// Stop semantics shared by the explicit operation and natural
    /// completion: release the source, reset the playhead, rewind the
    /// stream so a later play starts from the top.
    fn halt_voice(&mut self, node: &mut VoiceNode) {
        self.disconnect(node);
        node.time = 0.0;
        if let GeneratorKind::Streaming(stream) = node.generator.kind() {
            self.rewind_stream(stream);
        }
        node.state = VoiceState::Stopped;
    }

    fn complete_voice(&mut self, id: Uuid, node: &mut VoiceNode) {
        self.halt_voice(node);
        let _ = self.events.send(SonaraEvent::VoiceCompleted { voice: id });
    }

    fn rewind_stream(&self, stream: &StreamingSound) {
        if stream.can_seek() {
            if let Err(e) = stream.seek(0.0) {
                log::warn!("stream rewind failed: {}", e);
            }
        }
    }

    /// Scheduler promotion: rent a source and hydrate; on failure the
    /// voice stays virtual.
    pub(crate) fn promote_voice(&mut self, id: Uuid) -> bool {
        self.with_voice(id, |core, node| {
            if !node.state.is_virtual() {
                return false;
            }
            let Some(source) = core.pool.rent() else {
                return false;
            };
            node.source = Some(source);
            node.state = match node.state {
                VoiceState::PausedVirtual => VoiceState::PausedPhysical,
                _ => VoiceState::PlayingPhysical,
            };
            if let Err(e) = core.hydrate(node) {
                log::warn!("promotion failed, voice stays virtual: {}", e);
                core.disconnect(node);
                node.state = match node.state {
                    VoiceState::PausedPhysical => VoiceState::PausedVirtual,
                    _ => VoiceState::PlayingVirtual,
                };
                return false;
            }
            true
        })
        .unwrap_or(false)
    }

    /// Scheduler demotion: capture the playhead into the logical clock,
    /// release the source, mirror the state category.
    pub(crate) fn demote_voice(&mut self, id: Uuid) {
        self.with_voice(id, |core, node| {
            if !node.state.is_physical() {
                return;
            }
            if let (Some(source), GeneratorKind::Static(_)) = (node.source, node.generator.kind())
            {
                if let Ok(playhead) = core.backend.playhead(source) {
                    node.time = playhead;
                }
            }
            core.disconnect(node);
            node.state = match node.state {
                VoiceState::PausedPhysical => VoiceState::PausedVirtual,
                _ => VoiceState::PlayingVirtual,
            };
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_flag_set_operations() {
        let mut flags = DirtyFlags::empty();
        assert!(flags.is_empty());
        flags.insert(DirtyFlags::GAIN | DirtyFlags::PITCH);
        assert!(flags.contains(DirtyFlags::GAIN));
        assert!(flags.contains(DirtyFlags::PITCH));
        assert!(!flags.contains(DirtyFlags::TRANSFORM));
        assert!(DirtyFlags::all().contains(DirtyFlags::PRIORITY));
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            VoiceState::Stopped,
            VoiceState::PlayingPhysical,
            VoiceState::PausedPhysical,
            VoiceState::PlayingVirtual,
            VoiceState::PausedVirtual,
            VoiceState::Disposed,
        ] {
            assert_eq!(VoiceState::from_u8(state.to_u8()), state);
        }
    }

    #[test]
    fn test_state_categories() {
        assert!(VoiceState::PlayingPhysical.is_physical());
        assert!(VoiceState::PausedPhysical.is_physical());
        assert!(VoiceState::PlayingVirtual.is_virtual());
        assert!(!VoiceState::Stopped.is_virtual());
        assert!(VoiceState::PlayingVirtual.is_playing());
        assert!(!VoiceState::PausedVirtual.is_playing());
    }
}
