//! Engine core and tick loop.
//!
//! All mutable engine state lives in [`EngineCore`], owned exclusively by
//! the thread that calls [`SonaraEngine::tick`] (the audio thread). Other
//! threads interact through [`SonaraHandle`], whose operations are deferred
//! onto the marshaller queue.
//!
//! Each tick: drain the queue, advance every voice, commit the listener,
//! run the virtualization pass, reap finished one-shots, drain the queue
//! again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use uuid::Uuid;

use crate::backend::{Backend, PcmFormat};
use crate::bus::{Bus, BusTree};
use crate::config::SonaraConfig;
use crate::dispatch::{JobQueue, JobSender, Ticket};
use crate::emitter::{Emitter, EmitterNode};
use crate::error::Result;
use crate::events::SonaraEvent;
use crate::generator::{Decoder, Generator};
use crate::listener::Listener;
use crate::math::{Orientation, Vec3};
use crate::pool::SourcePool;
use crate::resolver::{FileProvider, ProviderContext, Resolver};
use crate::voice::{spawn_oneshot, spawn_voice, Voice, VoiceDesc, VoiceNode, VoiceState};

/// Audio-thread-exclusive engine state.
pub(crate) struct EngineCore {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) pool: SourcePool,
    pub(crate) buses: BusTree,
    pub(crate) emitters: HashMap<Uuid, EmitterNode>,
    pub(crate) voices: HashMap<Uuid, VoiceNode>,
    /// Engine-owned voices, disposed when they reach Stopped.
    pub(crate) oneshots: Vec<Uuid>,
    pub(crate) physical: HashSet<Uuid>,
    pub(crate) virtual_voices: HashSet<Uuid>,
    pub(crate) listener: Listener,
    pub(crate) events: Sender<SonaraEvent>,
}

impl EngineCore {
    fn update_voices(&mut self, dt: f32) {
        let ids: Vec<Uuid> = self.voices.keys().copied().collect();
        for id in ids {
            self.update_voice(id, dt);
        }
    }

    fn apply_listener(&mut self) {
        let Self {
            backend, listener, ..
        } = self;
        listener.apply(backend.as_mut());
    }

    /// Promote virtual voices into free pool slots; when the pool is
    /// exhausted, preempt the lowest-priority physical voice if a virtual
    /// one outranks it strictly. Equal priorities never preempt.
    fn run_virtualization(&mut self) {
        let mut candidates: Vec<(i32, Uuid)> = self
            .virtual_voices
            .iter()
            .filter_map(|id| self.voices.get(id).map(|n| (n.effective_priority, *id)))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (priority, id) in candidates {
            if self.pool.available() > 0 {
                self.promote_voice(id);
                continue;
            }
            let victim = self
                .physical
                .iter()
                .filter_map(|v| self.voices.get(v).map(|n| (n.effective_priority, *v)))
                .min();
            match victim {
                Some((victim_priority, victim_id)) if victim_priority < priority => {
                    self.demote_voice(victim_id);
                    self.promote_voice(id);
                }
                // Remaining candidates rank even lower; nothing to do.
                _ => break,
            }
        }
    }

    fn reap_oneshots(&mut self) {
        let finished: Vec<Uuid> = self
            .oneshots
            .iter()
            .copied()
            .filter(|id| {
                self.voices
                    .get(id)
                    .map(|n| n.state == VoiceState::Stopped)
                    .unwrap_or(true)
            })
            .collect();
        for id in finished {
            self.voice_dispose(id);
        }
        self.oneshots.retain(|id| self.voices.contains_key(id));
    }

    fn stop_all_voices(&mut self) {
        let ids: Vec<Uuid> = self.voices.keys().copied().collect();
        for id in ids {
            self.voice_stop(id);
        }
    }
}

/// The engine. Owns all audio-thread state; the thread calling
/// [`SonaraEngine::tick`] is the audio thread.
pub struct SonaraEngine {
    core: EngineCore,
    queue: JobQueue,
    jobs: JobSender,
    events_tx: Sender<SonaraEvent>,
    events_rx: Receiver<SonaraEvent>,
    resolver: Arc<Resolver>,
    config: SonaraConfig,
}

impl SonaraEngine {
    /// Build an engine over a backend. Creates the source pool up front and
    /// registers the built-in file provider for the configured search
    /// paths.
    pub fn new(config: SonaraConfig, mut backend: Box<dyn Backend>) -> Result<Self> {
        config.validate()?;

        let (jobs, queue) = JobQueue::channel();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        log::info!(
            "starting audio engine on device '{}' with {} sources",
            backend.device_name(),
            config.max_sources
        );
        let caps = backend.capabilities();
        log::debug!(
            "backend capabilities: spatialization={} direct_channels={} hrtf={}",
            caps.spatialization,
            caps.direct_channels,
            caps.hrtf
        );

        let sources = backend.create_sources(config.max_sources)?;
        let pool = SourcePool::new(sources);

        let resolver = Arc::new(Resolver::new(
            ProviderContext::new(
                jobs.clone(),
                config.stream_buffer_count,
                config.stream_chunk_frames,
            ),
            &config.default_scheme,
        ));
        resolver.register(Arc::new(FileProvider::new(
            config.search_paths.clone(),
            config.absolute_paths_relative,
        )));

        let core = EngineCore {
            backend,
            pool,
            buses: BusTree::new(jobs.clone()),
            emitters: HashMap::new(),
            voices: HashMap::new(),
            oneshots: Vec::new(),
            physical: HashSet::new(),
            virtual_voices: HashSet::new(),
            listener: Listener::new(),
            events: events_tx.clone(),
        };

        Ok(Self {
            core,
            queue,
            jobs,
            events_tx,
            events_rx,
            resolver,
            config,
        })
    }

    /// Advance the engine by `dt` seconds of simulation time.
    pub fn tick(&mut self, dt: f32) {
        self.queue.drain(&mut self.core);
        self.core.update_voices(dt);
        self.core.apply_listener();
        self.core.run_virtualization();
        self.core.reap_oneshots();
        self.queue.drain(&mut self.core);
    }

    /// Cloneable, thread-safe API for callers off the audio thread.
    pub fn handle(&self) -> SonaraHandle {
        SonaraHandle {
            jobs: self.jobs.clone(),
            events_tx: self.events_tx.clone(),
            events_rx: self.events_rx.clone(),
            master: self.master(),
            resolver: self.resolver.clone(),
            stream_buffer_count: self.config.stream_buffer_count,
            stream_chunk_frames: self.config.stream_chunk_frames,
        }
    }

    pub fn master(&self) -> Bus {
        self.core
            .buses
            .handle(self.core.buses.master_id())
            .expect("master bus exists for the engine's lifetime")
    }

    /// Resolve or create a bus by slash-delimited path.
    pub fn bus(&mut self, path: &str) -> Bus {
        let id = self.core.buses.resolve_or_create(path);
        self.core.buses.handle(id).expect("bus exists after resolve")
    }

    pub fn lookup_bus(&self, path: &str) -> Option<Bus> {
        self.core
            .buses
            .lookup(path)
            .and_then(|id| self.core.buses.handle(id))
    }

    pub fn delete_bus(&mut self, path: &str) -> bool {
        self.core.buses.delete(path)
    }

    pub fn create_emitter(&self) -> Emitter {
        Emitter::create(&self.jobs)
    }

    /// Create a persistent voice owned by the caller.
    pub fn create_voice(&self, generator: &Generator, desc: VoiceDesc) -> Result<Voice> {
        spawn_voice(&self.jobs, generator, desc, None)
    }

    /// Build a static generator from decoded interleaved samples.
    pub fn create_static_generator(&self, samples: Vec<f32>, format: PcmFormat) -> Generator {
        Generator::new_static(&self.jobs, format, samples)
    }

    /// Build a streaming generator around a decoder.
    pub fn create_streaming_generator(&self, decoder: Box<dyn Decoder>) -> Generator {
        Generator::new_streaming(
            &self.jobs,
            decoder,
            self.config.stream_buffer_count,
            self.config.stream_chunk_frames,
        )
    }

    /// Resolve a URI through the registered providers.
    pub fn resolve(&self, uri: &str) -> Result<Option<Generator>> {
        self.resolver.resolve(uri)
    }

    /// Fire-and-forget one-shot; failures are logged and reported on the
    /// event channel.
    pub fn play_oneshot(&self, uri: &str, desc: VoiceDesc) {
        fire_oneshot(&self.resolver, &self.jobs, &self.events_tx, uri, desc);
    }

    pub fn play_oneshot_generator(&self, generator: &Generator, desc: VoiceDesc) -> Result<()> {
        spawn_oneshot(&self.jobs, generator, desc, None)
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }

    pub fn events(&self) -> Receiver<SonaraEvent> {
        self.events_rx.clone()
    }

    pub fn set_listener_transform(&mut self, position: Vec3, velocity: Vec3) {
        self.core.listener.set_transform(position, velocity);
    }

    pub fn set_listener_orientation(&mut self, orientation: Orientation) {
        self.core.listener.set_orientation(orientation);
    }

    pub fn stop_all(&mut self) {
        self.core.stop_all_voices();
    }

    /// All registered voices, whatever their state.
    pub fn voice_count(&self) -> usize {
        self.core.voices.len()
    }

    /// Voices currently in a playing state, physical or virtual.
    pub fn active_voice_count(&self) -> usize {
        self.core
            .voices
            .values()
            .filter(|n| n.state.is_playing())
            .count()
    }

    pub fn physical_voice_count(&self) -> usize {
        self.core.physical.len()
    }

    pub fn virtual_voice_count(&self) -> usize {
        self.core.virtual_voices.len()
    }

    pub fn enumerate_devices(&self) -> Vec<String> {
        self.core.backend.enumerate_devices()
    }

    pub fn reset_device(&mut self, device: Option<&str>) -> Result<()> {
        self.core.backend.reset_device(device)
    }
}

impl Drop for SonaraEngine {
    fn drop(&mut self) {
        let ids: Vec<Uuid> = self.core.voices.keys().copied().collect();
        for id in ids {
            self.core.voice_dispose(id);
        }
        let sources = self.core.pool.all_sources().to_vec();
        self.core.backend.destroy_sources(&sources);
        log::info!("audio engine disposed");
    }
}

/// Cloneable, `Send + Sync` API surface for threads other than the audio
/// thread. Every mutation is marshalled; reads return last-committed
/// values.
#[derive(Clone)]
pub struct SonaraHandle {
    jobs: JobSender,
    events_tx: Sender<SonaraEvent>,
    events_rx: Receiver<SonaraEvent>,
    master: Bus,
    resolver: Arc<Resolver>,
    stream_buffer_count: usize,
    stream_chunk_frames: usize,
}

impl SonaraHandle {
    pub fn master(&self) -> Bus {
        self.master.clone()
    }

    /// Resolve or create a bus; the ticket resolves on the next tick.
    pub fn bus(&self, path: &str) -> Ticket<Bus> {
        let path = path.to_string();
        self.jobs.request(move |core| {
            let id = core.buses.resolve_or_create(&path);
            Ok(core.buses.handle(id).expect("bus exists after resolve"))
        })
    }

    pub fn lookup_bus(&self, path: &str) -> Ticket<Option<Bus>> {
        let path = path.to_string();
        self.jobs
            .request(move |core| Ok(core.buses.lookup(&path).and_then(|id| core.buses.handle(id))))
    }

    pub fn delete_bus(&self, path: &str) -> Ticket<bool> {
        let path = path.to_string();
        self.jobs.request(move |core| Ok(core.buses.delete(&path)))
    }

    pub fn create_emitter(&self) -> Emitter {
        Emitter::create(&self.jobs)
    }

    pub fn create_voice(&self, generator: &Generator, desc: VoiceDesc) -> Result<Voice> {
        spawn_voice(&self.jobs, generator, desc, None)
    }

    pub fn create_static_generator(&self, samples: Vec<f32>, format: PcmFormat) -> Generator {
        Generator::new_static(&self.jobs, format, samples)
    }

    pub fn create_streaming_generator(&self, decoder: Box<dyn Decoder>) -> Generator {
        Generator::new_streaming(
            &self.jobs,
            decoder,
            self.stream_buffer_count,
            self.stream_chunk_frames,
        )
    }

    pub fn resolve(&self, uri: &str) -> Result<Option<Generator>> {
        self.resolver.resolve(uri)
    }

    pub fn play_oneshot(&self, uri: &str, desc: VoiceDesc) {
        fire_oneshot(&self.resolver, &self.jobs, &self.events_tx, uri, desc);
    }

    pub fn play_oneshot_generator(&self, generator: &Generator, desc: VoiceDesc) -> Result<()> {
        spawn_oneshot(&self.jobs, generator, desc, None)
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        self.resolver.clone()
    }

    pub fn set_listener_transform(&self, position: Vec3, velocity: Vec3) {
        self.jobs.post(move |core| {
            core.listener.set_transform(position, velocity);
            Ok(())
        });
    }

    pub fn set_listener_orientation(&self, orientation: Orientation) {
        self.jobs.post(move |core| {
            core.listener.set_orientation(orientation);
            Ok(())
        });
    }

    pub fn stop_all(&self) {
        self.jobs.post(move |core| {
            core.stop_all_voices();
            Ok(())
        });
    }

    pub fn events(&self) -> Receiver<SonaraEvent> {
        self.events_rx.clone()
    }
}

fn fire_oneshot(
    resolver: &Resolver,
    jobs: &JobSender,
    events: &Sender<SonaraEvent>,
    uri: &str,
    desc: VoiceDesc,
) {
    let failure = match resolver.resolve(uri) {
        Ok(Some(generator)) => spawn_oneshot(jobs, &generator, desc, None)
            .err()
            .map(|e| e.to_string()),
        Ok(None) => Some("resource not found".to_string()),
        Err(e) => Some(e.to_string()),
    };
    if let Some(error) = failure {
        log::warn!("one-shot '{}' failed: {}", uri, error);
        let _ = events.send(SonaraEvent::OneShotFailed {
            uri: uri.to_string(),
            error,
        });
    }
}
