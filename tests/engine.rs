//! End-to-end engine scenarios against the mock backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sonara::backend::{SourceParamF, SourceParamV};
use sonara::{
    Decoder, Generator, MockBackend, PcmFormat, Provider, ProviderContext, Result, SonaraConfig,
    SonaraEngine, SonaraEvent, SourceState, Uri, Vec3, VoiceDesc, VoiceState,
};

const RATE: u32 = 1000;

fn engine_with_pool(max_sources: usize) -> (SonaraEngine, MockBackend) {
    let backend = MockBackend::new();
    let engine = SonaraEngine::new(
        SonaraConfig::new().max_sources(max_sources),
        Box::new(backend.clone()),
    )
    .unwrap();
    (engine, backend)
}

/// A static generator holding `seconds` of silence at 1 kHz mono.
fn static_gen(engine: &SonaraEngine, seconds: f64) -> Generator {
    let frames = (seconds * RATE as f64) as usize;
    engine.create_static_generator(vec![0.0; frames], PcmFormat::float(1, RATE))
}

/// Seekable test decoder producing `frames_total` frames of silence.
struct SilenceDecoder {
    frames_total: usize,
    position: usize,
}

impl SilenceDecoder {
    fn new(frames_total: usize) -> Self {
        Self {
            frames_total,
            position: 0,
        }
    }
}

impl Decoder for SilenceDecoder {
    fn format(&self) -> PcmFormat {
        PcmFormat::float(1, RATE)
    }

    fn duration(&self) -> Option<f64> {
        Some(self.frames_total as f64 / RATE as f64)
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn decode(&mut self, out: &mut [f32]) -> Result<usize> {
        let frames = out.len().min(self.frames_total - self.position);
        out[..frames].fill(0.0);
        self.position += frames;
        Ok(frames)
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.position = ((seconds * RATE as f64) as usize).min(self.frames_total);
        Ok(())
    }
}

#[test]
fn master_gain_cascade() {
    let (mut engine, _backend) = engine_with_pool(4);
    let sfx = engine.bus("/sfx");
    let guns = engine.bus("/sfx/guns");

    sfx.set_gain(0.5);
    guns.set_gain(0.5);
    engine.tick(0.01);
    assert!((guns.effective_gain() - 0.25).abs() < 1e-6);

    sfx.set_muted(true);
    engine.tick(0.01);
    assert_eq!(guns.effective_gain(), 0.0);
    assert!(guns.effective_muted());

    sfx.set_muted(false);
    engine.tick(0.01);
    assert!((guns.effective_gain() - 0.25).abs() < 1e-6);
}

#[test]
fn bus_gain_reaches_backend_source() {
    let (mut engine, backend) = engine_with_pool(2);
    let bus = engine.bus("sfx");
    let generator = static_gen(&engine, 1.0);

    let voice = engine
        .create_voice(
            &generator,
            VoiceDesc {
                bus: Some(bus.clone()),
                gain: 0.8,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    voice.play();
    engine.tick(0.01);

    let source = playing_source(&backend);
    let gain = backend.f32_param(source, SourceParamF::Gain).unwrap();
    assert!((gain - 0.8).abs() < 1e-6);

    // A bus change invalidates the cached commit through the version check.
    bus.set_gain(0.5);
    engine.tick(0.01);
    let gain = backend.f32_param(source, SourceParamF::Gain).unwrap();
    assert!((gain - 0.4).abs() < 1e-6);
}

#[test]
fn pool_exhaustion_virtualizes_and_promotes() {
    let (mut engine, _backend) = engine_with_pool(2);
    let generator = static_gen(&engine, 1.0);

    let a = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    let b = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    let c = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    a.play();
    b.play();
    c.play();
    engine.tick(0.01);

    assert_eq!(a.state(), VoiceState::PlayingPhysical);
    assert_eq!(b.state(), VoiceState::PlayingPhysical);
    assert_eq!(c.state(), VoiceState::PlayingVirtual);
    assert_eq!(engine.physical_voice_count(), 2);

    a.dispose();
    engine.tick(0.01);
    assert_eq!(c.state(), VoiceState::PlayingPhysical);
    assert_eq!(engine.physical_voice_count(), 2);
    assert_eq!(engine.voice_count(), 2);
}

#[test]
fn source_budget_never_exceeded() {
    let (mut engine, _backend) = engine_with_pool(3);
    let generator = static_gen(&engine, 5.0);

    let voices: Vec<_> = (0..8)
        .map(|i| {
            let voice = engine
                .create_voice(
                    &generator,
                    VoiceDesc {
                        priority: i,
                        ..VoiceDesc::new()
                    },
                )
                .unwrap();
            voice.play();
            voice
        })
        .collect();

    for _ in 0..10 {
        engine.tick(0.01);
        assert!(engine.physical_voice_count() <= 3);
    }
    drop(voices);
}

#[test]
fn higher_priority_preempts_lower() {
    let (mut engine, _backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 5.0);

    let low = engine
        .create_voice(
            &generator,
            VoiceDesc {
                priority: -5,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    low.play();
    engine.tick(0.01);
    assert_eq!(low.state(), VoiceState::PlayingPhysical);

    let high = engine
        .create_voice(
            &generator,
            VoiceDesc {
                priority: 10,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    high.play();
    engine.tick(0.01);

    assert_eq!(high.state(), VoiceState::PlayingPhysical);
    assert_eq!(low.state(), VoiceState::PlayingVirtual);

    // Equal priority must not preempt.
    let peer = engine
        .create_voice(
            &generator,
            VoiceDesc {
                priority: 10,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    peer.play();
    engine.tick(0.01);
    assert_eq!(high.state(), VoiceState::PlayingPhysical);
    assert_eq!(peer.state(), VoiceState::PlayingVirtual);
}

#[test]
fn virtual_voice_advances_and_completes() {
    let (mut engine, _backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 1.0);

    let physical = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    physical.play();
    let virtual_voice = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    virtual_voice.play();
    let events = engine.events();

    engine.tick(0.0);
    assert_eq!(virtual_voice.state(), VoiceState::PlayingVirtual);

    engine.tick(0.5);
    assert!((virtual_voice.playback_time() - 0.5).abs() < 1e-6);

    engine.tick(0.6);
    assert_eq!(virtual_voice.state(), VoiceState::Stopped);
    assert_eq!(virtual_voice.playback_time(), 0.0);
    let completed: Vec<_> = events.try_iter().collect();
    assert!(completed
        .iter()
        .any(|e| matches!(e, SonaraEvent::VoiceCompleted { voice } if *voice == virtual_voice.id())));
}

#[test]
fn virtual_looping_wraps_playhead() {
    let (mut engine, _backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 1.0);

    let physical = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    physical.play();
    let looper = engine
        .create_voice(
            &generator,
            VoiceDesc {
                looping: true,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    looper.play();

    engine.tick(0.01);
    engine.tick(1.5);
    assert_eq!(looper.state(), VoiceState::PlayingVirtual);
    assert!(looper.playback_time() < 1.0);
}

#[test]
fn paused_virtual_promotes_to_paused_physical() {
    let (mut engine, backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 5.0);

    let a = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    a.play();
    let b = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    b.play();
    b.pause();
    engine.tick(0.01);
    assert_eq!(b.state(), VoiceState::PausedVirtual);

    a.dispose();
    engine.tick(0.01);
    assert_eq!(b.state(), VoiceState::PausedPhysical);
    let source = single_rented_source(&backend);
    assert_ne!(backend.state_of(source), Some(SourceState::Playing));

    b.play();
    engine.tick(0.01);
    assert_eq!(b.state(), VoiceState::PlayingPhysical);
    assert_eq!(backend.state_of(source), Some(SourceState::Playing));
}

#[test]
fn emitter_follow_writes_position_once() {
    let (mut engine, backend) = engine_with_pool(2);
    let generator = static_gen(&engine, 5.0);

    let emitter = engine.create_emitter();
    let voice = emitter
        .attach_voice(
            &generator,
            VoiceDesc {
                position: Vec3::new(1.0, 0.0, 0.0),
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    voice.play();
    engine.tick(0.01);

    let source = playing_source(&backend);
    assert_eq!(
        backend.vec3_param(source, SourceParamV::Position),
        Some(Vec3::new(1.0, 0.0, 0.0))
    );
    let writes_before = backend.vec3_writes(source, SourceParamV::Position);

    emitter.set_transform(Vec3::new(10.0, 0.0, 0.0), Vec3::ZERO);
    engine.tick(0.01);
    assert_eq!(
        backend.vec3_param(source, SourceParamV::Position),
        Some(Vec3::new(11.0, 0.0, 0.0))
    );
    assert_eq!(
        backend.vec3_writes(source, SourceParamV::Position),
        writes_before + 1
    );

    // No further traffic while the emitter is still.
    engine.tick(0.01);
    assert_eq!(
        backend.vec3_writes(source, SourceParamV::Position),
        writes_before + 1
    );
}

#[test]
fn destroyed_emitter_leaves_voice_unattached() {
    let (mut engine, backend) = engine_with_pool(2);
    let generator = static_gen(&engine, 5.0);

    let emitter = engine.create_emitter();
    emitter.set_transform(Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO);
    let voice = emitter
        .attach_voice(
            &generator,
            VoiceDesc {
                position: Vec3::new(1.0, 0.0, 0.0),
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    voice.play();
    engine.tick(0.01);

    let source = playing_source(&backend);
    assert_eq!(
        backend.vec3_param(source, SourceParamV::Position),
        Some(Vec3::new(6.0, 0.0, 0.0))
    );

    emitter.destroy();
    engine.tick(0.01);
    assert_eq!(
        backend.vec3_param(source, SourceParamV::Position),
        Some(Vec3::new(1.0, 0.0, 0.0))
    );
}

#[test]
fn rewind_round_trip() {
    let (mut engine, backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 2.0);

    let voice = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    voice.play();
    engine.tick(0.01);

    let source = playing_source(&backend);
    for _ in 0..5 {
        backend.advance(0.1);
        engine.tick(0.1);
    }
    assert!((voice.playback_time() - 0.5).abs() < 1e-6);

    voice.rewind();
    engine.tick(0.01);
    assert_eq!(voice.playback_time(), 0.0);
    assert_eq!(backend.playhead_of(source), Some(0.0));
    assert_eq!(voice.state(), VoiceState::PlayingPhysical);
    assert_eq!(backend.state_of(source), Some(SourceState::Playing));
}

#[test]
fn stop_resets_and_releases_source() {
    let (mut engine, _backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 2.0);

    let voice = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    voice.play();
    engine.tick(0.01);
    assert_eq!(engine.physical_voice_count(), 1);

    voice.stop();
    engine.tick(0.01);
    assert_eq!(voice.state(), VoiceState::Stopped);
    assert_eq!(voice.playback_time(), 0.0);
    assert_eq!(engine.physical_voice_count(), 0);

    // The freed source is immediately available to someone else.
    let other = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    other.play();
    engine.tick(0.01);
    assert_eq!(other.state(), VoiceState::PlayingPhysical);
}

#[test]
fn transitions_are_idempotent() {
    let (mut engine, _backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 2.0);

    let voice = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    voice.play();
    voice.play();
    engine.tick(0.01);
    assert_eq!(voice.state(), VoiceState::PlayingPhysical);

    voice.pause();
    voice.pause();
    engine.tick(0.01);
    assert_eq!(voice.state(), VoiceState::PausedPhysical);

    voice.stop();
    voice.stop();
    engine.tick(0.01);
    assert_eq!(voice.state(), VoiceState::Stopped);
    assert_eq!(engine.physical_voice_count(), 0);
}

#[test]
fn effective_priority_sums_voice_emitter_and_bus() {
    let (mut engine, _backend) = engine_with_pool(2);
    let bus = engine.bus("combat");
    bus.set_priority_bias(3);
    let generator = static_gen(&engine, 5.0);

    let emitter = engine.create_emitter();
    emitter.set_priority_bias(7);
    let voice = emitter
        .attach_voice(
            &generator,
            VoiceDesc {
                bus: Some(bus.clone()),
                priority: 2,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    voice.play();
    engine.tick(0.01);
    assert_eq!(voice.effective_priority(), 12);

    emitter.set_priority_bias(1);
    engine.tick(0.01);
    assert_eq!(voice.effective_priority(), 6);

    bus.set_priority_bias(-2);
    engine.tick(0.01);
    assert_eq!(voice.effective_priority(), 1);
}

#[test]
fn deleting_bus_rebinds_voice_to_master() {
    let (mut engine, backend) = engine_with_pool(1);
    let bus = engine.bus("doomed");
    bus.set_gain(0.25);
    let generator = static_gen(&engine, 5.0);

    let voice = engine
        .create_voice(
            &generator,
            VoiceDesc {
                bus: Some(bus.clone()),
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    voice.play();
    engine.tick(0.01);

    let source = playing_source(&backend);
    let gain = backend.f32_param(source, SourceParamF::Gain).unwrap();
    assert!((gain - 0.25).abs() < 1e-6);

    assert!(engine.delete_bus("doomed"));
    engine.tick(0.01);
    let gain = backend.f32_param(source, SourceParamF::Gain).unwrap();
    assert!((gain - 1.0).abs() < 1e-6);
}

#[test]
fn natural_completion_stops_static_voice() {
    let (mut engine, backend) = engine_with_pool(1);
    let generator = static_gen(&engine, 0.5);

    let voice = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    voice.play();
    engine.tick(0.01);

    backend.advance(0.6);
    engine.tick(0.01);
    assert_eq!(voice.state(), VoiceState::Stopped);
    assert_eq!(engine.physical_voice_count(), 0);
}

#[test]
fn one_shots_are_reaped() {
    let (mut engine, backend) = engine_with_pool(2);
    let generator = static_gen(&engine, 0.5);

    engine
        .play_oneshot_generator(&generator, VoiceDesc::new())
        .unwrap();
    engine.tick(0.01);
    assert_eq!(engine.voice_count(), 1);
    assert_eq!(engine.physical_voice_count(), 1);

    backend.advance(0.6);
    engine.tick(0.01);
    assert_eq!(engine.voice_count(), 0);
    assert_eq!(engine.physical_voice_count(), 0);
}

#[test]
fn exclusive_generator_rejects_second_voice() {
    let (engine, _backend) = engine_with_pool(2);
    let generator =
        engine.create_streaming_generator(Box::new(SilenceDecoder::new(RATE as usize)));

    let first = engine.create_voice(&generator, VoiceDesc::new());
    assert!(first.is_ok());
    let second = engine.create_voice(&generator, VoiceDesc::new());
    assert!(second.is_err());
    drop(first);
}

#[test]
fn streaming_conservation_and_loop_recovery() {
    let backend = MockBackend::new();
    let mut engine = SonaraEngine::new(
        SonaraConfig::new()
            .max_sources(2)
            .stream_buffer_count(2)
            .stream_chunk_frames(250),
        Box::new(backend.clone()),
    )
    .unwrap();

    // Material of exactly one chunk: the producer reaches end-of-stream
    // while a free buffer is still available, before any voice loops it.
    let generator = engine.create_streaming_generator(Box::new(SilenceDecoder::new(250)));

    let mut eos_seen = false;
    for _ in 0..500 {
        engine.tick(0.0);
        if generator.stream_stats().unwrap().end_of_stream {
            eos_seen = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(eos_seen, "producer never reached end of stream");

    let voice = engine
        .create_voice(
            &generator,
            VoiceDesc {
                looping: true,
                ..VoiceDesc::new()
            },
        )
        .unwrap();
    voice.play();
    engine.tick(0.01);

    for _ in 0..100 {
        backend.advance(0.05);
        engine.tick(0.05);

        let stats = generator.stream_stats().unwrap();
        let queued = backend.total_buffers_on_sources();
        assert_eq!(
            stats.free + stats.filled + stats.in_flight + queued,
            stats.buffer_count,
            "buffer ring leaked or duplicated a handle"
        );
        assert_eq!(voice.state(), VoiceState::PlayingPhysical);
        std::thread::sleep(Duration::from_millis(2));
    }
    drop(voice);
}

#[test]
fn streaming_voice_stops_at_end_when_not_looping() {
    let backend = MockBackend::new();
    let mut engine = SonaraEngine::new(
        SonaraConfig::new()
            .max_sources(2)
            .stream_buffer_count(2)
            .stream_chunk_frames(250),
        Box::new(backend.clone()),
    )
    .unwrap();

    let generator = engine.create_streaming_generator(Box::new(SilenceDecoder::new(500)));
    let voice = engine.create_voice(&generator, VoiceDesc::new()).unwrap();
    voice.play();

    let mut stopped = false;
    for _ in 0..500 {
        backend.advance(0.05);
        engine.tick(0.05);
        if voice.state() == VoiceState::Stopped {
            stopped = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(stopped, "streaming voice never completed");
    assert_eq!(engine.physical_voice_count(), 0);
}

struct RecordingProvider {
    seen: Mutex<Vec<String>>,
}

impl Provider for RecordingProvider {
    fn schemes(&self) -> &[&str] {
        &["file"]
    }

    fn resolve(&self, uri: &Uri, _ctx: &ProviderContext) -> Result<Option<Generator>> {
        self.seen.lock().unwrap().push(uri.to_string());
        Ok(None)
    }
}

#[test]
fn default_scheme_dispatch_through_engine() {
    let (engine, _backend) = engine_with_pool(1);
    let provider = Arc::new(RecordingProvider {
        seen: Mutex::new(Vec::new()),
    });
    engine.resolver().register(provider.clone());

    let handle = engine.handle();
    assert!(handle.resolve("sfx/boom.ogg").unwrap().is_none());
    assert_eq!(
        provider.seen.lock().unwrap().as_slice(),
        &["file:///sfx/boom.ogg".to_string()]
    );
}

#[test]
fn oneshot_resolution_failure_is_reported() {
    let (mut engine, _backend) = engine_with_pool(1);
    let events = engine.events();

    engine.play_oneshot("missing/sound.ogg", VoiceDesc::new());
    engine.tick(0.01);

    let failures: Vec<_> = events
        .try_iter()
        .filter(|e| matches!(e, SonaraEvent::OneShotFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(engine.voice_count(), 0);
}

#[test]
fn handle_bus_ticket_resolves_after_tick() {
    let (mut engine, _backend) = engine_with_pool(1);
    let handle = engine.handle();

    let ticket = handle.bus("/music/combat");
    engine.tick(0.01);
    let bus = ticket.wait().unwrap();
    assert_eq!(bus.name(), "combat");
    assert!(engine.lookup_bus("music/combat").is_some());

    let deleted = handle.delete_bus("music/combat");
    engine.tick(0.01);
    assert!(deleted.wait().unwrap());
    assert!(engine.lookup_bus("music/combat").is_none());
}

#[test]
fn listener_commits_once_per_change() {
    let (mut engine, backend) = engine_with_pool(1);

    engine.tick(0.01);
    let initial = backend.listener_frame().unwrap();
    assert_eq!(initial.position, Vec3::ZERO);

    engine.set_listener_transform(Vec3::new(3.0, 0.0, 1.0), Vec3::ZERO);
    engine.tick(0.01);
    assert_eq!(
        backend.listener_frame().unwrap().position,
        Vec3::new(3.0, 0.0, 1.0)
    );
}

/// The source a hydrated playing voice rented, found via the mock's write
/// log.
fn playing_source(backend: &MockBackend) -> sonara::backend::SourceHandle {
    backend
        .all_sources()
        .into_iter()
        .find(|s| backend.state_of(*s) == Some(SourceState::Playing))
        .expect("one source should be playing")
}

/// The single source that carries parameter writes, playing or not.
fn single_rented_source(backend: &MockBackend) -> sonara::backend::SourceHandle {
    backend
        .all_sources()
        .into_iter()
        .find(|s| backend.f32_writes(*s, SourceParamF::Gain) > 0)
        .expect("one source should have been hydrated")
}
