//! Positional emitters.
//!
//! An emitter is a world-space transform anchor. Voices attached to it
//! inherit its pose each tick: the engine adds emitter position/velocity to
//! the voice's local offset when committing the transform. Mutations bump
//! the emitter's version counter only when a value actually changed, so
//! attached voices are not reprocessed spuriously.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::atomic::AtomicF32;
use crate::bus::Bus;
use crate::dispatch::JobSender;
use crate::error::Result;
use crate::generator::Generator;
use crate::math::Vec3;
use crate::voice::{spawn_oneshot, spawn_voice, Voice, VoiceDesc};

#[derive(Debug)]
pub(crate) struct EmitterShared {
    position: [AtomicF32; 3],
    velocity: [AtomicF32; 3],
    priority_bias: AtomicI32,
    version: AtomicU64,
}

impl EmitterShared {
    fn new() -> Self {
        Self {
            position: Default::default(),
            velocity: Default::default(),
            priority_bias: AtomicI32::new(0),
            version: AtomicU64::new(0),
        }
    }

    fn store_vec3(slot: &[AtomicF32; 3], v: Vec3) {
        slot[0].set(v.x);
        slot[1].set(v.y);
        slot[2].set(v.z);
    }

    fn load_vec3(slot: &[AtomicF32; 3]) -> Vec3 {
        Vec3::new(slot[0].get(), slot[1].get(), slot[2].get())
    }
}

pub(crate) struct EmitterNode {
    pub position: Vec3,
    pub velocity: Vec3,
    pub bus_override: Option<Uuid>,
    pub priority_bias: i32,
    pub version: u64,
    pub shared: Arc<EmitterShared>,
}

impl EmitterNode {
    pub fn new(shared: Arc<EmitterShared>) -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            bus_override: None,
            priority_bias: 0,
            version: 0,
            shared,
        }
    }

    pub fn set_transform(&mut self, position: Vec3, velocity: Vec3) {
        if self.position == position && self.velocity == velocity {
            return;
        }
        self.position = position;
        self.velocity = velocity;
        self.bump();
    }

    pub fn set_bus_override(&mut self, bus: Option<Uuid>) {
        if self.bus_override == bus {
            return;
        }
        self.bus_override = bus;
        self.bump();
    }

    pub fn set_priority_bias(&mut self, bias: i32) {
        if self.priority_bias == bias {
            return;
        }
        self.priority_bias = bias;
        self.bump();
    }

    fn bump(&mut self) {
        self.version += 1;
        EmitterShared::store_vec3(&self.shared.position, self.position);
        EmitterShared::store_vec3(&self.shared.velocity, self.velocity);
        self.shared
            .priority_bias
            .store(self.priority_bias, Ordering::Relaxed);
        self.shared.version.store(self.version, Ordering::Relaxed);
    }
}

/// Handle to a positional emitter.
///
/// Owned by the caller; dropping it destroys the engine-side anchor, and
/// voices that referenced it behave as unattached from then on.
pub struct Emitter {
    pub(crate) id: Uuid,
    pub(crate) shared: Arc<EmitterShared>,
    pub(crate) jobs: JobSender,
}

impl Emitter {
    pub(crate) fn create(jobs: &JobSender) -> Emitter {
        let id = Uuid::new_v4();
        let shared = Arc::new(EmitterShared::new());
        let node_shared = shared.clone();
        jobs.post(move |core| {
            core.emitters.insert(id, EmitterNode::new(node_shared));
            Ok(())
        });
        Emitter {
            id,
            shared,
            jobs: jobs.clone(),
        }
    }

    pub fn set_transform(&self, position: Vec3, velocity: Vec3) {
        let id = self.id;
        self.jobs.post(move |core| {
            if let Some(node) = core.emitters.get_mut(&id) {
                node.set_transform(position, velocity);
            }
            Ok(())
        });
    }

    pub fn set_position(&self, position: Vec3) {
        let velocity = self.velocity();
        self.set_transform(position, velocity);
    }

    pub fn set_bus(&self, bus: Option<&Bus>) {
        let id = self.id;
        let bus = bus.map(|b| b.id);
        self.jobs.post(move |core| {
            if let Some(node) = core.emitters.get_mut(&id) {
                node.set_bus_override(bus);
            }
            Ok(())
        });
    }

    pub fn set_priority_bias(&self, bias: i32) {
        let id = self.id;
        self.jobs.post(move |core| {
            if let Some(node) = core.emitters.get_mut(&id) {
                node.set_priority_bias(bias);
            }
            Ok(())
        });
    }

    /// Create a persistent voice bound to this emitter.
    pub fn attach_voice(&self, generator: &Generator, desc: VoiceDesc) -> Result<Voice> {
        spawn_voice(&self.jobs, generator, desc, Some(self.id))
    }

    /// Fire an engine-owned one-shot voice through this emitter.
    pub fn play_oneshot(&self, generator: &Generator, desc: VoiceDesc) -> Result<()> {
        spawn_oneshot(&self.jobs, generator, desc, Some(self.id))
    }

    pub fn position(&self) -> Vec3 {
        EmitterShared::load_vec3(&self.shared.position)
    }

    pub fn velocity(&self) -> Vec3 {
        EmitterShared::load_vec3(&self.shared.velocity)
    }

    pub fn priority_bias(&self) -> i32 {
        self.shared.priority_bias.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Relaxed)
    }

    /// Destroy the emitter now instead of at drop.
    pub fn destroy(self) {}
}

impl Drop for Emitter {
    fn drop(&mut self) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.emitters.remove(&id);
            Ok(())
        });
    }
}
