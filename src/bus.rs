//! Hierarchical mix buses.
//!
//! Buses form a tree rooted at `Master`. Each node carries local gain,
//! pitch, priority bias and mute, and caches the effective values inherited
//! down the tree: gain and pitch multiply, priority bias adds, mute ORs, and
//! an effectively muted bus forces its effective gain to zero. Every local
//! change recomputes the node and all descendants depth-first (parents
//! before children) and bumps their version counters, which voices compare
//! cheaply each tick.
//!
//! The tree itself is audio-thread-exclusive; [`Bus`] handles defer
//! mutations through the marshaller and read last-committed effective
//! values from atomic mirrors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::atomic::AtomicF32;
use crate::dispatch::JobSender;

pub(crate) const MASTER_NAME: &str = "Master";

const MIN_PITCH: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BusValues {
    pub gain: f32,
    pub pitch: f32,
    pub priority_bias: i32,
    pub muted: bool,
}

impl BusValues {
    pub const IDENTITY: BusValues = BusValues {
        gain: 1.0,
        pitch: 1.0,
        priority_bias: 0,
        muted: false,
    };

    fn inherit(parent: &BusValues, local: &BusValues) -> BusValues {
        let muted = local.muted || parent.muted;
        BusValues {
            gain: if muted { 0.0 } else { local.gain * parent.gain },
            pitch: local.pitch * parent.pitch,
            priority_bias: local.priority_bias + parent.priority_bias,
            muted,
        }
    }
}

/// Cross-thread mirror of a bus's committed effective values.
#[derive(Debug)]
pub(crate) struct BusShared {
    name: String,
    gain: AtomicF32,
    pitch: AtomicF32,
    priority_bias: AtomicI32,
    muted: AtomicBool,
    version: AtomicU64,
}

impl BusShared {
    fn new(name: String) -> Self {
        Self {
            name,
            gain: AtomicF32::new(1.0),
            pitch: AtomicF32::new(1.0),
            priority_bias: AtomicI32::new(0),
            muted: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }
    }
}

pub(crate) struct BusNode {
    parent: Option<Uuid>,
    children: HashMap<String, Uuid>,
    local: BusValues,
    effective: BusValues,
    version: u64,
    shared: Arc<BusShared>,
}

impl BusNode {
    fn new(name: &str, parent: Option<Uuid>) -> Self {
        Self {
            parent,
            children: HashMap::new(),
            local: BusValues::IDENTITY,
            effective: BusValues::IDENTITY,
            version: 0,
            shared: Arc::new(BusShared::new(name.to_string())),
        }
    }

    fn publish(&self) {
        self.shared.gain.set(self.effective.gain);
        self.shared.pitch.set(self.effective.pitch);
        self.shared
            .priority_bias
            .store(self.effective.priority_bias, Ordering::Relaxed);
        self.shared.muted.store(self.effective.muted, Ordering::Relaxed);
        self.shared.version.store(self.version, Ordering::Relaxed);
    }
}

/// The mix tree. Audio-thread-exclusive; no locks.
pub(crate) struct BusTree {
    nodes: HashMap<Uuid, BusNode>,
    master: Uuid,
    jobs: JobSender,
}

impl BusTree {
    pub fn new(jobs: JobSender) -> Self {
        let master = Uuid::new_v4();
        let mut nodes = HashMap::new();
        nodes.insert(master, BusNode::new(MASTER_NAME, None));
        Self {
            nodes,
            master,
            jobs,
        }
    }

    pub fn master_id(&self) -> Uuid {
        self.master
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn handle(&self, id: Uuid) -> Option<Bus> {
        self.nodes.get(&id).map(|node| Bus {
            id,
            shared: node.shared.clone(),
            jobs: self.jobs.clone(),
        })
    }

    /// Resolve a slash-delimited path, creating missing segments.
    ///
    /// A leading `/` is stripped, empty segments are ignored, and the empty
    /// path resolves to Master. Names are unique among siblings only.
    pub fn resolve_or_create(&mut self, path: &str) -> Uuid {
        let mut current = self.master;
        for segment in path_segments(path) {
            if let Some(&child) = self.nodes[&current].children.get(segment) {
                current = child;
                continue;
            }
            let id = Uuid::new_v4();
            let mut node = BusNode::new(segment, Some(current));
            node.effective = self.nodes[&current].effective;
            node.publish();
            self.nodes.insert(id, node);
            self.nodes
                .get_mut(&current)
                .expect("parent bus exists")
                .children
                .insert(segment.to_string(), id);
            current = id;
        }
        current
    }

    /// Lookup without creation; `None` when any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<Uuid> {
        let mut current = self.master;
        for segment in path_segments(path) {
            current = *self.nodes[&current].children.get(segment)?;
        }
        Some(current)
    }

    /// Delete the bus at `path` and its whole subtree. Master cannot be
    /// deleted. Returns false when the path does not resolve.
    pub fn delete(&mut self, path: &str) -> bool {
        let Some(id) = self.lookup(path) else {
            return false;
        };
        if id == self.master {
            return false;
        }
        let node = &self.nodes[&id];
        let parent = node.parent.expect("non-master bus has a parent");
        let name = node.shared.name.clone();
        self.nodes
            .get_mut(&parent)
            .expect("parent bus exists")
            .children
            .remove(&name);

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.values().copied());
            }
        }
        true
    }

    pub fn set_gain(&mut self, id: Uuid, gain: f32) {
        self.mutate(id, |local| local.gain = gain.max(0.0));
    }

    pub fn set_pitch(&mut self, id: Uuid, pitch: f32) {
        self.mutate(id, |local| local.pitch = pitch.max(MIN_PITCH));
    }

    pub fn set_priority_bias(&mut self, id: Uuid, bias: i32) {
        self.mutate(id, |local| local.priority_bias = bias);
    }

    pub fn set_muted(&mut self, id: Uuid, muted: bool) {
        self.mutate(id, |local| local.muted = muted);
    }

    pub fn values(&self, id: Uuid) -> Option<&BusValues> {
        self.nodes.get(&id).map(|n| &n.effective)
    }

    pub fn version(&self, id: Uuid) -> Option<u64> {
        self.nodes.get(&id).map(|n| n.version)
    }

    fn mutate(&mut self, id: Uuid, apply: impl FnOnce(&mut BusValues)) {
        let Some(node) = self.nodes.get_mut(&id) else {
            log::warn!("mutation on deleted bus {}", id);
            return;
        };
        apply(&mut node.local);
        self.recompute_subtree(id);
    }

    /// Recompute cached effective values of `root` and every descendant,
    /// parents before children, bumping each version.
    fn recompute_subtree(&mut self, root: Uuid) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let parent_effective = self.nodes[&id]
                .parent
                .map(|p| self.nodes[&p].effective)
                .unwrap_or(BusValues::IDENTITY);
            let node = self.nodes.get_mut(&id).expect("bus exists during recompute");
            node.effective = BusValues::inherit(&parent_effective, &node.local);
            node.version += 1;
            node.publish();
            stack.extend(node.children.values().copied());
        }
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Handle to a mix bus.
///
/// Cheap to clone; setters are deferred to the audio thread, getters return
/// the last committed effective values.
#[derive(Clone)]
pub struct Bus {
    pub(crate) id: Uuid,
    pub(crate) shared: Arc<BusShared>,
    pub(crate) jobs: JobSender,
}

impl Bus {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn set_gain(&self, gain: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.buses.set_gain(id, gain);
            Ok(())
        });
    }

    pub fn set_pitch(&self, pitch: f32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.buses.set_pitch(id, pitch);
            Ok(())
        });
    }

    pub fn set_priority_bias(&self, bias: i32) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.buses.set_priority_bias(id, bias);
            Ok(())
        });
    }

    pub fn set_muted(&self, muted: bool) {
        let id = self.id;
        self.jobs.post(move |core| {
            core.buses.set_muted(id, muted);
            Ok(())
        });
    }

    pub fn effective_gain(&self) -> f32 {
        self.shared.gain.get()
    }

    pub fn effective_pitch(&self) -> f32 {
        self.shared.pitch.get()
    }

    pub fn effective_priority_bias(&self) -> i32 {
        self.shared.priority_bias.load(Ordering::Relaxed)
    }

    pub fn effective_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobQueue;

    fn tree() -> BusTree {
        let (jobs, _queue) = JobQueue::channel();
        BusTree::new(jobs)
    }

    #[test]
    fn test_gain_cascade() {
        let mut tree = tree();
        let sfx = tree.resolve_or_create("sfx");
        let guns = tree.resolve_or_create("sfx/guns");
        tree.set_gain(sfx, 0.5);
        tree.set_gain(guns, 0.5);
        assert!((tree.values(guns).unwrap().gain - 0.25).abs() < 1e-6);

        tree.set_muted(sfx, true);
        assert_eq!(tree.values(guns).unwrap().gain, 0.0);
        assert!(tree.values(guns).unwrap().muted);

        tree.set_muted(sfx, false);
        assert!((tree.values(guns).unwrap().gain - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_path_parsing() {
        let mut tree = tree();
        let a = tree.resolve_or_create("/music//ambient/");
        let b = tree.lookup("music/ambient").unwrap();
        assert_eq!(a, b);
        assert_eq!(tree.lookup(""), Some(tree.master_id()));
        assert_eq!(tree.resolve_or_create(""), tree.master_id());
        assert!(tree.lookup("music/missing").is_none());
    }

    #[test]
    fn test_delete_subtree() {
        let mut tree = tree();
        tree.resolve_or_create("sfx/guns/pistol");
        assert!(tree.delete("sfx/guns"));
        assert!(tree.lookup("sfx/guns").is_none());
        assert!(tree.lookup("sfx/guns/pistol").is_none());
        assert!(tree.lookup("sfx").is_some());
        assert!(!tree.delete("sfx/guns"));
        assert!(!tree.delete(""));
    }

    #[test]
    fn test_version_bumps_propagate() {
        let mut tree = tree();
        let sfx = tree.resolve_or_create("sfx");
        let guns = tree.resolve_or_create("sfx/guns");
        let before = tree.version(guns).unwrap();
        tree.set_pitch(sfx, 2.0);
        assert!(tree.version(guns).unwrap() > before);
        assert!((tree.values(guns).unwrap().pitch - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamps() {
        let mut tree = tree();
        let sfx = tree.resolve_or_create("sfx");
        tree.set_gain(sfx, -2.0);
        assert_eq!(tree.values(sfx).unwrap().gain, 0.0);
        tree.set_pitch(sfx, 0.0);
        assert!(tree.values(sfx).unwrap().pitch > 0.0);
    }

    /// After a random mutation sequence every cached effective value must
    /// equal a recomputation from scratch.
    #[test]
    fn test_random_mutations_match_recompute() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x50_4e4f);

        let mut tree = tree();
        let paths = [
            "sfx",
            "sfx/guns",
            "sfx/guns/pistol",
            "sfx/steps",
            "music",
            "music/combat",
        ];
        let ids: Vec<Uuid> = paths.iter().map(|p| tree.resolve_or_create(p)).collect();

        for _ in 0..500 {
            let id = ids[rng.gen_range(0..ids.len())];
            match rng.gen_range(0..4) {
                0 => tree.set_gain(id, rng.gen_range(0.0..2.0)),
                1 => tree.set_pitch(id, rng.gen_range(0.01..4.0)),
                2 => tree.set_priority_bias(id, rng.gen_range(-10..10)),
                _ => tree.set_muted(id, rng.gen_bool(0.3)),
            }

            for &id in &ids {
                let expected = recompute_from_scratch(&tree, id);
                let cached = *tree.values(id).unwrap();
                assert!((cached.gain - expected.gain).abs() < 1e-4);
                assert!((cached.pitch - expected.pitch).abs() < 1e-4);
                assert_eq!(cached.priority_bias, expected.priority_bias);
                assert_eq!(cached.muted, expected.muted);
            }
        }
    }

    fn recompute_from_scratch(tree: &BusTree, id: Uuid) -> BusValues {
        let node = &tree.nodes[&id];
        let parent = node
            .parent
            .map(|p| recompute_from_scratch(tree, p))
            .unwrap_or(BusValues::IDENTITY);
        BusValues::inherit(&parent, &node.local)
    }
}
