//! World-space listener, committed to the backend once per tick.

use crate::backend::{Backend, ListenerFrame};
use crate::math::{Orientation, Vec3};

pub(crate) struct Listener {
    frame: ListenerFrame,
    dirty: bool,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            frame: ListenerFrame::default(),
            // Commit the identity frame on the first tick.
            dirty: true,
        }
    }

    pub fn set_transform(&mut self, position: Vec3, velocity: Vec3) {
        if self.frame.position != position || self.frame.velocity != velocity {
            self.frame.position = position;
            self.frame.velocity = velocity;
            self.dirty = true;
        }
    }

    pub fn set_orientation(&mut self, orientation: Orientation) {
        if self.frame.forward != orientation.forward || self.frame.up != orientation.up {
            self.frame.forward = orientation.forward;
            self.frame.up = orientation.up;
            self.dirty = true;
        }
    }

    /// Write the frame if it changed. A transient backend failure keeps the
    /// frame dirty so the write is retried next tick.
    pub fn apply(&mut self, backend: &mut dyn Backend) {
        if !self.dirty {
            return;
        }
        match backend.set_listener(&self.frame) {
            Ok(()) => self.dirty = false,
            Err(e) => log::warn!("listener commit failed, retrying next tick: {}", e),
        }
    }
}
