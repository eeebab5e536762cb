//! Fixed-capacity free-list of backend source handles.

use crate::backend::SourceHandle;

pub(crate) struct SourcePool {
    free: Vec<SourceHandle>,
    all: Vec<SourceHandle>,
}

impl SourcePool {
    pub fn new(sources: Vec<SourceHandle>) -> Self {
        Self {
            free: sources.clone(),
            all: sources,
        }
    }

    pub fn rent(&mut self) -> Option<SourceHandle> {
        self.free.pop()
    }

    pub fn release(&mut self, source: SourceHandle) {
        debug_assert!(!self.free.contains(&source));
        self.free.push(source);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.all.len()
    }

    /// Every handle the pool was created with, rented or not. Used for bulk
    /// teardown on engine disposal.
    pub fn all_sources(&self) -> &[SourceHandle] {
        &self.all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_release_accounting() {
        let handles: Vec<SourceHandle> = (0..3u64).map(SourceHandle).collect();
        let mut pool = SourcePool::new(handles);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);

        let a = pool.rent().unwrap();
        let b = pool.rent().unwrap();
        assert_eq!(pool.available(), 1);

        pool.release(a);
        assert_eq!(pool.available(), 2);

        let _ = pool.rent().unwrap();
        let _ = pool.rent().unwrap();
        assert!(pool.rent().is_none());
        pool.release(b);
        assert_eq!(pool.available(), 1);
    }
}
