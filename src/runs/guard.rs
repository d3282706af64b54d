// src/runs/guard.rs

//! Checkpoint markers: at most one active execution per run.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Set of checkpoint keys that currently have an execution attached.
#[derive(Debug, Default)]
pub struct CheckpointMarkers {
    held: Mutex<HashSet<String>>,
}

impl CheckpointMarkers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`; `None` if another execution holds it.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<CheckpointGuard> {
        if !self.held().insert(key.to_string()) {
            return None;
        }
        Some(CheckpointGuard {
            markers: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held().contains(key)
    }
}

/// Releases its marker on drop, including when the holder panics.
#[derive(Debug)]
pub struct CheckpointGuard {
    markers: Arc<CheckpointMarkers>,
    key: String,
}

impl CheckpointGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        self.markers.held().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let markers = CheckpointMarkers::new();
        let guard = markers.try_acquire("s:1").expect("first acquire");
        assert!(markers.try_acquire("s:1").is_none());
        assert!(markers.try_acquire("s:2").is_some());

        drop(guard);
        assert!(!markers.is_held("s:1"));
        assert!(markers.try_acquire("s:1").is_some());
    }
}
