//! In-process memory tier, authoritative for the current session

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{normalize_owner, Position};

/// Session-scoped position cache keyed by owner.
///
/// Constructed explicitly and passed by reference; there is no hidden
/// process-wide state, so tests and account switches never leak entries
/// into each other.
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<String, Vec<Position>>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, owner: &str, positions: Vec<Position>) {
        self.entries
            .write()
            .unwrap()
            .insert(normalize_owner(owner), positions);
    }

    pub fn get(&self, owner: &str) -> Option<Vec<Position>> {
        self.entries
            .read()
            .unwrap()
            .get(&normalize_owner(owner))
            .cloned()
    }

    pub fn get_position(&self, owner: &str, id: u64) -> Option<Position> {
        self.entries
            .read()
            .unwrap()
            .get(&normalize_owner(owner))?
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub fn remove(&self, owner: &str) {
        self.entries.write().unwrap().remove(&normalize_owner(owner));
    }

    /// Drop everything; used on teardown and account switch.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
