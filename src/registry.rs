//! Live instance table with bounded capacity.
//!
//! Instances are stored in an arena of slots with a free list, plus an
//! ordered index from instance id to slot. Appearance inserts, disappearance
//! removes; nothing here outlives the instance it describes. When a capacity
//! is configured, inserting past it evicts the least recently observed
//! instance.

use crate::event::InstanceDescriptor;
use crate::key::EntityKey;
use crate::profile::BASE_PHASE;
use crate::tracker::CadenceTracker;
use crate::{InstanceId, SignalId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for the instance registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of live instances; 0 means unbounded
    pub max_instances: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_instances: 256 }
    }
}

/// Most recent signal observed on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSighting {
    pub signal: SignalId,
    pub tick: Tick,
    /// Already consumed by a confirmation
    pub confirmed: bool,
}

/// Runtime state of one live instance. Never persisted.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub descriptor: InstanceDescriptor,
    pub key: EntityKey,
    pub tracker: CadenceTracker,
    pub active_phase: String,
    pub last_sighting: Option<LastSighting>,
    pub targeting: bool,
    /// Tick of the last observed signal of any kind
    pub last_observed_tick: Option<Tick>,
    touched: u64,
}

impl InstanceState {
    pub fn new(descriptor: InstanceDescriptor) -> Self {
        let key = EntityKey::of(&descriptor.name, descriptor.level);
        Self {
            descriptor,
            key,
            tracker: CadenceTracker::new(),
            active_phase: BASE_PHASE.to_string(),
            last_sighting: None,
            targeting: false,
            last_observed_tick: None,
            touched: 0,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.descriptor.instance
    }

    pub fn note_sighting(&mut self, signal: SignalId, tick: Tick) {
        self.last_sighting = Some(LastSighting {
            signal,
            tick,
            confirmed: false,
        });
        self.last_observed_tick = Some(tick);
    }

    /// Last signal, if any, regardless of confirmation
    pub fn last_signal(&self) -> Option<SignalId> {
        self.last_sighting.map(|s| s.signal)
    }
}

/// Lifecycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub live: usize,
    pub appeared: u64,
    pub disappeared: u64,
    pub replaced: u64,
    pub evictions: u64,
    pub capacity: usize,
}

/// Why an instance left the table during an insert
#[derive(Debug)]
pub enum Displaced {
    Replaced(InstanceState),
    Evicted(InstanceState),
}

pub struct InstanceRegistry {
    slots: Vec<Option<InstanceState>>,
    free: Vec<usize>,
    index: BTreeMap<InstanceId, usize>,
    config: RegistryConfig,
    stats: RegistryStats,
    clock: u64,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            slots: Vec::with_capacity(config.max_instances.min(1024)),
            free: Vec::new(),
            index: BTreeMap::new(),
            stats: RegistryStats {
                capacity: config.max_instances,
                ..Default::default()
            },
            config,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.len(),
            ..self.stats.clone()
        }
    }

    fn is_full(&self) -> bool {
        self.config.max_instances > 0 && self.index.len() >= self.config.max_instances
    }

    fn tick_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Register an instance. Re-appearance of a live id replaces its slot.
    pub fn insert(&mut self, mut state: InstanceState) -> Option<Displaced> {
        state.touched = self.tick_clock();
        self.stats.appeared += 1;
        let id = state.id();

        if let Some(&slot) = self.index.get(&id) {
            self.stats.replaced += 1;
            return self.slots[slot]
                .replace(state)
                .map(Displaced::Replaced);
        }

        let evicted = if self.is_full() {
            self.evict_one().map(Displaced::Evicted)
        } else {
            None
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(state);
                slot
            }
            None => {
                self.slots.push(Some(state));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);

        evicted
    }

    fn evict_one(&mut self) -> Option<InstanceState> {
        let candidate = self
            .index
            .iter()
            .filter_map(|(&id, &slot)| self.slots[slot].as_ref().map(|s| (id, s.touched)))
            .min_by_key(|&(_, touched)| touched)
            .map(|(id, _)| id)?;

        let evicted = self.take(candidate)?;
        self.stats.evictions += 1;
        Some(evicted)
    }

    fn take(&mut self, id: InstanceId) -> Option<InstanceState> {
        let slot = self.index.remove(&id)?;
        let state = self.slots[slot].take();
        self.free.push(slot);
        state
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<InstanceState> {
        let state = self.take(id)?;
        self.stats.disappeared += 1;
        Some(state)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: InstanceId) -> Option<&InstanceState> {
        let slot = *self.index.get(&id)?;
        self.slots[slot].as_ref()
    }

    /// Mutable access without counting as an observation.
    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut InstanceState> {
        let slot = *self.index.get(&id)?;
        self.slots[slot].as_mut()
    }

    /// Mutable access that marks the instance as recently observed.
    pub fn touch(&mut self, id: InstanceId) -> Option<&mut InstanceState> {
        let now = self.tick_clock();
        let state = self.get_mut(id)?;
        state.touched = now;
        Some(state)
    }

    /// Live instances in instance-id order
    pub fn iter(&self) -> impl Iterator<Item = &InstanceState> {
        self.index
            .values()
            .filter_map(|&slot| self.slots[slot].as_ref())
    }

    /// Mutable iteration in slot order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InstanceState> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.index.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npc(instance: InstanceId, name: &str) -> InstanceState {
        InstanceState::new(InstanceDescriptor {
            instance,
            name: name.to_string(),
            level: 100,
            variant: None,
        })
    }

    #[test]
    fn test_basic_lifecycle() {
        let mut registry = InstanceRegistry::new();
        assert!(registry.insert(npc(7, "Vorkath")).is_none());
        assert!(registry.insert(npc(3, "Zulrah")).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(7).unwrap().key.key, "vorkath#100");
        assert_eq!(registry.get(3).unwrap().active_phase, BASE_PHASE);

        let gone = registry.remove(7).unwrap();
        assert_eq!(gone.id(), 7);
        assert!(!registry.contains(7));
        assert!(registry.remove(7).is_none());
        assert_eq!(registry.stats().disappeared, 1);
    }

    #[test]
    fn test_iteration_ordered_by_id() {
        let mut registry = InstanceRegistry::new();
        for id in [9, 2, 5] {
            registry.insert(npc(id, "Goblin"));
        }
        registry.remove(2);
        registry.insert(npc(1, "Goblin"));

        let ids: Vec<_> = registry.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![1, 5, 9]);
        // Freed slot reused.
        assert_eq!(registry.slots.len(), 3);
    }

    #[test]
    fn test_reappearance_replaces_state() {
        let mut registry = InstanceRegistry::new();
        registry.insert(npc(4, "Jad"));
        registry.get_mut(4).unwrap().tracker.confirm_occurrence(10);

        let displaced = registry.insert(npc(4, "Jad"));
        assert!(matches!(displaced, Some(Displaced::Replaced(_))));
        assert!(!registry.get(4).unwrap().tracker.is_confirmed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_eviction_prefers_least_recently_observed() {
        let mut registry = InstanceRegistry::with_config(RegistryConfig { max_instances: 3 });
        registry.insert(npc(1, "a"));
        registry.insert(npc(2, "b"));
        registry.insert(npc(3, "c"));

        registry.touch(1);
        registry.touch(3);

        match registry.insert(npc(4, "d")) {
            Some(Displaced::Evicted(state)) => assert_eq!(state.id(), 2),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.stats().evictions, 1);
    }

    #[test]
    fn test_unbounded_when_zero() {
        let mut registry = InstanceRegistry::with_config(RegistryConfig { max_instances: 0 });
        for id in 0..500 {
            assert!(registry.insert(npc(id, "rat")).is_none());
        }
        assert_eq!(registry.len(), 500);
    }
}
