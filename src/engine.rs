//! The runtime scheduler.
//!
//! `CadenceEngine` owns the store, the live instance table and the feedback
//! tagger, and turns observation inputs into tracker updates and a fresh
//! snapshot per scheduling tick. Everything runs on the caller's thread one
//! event at a time; only persistence is handed off to the writer thread.

use crate::config::EngineConfig;
use crate::event::{InstanceDescriptor, Observation};
use crate::feedback::{FeedbackTagger, TagOutcome, TaggerStats};
use crate::persist::{
    BackupSink, ConfigStore, FileBackup, FileConfigStore, FlushReport, FlushTicket,
    LoadSource, MemoryConfigStore, PersistError, PersistenceWriter, WriterStats, load_document,
};
use crate::phase;
use crate::profile::BASE_PHASE;
use crate::projector::{Snapshot, ViewProjector, governing_block};
use crate::registry::{Displaced, InstanceRegistry, InstanceState, RegistryStats};
use crate::store::{CadenceStore, EditError};
use crate::{InstanceId, SignalId, Tick, VariantId};
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Input counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    /// Every signal offered, including ignored ones
    pub signals: u64,
    /// Signals dropped: idle id, unknown instance or recording disabled
    pub ignored: u64,
    /// Harm on the subject
    pub confirmations: u64,
    /// Selected-signal sightings that restarted a countdown
    pub occurrences: u64,
    pub phase_changes: u64,
    pub ticks: u64,
}

pub struct CadenceEngine {
    config: EngineConfig,
    store: CadenceStore,
    registry: InstanceRegistry,
    tagger: FeedbackTagger,
    projector: ViewProjector,
    writer: Option<PersistenceWriter>,
    /// Revision last handed to the writer
    queued_revision: Option<u64>,
    /// Revision last confirmed written by an explicit flush
    saved_revision: u64,
    /// Writer failures already accounted for
    seen_failures: u64,
    snapshot: Arc<Snapshot>,
    counters: EngineCounters,
}

impl CadenceEngine {
    /// Engine over an empty in-memory store with no persistence.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, CadenceStore::new())
    }

    pub fn with_store(config: EngineConfig, store: CadenceStore) -> Self {
        Self {
            registry: InstanceRegistry::with_config(config.registry.clone()),
            tagger: FeedbackTagger::new(config.auto_tag.clone()),
            projector: ViewProjector::new(config.stale_factor, config.countdown_minus_one),
            queued_revision: Some(store.revision()),
            saved_revision: store.revision(),
            seen_failures: 0,
            store,
            writer: None,
            snapshot: Arc::new(Snapshot::default()),
            counters: EngineCounters::default(),
            config,
        }
    }

    /// Load from the configured files and start the writer.
    ///
    /// Without a `store_path` the primary store is in-memory only.
    pub fn open(config: EngineConfig) -> Result<Self, PersistError> {
        let p = &config.persistence;
        let primary: Arc<dyn ConfigStore> = match &p.store_path {
            Some(path) => Arc::new(FileConfigStore::new(path)),
            None => Arc::new(MemoryConfigStore::new()),
        };
        let backup = p
            .backup_path
            .as_ref()
            .map(|path| Arc::new(FileBackup::new(path)) as Arc<dyn BackupSink>);
        Self::open_with(config, primary, backup)
    }

    pub fn open_with(
        config: EngineConfig,
        primary: Arc<dyn ConfigStore>,
        backup: Option<Arc<dyn BackupSink>>,
    ) -> Result<Self, PersistError> {
        let (doc, source) = load_document(
            primary.as_ref(),
            backup.as_deref(),
            &config.persistence.group,
            &config.persistence.key,
        );
        if source == LoadSource::Empty {
            debug!("No saved profiles");
        }

        let writer = PersistenceWriter::spawn(&config.persistence, primary, backup)?;
        let mut engine = Self::with_store(config, CadenceStore::from_document(doc));
        engine.writer = Some(writer);
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &CadenceStore {
        &self.store
    }

    /// Direct access for the documented edit operations.
    pub fn store_mut(&mut self) -> &mut CadenceStore {
        &mut self.store
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn instance(&self, id: InstanceId) -> Option<&InstanceState> {
        self.registry.get(id)
    }

    /// Snapshot computed at the last scheduling tick
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.clone()
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn tagger_stats(&self) -> Arc<TaggerStats> {
        self.tagger.stats()
    }

    pub fn writer_stats(&self) -> Option<Arc<WriterStats>> {
        self.writer.as_ref().map(PersistenceWriter::stats)
    }

    pub fn set_recording_enabled(&mut self, enabled: bool) {
        self.config.recording_enabled = enabled;
    }

    pub fn set_auto_tag_enabled(&mut self, enabled: bool) {
        self.config.auto_tag.enabled = enabled;
        self.tagger.set_enabled(enabled);
    }

    // ------------------------------------------------------------------
    // Observation inputs
    // ------------------------------------------------------------------

    pub fn apply(&mut self, obs: Observation) {
        match obs {
            Observation::InstanceAppeared(desc) => self.on_instance_appeared(desc),
            Observation::InstanceDisappeared { instance } => self.on_instance_disappeared(instance),
            Observation::TargetChanged {
                instance,
                still_targeting,
            } => self.on_target_relationship_changed(instance, still_targeting),
            Observation::SignalObserved {
                instance,
                signal,
                tick,
            } => self.on_signal_observed(instance, signal, tick),
            Observation::VariantChanged { instance, variant } => {
                self.on_variant_changed(instance, variant)
            }
            Observation::ProjectileObserved { instance, speed } => {
                self.on_projectile_observed(instance, speed)
            }
            Observation::Confirmation { on_subject, tick } => {
                self.on_confirmation_signal(on_subject, tick);
            }
            Observation::SchedulingTick { tick } => {
                self.on_scheduling_tick(tick);
            }
        }
    }

    pub fn on_instance_appeared(&mut self, desc: InstanceDescriptor) {
        let id = desc.instance;
        debug!(instance = id, name = %desc.name, level = desc.level, "Instance appeared");
        match self.registry.insert(InstanceState::new(desc)) {
            Some(Displaced::Evicted(old)) => {
                warn!(instance = old.id(), key = %old.key, "Instance table full; evicted least recently observed")
            }
            Some(Displaced::Replaced(_)) => debug!(instance = id, "Instance re-appeared"),
            None => {}
        }
    }

    pub fn on_instance_disappeared(&mut self, id: InstanceId) {
        if self.registry.remove(id).is_some() {
            debug!(instance = id, "Instance disappeared");
        }
    }

    pub fn on_target_relationship_changed(&mut self, id: InstanceId, still_targeting: bool) {
        let Some(state) = self.registry.get_mut(id) else {
            return;
        };
        state.targeting = still_targeting;
        if !still_targeting {
            state.tracker.reset();
            debug!(instance = id, "Target lost; cadence reset");
        }
    }

    pub fn on_signal_observed(&mut self, id: InstanceId, signal: SignalId, now: Tick) {
        self.counters.signals += 1;
        if !self.config.recording_enabled || signal <= 0 {
            self.counters.ignored += 1;
            return;
        }
        let Some(state) = self.registry.touch(id) else {
            self.counters.ignored += 1;
            return;
        };

        let variant = state.descriptor.variant;
        let (key, _) = self
            .store
            .touch_profile(&state.descriptor.name, state.descriptor.level, variant);

        let selects_block = match self.store.profiles().get(&key.key) {
            Some(profile) => {
                if let Some(next) =
                    phase::evaluate_triggers(profile, &state.active_phase, signal, variant)
                {
                    info!(instance = id, key = %key, from = %state.active_phase, to = %next, "Phase change");
                    state.active_phase = next;
                    self.counters.phase_changes += 1;
                }
                phase::resolve_phase(profile, &mut state.active_phase)
                    .block_selecting(signal)
                    .is_some()
            }
            None => false,
        };

        let sighting = self.store.record_observation(&key.key, signal, now);
        if let Some(gap) = sighting.gap {
            debug!(instance = id, signal, gap, "Attack gap sampled");
        }
        state.note_sighting(signal, now);

        if selects_block {
            state.tracker.confirm_occurrence(now);
            self.counters.occurrences += 1;
        }
    }

    /// Form change of a live instance. The cadence is kept; only variant
    /// triggers are re-evaluated.
    pub fn on_variant_changed(&mut self, id: InstanceId, variant: VariantId) {
        let Some(state) = self.registry.touch(id) else {
            return;
        };
        if state.descriptor.variant == Some(variant) {
            return;
        }
        debug!(instance = id, from = ?state.descriptor.variant, to = variant, "Variant changed");
        state.descriptor.variant = Some(variant);

        let key = if self.config.recording_enabled {
            self.store
                .touch_profile(&state.descriptor.name, state.descriptor.level, Some(variant))
                .0
                .key
        } else {
            state.key.key.clone()
        };
        let Some(profile) = self.store.profiles().get(&key) else {
            return;
        };
        if let Some(next) = phase::evaluate_variant_triggers(profile, &state.active_phase, variant) {
            info!(instance = id, key = %key, from = %state.active_phase, to = %next, variant, "Phase change");
            state.active_phase = next;
            self.counters.phase_changes += 1;
        }
    }

    pub fn on_projectile_observed(&mut self, id: InstanceId, speed: i32) {
        if !self.config.recording_enabled {
            return;
        }
        let Some(state) = self.registry.get(id) else {
            return;
        };
        if let Some(signal) = state.last_signal() {
            let key = state.key.key.clone();
            self.store.record_projectile_speed(&key, signal, speed);
        }
    }

    /// Attribute harm on the subject to the targeting instance with the
    /// most recent unconfirmed sighting at or before `now`.
    pub fn on_confirmation_signal(&mut self, on_subject: bool, now: Tick) -> Option<TagOutcome> {
        if !on_subject {
            return None;
        }
        self.counters.confirmations += 1;

        let source = self
            .registry
            .iter()
            .filter(|s| s.targeting)
            .filter_map(|s| {
                s.last_sighting
                    .filter(|l| !l.confirmed && l.tick <= now)
                    .map(|l| (l.tick, Reverse(s.id())))
            })
            .max()
            .map(|(_, Reverse(id))| id)?;

        let state = self.registry.get_mut(source)?;
        let outcome = self.tagger.on_confirmation_signal(&mut self.store, state, now);
        debug!(instance = source, ?outcome, "Confirmation handled");
        Some(outcome)
    }

    pub fn on_scheduling_tick(&mut self, now: Tick) -> Arc<Snapshot> {
        self.counters.ticks += 1;
        self.clear_stale_phases();

        let due: Vec<(InstanceId, i32)> = self
            .registry
            .iter()
            .filter_map(|s| {
                let interval = governing_block(&self.store, s)?.interval?;
                Some((s.id(), interval))
            })
            .collect();
        for (id, interval) in due {
            if let Some(state) = self.registry.get_mut(id) {
                state.tracker.auto_advance(now, interval);
            }
        }

        self.snapshot = Arc::new(self.projector.project(&self.store, &self.registry, now));
        self.persist_if_dirty();
        self.snapshot.clone()
    }

    /// Send instances whose active phase was removed back to base, so a
    /// phase re-added under the same name is not re-entered silently.
    fn clear_stale_phases(&mut self) {
        for state in self.registry.iter_mut() {
            if state.active_phase == BASE_PHASE {
                continue;
            }
            match self.store.profiles().get(&state.key.key) {
                Some(profile) => {
                    phase::resolve_phase(profile, &mut state.active_phase);
                }
                None => state.active_phase = BASE_PHASE.to_string(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Edits that also touch live instances
    // ------------------------------------------------------------------

    /// Remove a named phase and move every instance that was in it back to base.
    pub fn remove_phase(&mut self, key: &str, name: &str) -> Result<(), EditError> {
        self.store.remove_phase(key, name)?;
        for state in self.registry.iter_mut() {
            if state.key.key == key && state.active_phase == name {
                state.active_phase = BASE_PHASE.to_string();
            }
        }
        Ok(())
    }

    pub fn delete_profile(&mut self, key: &str) -> bool {
        let deleted = self.store.delete_profile(key);
        if deleted {
            for state in self.registry.iter_mut().filter(|s| s.key.key == key) {
                state.active_phase = BASE_PHASE.to_string();
                state.tracker.reset();
            }
        }
        deleted
    }

    pub fn reset_all(&mut self) {
        self.store.reset_all();
        for state in self.registry.iter_mut() {
            state.active_phase = BASE_PHASE.to_string();
            state.tracker.reset();
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn persist_if_dirty(&mut self) {
        let Some(writer) = &self.writer else {
            return;
        };
        // A failed write leaves its revision unsaved; queue it again.
        let failures = writer.stats().failures.load(Ordering::Relaxed);
        if failures != self.seen_failures {
            warn!(failures, "Save failed; will retry");
            self.seen_failures = failures;
            self.queued_revision = None;
        }

        let revision = self.store.revision();
        if self.queued_revision == Some(revision) {
            return;
        }
        if writer.mark_dirty(self.store.to_document()) {
            self.queued_revision = Some(revision);
        }
    }

    /// Queue an immediate save. The ticket may be dropped without blocking.
    ///
    /// The store counts as saved only once [`save_now`](Self::save_now)
    /// sees the write succeed.
    pub fn request_save(&mut self) -> Result<FlushTicket, PersistError> {
        let writer = self.writer.as_ref().ok_or(PersistError::Disabled)?;
        let ticket = writer.request_flush(self.store.to_document())?;
        self.queued_revision = Some(self.store.revision());
        Ok(ticket)
    }

    /// Save and wait for the write to finish.
    pub fn save_now(&mut self) -> Result<FlushReport, PersistError> {
        let revision = self.store.revision();
        let report = self.request_save()?.wait()?;
        self.saved_revision = revision;
        self.store.notify_saved();
        info!(bytes = report.bytes, written = report.written, "Saved profiles");
        Ok(report)
    }

    /// Flush pending state and stop the writer.
    pub fn shutdown(mut self) {
        if self.writer.is_some() && self.store.revision() != self.saved_revision {
            if let Err(e) = self.save_now() {
                warn!(error = %e, "Final save failed");
            }
        }
        if let Some(writer) = self.writer.take() {
            writer.shutdown();
        }
    }
}
