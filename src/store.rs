//! The single owner of learned and configured data.
//!
//! `CadenceStore` wraps the profile and recording stores so that every
//! mutation goes through one place: it bumps a revision (used by the
//! persistence writer to decide whether anything is dirty) and publishes a
//! `StoreChange` to any subscriber.

use crate::document::Document;
use crate::key::EntityKey;
use crate::profile::{BASE_PHASE, EntityProfile, ProfileStore, StyleBlock, StyleKind, Touch};
use crate::recording::{
    AttackStyle, RecordingRow, RecordingStore, Sighting, SignalClass, SignalRows,
};
use crate::{SignalId, Tick, VariantId};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Notification published after every store mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Profile(String),
    Recording(String),
    Delete(String),
    Reset,
    Import,
    Save,
}

/// Rejected user edit. The store is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    UnknownProfile(String),
    UnknownPhase { key: String, phase: String },
    ReservedPhaseName,
    EmptyPhaseName,
    DuplicatePhase { key: String, phase: String },
}

impl std::fmt::Display for EditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownProfile(k) => write!(f, "Unknown profile: {}", k),
            Self::UnknownPhase { key, phase } => write!(f, "Unknown phase '{}' on {}", phase, key),
            Self::ReservedPhaseName => write!(f, "Phase name '{}' is reserved", BASE_PHASE),
            Self::EmptyPhaseName => write!(f, "Phase name is empty"),
            Self::DuplicatePhase { key, phase } => {
                write!(f, "Phase '{}' already exists on {}", phase, key)
            }
        }
    }
}

impl std::error::Error for EditError {}

#[derive(Default)]
pub struct CadenceStore {
    profiles: ProfileStore,
    recording: RecordingStore,
    revision: u64,
    subscribers: Vec<Sender<StoreChange>>,
    /// Tick of the last passive `Recording` notice per entity
    recording_noticed: HashMap<String, Tick>,
}

impl CadenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: Document) -> Self {
        let mut store = Self::new();
        store.load(doc);
        store
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn recording(&self) -> &RecordingStore {
        &self.recording
    }

    /// Monotonic mutation counter
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Subscribe to change notifications. A full queue drops notifications.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<StoreChange> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, change: StoreChange) {
        self.revision += 1;
        self.notify(change);
    }

    fn notify(&mut self, change: StoreChange) {
        self.subscribers.retain(|tx| match tx.try_send(change.clone()) {
            Ok(_) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Publish a save marker without bumping the data revision.
    pub(crate) fn notify_saved(&mut self) {
        self.subscribers
            .retain(|tx| !matches!(tx.try_send(StoreChange::Save), Err(TrySendError::Disconnected(_))));
    }

    // ------------------------------------------------------------------
    // Learning paths
    // ------------------------------------------------------------------

    /// Profile for a live identity, created on first sight.
    pub fn touch_profile(
        &mut self,
        name: &str,
        level: i32,
        variant: Option<VariantId>,
    ) -> (EntityKey, Touch) {
        let (profile, touch) = self.profiles.get_or_create_by_identity(name, level, variant);
        let key = EntityKey {
            name: profile.name.clone(),
            level: profile.level,
            key: profile.key.clone(),
        };
        if touch.created {
            info!(key = %key, "Created profile");
        }
        if touch.changed() {
            self.publish(StoreChange::Profile(key.key.clone()));
        }
        (key, touch)
    }

    pub fn record_observation(&mut self, key: &str, signal: SignalId, now: Tick) -> Sighting {
        let sighting = self.recording.record_observation(key, signal, now);
        self.revision += 1;
        // Passive sightings notify at most once per entity per tick.
        if self.recording_noticed.insert(key.to_string(), now) != Some(now) {
            self.notify(StoreChange::Recording(key.to_string()));
        }
        sighting
    }

    /// Sample a signal-to-confirmation latency; returns the updated row.
    pub fn record_confirm_latency(&mut self, key: &str, signal: SignalId, delta: i64) -> &RecordingRow {
        self.recording.get_or_create(key, signal).push_confirm_latency(delta);
        self.publish(StoreChange::Recording(key.to_string()));
        self.recording.get_or_create(key, signal)
    }

    /// Write a learned cadence into one block's per-signal override.
    ///
    /// Selects the signal if the block has none. Returns false when the
    /// profile or phase is gone or a user override is in the way.
    pub fn promote_learned(
        &mut self,
        key: &str,
        phase: &str,
        kind: StyleKind,
        signal: SignalId,
        ticks: i32,
    ) -> bool {
        let Some(block) = self
            .profiles
            .get_mut(key)
            .and_then(|p| p.phase_mut(phase))
            .map(|p| p.block_mut(kind))
        else {
            return false;
        };

        if block.selected_signal.is_none() {
            block.select(Some(signal));
        }
        let promoted = block.promote_learned_ticks(signal, ticks);
        if promoted {
            debug!(key, phase, style = kind.name(), signal, ticks, "Promoted learned cadence");
            self.publish(StoreChange::Profile(key.to_string()));
        }
        promoted
    }

    // ------------------------------------------------------------------
    // Recording edits
    // ------------------------------------------------------------------

    pub fn set_class(&mut self, key: &str, signal: SignalId, class: SignalClass) {
        self.recording.set_class(key, signal, class);
        self.publish(StoreChange::Recording(key.to_string()));
    }

    pub fn set_style(&mut self, key: &str, signal: SignalId, style: AttackStyle) {
        self.recording.set_style(key, signal, style);
        self.publish(StoreChange::Recording(key.to_string()));
    }

    pub fn set_user_ticks(&mut self, key: &str, signal: SignalId, ticks: Option<i32>) {
        self.recording.set_user_ticks(key, signal, ticks);
        self.publish(StoreChange::Recording(key.to_string()));
    }

    pub fn set_user_projectile_speed(&mut self, key: &str, signal: SignalId, speed: Option<i32>) {
        self.recording.set_user_projectile_speed(key, signal, speed);
        self.publish(StoreChange::Recording(key.to_string()));
    }

    pub fn record_projectile_speed(&mut self, key: &str, signal: SignalId, speed: i32) -> bool {
        let pushed = self.recording.record_projectile_speed(key, signal, speed);
        if pushed {
            self.publish(StoreChange::Recording(key.to_string()));
        }
        pushed
    }

    pub fn remove_row(&mut self, key: &str, signal: SignalId) -> Option<RecordingRow> {
        let removed = self.recording.remove_row(key, signal)?;
        self.publish(StoreChange::Recording(key.to_string()));
        Some(removed)
    }

    // ------------------------------------------------------------------
    // Profile edits
    // ------------------------------------------------------------------

    /// Full replace of a profile.
    pub fn put_profile(&mut self, profile: EntityProfile) {
        let key = profile.key.clone();
        self.profiles.put(profile);
        self.publish(StoreChange::Profile(key));
    }

    pub fn add_phase(&mut self, key: &str, name: &str) -> Result<(), EditError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EditError::EmptyPhaseName);
        }
        if name.eq_ignore_ascii_case(BASE_PHASE) {
            return Err(EditError::ReservedPhaseName);
        }

        let profile = self
            .profiles
            .get_mut(key)
            .ok_or_else(|| EditError::UnknownProfile(key.to_string()))?;
        if profile.phases.contains(name) {
            return Err(EditError::DuplicatePhase {
                key: key.to_string(),
                phase: name.to_string(),
            });
        }
        profile.phases.insert(name, Default::default());

        self.publish(StoreChange::Profile(key.to_string()));
        Ok(())
    }

    pub fn remove_phase(&mut self, key: &str, name: &str) -> Result<(), EditError> {
        if name == BASE_PHASE {
            return Err(EditError::ReservedPhaseName);
        }
        let profile = self
            .profiles
            .get_mut(key)
            .ok_or_else(|| EditError::UnknownProfile(key.to_string()))?;
        profile
            .phases
            .remove(name)
            .ok_or_else(|| EditError::UnknownPhase {
                key: key.to_string(),
                phase: name.to_string(),
            })?;

        self.publish(StoreChange::Profile(key.to_string()));
        Ok(())
    }

    pub fn set_phase_triggers(
        &mut self,
        key: &str,
        phase: &str,
        signals: impl IntoIterator<Item = SignalId>,
        variants: impl IntoIterator<Item = VariantId>,
    ) -> Result<(), EditError> {
        let target = self.phase_mut(key, phase)?;
        target.trigger_signals = signals.into_iter().filter(|&s| s > 0).collect();
        target.trigger_variants = variants.into_iter().filter(|&v| v > 0).collect();

        self.publish(StoreChange::Profile(key.to_string()));
        Ok(())
    }

    /// Edit exactly one (phase, style) block.
    pub fn edit_block<R>(
        &mut self,
        key: &str,
        phase: &str,
        kind: StyleKind,
        edit: impl FnOnce(&mut StyleBlock) -> R,
    ) -> Result<R, EditError> {
        let out = edit(self.phase_mut(key, phase)?.block_mut(kind));
        self.publish(StoreChange::Profile(key.to_string()));
        Ok(out)
    }

    fn phase_mut(
        &mut self,
        key: &str,
        phase: &str,
    ) -> Result<&mut crate::profile::PhaseProfile, EditError> {
        let profile = self
            .profiles
            .get_mut(key)
            .ok_or_else(|| EditError::UnknownProfile(key.to_string()))?;
        profile.phase_mut(phase).ok_or_else(|| EditError::UnknownPhase {
            key: key.to_string(),
            phase: phase.to_string(),
        })
    }

    pub fn clear_selections(&mut self, key: &str) -> Result<(), EditError> {
        self.profiles
            .get_mut(key)
            .ok_or_else(|| EditError::UnknownProfile(key.to_string()))?
            .clear_selections();
        self.publish(StoreChange::Profile(key.to_string()));
        Ok(())
    }

    /// Forget everything learned about an entity but keep its sighting counts.
    pub fn relearn(&mut self, key: &str) -> bool {
        let had_rows = self.recording.relearn(key);
        let had_profile = match self.profiles.get_mut(key) {
            Some(p) => {
                p.clear_selections();
                true
            }
            None => false,
        };
        if had_rows || had_profile {
            info!(key, "Relearning entity");
            self.publish(StoreChange::Profile(key.to_string()));
        }
        had_rows || had_profile
    }

    /// Remove a profile together with all of its recording rows.
    pub fn delete_profile(&mut self, key: &str) -> bool {
        let profile = self.profiles.remove(key);
        let rows = self.recording.remove_entity(key);
        self.recording_noticed.remove(key);
        let existed = profile.is_some() || rows.is_some();
        if existed {
            info!(key, "Deleted profile");
            self.publish(StoreChange::Delete(key.to_string()));
        }
        existed
    }

    pub fn reset_all(&mut self) {
        self.profiles.clear();
        self.recording.clear();
        self.recording_noticed.clear();
        info!("Reset all profiles and recordings");
        self.publish(StoreChange::Reset);
    }

    // ------------------------------------------------------------------
    // Document conversion
    // ------------------------------------------------------------------

    /// Replace the whole state with a loaded document.
    pub fn import(&mut self, doc: Document) {
        self.load(doc);
        self.publish(StoreChange::Import);
    }

    fn load(&mut self, doc: Document) {
        let Document {
            profiles, recording, ..
        } = doc;
        self.profiles = ProfileStore::from_profiles(profiles);
        self.recording = RecordingStore::from_rows(recording);
    }

    pub fn to_document(&self) -> Document {
        let recording: BTreeMap<String, SignalRows> = self
            .recording
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(k, rows)| (k.clone(), rows.clone()))
            .collect();
        Document::new(self.profiles.snapshot(), recording)
    }
}
