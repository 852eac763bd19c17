//! Auto-tagging from confirmation signals.
//!
//! When harm lands on the subject shortly after an instance's last signal,
//! that signal is taken to be a real attack. The delay between the two is a
//! latency sample, kept apart from the swing-to-swing gaps. Optionally the
//! row's live cadence estimate is promoted into the instance's active phase.

use crate::phase;
use crate::profile::{BASE_PHASE, StyleKind};
use crate::recording::SignalClass;
use crate::registry::InstanceState;
use crate::store::CadenceStore;
use crate::{SignalId, Tick};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTagConfig {
    pub enabled: bool,
    /// Maximum ticks between a signal and the confirmation it explains
    pub window_ticks: i64,
    /// Write the learned estimate into the active profile
    pub promote: bool,
}

impl Default for AutoTagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ticks: 2,
            promote: true,
        }
    }
}

/// Statistics for confirmation handling
#[derive(Debug, Default)]
pub struct TaggerStats {
    pub received: AtomicU64,
    pub matched: AtomicU64,
    pub tagged: AtomicU64,
    pub promoted: AtomicU64,
    pub out_of_window: AtomicU64,
    pub unmatched: AtomicU64,
}

impl TaggerStats {
    pub fn snapshot(&self) -> TaggerStatsSnapshot {
        TaggerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            tagged: self.tagged.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            out_of_window: self.out_of_window.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of tagger stats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggerStatsSnapshot {
    pub received: u64,
    pub matched: u64,
    pub tagged: u64,
    pub promoted: u64,
    pub out_of_window: u64,
    pub unmatched: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Disabled,
    /// No unconfirmed sighting to attribute the confirmation to
    NoSighting,
    OutOfWindow { delta: Tick },
    Sampled {
        signal: SignalId,
        delta: Tick,
        /// Row moved from `Unknown` to `Attack`
        tagged: bool,
        promoted: Option<StyleKind>,
    },
}

pub struct FeedbackTagger {
    config: AutoTagConfig,
    stats: Arc<TaggerStats>,
}

impl FeedbackTagger {
    pub fn new(config: AutoTagConfig) -> Self {
        Self {
            config,
            stats: Arc::new(TaggerStats::default()),
        }
    }

    pub fn config(&self) -> &AutoTagConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn stats(&self) -> Arc<TaggerStats> {
        self.stats.clone()
    }

    pub fn on_confirmation_signal(
        &self,
        store: &mut CadenceStore,
        instance: &mut InstanceState,
        now: Tick,
    ) -> TagOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return TagOutcome::Disabled;
        }

        let Some(sighting) = instance.last_sighting.as_mut().filter(|s| !s.confirmed) else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            return TagOutcome::NoSighting;
        };

        let delta = now - sighting.tick;
        if delta < 0 || delta > self.config.window_ticks {
            self.stats.out_of_window.fetch_add(1, Ordering::Relaxed);
            return TagOutcome::OutOfWindow { delta };
        }
        sighting.confirmed = true;
        let signal = sighting.signal;
        self.stats.matched.fetch_add(1, Ordering::Relaxed);

        let key = instance.key.key.as_str();
        let class = store.record_confirm_latency(key, signal, delta).class;

        // User tags are never overwritten.
        let tagged = class == SignalClass::Unknown;
        if tagged {
            store.set_class(key, signal, SignalClass::Attack);
            self.stats.tagged.fetch_add(1, Ordering::Relaxed);
            info!(key, signal, delta, "Auto-tagged signal as attack");
        }

        let promoted = if self.config.promote {
            self.promote(store, instance, signal)
        } else {
            None
        };

        TagOutcome::Sampled {
            signal,
            delta,
            tagged,
            promoted,
        }
    }

    fn promote(
        &self,
        store: &mut CadenceStore,
        instance: &InstanceState,
        signal: SignalId,
    ) -> Option<StyleKind> {
        let key = instance.key.key.as_str();
        let row = store.recording().get(key, signal)?;
        if row.class == SignalClass::NonAttack {
            return None;
        }
        let estimate = row.live_estimate_ticks()?;
        let kind = phase::style_of(store.recording().all_for(key), signal)?;

        let phase_name = match store.profiles().get(key) {
            Some(p) if p.phase(&instance.active_phase).is_some() => instance.active_phase.clone(),
            Some(_) => BASE_PHASE.to_string(),
            None => return None,
        };

        if store.promote_learned(key, &phase_name, kind, signal, estimate) {
            self.stats.promoted.fetch_add(1, Ordering::Relaxed);
            Some(kind)
        } else {
            debug!(key, signal, "Promotion skipped: user override present");
            None
        }
    }
}
