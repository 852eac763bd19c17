//! Read-only countdown snapshot for presentation layers.

use crate::phase;
use crate::profile::{BASE_PHASE, StyleKind};
use crate::registry::{InstanceRegistry, InstanceState};
use crate::store::CadenceStore;
use crate::{InstanceId, SignalId, Tick};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "ticks", rename_all = "snake_case")]
pub enum Countdown {
    Unknown,
    Ticks(Tick),
}

impl Countdown {
    pub fn ticks(&self) -> Option<Tick> {
        match self {
            Self::Ticks(t) => Some(*t),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownView {
    pub instance: InstanceId,
    pub entity_key: String,
    pub name: String,
    pub phase: String,
    pub style: StyleKind,
    pub signal: Option<SignalId>,
    pub interval: Option<i32>,
    pub countdown: Countdown,
    pub targeting: bool,
}

/// Views for every live instance at one tick, ordered by instance id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: Tick,
    pub views: Vec<CountdownView>,
}

impl Snapshot {
    pub fn view(&self, instance: InstanceId) -> Option<&CountdownView> {
        self.views.iter().find(|v| v.instance == instance)
    }
}

/// Block that currently governs an instance's prediction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Governing {
    pub phase: String,
    pub style: StyleKind,
    pub signal: Option<SignalId>,
    pub interval: Option<i32>,
}

/// Resolve phase, style block and effective interval without mutating anything.
pub fn governing_block(store: &CadenceStore, state: &InstanceState) -> Option<Governing> {
    let profile = store.profiles().get(&state.key.key)?;
    let phase_name = if profile.phase(&state.active_phase).is_some() {
        state.active_phase.as_str()
    } else {
        BASE_PHASE
    };
    let phase = phase::phase_or_base(profile, phase_name);
    let rows = store.recording().all_for(&state.key.key);

    let style = phase::select_style_block(phase, rows, state.last_signal());
    let block = phase.block(style);

    Some(Governing {
        phase: phase_name.to_string(),
        style,
        signal: block.selected_signal,
        interval: block.effective_ticks(None),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ViewProjector {
    stale_factor: i64,
    minus_one: bool,
}

impl Default for ViewProjector {
    fn default() -> Self {
        Self::new(2, false)
    }
}

impl ViewProjector {
    pub fn new(stale_factor: i64, minus_one: bool) -> Self {
        Self {
            stale_factor: stale_factor.max(1),
            minus_one,
        }
    }

    pub fn project(&self, store: &CadenceStore, registry: &InstanceRegistry, now: Tick) -> Snapshot {
        let views = registry
            .iter()
            .map(|state| self.view_for(store, state, now))
            .collect();
        Snapshot { tick: now, views }
    }

    fn view_for(&self, store: &CadenceStore, state: &InstanceState, now: Tick) -> CountdownView {
        let governing = governing_block(store, state);
        let interval = governing.as_ref().and_then(|g| g.interval);

        CountdownView {
            instance: state.id(),
            entity_key: state.key.key.clone(),
            name: state.key.name.clone(),
            phase: governing
                .as_ref()
                .map_or_else(|| BASE_PHASE.to_string(), |g| g.phase.clone()),
            style: governing.as_ref().map_or(StyleKind::Melee, |g| g.style),
            signal: governing.as_ref().and_then(|g| g.signal),
            interval,
            countdown: self.countdown(state, interval, now),
            targeting: state.targeting,
        }
    }

    fn countdown(&self, state: &InstanceState, interval: Option<i32>, now: Tick) -> Countdown {
        let Some(interval) = interval else {
            return Countdown::Unknown;
        };
        let Some(last_observed) = state.last_observed_tick else {
            return Countdown::Unknown;
        };
        if now - last_observed > self.stale_factor * Tick::from(interval) {
            return Countdown::Unknown;
        }
        let Some(left) = state.tracker.ticks_until_next(now, interval) else {
            return Countdown::Unknown;
        };

        let left = left.max(1);
        if self.minus_one {
            Countdown::Ticks((left - 1).max(1))
        } else {
            Countdown::Ticks(left)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InstanceDescriptor;
    use crate::registry::InstanceState;

    fn setup(ticks: i32) -> (CadenceStore, InstanceRegistry) {
        let mut store = CadenceStore::new();
        let (key, _) = store.touch_profile("Vorkath", 732, None);
        store
            .edit_block(&key.key, BASE_PHASE, StyleKind::Ranged, |b| {
                b.select(Some(7952));
                b.set_base_ticks(Some(ticks));
            })
            .unwrap();

        let mut registry = InstanceRegistry::new();
        for id in [8, 3] {
            registry.insert(InstanceState::new(InstanceDescriptor {
                instance: id,
                name: "Vorkath".into(),
                level: 732,
                variant: None,
            }));
        }
        (store, registry)
    }

    fn confirm(registry: &mut InstanceRegistry, id: InstanceId, tick: Tick) {
        let state = registry.get_mut(id).unwrap();
        state.note_sighting(7952, tick);
        state.tracker.confirm_occurrence(tick);
    }

    #[test]
    fn test_views_ordered_and_unknown_before_sighting() {
        let (store, registry) = setup(5);
        let snap = ViewProjector::default().project(&store, &registry, 10);

        let ids: Vec<_> = snap.views.iter().map(|v| v.instance).collect();
        assert_eq!(ids, vec![3, 8]);
        assert!(snap.views.iter().all(|v| v.countdown == Countdown::Unknown));
        assert_eq!(snap.views[0].style, StyleKind::Ranged);
        assert_eq!(snap.views[0].interval, Some(5));
    }

    #[test]
    fn test_countdown_and_staleness() {
        let (store, mut registry) = setup(5);
        confirm(&mut registry, 3, 100);
        let projector = ViewProjector::default();

        assert_eq!(projector.project(&store, &registry, 100).view(3).unwrap().countdown, Countdown::Ticks(5));
        assert_eq!(projector.project(&store, &registry, 108).view(3).unwrap().countdown, Countdown::Ticks(2));
        assert_eq!(projector.project(&store, &registry, 110).view(3).unwrap().countdown, Countdown::Ticks(5));
        assert_eq!(projector.project(&store, &registry, 111).view(3).unwrap().countdown, Countdown::Unknown);
    }

    #[test]
    fn test_unknown_without_configured_ticks() {
        let (mut store, mut registry) = setup(5);
        store
            .edit_block("vorkath#732", BASE_PHASE, StyleKind::Ranged, |b| b.set_base_ticks(None))
            .unwrap();
        confirm(&mut registry, 3, 100);

        let view = ViewProjector::default().project(&store, &registry, 101);
        assert_eq!(view.view(3).unwrap().interval, None);
        assert_eq!(view.view(3).unwrap().countdown, Countdown::Unknown);
    }

    #[test]
    fn test_minus_one_mode_never_below_one() {
        let (store, mut registry) = setup(4);
        confirm(&mut registry, 3, 20);
        let projector = ViewProjector::new(2, true);

        assert_eq!(projector.project(&store, &registry, 20).view(3).unwrap().countdown, Countdown::Ticks(3));
        assert_eq!(projector.project(&store, &registry, 23).view(3).unwrap().countdown, Countdown::Ticks(1));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let (store, mut registry) = setup(4);
        confirm(&mut registry, 8, 20);
        let snap = ViewProjector::default().project(&store, &registry, 21);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["views"][1]["countdown"]["state"], "ticks");
        assert_eq!(json["views"][1]["countdown"]["ticks"], 3);
        assert_eq!(json["views"][0]["countdown"]["state"], "unknown");
    }
}
