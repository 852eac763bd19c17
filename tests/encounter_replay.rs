use cadence_core::config::PersistenceConfig;
use cadence_core::feedback::TagOutcome;
use cadence_core::persist::{ConfigStore, MemoryConfigStore, PersistError};
use cadence_core::profile::{BASE_PHASE, StyleKind};
use cadence_core::recording::{AttackStyle, SignalClass};
use cadence_core::simulation::SimulationEngine;
use cadence_core::simulation::scenarios::{self, SteadySwings};
use cadence_core::tracker::CadenceTracker;
use cadence_core::{
    CadenceEngine, Countdown, Document, EngineConfig, EntityKey, InstanceDescriptor, Observation,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn zulrah(instance: u32) -> InstanceDescriptor {
    InstanceDescriptor {
        instance,
        name: "Zulrah".to_string(),
        level: 725,
        variant: None,
    }
}

fn engaged(engine: &mut CadenceEngine, desc: InstanceDescriptor) {
    let id = desc.instance;
    engine.apply(Observation::InstanceAppeared(desc));
    engine.apply(Observation::TargetChanged {
        instance: id,
        still_targeting: true,
    });
}

/// Config store whose first `n` writes fail.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryConfigStore,
    failures_left: Arc<AtomicU32>,
}

impl FlakyStore {
    fn failing(n: u32) -> Self {
        Self {
            inner: MemoryConfigStore::new(),
            failures_left: Arc::new(AtomicU32::new(n)),
        }
    }

    fn saved(&self, config: &EngineConfig) -> Option<Document> {
        let text = self
            .inner
            .get(&config.persistence.group, &config.persistence.key)
            .unwrap()?;
        Some(Document::from_json(&text).unwrap())
    }
}

impl ConfigStore for FlakyStore {
    fn get(&self, group: &str, key: &str) -> Result<Option<String>, PersistError> {
        self.inner.get(group, key)
    }

    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), PersistError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(PersistError::Io("disk full".into()));
        }
        self.inner.set(group, key, value)
    }
}

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_entity_key_normalization() {
    let a = EntityKey::of("Zulrah", 725);
    let b = EntityKey::of("zulrah", 725);
    let c = EntityKey::of("Zulrah ", 725);
    assert_eq!(a.key, b.key);
    assert_eq!(b.key, c.key);
    assert_ne!(a.key, EntityKey::of("Zulrah", 726).key);
    assert_eq!(EntityKey::of(&a.name, a.level), a);
}

#[test]
fn test_confirmation_latency_kept_apart_from_gaps() {
    let mut engine = CadenceEngine::new(EngineConfig::default());
    engaged(&mut engine, zulrah(1));

    engine.on_signal_observed(1, 42, 10);
    let first = engine.on_confirmation_signal(true, 11);
    assert!(matches!(
        first,
        Some(TagOutcome::Sampled {
            signal: 42,
            delta: 1,
            tagged: true,
            ..
        })
    ));

    engine.on_signal_observed(1, 42, 14);
    engine.on_signal_observed(1, 42, 18);
    engine.on_confirmation_signal(true, 19);

    let row = engine.store().recording().get("zulrah#725", 42).unwrap();
    assert_eq!(row.class, SignalClass::Attack);
    assert_eq!(row.recent_gaps.iter().collect::<Vec<_>>(), vec![4, 4]);
    assert_eq!(row.confirm_latencies.iter().collect::<Vec<_>>(), vec![1, 1]);
    assert_eq!(row.live_estimate_ticks(), Some(4));
}

#[test]
fn test_repetition_alone_never_tags() {
    let mut engine = CadenceEngine::new(EngineConfig::default());
    engaged(&mut engine, zulrah(1));
    for tick in [10, 14, 18, 22] {
        engine.on_signal_observed(1, 808, tick);
    }
    let row = engine.store().recording().get("zulrah#725", 808).unwrap();
    assert_eq!(row.class, SignalClass::Unknown);
    assert_eq!(row.seen_count, 4);
    assert!(row.recent_gaps.is_empty());
}

#[test]
fn test_grid_catch_up_after_silence() {
    let mut tracker = CadenceTracker::new();
    tracker.confirm_occurrence(100);
    tracker.auto_advance(108, 5);
    assert_eq!(tracker.ticks_until_next(108, 5), Some(2));

    let mut engine = CadenceEngine::new(EngineConfig::default());
    engaged(&mut engine, zulrah(1));
    engine.store_mut().touch_profile("Zulrah", 725, None);
    engine
        .store_mut()
        .edit_block("zulrah#725", BASE_PHASE, StyleKind::Magic, |b| {
            b.select(Some(5069));
            b.set_base_ticks(Some(5));
        })
        .unwrap();

    engine.on_signal_observed(1, 5069, 100);
    let snap = engine.on_scheduling_tick(108);
    assert_eq!(snap.view(1).unwrap().countdown, Countdown::Ticks(2));

    // Older than twice the interval.
    let snap = engine.on_scheduling_tick(111);
    assert_eq!(snap.view(1).unwrap().countdown, Countdown::Unknown);
}

#[test]
fn test_delete_profile_removes_recording() {
    let mut engine = CadenceEngine::new(EngineConfig::default());
    engaged(&mut engine, zulrah(1));
    engine.on_signal_observed(1, 5069, 10);
    engine.on_signal_observed(1, 5072, 12);
    assert_eq!(engine.store().recording().all_for("zulrah#725").len(), 2);

    assert!(engine.delete_profile("zulrah#725"));
    assert!(engine.store().profiles().get("zulrah#725").is_none());
    assert!(engine.store().recording().all_for("zulrah#725").is_empty());
    assert!(!engine.delete_profile("zulrah#725"));
}

#[test]
fn test_profiles_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        persistence: PersistenceConfig {
            store_path: Some(dir.path().join("settings.json")),
            backup_path: Some(dir.path().join("attack-cycle-db-v2.json")),
            debounce_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut engine = CadenceEngine::open(config.clone()).unwrap();
    engaged(&mut engine, zulrah(1));
    engine.on_signal_observed(1, 5069, 10);
    engine
        .store_mut()
        .set_style("zulrah#725", 5069, AttackStyle::Magic);
    engine
        .store_mut()
        .edit_block("zulrah#725", BASE_PHASE, StyleKind::Magic, |b| {
            b.select(Some(5069));
            b.set_base_ticks(Some(4));
        })
        .unwrap();
    let report = engine.save_now().unwrap();
    assert!(report.written);
    engine.shutdown();

    let reopened = CadenceEngine::open(config.clone()).unwrap();
    let profile = reopened.store().profiles().get("zulrah#725").unwrap();
    assert_eq!(profile.base.magic.selected_signal, Some(5069));
    assert_eq!(profile.base.magic.effective_ticks(None), Some(4));
    let row = reopened.store().recording().get("zulrah#725", 5069).unwrap();
    assert_eq!(row.style, AttackStyle::Magic);
    reopened.shutdown();

    // Primary lost: the backup brings everything back.
    std::fs::remove_file(dir.path().join("settings.json")).unwrap();
    let recovered = CadenceEngine::open(config).unwrap();
    assert!(recovered.store().profiles().contains("zulrah#725"));
    recovered.shutdown();
    assert!(dir.path().join("settings.json").exists());
}

#[test]
fn test_failed_save_keeps_changes_for_shutdown() {
    let config = EngineConfig::default();
    let flaky = FlakyStore::failing(1);
    let mut engine =
        CadenceEngine::open_with(config.clone(), Arc::new(flaky.clone()), None).unwrap();
    engine.store_mut().touch_profile("Zulrah", 725, Some(2042));

    assert!(matches!(engine.save_now(), Err(PersistError::Io(_))));
    assert!(flaky.saved(&config).is_none());

    engine.shutdown();
    let doc = flaky.saved(&config).unwrap();
    assert!(doc.profiles.contains_key("zulrah#725"));
}

#[test]
fn test_failed_debounced_save_is_retried() {
    let config = EngineConfig {
        persistence: PersistenceConfig {
            debounce_ms: 5,
            ..Default::default()
        },
        ..Default::default()
    };
    let flaky = FlakyStore::failing(1);
    let mut engine =
        CadenceEngine::open_with(config.clone(), Arc::new(flaky.clone()), None).unwrap();
    let stats = engine.writer_stats().unwrap();

    engine.store_mut().touch_profile("Zulrah", 725, None);
    engine.on_scheduling_tick(1);
    assert!(eventually(|| stats.failures.load(Ordering::Relaxed) == 1));
    assert!(flaky.saved(&config).is_none());

    // Nothing changed since, but the failed revision is queued again.
    engine.on_scheduling_tick(2);
    assert!(eventually(|| stats.writes.load(Ordering::Relaxed) == 1));
    assert!(flaky.saved(&config).unwrap().profiles.contains_key("zulrah#725"));
    engine.shutdown();
}

#[test]
fn test_variant_change_mid_encounter_enters_phase() {
    let key = "zulrah#725";
    let mut engine = CadenceEngine::new(EngineConfig::default());
    engine.store_mut().touch_profile("Zulrah", 725, Some(2042));
    engine.store_mut().add_phase(key, "blue").unwrap();
    engine
        .store_mut()
        .set_phase_triggers(key, "blue", Vec::new(), [2043])
        .unwrap();
    for (phase, ticks) in [(BASE_PHASE, 5), ("blue", 3)] {
        engine
            .store_mut()
            .edit_block(key, phase, StyleKind::Magic, |b| {
                b.select(Some(5069));
                b.set_base_ticks(Some(ticks));
            })
            .unwrap();
    }

    let mut desc = zulrah(7);
    desc.variant = Some(2042);
    engaged(&mut engine, desc);
    engine.on_signal_observed(7, 5069, 100);
    engine.on_signal_observed(7, 5069, 105);

    let snap = engine.on_scheduling_tick(106);
    let view = snap.view(7).unwrap();
    assert_eq!(view.phase, BASE_PHASE);
    assert_eq!(view.countdown, Countdown::Ticks(4));

    engine.apply(Observation::VariantChanged {
        instance: 7,
        variant: 2043,
    });
    let snap = engine.on_scheduling_tick(107);
    let view = snap.view(7).unwrap();
    assert_eq!(view.phase, "blue");
    assert_eq!(view.interval, Some(3));
    assert_eq!(view.countdown, Countdown::Ticks(1));
    assert!(
        engine
            .store()
            .profiles()
            .get(key)
            .unwrap()
            .variant_ids
            .contains(&2043)
    );
}

#[test]
fn test_corrupt_store_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("settings.json");
    std::fs::write(&store_path, "{ not json").unwrap();

    let config = EngineConfig {
        persistence: PersistenceConfig {
            store_path: Some(store_path),
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = CadenceEngine::open(config).unwrap();
    assert_eq!(engine.store().profiles().len(), 0);
    engine.shutdown();
}

#[test]
fn test_simulated_encounter_reaches_prediction() {
    let mut sim = SimulationEngine::new(0);
    sim.add_scenario(Box::new(SteadySwings::new(11)));
    let mut engine = CadenceEngine::new(EngineConfig::default());
    sim.prepare(engine.store_mut());

    let mut predicted = 0;
    let last = sim.drive(&mut engine, 240, |snap| {
        if snap.views.iter().any(|v| v.countdown.ticks().is_some()) {
            predicted += 1;
        }
    });
    assert!(predicted > 100, "only {} predicting ticks", predicted);

    let json = serde_json::to_string(last.as_ref()).unwrap();
    assert!(json.contains("\"entity_key\":\"general_graardor#624\""));
}

#[test]
fn test_every_listed_scenario_runs() {
    for info in cadence_core::simulation::SCENARIOS {
        let mut sim = SimulationEngine::new(500);
        sim.add_scenario(scenarios::build(info.name, 3).unwrap());
        let mut engine = CadenceEngine::new(EngineConfig::default());
        sim.prepare(engine.store_mut());
        let snap = sim.drive(&mut engine, 120, |_| {});
        assert_eq!(snap.tick, 619, "{}", info.name);
        assert_eq!(snap.views.len(), 1, "{}", info.name);
    }
}

#[test]
fn test_trace_lines_drive_the_engine() {
    let trace = r#"
{"type":"instance_appeared","instance":4,"name":"Zulrah","level":725}
{"type":"target_changed","instance":4,"still_targeting":true}
{"type":"signal_observed","instance":4,"signal":5069,"tick":20}
{"type":"confirmation","tick":21}
{"type":"scheduling_tick","tick":21}
"#;
    let mut engine = CadenceEngine::new(EngineConfig::default());
    for line in trace.lines().filter(|l| !l.trim().is_empty()) {
        let obs: Observation = serde_json::from_str(line).unwrap();
        engine.apply(obs);
    }

    let row = engine.store().recording().get("zulrah#725", 5069).unwrap();
    assert_eq!(row.class, SignalClass::Attack);
    assert_eq!(engine.snapshot().tick, 21);
    assert_eq!(engine.snapshot().views[0].instance, 4);
}
