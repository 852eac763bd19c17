//! Synthetic encounters for exercising the engine without a live client.
//!
//! Each scenario emits the observations one attacker would produce per tick;
//! the engine merges them and closes every tick with a scheduling tick.

pub mod scenarios;

pub use scenarios::{SCENARIOS, Scenario, ScenarioInfo};

use crate::Tick;
use crate::engine::CadenceEngine;
use crate::event::Observation;
use crate::projector::Snapshot;
use crate::store::CadenceStore;
use std::sync::Arc;

pub struct SimulationEngine {
    scenarios: Vec<Box<dyn Scenario + Send>>,
    current_tick: Tick,
}

impl SimulationEngine {
    pub fn new(start_tick: Tick) -> Self {
        Self {
            scenarios: Vec::new(),
            current_tick: start_tick,
        }
    }

    pub fn add_scenario(&mut self, scenario: Box<dyn Scenario + Send>) {
        self.scenarios.push(scenario);
    }

    pub fn clear_scenarios(&mut self) {
        self.scenarios.clear();
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn scenario_names(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.name()).collect()
    }

    /// Apply every scenario's pre-fight configuration.
    pub fn prepare(&self, store: &mut CadenceStore) {
        for scenario in &self.scenarios {
            scenario.prepare(store);
        }
    }

    /// Observations for the current tick, ending with its scheduling tick.
    pub fn tick(&mut self) -> Vec<Observation> {
        let now = self.current_tick;
        let mut all = Vec::new();
        for scenario in &mut self.scenarios {
            all.extend(scenario.tick(now));
        }
        all.push(Observation::SchedulingTick { tick: now });
        self.current_tick += 1;
        all
    }

    pub fn tick_json(&mut self) -> Vec<String> {
        self.tick()
            .iter()
            .map(|o| serde_json::to_string(o).unwrap_or_else(|_| "{}".to_string()))
            .collect()
    }

    /// Feed `ticks` ticks into `engine`, handing each snapshot to `on_snapshot`.
    pub fn drive(
        &mut self,
        engine: &mut CadenceEngine,
        ticks: u64,
        mut on_snapshot: impl FnMut(&Snapshot),
    ) -> Arc<Snapshot> {
        for _ in 0..ticks {
            for obs in self.tick() {
                engine.apply(obs);
            }
            on_snapshot(&engine.snapshot());
        }
        engine.snapshot()
    }
}

impl Default for SimulationEngine {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::scenarios::{PhaseShift, SteadySwings, TargetSwap};
    use super::*;
    use crate::config::EngineConfig;
    use crate::projector::Countdown;

    fn engine_for(scenario: Box<dyn Scenario + Send>) -> (SimulationEngine, CadenceEngine) {
        let mut sim = SimulationEngine::new(1000);
        sim.add_scenario(scenario);
        let mut engine = CadenceEngine::new(EngineConfig::default());
        sim.prepare(engine.store_mut());
        (sim, engine)
    }

    #[test]
    fn test_tick_ends_with_scheduling() {
        let mut sim = SimulationEngine::new(5);
        sim.add_scenario(Box::new(SteadySwings::new(1)));
        let first = sim.tick();
        assert!(matches!(first[0], Observation::InstanceAppeared(_)));
        assert_eq!(first.last(), Some(&Observation::SchedulingTick { tick: 5 }));
        assert_eq!(sim.current_tick(), 6);

        sim.clear_scenarios();
        assert_eq!(sim.tick(), vec![Observation::SchedulingTick { tick: 6 }]);
    }

    #[test]
    fn test_same_seed_same_trace() {
        let mut a = SimulationEngine::default();
        let mut b = SimulationEngine::default();
        a.add_scenario(Box::new(SteadySwings::new(42)));
        b.add_scenario(Box::new(SteadySwings::new(42)));
        for _ in 0..100 {
            assert_eq!(a.tick(), b.tick());
        }
    }

    #[test]
    fn test_steady_learns_a_countdown() {
        let (mut sim, mut engine) = engine_for(Box::new(SteadySwings::new(3)));
        let snap = sim.drive(&mut engine, 200, |_| {});

        let view = snap.view(1).unwrap();
        assert_eq!(view.entity_key, "general_graardor#624");
        let learned = view.interval.unwrap();
        assert!((5..=7).contains(&learned), "learned {}", learned);
    }

    #[test]
    fn test_phase_shift_switches_blocks() {
        let (mut sim, mut engine) = engine_for(Box::new(PhaseShift::new(9)));
        let before = sim.drive(&mut engine, 50, |_| {});
        let view = before.view(2).unwrap();
        assert_eq!(view.phase, "base");
        assert_eq!(view.interval, Some(4));

        let after = sim.drive(&mut engine, 30, |_| {});
        let view = after.view(2).unwrap();
        assert_eq!(view.phase, "enraged");
        assert_eq!(view.interval, Some(3));
    }

    #[test]
    fn test_target_swap_goes_unknown_while_away() {
        let (mut sim, mut engine) = engine_for(Box::new(TargetSwap::new(5)));
        let engaged = sim.drive(&mut engine, 30, |_| {});
        assert!(matches!(engaged.view(3).unwrap().countdown, Countdown::Ticks(_)));

        let away = sim.drive(&mut engine, 20, |_| {});
        assert_eq!(away.view(3).unwrap().countdown, Countdown::Unknown);

        let back = sim.drive(&mut engine, 30, |_| {});
        assert!(matches!(back.view(3).unwrap().countdown, Countdown::Ticks(_)));
    }
}
