use crate::event::Observation;
use crate::store::CadenceStore;
use crate::{InstanceId, SignalId, Tick};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

pub mod phase_shift;
pub mod steady;
pub mod target_swap;

pub use phase_shift::PhaseShift;
pub use steady::SteadySwings;
pub use target_swap::TargetSwap;

pub trait Scenario {
    fn name(&self) -> &str;

    /// Seed whatever the player would have configured before the fight.
    fn prepare(&self, _store: &mut CadenceStore) {}

    fn tick(&mut self, now: Tick) -> Vec<Observation>;
}

pub struct ScenarioInfo {
    pub name: &'static str,
    pub description: &'static str,
}

pub const SCENARIOS: &[ScenarioInfo] = &[
    ScenarioInfo {
        name: "steady",
        description: "One attacker swinging on a fixed period with jitter and missed frames",
    },
    ScenarioInfo {
        name: "phase-shift",
        description: "Attacker switches phase on a trigger animation and changes weapon",
    },
    ScenarioInfo {
        name: "target-swap",
        description: "Attacker loses interest mid-fight and later re-engages",
    },
];

pub fn build(name: &str, seed: u64) -> Option<Box<dyn Scenario + Send>> {
    match name {
        "steady" => Some(Box::new(SteadySwings::new(seed))),
        "phase-shift" => Some(Box::new(PhaseShift::new(seed))),
        "target-swap" => Some(Box::new(TargetSwap::new(seed))),
        _ => None,
    }
}

/// Periodic attack emitter shared by the scenarios.
///
/// Each swing is seen with probability `1 - miss_rate`; missed swings still
/// land and still produce a confirmation. Hits land `hit_delay` ticks later.
pub struct Swinger {
    pub instance: InstanceId,
    pub signal: SignalId,
    pub period: Tick,
    pub miss_rate: f64,
    pub hit_delay: Tick,
    next_swing: Option<Tick>,
    pending_hits: Vec<Tick>,
    jitter: Option<Normal<f64>>,
}

impl Swinger {
    pub fn new(instance: InstanceId, signal: SignalId, period: Tick, jitter_sd: f64) -> Self {
        Self {
            instance,
            signal,
            period: period.max(1),
            miss_rate: 0.0,
            hit_delay: 1,
            next_swing: None,
            pending_hits: Vec::new(),
            jitter: Normal::new(0.0, jitter_sd).ok().filter(|_| jitter_sd > 0.0),
        }
    }

    pub fn with_miss_rate(mut self, miss_rate: f64) -> Self {
        self.miss_rate = miss_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_hit_delay(mut self, hit_delay: Tick) -> Self {
        self.hit_delay = hit_delay.max(0);
        self
    }

    /// Restart the rhythm with the first swing at `at`.
    pub fn start_at(&mut self, at: Tick) {
        self.next_swing = Some(at);
    }

    pub fn stop(&mut self) {
        self.next_swing = None;
    }

    pub fn has_pending_hits(&self) -> bool {
        !self.pending_hits.is_empty()
    }

    pub fn tick(&mut self, now: Tick, rng: &mut StdRng, out: &mut Vec<Observation>) {
        if self.next_swing.is_some_and(|due| now >= due) {
            if !rng.random_bool(self.miss_rate) {
                out.push(Observation::SignalObserved {
                    instance: self.instance,
                    signal: self.signal,
                    tick: now,
                });
            }
            self.pending_hits.push(now + self.hit_delay);

            let jitter = self
                .jitter
                .map(|d| d.sample(rng).round() as Tick)
                .unwrap_or(0);
            self.next_swing = Some(now + (self.period + jitter).max(1));
        }

        let before = self.pending_hits.len();
        self.pending_hits.retain(|&at| at > now);
        for _ in self.pending_hits.len()..before {
            out.push(Observation::Confirmation {
                on_subject: true,
                tick: now,
            });
        }
    }
}
