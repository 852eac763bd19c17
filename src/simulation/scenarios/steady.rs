use super::{Scenario, Swinger};
use crate::event::{InstanceDescriptor, Observation};
use crate::recording::{AttackStyle, SignalClass};
use crate::store::CadenceStore;
use crate::{InstanceId, SignalId, Tick};
use rand::prelude::*;

/// A single attacker on a fixed weapon speed. Nothing is configured up
/// front except the swing's style, so the countdown only appears once the
/// auto-tagger has learned the period from confirmed hits.
pub struct SteadySwings {
    pub instance: InstanceId,
    pub name: String,
    pub level: i32,
    pub idle_signal: SignalId,
    pub idle_rate: f64,
    swinger: Swinger,
    rng: StdRng,
    engaged: bool,
}

impl SteadySwings {
    pub fn new(seed: u64) -> Self {
        Self {
            instance: 1,
            name: "General Graardor".to_string(),
            level: 624,
            idle_signal: 7017,
            idle_rate: 0.05,
            swinger: Swinger::new(1, 7018, 6, 0.3)
                .with_miss_rate(0.1)
                .with_hit_delay(1),
            rng: StdRng::seed_from_u64(seed),
            engaged: false,
        }
    }

    pub fn signal(&self) -> SignalId {
        self.swinger.signal
    }

    pub fn period(&self) -> Tick {
        self.swinger.period
    }
}

impl Scenario for SteadySwings {
    fn name(&self) -> &str {
        "Steady Swings"
    }

    fn prepare(&self, store: &mut CadenceStore) {
        let (key, _) = store.touch_profile(&self.name, self.level, None);
        store.set_style(&key.key, self.swinger.signal, AttackStyle::Melee);
        store.set_class(&key.key, self.idle_signal, SignalClass::NonAttack);
    }

    fn tick(&mut self, now: Tick) -> Vec<Observation> {
        let mut out = Vec::new();

        if !self.engaged {
            self.engaged = true;
            out.push(Observation::InstanceAppeared(InstanceDescriptor {
                instance: self.instance,
                name: self.name.clone(),
                level: self.level,
                variant: None,
            }));
            out.push(Observation::TargetChanged {
                instance: self.instance,
                still_targeting: true,
            });
            self.swinger.start_at(now + 1);
        }

        let before = out.len();
        self.swinger.tick(now, &mut self.rng, &mut out);
        let swung = out[before..]
            .iter()
            .any(|o| matches!(o, Observation::SignalObserved { .. }));

        // Idle noise never sits between a swing and its hit.
        if !swung && !self.swinger.has_pending_hits() && self.rng.random_bool(self.idle_rate) {
            out.push(Observation::SignalObserved {
                instance: self.instance,
                signal: self.idle_signal,
                tick: now,
            });
        }

        out
    }
}
