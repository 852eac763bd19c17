use super::{Scenario, Swinger};
use crate::event::{InstanceDescriptor, Observation};
use crate::profile::{BASE_PHASE, StyleKind};
use crate::recording::AttackStyle;
use crate::store::CadenceStore;
use crate::{InstanceId, Tick};
use rand::prelude::*;
use tracing::warn;

/// A ranged attacker that drops the subject for a while and re-engages.
/// The countdown should go unknown during the break and recover on the
/// first swing after.
pub struct TargetSwap {
    pub instance: InstanceId,
    pub name: String,
    pub level: i32,
    pub drop_at: Tick,
    pub resume_at: Tick,
    swinger: Swinger,
    rng: StdRng,
    started: Option<Tick>,
    dropped: bool,
    resumed: bool,
}

impl TargetSwap {
    pub fn new(seed: u64) -> Self {
        Self {
            instance: 3,
            name: "Kree'arra".to_string(),
            level: 580,
            drop_at: 40,
            resume_at: 70,
            swinger: Swinger::new(3, 6978, 3, 0.0).with_hit_delay(2),
            rng: StdRng::seed_from_u64(seed),
            started: None,
            dropped: false,
            resumed: false,
        }
    }
}

impl Scenario for TargetSwap {
    fn name(&self) -> &str {
        "Target Swap"
    }

    fn prepare(&self, store: &mut CadenceStore) {
        let (key, _) = store.touch_profile(&self.name, self.level, None);
        store.set_style(&key.key, self.swinger.signal, AttackStyle::Ranged);
        let (signal, period) = (self.swinger.signal, self.swinger.period as i32);
        let edited = store.edit_block(&key.key, BASE_PHASE, StyleKind::Ranged, |b| {
            b.select(Some(signal));
            b.set_base_ticks(Some(period));
        });
        if let Err(e) = edited {
            warn!(error = %e, "Failed to configure target swap profile");
        }
    }

    fn tick(&mut self, now: Tick) -> Vec<Observation> {
        let mut out = Vec::new();

        let started = match self.started {
            Some(t) => t,
            None => {
                self.started = Some(now);
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
                now
            }
        };

        let elapsed = now - started;
        if !self.dropped && elapsed >= self.drop_at {
            self.dropped = true;
            self.swinger.stop();
            out.push(Observation::TargetChanged {
                instance: self.instance,
                still_targeting: false,
            });
        }
        if self.dropped && !self.resumed && elapsed >= self.resume_at {
            self.resumed = true;
            out.push(Observation::TargetChanged {
                instance: self.instance,
                still_targeting: true,
            });
            self.swinger.start_at(now + 1);
        }

        self.swinger.tick(now, &mut self.rng, &mut out);
        out
    }
}
