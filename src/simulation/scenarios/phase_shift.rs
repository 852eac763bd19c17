use super::{Scenario, Swinger};
use crate::event::{InstanceDescriptor, Observation};
use crate::profile::{BASE_PHASE, StyleKind};
use crate::recording::{AttackStyle, SignalClass};
use crate::store::CadenceStore;
use crate::{InstanceId, SignalId, Tick};
use rand::prelude::*;
use tracing::warn;

pub const SHIFTED_PHASE: &str = "enraged";

/// Melee until `shift_at`, then a trigger animation and a faster magic
/// attack. Both blocks are configured by hand, so countdowns are available
/// from the first swing.
pub struct PhaseShift {
    pub instance: InstanceId,
    pub name: String,
    pub level: i32,
    pub trigger_signal: SignalId,
    pub shift_at: Tick,
    first: Swinger,
    second: Swinger,
    rng: StdRng,
    started: Option<Tick>,
    shifted: bool,
}

impl PhaseShift {
    pub fn new(seed: u64) -> Self {
        Self {
            instance: 2,
            name: "Kalphite Queen".to_string(),
            level: 333,
            trigger_signal: 6270,
            shift_at: 60,
            first: Swinger::new(2, 6241, 4, 0.0).with_miss_rate(0.05),
            second: Swinger::new(2, 6234, 3, 0.0).with_miss_rate(0.05),
            rng: StdRng::seed_from_u64(seed),
            started: None,
            shifted: false,
        }
    }

    fn configure(&self, store: &mut CadenceStore) -> Result<(), crate::store::EditError> {
        let (key, _) = store.touch_profile(&self.name, self.level, None);
        let key = key.key;
        if store
            .profiles()
            .get(&key)
            .and_then(|p| p.phase(SHIFTED_PHASE))
            .is_none()
        {
            store.add_phase(&key, SHIFTED_PHASE)?;
        }
        store.set_phase_triggers(&key, SHIFTED_PHASE, [self.trigger_signal], Vec::new())?;

        store.set_style(&key, self.first.signal, AttackStyle::Melee);
        store.set_style(&key, self.second.signal, AttackStyle::Magic);
        store.set_class(&key, self.trigger_signal, SignalClass::NonAttack);

        let (first_signal, first_period) = (self.first.signal, self.first.period as i32);
        store.edit_block(&key, BASE_PHASE, StyleKind::Melee, |b| {
            b.select(Some(first_signal));
            b.set_base_ticks(Some(first_period));
        })?;
        let (second_signal, second_period) = (self.second.signal, self.second.period as i32);
        store.edit_block(&key, SHIFTED_PHASE, StyleKind::Magic, |b| {
            b.select(Some(second_signal));
            b.set_base_ticks(Some(second_period));
        })?;
        Ok(())
    }
}

impl Scenario for PhaseShift {
    fn name(&self) -> &str {
        "Phase Shift"
    }

    fn prepare(&self, store: &mut CadenceStore) {
        if let Err(e) = self.configure(store) {
            warn!(error = %e, "Failed to configure phase shift profile");
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
                self.first.start_at(now + 1);
                now
            }
        };

        if !self.shifted && now - started >= self.shift_at {
            self.shifted = true;
            self.first.stop();
            out.push(Observation::SignalObserved {
                instance: self.instance,
                signal: self.trigger_signal,
                tick: now,
            });
            self.second.start_at(now + 2);
        }

        self.first.tick(now, &mut self.rng, &mut out);
        self.second.tick(now, &mut self.rng, &mut out);
        out
    }
}
