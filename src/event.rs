//! Observation inputs from the event source.

use crate::{InstanceId, SignalId, Tick, VariantId};
use serde::{Deserialize, Serialize};

/// Identity of a live instance at the moment it becomes observable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance: InstanceId,
    pub name: String,
    pub level: i32,
    #[serde(default)]
    pub variant: Option<VariantId>,
}

/// One input to the engine, tagged by `type` on the wire:
///
/// ```json
/// {"type":"signal_observed","instance":7,"signal":5069,"tick":1200}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    InstanceAppeared(InstanceDescriptor),
    InstanceDisappeared {
        instance: InstanceId,
    },
    TargetChanged {
        instance: InstanceId,
        still_targeting: bool,
    },
    SignalObserved {
        instance: InstanceId,
        signal: SignalId,
        tick: Tick,
    },
    /// The instance switched form without leaving the scene
    VariantChanged {
        instance: InstanceId,
        variant: VariantId,
    },
    /// Travel time of a projectile launched by the instance's last signal
    ProjectileObserved {
        instance: InstanceId,
        speed: i32,
    },
    /// Harm applied to an actor. Only harm applied to the subject confirms anything.
    Confirmation {
        #[serde(default = "default_on_subject")]
        on_subject: bool,
        tick: Tick,
    },
    SchedulingTick {
        tick: Tick,
    },
}

fn default_on_subject() -> bool {
    true
}

impl Observation {
    pub fn tick(&self) -> Option<Tick> {
        match self {
            Self::SignalObserved { tick, .. }
            | Self::Confirmation { tick, .. }
            | Self::SchedulingTick { tick } => Some(*tick),
            _ => None,
        }
    }

    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            Self::InstanceAppeared(d) => Some(d.instance),
            Self::InstanceDisappeared { instance }
            | Self::TargetChanged { instance, .. }
            | Self::SignalObserved { instance, .. }
            | Self::VariantChanged { instance, .. }
            | Self::ProjectileObserved { instance, .. } => Some(*instance),
            Self::Confirmation { .. } | Self::SchedulingTick { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InstanceAppeared(_) => "instance_appeared",
            Self::InstanceDisappeared { .. } => "instance_disappeared",
            Self::TargetChanged { .. } => "target_changed",
            Self::SignalObserved { .. } => "signal_observed",
            Self::VariantChanged { .. } => "variant_changed",
            Self::ProjectileObserved { .. } => "projectile_observed",
            Self::Confirmation { .. } => "confirmation",
            Self::SchedulingTick { .. } => "scheduling_tick",
        }
    }
}
