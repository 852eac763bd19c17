//! Which phase and which style block govern an instance right now.

use crate::profile::{BASE_PHASE, EntityProfile, PhaseProfile, StyleKind};
use crate::recording::{AttackStyle, SignalClass, SignalRows};
use crate::{SignalId, VariantId};
use tracing::debug;

/// Phase an observed signal switches to, if it differs from `current`.
///
/// Named phases are tested in declared order and the first match wins. If
/// none matches, the base phase's own triggers return the instance to base.
/// No match leaves the current phase in place.
pub fn evaluate_triggers(
    profile: &EntityProfile,
    current: &str,
    signal: SignalId,
    variant: Option<VariantId>,
) -> Option<String> {
    switch_target(profile, current, |phase| phase.is_triggered_by(signal, variant))
}

/// Phase a mid-encounter variant change switches to. Signal triggers are not consulted.
pub fn evaluate_variant_triggers(
    profile: &EntityProfile,
    current: &str,
    variant: VariantId,
) -> Option<String> {
    switch_target(profile, current, |phase| phase.trigger_variants.contains(&variant))
}

fn switch_target(
    profile: &EntityProfile,
    current: &str,
    matches: impl Fn(&PhaseProfile) -> bool,
) -> Option<String> {
    let target = profile
        .phases
        .iter()
        .find(|(_, phase)| matches(phase))
        .map(|(name, _)| name)
        .or_else(|| matches(&profile.base).then_some(BASE_PHASE))?;

    (target != current).then(|| target.to_string())
}

/// The phase named by `active`, falling back to base when it no longer exists.
///
/// A stale name is reset to base in place.
pub fn resolve_phase<'a>(profile: &'a EntityProfile, active: &mut String) -> &'a PhaseProfile {
    match profile.phase(active) {
        Some(phase) => phase,
        None => {
            debug!(key = %profile.key, phase = %active, "Active phase no longer exists; using base");
            *active = BASE_PHASE.to_string();
            &profile.base
        }
    }
}

/// Read-only variant of [`resolve_phase`] for projection.
pub fn phase_or_base<'a>(profile: &'a EntityProfile, active: &str) -> &'a PhaseProfile {
    profile.phase(active).unwrap_or(&profile.base)
}

/// Style a recorded signal maps to, if it is known.
pub fn style_of(rows: &SignalRows, signal: SignalId) -> Option<StyleKind> {
    let row = rows.get(&signal)?;
    if row.class == SignalClass::ChargeUp {
        return Some(StyleKind::ChargeUp);
    }
    match row.style {
        AttackStyle::Melee => Some(StyleKind::Melee),
        AttackStyle::Ranged => Some(StyleKind::Ranged),
        AttackStyle::Magic => Some(StyleKind::Magic),
        AttackStyle::Unknown => None,
    }
}

/// Block governing prediction within `phase`. Never fails: melee is the last resort.
pub fn select_style_block(
    phase: &PhaseProfile,
    rows: &SignalRows,
    last_signal: Option<SignalId>,
) -> StyleKind {
    if let Some(kind) = last_signal.and_then(|s| style_of(rows, s)) {
        return kind;
    }
    StyleKind::ALL
        .into_iter()
        .find(|&k| phase.block(k).is_configured())
        .unwrap_or(StyleKind::Melee)
}
