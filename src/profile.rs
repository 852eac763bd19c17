//! Per-entity behavioral configuration.
//!
//! A profile has a base phase and any number of named phases. Each phase
//! holds one style block per attack category plus one for charge-ups, and
//! each block names the signal it follows and the cadence to predict with.

use crate::key::EntityKey;
use crate::recording::{
    MAX_CADENCE_TICKS, MAX_PROJECTILE_SPEED, MIN_CADENCE_TICKS, MIN_PROJECTILE_SPEED,
};
use crate::{SignalId, VariantId};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Name of the implicit phase every profile starts in.
pub const BASE_PHASE: &str = "base";

pub const MIN_OFFSET: i32 = -MAX_CADENCE_TICKS;
pub const MAX_OFFSET: i32 = MAX_CADENCE_TICKS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleKind {
    Melee,
    Ranged,
    Magic,
    ChargeUp,
}

impl StyleKind {
    /// Fallback preference when no signal context is available.
    pub const ALL: [StyleKind; 4] = [
        StyleKind::Melee,
        StyleKind::Ranged,
        StyleKind::Magic,
        StyleKind::ChargeUp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Melee => "melee",
            Self::Ranged => "ranged",
            Self::Magic => "magic",
            Self::ChargeUp => "charge_up",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalOverride {
    pub ticks: Option<i32>,
    pub offset: Option<i32>,
    pub projectile_speed: Option<i32>,
    /// Set when `ticks` came from automatic promotion rather than a user edit
    pub learned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleBlock {
    /// Signal whose sighting restarts the countdown
    pub selected_signal: Option<SignalId>,
    /// Block-wide cadence when no per-signal override applies
    pub base_ticks: Option<i32>,
    /// Added to the cadence before clamping
    pub base_offset: i32,
    pub base_projectile_speed: Option<i32>,
    /// Per-signal cadence, user-entered or promoted from learning
    pub overrides: BTreeMap<SignalId, SignalOverride>,
}

impl StyleBlock {
    pub fn is_configured(&self) -> bool {
        self.selected_signal.is_some()
    }

    /// Effective cadence for `signal` (or the selected signal).
    ///
    /// `None` when neither an override nor the block carries a tick count.
    pub fn effective_ticks(&self, signal: Option<SignalId>) -> Option<i32> {
        let ov = signal
            .or(self.selected_signal)
            .and_then(|s| self.overrides.get(&s));

        let ticks = ov.and_then(|o| o.ticks).or(self.base_ticks)?;
        let offset = ov.and_then(|o| o.offset).unwrap_or(self.base_offset);

        Some((ticks + offset).clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS))
    }

    pub fn effective_projectile_speed(&self, signal: Option<SignalId>) -> Option<i32> {
        let ov = signal
            .or(self.selected_signal)
            .and_then(|s| self.overrides.get(&s));

        ov.and_then(|o| o.projectile_speed)
            .or(self.base_projectile_speed)
            .map(|s| s.clamp(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED))
    }

    pub fn select(&mut self, signal: Option<SignalId>) {
        self.selected_signal = signal;
    }

    pub fn set_base_ticks(&mut self, ticks: Option<i32>) {
        self.base_ticks = ticks.map(|t| t.clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS));
    }

    pub fn set_base_offset(&mut self, offset: i32) {
        self.base_offset = offset.clamp(MIN_OFFSET, MAX_OFFSET);
    }

    pub fn set_base_projectile_speed(&mut self, speed: Option<i32>) {
        self.base_projectile_speed =
            speed.map(|s| s.clamp(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED));
    }

    /// User edit of a per-signal override. Empty overrides are dropped.
    pub fn set_override(
        &mut self,
        signal: SignalId,
        ticks: Option<i32>,
        offset: Option<i32>,
        projectile_speed: Option<i32>,
    ) {
        let ov = SignalOverride {
            ticks: ticks.map(|t| t.clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS)),
            offset: offset.map(|o| o.clamp(MIN_OFFSET, MAX_OFFSET)),
            projectile_speed: projectile_speed
                .map(|s| s.clamp(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED)),
            learned: false,
        };
        if ov == SignalOverride::default() {
            self.overrides.remove(&signal);
        } else {
            self.overrides.insert(signal, ov);
        }
    }

    /// Write a learned tick estimate. Returns false when a user value is in the way.
    pub fn promote_learned_ticks(&mut self, signal: SignalId, ticks: i32) -> bool {
        let ov = self.overrides.entry(signal).or_default();
        if ov.ticks.is_some() && !ov.learned {
            return false;
        }
        ov.ticks = Some(ticks.clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS));
        ov.learned = true;
        true
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn normalize(&mut self) {
        self.base_ticks = self
            .base_ticks
            .map(|t| t.clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS));
        self.base_offset = self.base_offset.clamp(MIN_OFFSET, MAX_OFFSET);
        self.base_projectile_speed = self
            .base_projectile_speed
            .map(|s| s.clamp(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseProfile {
    pub melee: StyleBlock,
    pub ranged: StyleBlock,
    pub magic: StyleBlock,
    pub charge_up: StyleBlock,
    pub trigger_signals: BTreeSet<SignalId>,
    pub trigger_variants: BTreeSet<VariantId>,
}

impl PhaseProfile {
    pub fn block(&self, kind: StyleKind) -> &StyleBlock {
        match kind {
            StyleKind::Melee => &self.melee,
            StyleKind::Ranged => &self.ranged,
            StyleKind::Magic => &self.magic,
            StyleKind::ChargeUp => &self.charge_up,
        }
    }

    pub fn block_mut(&mut self, kind: StyleKind) -> &mut StyleBlock {
        match kind {
            StyleKind::Melee => &mut self.melee,
            StyleKind::Ranged => &mut self.ranged,
            StyleKind::Magic => &mut self.magic,
            StyleKind::ChargeUp => &mut self.charge_up,
        }
    }

    pub fn is_triggered_by(&self, signal: SignalId, variant: Option<VariantId>) -> bool {
        self.trigger_signals.contains(&signal)
            || variant.is_some_and(|v| self.trigger_variants.contains(&v))
    }

    /// Block whose selected signal is `signal`, in fallback order.
    pub fn block_selecting(&self, signal: SignalId) -> Option<StyleKind> {
        StyleKind::ALL
            .into_iter()
            .find(|&k| self.block(k).selected_signal == Some(signal))
    }

    pub fn clear_blocks(&mut self) {
        for kind in StyleKind::ALL {
            self.block_mut(kind).clear();
        }
    }

    fn normalize(&mut self) {
        for kind in StyleKind::ALL {
            self.block_mut(kind).normalize();
        }
    }
}

/// Insertion-ordered phase table. Serialized as a JSON object in declared order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseMap {
    entries: Vec<(String, PhaseProfile)>,
}

impl PhaseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PhaseProfile> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PhaseProfile> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or replace; a new name is appended at the end.
    pub fn insert(&mut self, name: impl Into<String>, phase: PhaseProfile) -> Option<PhaseProfile> {
        let name = name.into();
        if let Some(existing) = self.get_mut(&name) {
            return Some(std::mem::replace(existing, phase));
        }
        self.entries.push((name, phase));
        None
    }

    pub fn remove(&mut self, name: &str) -> Option<PhaseProfile> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PhaseProfile)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut PhaseProfile> {
        self.entries.iter_mut().map(|(_, p)| p)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PhaseMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, phase) in &self.entries {
            map.serialize_entry(name, phase)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PhaseMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PhaseMapVisitor;

        impl<'de> Visitor<'de> for PhaseMapVisitor {
            type Value = PhaseMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of phase name to phase profile")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PhaseMap, A::Error> {
                let mut phases = PhaseMap::new();
                while let Some((name, phase)) = access.next_entry::<String, PhaseProfile>()? {
                    if name == BASE_PHASE {
                        continue;
                    }
                    phases.insert(name, phase);
                }
                Ok(phases)
            }
        }

        deserializer.deserialize_map(PhaseMapVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityProfile {
    pub key: String,
    pub name: String,
    pub level: i32,
    pub variant_ids: BTreeSet<VariantId>,
    pub base: PhaseProfile,
    pub phases: PhaseMap,
}

impl EntityProfile {
    pub fn new(key: &EntityKey) -> Self {
        Self {
            key: key.key.clone(),
            name: key.name.clone(),
            level: key.level,
            ..Default::default()
        }
    }

    /// Phase by name; `base` resolves to the base phase.
    pub fn phase(&self, name: &str) -> Option<&PhaseProfile> {
        if name == BASE_PHASE {
            Some(&self.base)
        } else {
            self.phases.get(name)
        }
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut PhaseProfile> {
        if name == BASE_PHASE {
            Some(&mut self.base)
        } else {
            self.phases.get_mut(name)
        }
    }

    pub fn clear_selections(&mut self) {
        self.base.clear_blocks();
        for phase in self.phases.values_mut() {
            phase.clear_blocks();
        }
    }

    pub fn label(&self) -> String {
        format!("{} · {}", self.name, self.level)
    }

    pub(crate) fn normalize(&mut self, key: &str) {
        self.key = key.to_string();
        self.base.normalize();
        for phase in self.phases.values_mut() {
            phase.normalize();
        }
    }
}

/// Result of `ProfileStore::get_or_create_by_identity`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Touch {
    pub created: bool,
    pub variant_added: bool,
}

impl Touch {
    pub fn changed(&self) -> bool {
        self.created || self.variant_added
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: BTreeMap<String, EntityProfile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: BTreeMap<String, EntityProfile>) -> Self {
        Self { profiles }
    }

    pub fn get_or_create_by_identity(
        &mut self,
        name: &str,
        level: i32,
        variant: Option<VariantId>,
    ) -> (&mut EntityProfile, Touch) {
        let key = EntityKey::of(name, level);
        let mut touch = Touch::default();

        let profile = self.profiles.entry(key.key.clone()).or_insert_with(|| {
            touch.created = true;
            EntityProfile::new(&key)
        });

        if let Some(v) = variant.filter(|&v| v > 0) {
            touch.variant_added = profile.variant_ids.insert(v);
        }

        (profile, touch)
    }

    pub fn get(&self, key: &str) -> Option<&EntityProfile> {
        self.profiles.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut EntityProfile> {
        self.profiles.get_mut(key)
    }

    /// Full replace, keyed by the profile's own key.
    pub fn put(&mut self, profile: EntityProfile) -> Option<EntityProfile> {
        self.profiles.insert(profile.key.clone(), profile)
    }

    pub fn remove(&mut self, key: &str) -> Option<EntityProfile> {
        self.profiles.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.profiles.contains_key(key)
    }

    /// Substring match on name or level, ordered by name then level.
    pub fn search(&self, query: &str) -> Vec<&EntityProfile> {
        let q = query.trim().to_lowercase();
        let mut hits: Vec<&EntityProfile> = self
            .profiles
            .values()
            .filter(|p| {
                q.is_empty()
                    || p.name.to_lowercase().contains(&q)
                    || p.level.to_string().contains(&q)
            })
            .collect();
        hits.sort_by_cached_key(|p| (p.name.to_lowercase(), p.level));
        hits
    }

    pub fn all(&self) -> impl Iterator<Item = &EntityProfile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
    }

    pub fn snapshot(&self) -> BTreeMap<String, EntityProfile> {
        self.profiles.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_ticks_prefers_override() {
        let mut block = StyleBlock::default();
        assert_eq!(block.effective_ticks(None), None);

        block.set_base_ticks(Some(4));
        block.select(Some(42));
        assert_eq!(block.effective_ticks(None), Some(4));

        block.set_override(42, Some(6), Some(-1), None);
        assert_eq!(block.effective_ticks(None), Some(5));
        // Other signals fall back to the block defaults.
        assert_eq!(block.effective_ticks(Some(43)), Some(4));
    }

    #[test]
    fn test_effective_ticks_clamped() {
        let mut block = StyleBlock::default();
        block.set_base_ticks(Some(2));
        block.set_base_offset(-9);
        assert_eq!(block.effective_ticks(None), Some(1));

        block.set_base_ticks(Some(14));
        block.set_base_offset(40);
        assert_eq!(block.base_offset, MAX_OFFSET);
        assert_eq!(block.effective_ticks(None), Some(15));
    }

    #[test]
    fn test_promotion_respects_user_override() {
        let mut block = StyleBlock::default();
        assert!(block.promote_learned_ticks(42, 4));
        assert!(block.promote_learned_ticks(42, 5));
        assert_eq!(block.overrides[&42].ticks, Some(5));

        block.set_override(42, Some(7), None, None);
        assert!(!block.promote_learned_ticks(42, 3));
        assert_eq!(block.overrides[&42].ticks, Some(7));
    }

    #[test]
    fn test_empty_override_removed() {
        let mut block = StyleBlock::default();
        block.set_override(1, Some(3), None, None);
        block.set_override(1, None, None, None);
        assert!(block.overrides.is_empty());
    }

    #[test]
    fn test_block_mutation_is_scoped() {
        let mut phase = PhaseProfile::default();
        phase.block_mut(StyleKind::Ranged).select(Some(10));
        phase.block_mut(StyleKind::Magic).select(Some(11));

        phase.block_mut(StyleKind::Ranged).clear();
        assert!(!phase.ranged.is_configured());
        assert_eq!(phase.magic.selected_signal, Some(11));
        assert_eq!(phase.block_selecting(11), Some(StyleKind::Magic));
    }

    #[test]
    fn test_phase_map_keeps_declared_order() {
        let mut phases = PhaseMap::new();
        phases.insert("zeta", PhaseProfile::default());
        phases.insert("alpha", PhaseProfile::default());
        phases.insert("mid", PhaseProfile::default());

        let json = serde_json::to_string(&phases).unwrap();
        let back: PhaseMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut store = ProfileStore::new();
        let (_, t1) = store.get_or_create_by_identity("Zulrah", 725, Some(2042));
        assert!(t1.created && t1.variant_added);

        let (p, t2) = store.get_or_create_by_identity("zulrah ", 725, Some(2043));
        assert!(!t2.created && t2.variant_added);
        assert_eq!(p.variant_ids.len(), 2);

        let (_, t3) = store.get_or_create_by_identity("Zulrah", 725, Some(2042));
        assert!(!t3.changed());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_search_sorted_by_name_then_level() {
        let mut store = ProfileStore::new();
        store.get_or_create_by_identity("Vorkath", 732, None);
        store.get_or_create_by_identity("General Graardor", 624, None);
        store.get_or_create_by_identity("Vorkath", 392, None);

        let all: Vec<_> = store.search("").iter().map(|p| p.key.clone()).collect();
        assert_eq!(all, vec!["general_graardor#624", "vorkath#392", "vorkath#732"]);

        let by_level: Vec<_> = store.search("62").iter().map(|p| p.key.clone()).collect();
        assert_eq!(by_level, vec!["general_graardor#624"]);

        assert_eq!(store.search("VORK").len(), 2);
    }

    #[test]
    fn test_search_order_ignores_case() {
        let mut store = ProfileStore::new();
        store.get_or_create_by_identity("Zulrah", 725, None);
        store.get_or_create_by_identity("abyssal sire", 350, None);
        store.get_or_create_by_identity("Kree'arra", 580, None);

        let names: Vec<_> = store.search("").iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["abyssal sire", "Kree'arra", "Zulrah"]);
    }
}
