//! Per-(entity, signal) observation statistics.
//!
//! Rows accumulate passively: every sighting bumps the seen counter, and
//! swing-to-swing gaps are only sampled once a row is classified as an
//! attack. Repetition alone never classifies a signal; idle and movement
//! animations repeat too.

use crate::algo::rolling::RollingWindow;
use crate::{SignalId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const MAX_GAP_TICKS: i32 = 60;
pub const MIN_CADENCE_TICKS: i32 = 1;
pub const MAX_CADENCE_TICKS: i32 = 15;
pub const MIN_PROJECTILE_SPEED: i32 = 1;
pub const MAX_PROJECTILE_SPEED: i32 = 60;

/// What kind of signal a row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalClass {
    #[default]
    Unknown,
    Attack,
    NonAttack,
    ChargeUp,
}

/// Combat style carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttackStyle {
    #[default]
    Unknown,
    Melee,
    Ranged,
    Magic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecordingRow {
    pub signal_id: SignalId,
    /// User tag, or `Attack` once the feedback tagger confirms it
    pub class: SignalClass,
    pub style: AttackStyle,
    /// Every sighting, whatever the class
    pub seen_count: u32,
    pub last_seen_tick: Option<Tick>,
    /// User-entered cadence; wins over the learned median
    pub user_ticks: Option<i32>,
    /// User-entered projectile travel time
    pub user_projectile_speed: Option<i32>,
    /// Swing-to-swing gaps, clamped to `[1, 60]`
    pub recent_gaps: RollingWindow,
    pub recent_projectile_speeds: RollingWindow,
    /// Signal-to-confirmation deltas fed by the feedback tagger, clamped to `[0, 60]`
    pub confirm_latencies: RollingWindow,
}

impl RecordingRow {
    pub fn new(signal_id: SignalId) -> Self {
        Self {
            signal_id,
            ..Default::default()
        }
    }

    pub fn push_gap(&mut self, gap: i64) -> bool {
        if gap <= 0 {
            return false;
        }
        let gap = gap.min(MAX_GAP_TICKS as i64) as i32;
        self.recent_gaps.push(gap)
    }

    pub fn push_projectile_speed(&mut self, speed: i32) -> bool {
        self.recent_projectile_speeds.push(speed)
    }

    pub fn push_confirm_latency(&mut self, delta: i64) -> bool {
        let delta = delta.clamp(0, MAX_GAP_TICKS as i64) as i32;
        self.confirm_latencies.push_non_negative(delta)
    }

    /// Live cadence estimate. Recomputed from the window on every call.
    pub fn live_estimate_ticks(&self) -> Option<i32> {
        if let Some(user) = self.user_ticks {
            return Some(user);
        }
        self.recent_gaps
            .median_clamped(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS)
    }

    pub fn live_projectile_speed(&self) -> Option<i32> {
        if let Some(user) = self.user_projectile_speed {
            return Some(user);
        }
        self.recent_projectile_speeds
            .median_clamped(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED)
    }

    pub fn latency_estimate(&self) -> Option<i32> {
        self.confirm_latencies.median()
    }

    /// Drop tags, overrides and learned windows; keep sighting history.
    pub fn forget_learning(&mut self) {
        self.class = SignalClass::Unknown;
        self.style = AttackStyle::Unknown;
        self.user_ticks = None;
        self.user_projectile_speed = None;
        self.recent_gaps.clear();
        self.recent_projectile_speeds.clear();
        self.confirm_latencies.clear();
    }

    pub fn normalize(&mut self, signal_id: SignalId) {
        self.signal_id = signal_id;
        self.user_ticks = self
            .user_ticks
            .map(|t| t.clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS));
        self.user_projectile_speed = self
            .user_projectile_speed
            .map(|s| s.clamp(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED));
    }
}

pub type SignalRows = BTreeMap<SignalId, RecordingRow>;

static EMPTY_ROWS: SignalRows = BTreeMap::new();

/// Outcome of a single sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub seen_count: u32,
    /// Gap pushed into `recent_gaps`, if any
    pub gap: Option<i64>,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingStore {
    rows: HashMap<String, SignalRows>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (String, SignalRows)>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
        }
    }

    /// Existing row or a fresh `Unknown` one; never overwrites tags.
    pub fn get_or_create(&mut self, entity: &str, signal: SignalId) -> &mut RecordingRow {
        self.rows
            .entry(entity.to_string())
            .or_default()
            .entry(signal)
            .or_insert_with(|| RecordingRow::new(signal))
    }

    pub fn get(&self, entity: &str, signal: SignalId) -> Option<&RecordingRow> {
        self.rows.get(entity).and_then(|rows| rows.get(&signal))
    }

    pub fn get_mut(&mut self, entity: &str, signal: SignalId) -> Option<&mut RecordingRow> {
        self.rows.get_mut(entity).and_then(|rows| rows.get_mut(&signal))
    }

    /// Read view of every row for an entity; empty when nothing was recorded.
    pub fn all_for(&self, entity: &str) -> &SignalRows {
        self.rows.get(entity).unwrap_or(&EMPTY_ROWS)
    }

    pub fn record_observation(&mut self, entity: &str, signal: SignalId, now: Tick) -> Sighting {
        let created = self.get(entity, signal).is_none();
        let row = self.get_or_create(entity, signal);

        let previous = row.last_seen_tick;
        row.seen_count = row.seen_count.saturating_add(1);
        row.last_seen_tick = Some(now);

        let mut gap = None;
        if row.class == SignalClass::Attack {
            if let Some(prev) = previous {
                let delta = now - prev;
                if row.push_gap(delta) {
                    gap = Some(delta.min(MAX_GAP_TICKS as i64));
                }
            }
        }

        Sighting {
            seen_count: row.seen_count,
            gap,
            created,
        }
    }

    pub fn set_class(&mut self, entity: &str, signal: SignalId, class: SignalClass) {
        self.get_or_create(entity, signal).class = class;
    }

    pub fn set_style(&mut self, entity: &str, signal: SignalId, style: AttackStyle) {
        self.get_or_create(entity, signal).style = style;
    }

    pub fn set_user_ticks(&mut self, entity: &str, signal: SignalId, ticks: Option<i32>) {
        self.get_or_create(entity, signal).user_ticks =
            ticks.map(|t| t.clamp(MIN_CADENCE_TICKS, MAX_CADENCE_TICKS));
    }

    pub fn set_user_projectile_speed(&mut self, entity: &str, signal: SignalId, speed: Option<i32>) {
        self.get_or_create(entity, signal).user_projectile_speed =
            speed.map(|s| s.clamp(MIN_PROJECTILE_SPEED, MAX_PROJECTILE_SPEED));
    }

    pub fn record_projectile_speed(&mut self, entity: &str, signal: SignalId, speed: i32) -> bool {
        if speed <= 0 {
            return false;
        }
        self.get_or_create(entity, signal).push_projectile_speed(speed)
    }

    pub fn remove_row(&mut self, entity: &str, signal: SignalId) -> Option<RecordingRow> {
        let rows = self.rows.get_mut(entity)?;
        let removed = rows.remove(&signal);
        if rows.is_empty() {
            self.rows.remove(entity);
        }
        removed
    }

    pub fn remove_entity(&mut self, entity: &str) -> Option<SignalRows> {
        self.rows.remove(entity)
    }

    pub fn relearn(&mut self, entity: &str) -> bool {
        match self.rows.get_mut(entity) {
            Some(rows) => {
                rows.values_mut().for_each(RecordingRow::forget_learning);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn entity_count(&self) -> usize {
        self.rows.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SignalRows)> {
        self.rows.iter()
    }
}
