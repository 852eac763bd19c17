//! Phase-locked swing prediction for one live instance.
//!
//! Confirmation and advancement are separate: `confirm_occurrence` is
//! evidence from a real sighting and re-synchronizes the grid, while
//! `auto_advance` only rolls the anchor forward along the predicted grid so
//! the countdown keeps running through gaps in observation.

use crate::Tick;
use crate::recording::MAX_GAP_TICKS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CadenceTracker {
    last_confirmed_tick: Option<Tick>,
    last_gap: Option<Tick>,
}

impl CadenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_confirmed_tick(&self) -> Option<Tick> {
        self.last_confirmed_tick
    }

    pub fn last_gap(&self) -> Option<Tick> {
        self.last_gap
    }

    pub fn is_confirmed(&self) -> bool {
        self.last_confirmed_tick.is_some()
    }

    /// Record a real occurrence at `now`. Returns the clamped gap to the previous one.
    pub fn confirm_occurrence(&mut self, now: Tick) -> Option<Tick> {
        let gap = self
            .last_confirmed_tick
            .map(|prev| (now - prev).clamp(1, MAX_GAP_TICKS as Tick));
        if gap.is_some() {
            self.last_gap = gap;
        }
        self.last_confirmed_tick = Some(now);
        gap
    }

    /// Ticks until the next predicted occurrence; `None` before the first confirmation.
    ///
    /// The result is always at least 1: an occurrence predicted for `now`
    /// rolls to the following grid point.
    pub fn ticks_until_next(&self, now: Tick, interval: i32) -> Option<Tick> {
        let last = self.last_confirmed_tick?;
        let interval = Tick::from(interval.max(1));

        let mut next = last + interval;
        if now >= next {
            let jumps = (now - next) / interval + 1;
            next += jumps * interval;
        }
        Some(next - now)
    }

    /// Roll the anchor forward over every predicted occurrence at or before `now`.
    pub fn auto_advance(&mut self, now: Tick, interval: i32) -> bool {
        let Some(last) = self.last_confirmed_tick else {
            return false;
        };
        let interval = Tick::from(interval.max(1));
        if now - last < interval {
            return false;
        }

        let skipped = (now - last) / interval;
        self.last_confirmed_tick = Some(last + skipped * interval);
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
