use std::collections::VecDeque;

use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SimError};
use crate::types::Tick;

/// One scheduled catastrophe, as listed by [`EventScheduler::timeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatastropheEvent {
    pub time: Tick,
    pub category: usize,
}

/// Per-category catastrophe timelines, drawn once at setup and consumed
/// tick by tick. Each timeline is strictly increasing; its head may equal
/// the current tick but must never fall behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventScheduler {
    schedules: Vec<VecDeque<Tick>>,
}

impl EventScheduler {
    /// Draw every category's timeline up to (excluding) `max_time`.
    ///
    /// Gaps are exponential with mean `mean_separation`, rounded up to whole
    /// ticks (at least one, so times stay strictly increasing). Categories
    /// are drawn one after the other, which fixes the order of draws.
    pub fn generate(categories: usize, max_time: u64, mean_separation: f64, rng: &mut impl Rng) -> Result<Self, SimError> {
        let gap = Exp::new(1.0 / mean_separation).map_err(|e| ConfigError::InvalidBounds {
            field: "event_time_mean_separation",
            reason: e.to_string(),
        })?;
        let schedules = (0..categories)
            .map(|_| {
                let mut times = VecDeque::new();
                let mut total = 0u64;
                loop {
                    let step: f64 = gap.sample(rng);
                    total += (step.ceil() as u64).max(1);
                    if total >= max_time {
                        break;
                    }
                    times.push_back(Tick(total));
                }
                times
            })
            .collect();
        Ok(EventScheduler { schedules })
    }

    /// Build from explicit timelines (tests and replays).
    pub fn from_schedules(schedules: Vec<Vec<Tick>>) -> Self {
        EventScheduler { schedules: schedules.into_iter().map(VecDeque::from).collect() }
    }

    pub fn categories(&self) -> usize {
        self.schedules.len()
    }

    pub fn head(&self, category: usize) -> Option<Tick> {
        self.schedules[category].front().copied()
    }

    pub fn remaining(&self, category: usize) -> usize {
        self.schedules[category].len()
    }

    /// Whether `category` fires at `t`, consuming the head if so.
    ///
    /// A head strictly before `t` means an earlier tick skipped this
    /// category; that is a fatal ordering bug.
    pub fn advance(&mut self, category: usize, t: Tick) -> Result<bool, SimError> {
        let schedule = &mut self.schedules[category];
        match schedule.front().copied() {
            Some(head) if head < t => Err(SimError::StaleSchedule { category, head, now: t }),
            Some(head) if head == t => {
                schedule.pop_front();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Advance every category at `t`, returning those that fire, in order.
    pub fn advance_all(&mut self, t: Tick) -> Result<Vec<usize>, SimError> {
        let mut fired = Vec::new();
        for category in 0..self.schedules.len() {
            if self.advance(category, t)? {
                fired.push(category);
            }
        }
        Ok(fired)
    }

    /// All remaining events across categories, ordered by time then category.
    pub fn timeline(&self) -> Vec<CatastropheEvent> {
        let mut events: Vec<CatastropheEvent> = self
            .schedules
            .iter()
            .enumerate()
            .flat_map(|(category, times)| times.iter().map(move |&time| CatastropheEvent { time, category }))
            .collect();
        events.sort_unstable();
        events
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(42)
    }

    fn scheduler(max_time: u64) -> EventScheduler {
        EventScheduler::generate(4, max_time, 100.0 / 3.0, &mut rng()).unwrap()
    }

    /// Every timeline is strictly increasing and inside [1, max_time).
    #[test]
    fn timelines_are_strictly_increasing_within_horizon() {
        let s = scheduler(1000);
        for c in 0..s.categories() {
            let times: Vec<u64> = s.schedules[c].iter().map(|t| t.0).collect();
            for pair in times.windows(2) {
                assert!(pair[0] < pair[1], "category {c} not strictly increasing: {times:?}");
            }
            assert!(times.iter().all(|&t| (1..1000).contains(&t)), "category {c} outside horizon");
        }
    }

    /// Mean separation 100/3 over 10 000 ticks → ~300 events per category.
    #[test]
    fn event_count_matches_mean_separation() {
        let s = scheduler(10_000);
        for c in 0..s.categories() {
            let n = s.remaining(c);
            assert!((240..=360).contains(&n), "category {c}: {n} events, expected ~300");
        }
    }

    #[test]
    fn advance_consumes_head_only_on_match() {
        let mut s = EventScheduler::from_schedules(vec![vec![Tick(3), Tick(7)]]);
        assert!(!s.advance(0, Tick(2)).unwrap());
        assert!(s.advance(0, Tick(3)).unwrap());
        assert_eq!(s.head(0), Some(Tick(7)));
        assert!(!s.advance(0, Tick(3)).unwrap(), "the same tick cannot fire twice");
    }

    #[test]
    fn skipped_event_is_fatal() {
        let mut s = EventScheduler::from_schedules(vec![vec![Tick(3)]]);
        let err = s.advance(0, Tick(4)).unwrap_err();
        assert!(matches!(err, SimError::StaleSchedule { category: 0, head: Tick(3), now: Tick(4) }));
    }

    #[test]
    fn exhausted_schedule_never_fires() {
        let mut s = EventScheduler::from_schedules(vec![vec![]]);
        assert!(!s.advance(0, Tick(0)).unwrap());
        assert!(!s.advance(0, Tick(999)).unwrap());
    }

    /// First twenty fire ticks and total event count per category for seed 42,
    /// four categories, mean separation 100/3, horizon 1000. Any added or
    /// dropped draw while generating shifts these.
    const SEED_42_FIRST_FIRES: [[u64; 20]; 4] = [
        [31, 50, 53, 76, 89, 103, 128, 145, 148, 172, 178, 192, 287, 415, 456, 459, 483, 495, 523, 551],
        [10, 14, 108, 143, 152, 185, 195, 206, 247, 348, 356, 371, 454, 489, 523, 558, 610, 648, 650, 678],
        [83, 86, 119, 128, 206, 231, 293, 337, 354, 363, 461, 462, 476, 522, 550, 663, 681, 705, 721, 731],
        [18, 43, 59, 61, 81, 97, 110, 116, 160, 267, 440, 449, 450, 490, 502, 521, 525, 594, 621, 628],
    ];
    const SEED_42_EVENT_COUNTS: [usize; 4] = [32, 30, 27, 32];

    /// The fire/no-fire sequence over 1000 ticks matches the recorded one for
    /// seed 42, and survives a JSON round trip of the scheduler taken mid-run.
    #[test]
    fn advance_sequence_replays_exactly() {
        let record = |s: &mut EventScheduler, from: u64, to: u64| -> Vec<Vec<usize>> {
            (from..to).map(|t| s.advance_all(Tick(t)).unwrap()).collect()
        };

        let mut golden_scheduler = scheduler(1000);
        let golden = record(&mut golden_scheduler, 0, 1000);
        for category in 0..4 {
            let fires: Vec<u64> = (0..1000u64).filter(|&t| golden[t as usize].contains(&category)).collect();
            assert_eq!(fires.len(), SEED_42_EVENT_COUNTS[category], "category {category} event count");
            assert_eq!(fires[..20], SEED_42_FIRST_FIRES[category], "category {category} fire ticks");
        }

        let mut replay = scheduler(1000);
        let mut outcomes = record(&mut replay, 0, 400);
        let saved = serde_json::to_string(&replay).unwrap();
        let mut restored: EventScheduler = serde_json::from_str(&saved).unwrap();
        outcomes.extend(record(&mut restored, 400, 1000));
        assert_eq!(outcomes, golden, "replayed advance sequence diverged");
    }

    #[test]
    fn timeline_is_time_ordered() {
        let s = scheduler(1000);
        let timeline = s.timeline();
        assert_eq!(timeline.len(), (0..4).map(|c| s.remaining(c)).sum::<usize>());
        for pair in timeline.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}
