//! Daily fire times with random jitter.

use std::sync::Arc;
use std::time::Duration;

use bs_core::config::{ConfigError, ScheduleConfig};
use bs_harness::shutdown::ShutdownSignal;
use chrono::{DateTime, Days, Local, LocalResult, NaiveTime, TimeZone, Utc};
use rand::Rng;
use tracing::{debug, info};

/// Longest single sleep before the wall clock is checked again.
pub const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Sleeping,
    Firing,
    Stopped,
}

/// Source of the current instant. Real time in production; tests drive a
/// virtual clock.
pub type WallClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct ScheduleClock<Tz: TimeZone = Local> {
    times: Vec<NaiveTime>,
    max_jitter: Duration,
    tz: Tz,
    wall: WallClock,
    state: ClockState,
}

impl ScheduleClock<Local> {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.times()?, config.max_jitter(), Local))
    }
}

impl<Tz: TimeZone> ScheduleClock<Tz> {
    /// `times` must not be empty.
    pub fn new(times: Vec<NaiveTime>, max_jitter: Duration, tz: Tz) -> Self {
        let mut times = times;
        times.sort();
        times.dedup();
        Self {
            times,
            max_jitter,
            tz,
            wall: Arc::new(Utc::now),
            state: ClockState::Idle,
        }
    }

    pub fn with_wall_clock(mut self, wall: WallClock) -> Self {
        self.wall = wall;
        self
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn now(&self) -> DateTime<Tz> {
        (self.wall)().with_timezone(&self.tz)
    }

    /// The next fire instant strictly after `now`.
    ///
    /// Each scheduled time for today and the next two days gets its own
    /// uniform offset in `[0, max_jitter)`, drawn day by day in time order;
    /// the earliest candidate after `now` wins, so a late jitter window that
    /// crosses midnight competes with the next morning's times. A time that
    /// falls in a DST gap is skipped that day; one that falls in a fold uses
    /// the earlier instant.
    pub fn next_fire<R: Rng>(&self, now: &DateTime<Tz>, rng: &mut R) -> DateTime<Tz> {
        let today = now.date_naive();
        let jitter_secs = self.max_jitter.as_secs();

        let mut best: Option<DateTime<Tz>> = None;
        for offset in 0..=2u64 {
            let Some(day) = today.checked_add_days(Days::new(offset)) else {
                continue;
            };
            for time in &self.times {
                let base = match self.tz.from_local_datetime(&day.and_time(*time)) {
                    LocalResult::Single(dt) => dt,
                    LocalResult::Ambiguous(earliest, _) => earliest,
                    LocalResult::None => {
                        debug!(%day, %time, "scheduled time does not exist locally, skipping");
                        continue;
                    }
                };
                let jitter = if jitter_secs > 0 {
                    rng.random_range(0..jitter_secs)
                } else {
                    0
                };
                let candidate = base + chrono::Duration::seconds(jitter as i64);
                if candidate > *now && best.as_ref().is_none_or(|b| candidate < *b) {
                    best = Some(candidate);
                }
            }
        }

        best.unwrap_or_else(|| now.clone() + chrono::Duration::days(1))
    }

    /// Sleep until `target`, re-reading the wall clock at least every
    /// [`MAX_SLEEP_CHUNK`] so a suspend or clock jump cannot delay the fire.
    ///
    /// Returns `false` without firing when shutdown is triggered first.
    pub async fn sleep_until(&mut self, target: &DateTime<Tz>, shutdown: &ShutdownSignal) -> bool {
        self.state = ClockState::Sleeping;
        loop {
            if shutdown.is_shutting_down() {
                self.state = ClockState::Stopped;
                return false;
            }
            let now = self.now();
            if now >= *target {
                break;
            }
            let remaining = (target.clone() - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP_CHUNK);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = shutdown.triggered() => {
                    info!("schedule clock stopped while sleeping");
                    self.state = ClockState::Stopped;
                    return false;
                }
            }
        }
        self.state = ClockState::Firing;
        true
    }

    /// Back to idle after the daemon has handled a fire.
    pub fn fired(&mut self) {
        if self.state == ClockState::Firing {
            self.state = ClockState::Idle;
        }
    }

    /// Stop permanently.
    pub fn stop(&mut self) {
        self.state = ClockState::Stopped;
    }

    /// True when the last successful refresh happened before today and at
    /// least one of today's times has already passed, i.e. a run was
    /// missed while the daemon was down.
    pub fn missed_run<T: TimeZone>(&self, last_update: Option<&DateTime<T>>, now: &DateTime<Tz>) -> bool {
        let Some(last) = last_update else {
            return false;
        };
        let last_day = last.with_timezone(&self.tz).date_naive();
        last_day < now.date_naive() && self.times.iter().any(|t| *t < now.time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn montevideo() -> FixedOffset {
        FixedOffset::west_opt(3 * 3600).unwrap()
    }

    fn at(tz: &FixedOffset, d: u32, h: u32, m: u32) -> DateTime<FixedOffset> {
        tz.from_local_datetime(
            &NaiveDate::from_ymd_opt(2026, 1, d)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn without_jitter_fires_exactly_on_time() {
        let tz = montevideo();
        let clock = ScheduleClock::new(vec![hm(20, 0), hm(7, 0)], Duration::ZERO, tz);
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(clock.next_fire(&at(&tz, 10, 6, 0), &mut rng), at(&tz, 10, 7, 0));
        assert_eq!(clock.next_fire(&at(&tz, 10, 7, 0), &mut rng), at(&tz, 10, 20, 0));
        assert_eq!(clock.next_fire(&at(&tz, 10, 21, 0), &mut rng), at(&tz, 11, 7, 0));
    }

    #[test]
    fn missed_run_detection() {
        let tz = montevideo();
        let clock = ScheduleClock::new(vec![hm(7, 0), hm(20, 0)], Duration::ZERO, tz);
        let yesterday = at(&tz, 9, 20, 10);
        let this_morning = at(&tz, 10, 7, 5);

        assert!(clock.missed_run(Some(&yesterday), &at(&tz, 10, 8, 0)));
        assert!(!clock.missed_run(Some(&yesterday), &at(&tz, 10, 6, 0)));
        assert!(!clock.missed_run(Some(&this_morning), &at(&tz, 10, 21, 0)));
        assert!(!clock.missed_run::<FixedOffset>(None, &at(&tz, 10, 21, 0)));
    }

    #[test]
    fn fired_returns_to_idle_only_from_firing() {
        let mut clock = ScheduleClock::new(vec![hm(7, 0)], Duration::ZERO, montevideo());
        assert_eq!(clock.state(), ClockState::Idle);
        clock.stop();
        clock.fired();
        assert_eq!(clock.state(), ClockState::Stopped);
    }
}
