//! Feed scheduling: either a fixed interval between feeds or a fixed daily
//! time of day. All operations take `now` explicitly so the arithmetic is
//! deterministic under test; the stored trigger is an absolute unix
//! timestamp (0 = unset).

use chrono::{DateTime, Duration, Local, TimeZone};
use serde::{Deserialize, Serialize};

pub const MIN_FEED_GAP_HOURS: f64 = 1.0;
pub const MAX_FEED_GAP_HOURS: f64 = 48.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduleMode {
    Interval,
    Daily,
}

#[derive(Debug, Clone)]
pub struct FeedScheduler {
    pub mode: ScheduleMode,
    pub feed_gap_hours: f64,
    pub daily_feed_hour: u32,
    pub daily_feed_minute: u32,
    /// Unix timestamp of the next feed, 0 when no feed is scheduled.
    pub next_feed_time: i64,
}

impl Default for FeedScheduler {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::Interval,
            feed_gap_hours: 8.0,
            daily_feed_hour: 6,
            daily_feed_minute: 30,
            next_feed_time: 0,
        }
    }
}

impl FeedScheduler {
    fn gap(&self) -> Duration {
        Duration::seconds((self.feed_gap_hours * 3600.0) as i64)
    }

    /// Local time today at the configured daily hour/minute.
    fn today_target(&self, now: DateTime<Local>) -> DateTime<Local> {
        let naive = now
            .date_naive()
            .and_hms_opt(self.daily_feed_hour.min(23), self.daily_feed_minute.min(59), 0)
            .unwrap_or_else(|| now.naive_local());
        Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or(now)
    }

    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.next_feed_time != 0 && now.timestamp() >= self.next_feed_time
    }

    /// Advance past the trigger that just fired. Called the moment a
    /// scheduled feed is started, before the dispense runs, so a
    /// long-running sequence cannot re-trigger.
    pub fn advance(&mut self, now: DateTime<Local>) {
        match self.mode {
            ScheduleMode::Daily => {
                self.next_feed_time += 24 * 3600;
                tracing::info!("Advanced daily feed time to tomorrow");
            }
            ScheduleMode::Interval => {
                self.next_feed_time = (now + self.gap()).timestamp();
                tracing::info!("Advanced interval feed time by {} hours", self.feed_gap_hours);
            }
        }
    }

    /// Schedule the daily feed: today at the configured time when that is
    /// still ahead, otherwise tomorrow.
    pub fn activate_daily(&mut self, now: DateTime<Local>) {
        let mut target = self.today_target(now);
        if target.timestamp() <= now.timestamp() {
            target += Duration::hours(24);
            tracing::info!("Daily feed time already passed today, scheduling for tomorrow");
        } else {
            tracing::info!("Daily feed time still ahead, scheduling for today");
        }
        self.next_feed_time = target.timestamp();
    }

    /// Switch to interval mode and restart the countdown from now.
    pub fn set_interval_mode(&mut self, now: DateTime<Local>) {
        self.mode = ScheduleMode::Interval;
        self.next_feed_time = (now + self.gap()).timestamp();
        tracing::info!("Interval mode: next feed in {} hours", self.feed_gap_hours);
    }

    /// Startup recovery: a persisted feed time that is already in the past
    /// gets pushed forward instead of firing immediately on boot. Returns
    /// whether the time was changed.
    pub fn reschedule_if_past(&mut self, now: DateTime<Local>) -> bool {
        if self.next_feed_time == 0 || self.next_feed_time >= now.timestamp() {
            return false;
        }
        tracing::warn!("Persisted feed time is in the past, rescheduling");
        match self.mode {
            ScheduleMode::Daily => {
                self.next_feed_time = (self.today_target(now) + Duration::hours(24)).timestamp();
            }
            ScheduleMode::Interval => {
                self.next_feed_time = (now + self.gap()).timestamp();
            }
        }
        true
    }

    pub fn set_feed_gap(&mut self, hours: f64) {
        self.feed_gap_hours = hours.clamp(MIN_FEED_GAP_HOURS, MAX_FEED_GAP_HOURS);
    }

    pub fn set_daily_time(&mut self, hour: u32, minute: u32) {
        self.daily_feed_hour = hour.min(23);
        self.daily_feed_minute = minute.min(59);
    }
}
