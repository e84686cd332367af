//! Business hours — the local-time window in which messages may go out.

use campaign_core::config::SmartDelayConfig;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BusinessHours {
    pub fn from_config(config: &SmartDelayConfig) -> Self {
        Self {
            enabled: config.respect_business_hours,
            start_hour: config.business_hours_start,
            end_hour: config.business_hours_end,
        }
    }

    /// Whether `now` falls in `[start, end)`. Windows with start > end wrap
    /// past midnight.
    pub fn contains(&self, now: &DateTime<Local>) -> bool {
        if !self.enabled {
            return true;
        }
        let hour = now.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// Time left until the window next opens; zero when already open.
    pub fn until_open(&self, now: &DateTime<Local>) -> Duration {
        if self.contains(now) {
            return Duration::ZERO;
        }
        let day = if now.hour() < self.start_hour {
            now.date_naive()
        } else {
            now.date_naive() + ChronoDuration::days(1)
        };
        let opens_at = NaiveTime::from_hms_opt(self.start_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let naive = day.and_time(opens_at);

        // the opening hour can fall in a DST gap; take the first valid instant after it
        let target = Local
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                Local
                    .from_local_datetime(&(naive + ChronoDuration::hours(1)))
                    .earliest()
            });

        match target {
            Some(target) => (target - *now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::from_secs(3600),
        }
    }
}
