//! Humanized pacing between sends: randomized per-message delays scaled by
//! message length, periodic short and long breaks, and business-hour gating.

use crate::quiet_hours::BusinessHours;
use campaign_core::config::{SmartDelayConfig, Span};
use campaign_core::Clock;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakKind {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBreak {
    pub kind: BreakKind,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartDelayStats {
    pub messages_sent: u64,
    pub next_short_break: u64,
    pub next_long_break: u64,
    pub in_business_hours: bool,
}

#[derive(Debug)]
struct BreakState {
    messages_sent: u64,
    short_counter: u64,
    long_counter: u64,
    short_threshold: u64,
    long_threshold: u64,
}

pub struct SmartDelay {
    config: SmartDelayConfig,
    hours: BusinessHours,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakState>,
}

fn draw(span: Span) -> u64 {
    rand::thread_rng().gen_range(span.min..=span.max)
}

impl SmartDelay {
    pub fn new(config: SmartDelayConfig, clock: Arc<dyn Clock>) -> Self {
        let state = BreakState {
            messages_sent: 0,
            short_counter: 0,
            long_counter: 0,
            short_threshold: draw(config.short_break_every),
            long_threshold: draw(config.long_break_every),
        };
        Self {
            hours: BusinessHours::from_config(&config),
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn is_business_hours(&self) -> bool {
        self.hours.contains(&self.clock.now_local())
    }

    pub fn time_until_business_hours(&self) -> Duration {
        self.hours.until_open(&self.clock.now_local())
    }

    /// Random base delay in `[min, max]` plus a per-character surcharge.
    pub fn message_delay(&self, message_length: usize) -> Duration {
        let base = if self.config.message_delay_max > self.config.message_delay_min {
            rand::thread_rng()
                .gen_range(self.config.message_delay_min..=self.config.message_delay_max)
        } else {
            self.config.message_delay_min
        };
        let total = base + message_length as f64 * self.config.message_length_factor;
        Duration::from_secs_f64(total.max(0.0))
    }

    /// Waits out closed business hours, then the humanized delay for a
    /// message of `message_length` characters.
    pub async fn delay_before_message(&self, message_length: usize) {
        let closed_for = self.time_until_business_hours();
        if !closed_for.is_zero() {
            info!(
                wait_secs = closed_for.as_secs(),
                "Outside business hours, waiting for the window to open"
            );
            tokio::time::sleep(closed_for).await;
        }

        let delay = self.message_delay(message_length);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Count one message and decide whether a break is due. A long break
    /// takes precedence and resets both counters.
    pub fn plan_break(&self) -> Option<PlannedBreak> {
        let mut state = self.state.lock();
        state.messages_sent += 1;
        state.short_counter += 1;
        state.long_counter += 1;

        if state.long_counter >= state.long_threshold {
            state.long_counter = 0;
            state.short_counter = 0;
            state.long_threshold = draw(self.config.long_break_every);
            state.short_threshold = draw(self.config.short_break_every);
            return Some(PlannedBreak {
                kind: BreakKind::Long,
                duration: Duration::from_secs(draw(self.config.long_break_duration)),
            });
        }

        if state.short_counter >= state.short_threshold {
            state.short_counter = 0;
            state.short_threshold = draw(self.config.short_break_every);
            return Some(PlannedBreak {
                kind: BreakKind::Short,
                duration: Duration::from_secs(draw(self.config.short_break_duration)),
            });
        }

        None
    }

    /// Records a sent message and sleeps through a break if one is due.
    /// Returns true only for long breaks.
    ///
    /// Counters are updated before sleeping, so dropping the future
    /// mid-break leaves the state consistent.
    pub async fn check_and_do_break(&self) -> bool {
        let Some(planned) = self.plan_break() else {
            return false;
        };
        info!(
            kind = ?planned.kind,
            duration_secs = planned.duration.as_secs(),
            "Taking a break"
        );
        tokio::time::sleep(planned.duration).await;
        planned.kind == BreakKind::Long
    }

    pub fn get_stats(&self) -> SmartDelayStats {
        let state = self.state.lock();
        SmartDelayStats {
            messages_sent: state.messages_sent,
            next_short_break: state.short_threshold.saturating_sub(state.short_counter),
            next_long_break: state.long_threshold.saturating_sub(state.long_counter),
            in_business_hours: self.is_business_hours(),
        }
    }
}
