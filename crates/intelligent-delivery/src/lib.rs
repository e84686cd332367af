//! Intelligent delivery — sliding-window rate limiting, humanized pacing with
//! business-hour gating and breaks, and sending-identity warm-up.

pub mod quiet_hours;
pub mod smart_delay;
pub mod throttle;
pub mod warmup;

pub use quiet_hours::BusinessHours;
pub use smart_delay::{BreakKind, PlannedBreak, SmartDelay, SmartDelayStats};
pub use throttle::{RateLimitStats, RateLimiter};
pub use warmup::{daily_limit_for_age, WarmUpDecision, WarmUpManager, WarmUpStatus};
