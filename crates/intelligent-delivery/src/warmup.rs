//! Warm-up of new sending identities. A freshly connected number gets a small
//! daily allowance that grows with its age until it is considered warm.

use campaign_core::types::ChipStatus;
use campaign_core::{CampaignResult, ChipStore, Clock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Age in days at which an identity is warm and gets the full allowance.
pub const WARM_AFTER_DAYS: i64 = 15;

/// Daily allowance for an identity of the given age. Non-decreasing in age.
pub fn daily_limit_for_age(age_days: i64, warm_limit: u32) -> u32 {
    match age_days {
        i64::MIN..=-1 => 0,
        0..=3 => 5,
        4..=7 => 15,
        8..=14 => 30,
        _ => warm_limit,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmUpStatus {
    pub identity: String,
    pub age_days: i64,
    pub daily_limit: u32,
    pub sent_today: u32,
    pub remaining: u32,
    pub is_warm: bool,
    pub first_connected_at: DateTime<Utc>,
    /// True only on the call that created the record.
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmUpDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub status: WarmUpStatus,
}

pub struct WarmUpManager {
    store: Arc<dyn ChipStore>,
    clock: Arc<dyn Clock>,
    warm_limit: u32,
}

impl WarmUpManager {
    pub fn new(store: Arc<dyn ChipStore>, clock: Arc<dyn Clock>, warm_limit: u32) -> Self {
        Self {
            store,
            clock,
            warm_limit,
        }
    }

    fn age_days(&self, chip: &ChipStatus, now: DateTime<Utc>) -> i64 {
        (now - chip.first_connected_at)
            .num_seconds()
            .div_euclid(86_400)
    }

    fn status_of(&self, chip: &ChipStatus, now: DateTime<Utc>, is_new: bool) -> WarmUpStatus {
        let age_days = self.age_days(chip, now);
        let daily_limit = daily_limit_for_age(age_days, self.warm_limit);
        WarmUpStatus {
            identity: chip.identity.clone(),
            age_days,
            daily_limit,
            sent_today: chip.messages_sent_today,
            remaining: daily_limit.saturating_sub(chip.messages_sent_today),
            is_warm: age_days >= WARM_AFTER_DAYS,
            first_connected_at: chip.first_connected_at,
            is_new,
        }
    }

    /// Create a record for `identity` if none exists. Idempotent.
    pub async fn register(&self, identity: &str) -> CampaignResult<WarmUpStatus> {
        if let Some(status) = self.get_status(identity).await? {
            return Ok(status);
        }

        let now = self.clock.now();
        let chip = ChipStatus {
            identity: identity.to_string(),
            first_connected_at: now,
            daily_limit: daily_limit_for_age(0, self.warm_limit),
            messages_sent_today: 0,
            last_reset_date: self.clock.today(),
            is_warm: false,
            updated_at: now,
        };
        self.store.save_chip(chip.clone()).await?;
        info!(identity, "Registered new sending identity for warm-up");
        Ok(self.status_of(&chip, now, true))
    }

    /// Current status, applying the daily counter reset and refreshing the
    /// persisted limit when the identity has aged into a new tier.
    pub async fn get_status(&self, identity: &str) -> CampaignResult<Option<WarmUpStatus>> {
        let Some(mut chip) = self.store.get_chip(identity).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let today = self.clock.today();
        let mut dirty = false;

        if chip.last_reset_date != today {
            debug!(identity, previous = %chip.last_reset_date, "Daily warm-up counter reset");
            chip.messages_sent_today = 0;
            chip.last_reset_date = today;
            dirty = true;
        }

        let status = self.status_of(&chip, now, false);
        if chip.daily_limit != status.daily_limit || chip.is_warm != status.is_warm {
            chip.daily_limit = status.daily_limit;
            chip.is_warm = status.is_warm;
            dirty = true;
        }

        if dirty {
            chip.updated_at = now;
            self.store.save_chip(chip).await?;
        }
        Ok(Some(status))
    }

    /// Whether `identity` may send one more message today. Unknown identities
    /// are registered first.
    pub async fn can_send(&self, identity: &str) -> CampaignResult<WarmUpDecision> {
        let status = match self.get_status(identity).await? {
            Some(status) => status,
            None => self.register(identity).await?,
        };

        if status.sent_today >= status.daily_limit {
            return Ok(WarmUpDecision {
                allowed: false,
                reason: Some(format!(
                    "daily limit reached ({}/{} messages, day {}), wait until tomorrow",
                    status.sent_today, status.daily_limit, status.age_days
                )),
                status,
            });
        }

        Ok(WarmUpDecision {
            allowed: true,
            reason: None,
            status,
        })
    }

    /// Count one sent message. Does not check the limit.
    pub async fn record_send(&self, identity: &str) -> CampaignResult<WarmUpStatus> {
        if self.get_status(identity).await?.is_none() {
            self.register(identity).await?;
        }
        let now = self.clock.now();
        let chip = self.store.increment_chip_sent(identity, now).await?;
        Ok(self.status_of(&chip, now, false))
    }

    pub async fn list_identities(&self) -> CampaignResult<Vec<WarmUpStatus>> {
        let mut statuses = Vec::new();
        for chip in self.store.list_chips().await? {
            if let Some(status) = self.get_status(&chip.identity).await? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::{ManualClock, MemoryStore};
    use chrono::{Duration, TimeZone};

    fn setup() -> (WarmUpManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        ));
        let manager = WarmUpManager::new(store.clone(), clock.clone(), 40);
        (manager, store, clock)
    }

    #[test]
    fn test_limit_table() {
        assert_eq!(daily_limit_for_age(-1, 40), 0);
        assert_eq!(daily_limit_for_age(0, 40), 5);
        assert_eq!(daily_limit_for_age(3, 40), 5);
        assert_eq!(daily_limit_for_age(4, 40), 15);
        assert_eq!(daily_limit_for_age(7, 40), 15);
        assert_eq!(daily_limit_for_age(8, 40), 30);
        assert_eq!(daily_limit_for_age(14, 40), 30);
        assert_eq!(daily_limit_for_age(15, 40), 40);
        assert_eq!(daily_limit_for_age(400, 40), 40);
    }

    #[test]
    fn test_limit_is_monotone_in_age() {
        let limits: Vec<u32> = (-5..60).map(|age| daily_limit_for_age(age, 40)).collect();
        assert!(limits.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (manager, _, clock) = setup();
        let first = manager.register("chip-a").await.unwrap();
        assert!(first.is_new);
        assert_eq!(first.daily_limit, 5);
        assert_eq!(first.remaining, 5);

        clock.advance(Duration::hours(2));
        let again = manager.register("chip-a").await.unwrap();
        assert!(!again.is_new);
        assert_eq!(again.first_connected_at, first.first_connected_at);
    }

    #[tokio::test]
    async fn test_second_day_identity_with_two_sends() {
        let (manager, store, clock) = setup();
        let now = clock.now();
        store
            .save_chip(ChipStatus {
                identity: "chip-b".into(),
                first_connected_at: now - Duration::days(1),
                daily_limit: 5,
                messages_sent_today: 2,
                last_reset_date: clock.today(),
                is_warm: false,
                updated_at: now,
            })
            .await
            .unwrap();

        let status = manager.get_status("chip-b").await.unwrap().unwrap();
        assert_eq!(status.age_days, 1);
        assert_eq!(status.daily_limit, 5);
        assert_eq!(status.remaining, 3);
        assert!(manager.can_send("chip-b").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_refuses_at_limit() {
        let (manager, _, _) = setup();
        manager.register("chip-c").await.unwrap();
        for _ in 0..4 {
            manager.record_send("chip-c").await.unwrap();
        }
        assert!(manager.can_send("chip-c").await.unwrap().allowed);

        manager.record_send("chip-c").await.unwrap();
        let decision = manager.can_send("chip-c").await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("daily limit reached"));
        assert_eq!(decision.status.remaining, 0);
    }

    #[tokio::test]
    async fn test_record_send_past_limit_still_counts() {
        let (manager, _, _) = setup();
        for _ in 0..6 {
            manager.record_send("chip-d").await.unwrap();
        }
        let status = manager.get_status("chip-d").await.unwrap().unwrap();
        assert_eq!(status.sent_today, 6);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn test_counter_resets_on_new_day() {
        let (manager, _, clock) = setup();
        for _ in 0..5 {
            manager.record_send("chip-e").await.unwrap();
        }
        assert!(!manager.can_send("chip-e").await.unwrap().allowed);

        clock.advance(Duration::days(1));
        let decision = manager.can_send("chip-e").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.status.sent_today, 0);
        assert_eq!(decision.status.daily_limit, 5);

        // a second read on the same day does not reset again
        manager.record_send("chip-e").await.unwrap();
        let status = manager.get_status("chip-e").await.unwrap().unwrap();
        assert_eq!(status.sent_today, 1);
    }

    #[tokio::test]
    async fn test_limit_grows_with_age_and_is_persisted() {
        let (manager, store, clock) = setup();
        manager.register("chip-f").await.unwrap();

        for (days, limit) in [(4, 15), (8, 30), (15, 40)] {
            clock.set(
                Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap() + Duration::days(days),
            );
            let status = manager.get_status("chip-f").await.unwrap().unwrap();
            assert_eq!(status.daily_limit, limit);
            assert_eq!(store.get_chip("chip-f").await.unwrap().unwrap().daily_limit, limit);
        }

        let status = manager.get_status("chip-f").await.unwrap().unwrap();
        assert!(status.is_warm);
        assert!(store.get_chip("chip-f").await.unwrap().unwrap().is_warm);
    }

    #[tokio::test]
    async fn test_unknown_identity_registered_by_can_send() {
        let (manager, store, _) = setup();
        let decision = manager.can_send("fresh").await.unwrap();
        assert!(decision.allowed);
        assert!(decision.status.is_new);
        assert!(store.get_chip("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_future_connection_date_gets_no_allowance() {
        let (manager, store, clock) = setup();
        let now = clock.now();
        store
            .save_chip(ChipStatus {
                identity: "skewed".into(),
                first_connected_at: now + Duration::hours(3),
                daily_limit: 5,
                messages_sent_today: 0,
                last_reset_date: clock.today(),
                is_warm: false,
                updated_at: now,
            })
            .await
            .unwrap();

        let decision = manager.can_send("skewed").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.status.daily_limit, 0);
    }

    #[tokio::test]
    async fn test_list_identities() {
        let (manager, _, _) = setup();
        manager.register("b").await.unwrap();
        manager.register("a").await.unwrap();
        let listed: Vec<String> = manager
            .list_identities()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.identity)
            .collect();
        assert_eq!(listed, vec!["a", "b"]);
    }
}
