//! Per-message dispatch pipeline: rate-limit wait, warm-up admission, break,
//! humanized delay, delivery and outcome recording.

use campaign_channels::{SpintaxEngine, WhatsAppBridge};
use campaign_core::types::{Message, MessageStatus};
use campaign_core::{AppConfig, CampaignError, CampaignResult, CampaignStore, ChipStore, Clock};
use campaign_intelligent_delivery::{RateLimiter, SmartDelay, WarmUpManager};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Named stages of [`Pipeline::process`], used in logs and interruption
/// reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    RateLimit,
    WarmUp,
    Break,
    Delay,
    Send,
    Record,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::WarmUp => "warm_up",
            Self::Break => "break",
            Self::Delay => "delay",
            Self::Send => "send",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Sent,
    Failed,
    /// Refused by warm-up; the message stays pending.
    Deferred,
    /// Stop signal arrived in an interruptible phase; the message stays
    /// pending.
    Interrupted(Phase),
}

/// The services a dispatcher drives, explicitly constructed and shared.
#[derive(Clone)]
pub struct DispatchServices {
    pub store: Arc<dyn CampaignStore>,
    pub warmup: Arc<WarmUpManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub smart_delay: Arc<SmartDelay>,
    pub spintax: Arc<SpintaxEngine>,
    pub bridge: Arc<WhatsAppBridge>,
}

impl DispatchServices {
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn CampaignStore>,
        chips: Arc<dyn ChipStore>,
        clock: Arc<dyn Clock>,
    ) -> CampaignResult<Self> {
        let bridge = WhatsAppBridge::new(&config.bridge)
            .map_err(|e| CampaignError::Bridge(e.to_string()))?;
        Ok(Self {
            store,
            warmup: Arc::new(WarmUpManager::new(
                chips,
                clock.clone(),
                config.warmup.warm_daily_limit,
            )),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            smart_delay: Arc::new(SmartDelay::new(config.smart_delay.clone(), clock)),
            spintax: Arc::new(SpintaxEngine::new()),
            bridge: Arc::new(bridge),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub deferral_backoff: Duration,
    pub use_spintax: bool,
    pub use_typing: bool,
    pub warmup_enabled: bool,
    /// Sending identity checked against warm-up.
    pub identity: String,
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.dispatch.batch_size.max(1),
            batch_pause: Duration::from_millis(config.dispatch.batch_pause_ms),
            deferral_backoff: Duration::from_millis(config.dispatch.deferral_backoff_ms),
            use_spintax: config.dispatch.use_spintax,
            use_typing: config.dispatch.use_typing,
            warmup_enabled: config.warmup.enabled,
            identity: config.warmup.identity.clone(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Resolves once a stop has been requested, or the controlling side is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Run `work` unless a stop arrives first. `None` means stopped.
pub(crate) async fn until_stopped<F: Future>(
    stop: &mut watch::Receiver<bool>,
    work: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop_requested(stop) => None,
        out = work => Some(out),
    }
}

pub struct Pipeline {
    services: DispatchServices,
    settings: DispatchSettings,
}

impl Pipeline {
    pub fn new(services: DispatchServices, settings: DispatchSettings) -> Self {
        Self { services, settings }
    }

    pub fn services(&self) -> &DispatchServices {
        &self.services
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Contact variables plus `phone`/`telefone`, with `nome` falling back to
    /// the phone number.
    pub fn render_variables(message: &Message) -> HashMap<String, String> {
        let mut variables = message.variables.clone();
        variables
            .entry("phone".to_string())
            .or_insert_with(|| message.phone.clone());
        variables
            .entry("telefone".to_string())
            .or_insert_with(|| message.phone.clone());
        variables
            .entry("nome".to_string())
            .or_insert_with(|| message.phone.clone());
        variables
    }

    pub fn render(&self, message: &Message) -> String {
        if !self.settings.use_spintax {
            return message.text.clone();
        }
        self.services
            .spintax
            .render(&message.text, &Self::render_variables(message))
    }

    /// Take one pending message through every phase. Rate-limit, break and
    /// delay waits give way to `stop`; the network call does not.
    pub async fn process(
        &self,
        message: &Message,
        stop: &mut watch::Receiver<bool>,
    ) -> CampaignResult<MessageOutcome> {
        let services = &self.services;

        if until_stopped(stop, services.rate_limiter.wait_for_slot())
            .await
            .is_none()
        {
            return Ok(MessageOutcome::Interrupted(Phase::RateLimit));
        }

        if self.settings.warmup_enabled {
            let decision = services.warmup.can_send(&self.settings.identity).await?;
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "daily limit reached".to_string());
                debug!(
                    message_id = %message.id,
                    phase = %Phase::WarmUp,
                    identity = %self.settings.identity,
                    reason = %reason,
                    "Message deferred"
                );
                metrics::counter!("dispatch.warmup_deferred").increment(1);
                services
                    .store
                    .update_message_status(
                        message.id,
                        MessageStatus::Pending,
                        Some(&format!("Warm-up: {reason}")),
                    )
                    .await?;
                return Ok(MessageOutcome::Deferred);
            }
        }

        if until_stopped(stop, services.smart_delay.check_and_do_break())
            .await
            .is_none()
        {
            return Ok(MessageOutcome::Interrupted(Phase::Break));
        }

        let text = self.render(message);

        if until_stopped(
            stop,
            services.smart_delay.delay_before_message(text.chars().count()),
        )
        .await
        .is_none()
        {
            return Ok(MessageOutcome::Interrupted(Phase::Delay));
        }

        services
            .store
            .update_message_status(message.id, MessageStatus::Sending, None)
            .await?;

        match services
            .bridge
            .send_message(&message.phone, &text, self.settings.use_typing)
            .await
        {
            Ok(receipt) => {
                services
                    .store
                    .update_message_status(message.id, MessageStatus::Sent, None)
                    .await?;
                metrics::counter!("dispatch.messages_sent").increment(1);
                info!(
                    message_id = %message.id,
                    phone = %message.phone,
                    host = %receipt.host,
                    attempts = receipt.attempts,
                    "Message sent"
                );

                if self.settings.warmup_enabled {
                    // the message is out; a bookkeeping failure must not mark it failed
                    if let Err(e) = services.warmup.record_send(&self.settings.identity).await {
                        warn!(
                            phase = %Phase::Record,
                            identity = %self.settings.identity,
                            error = %e,
                            "Failed to record warm-up send"
                        );
                    }
                }
                Ok(MessageOutcome::Sent)
            }
            Err(e) => {
                metrics::counter!("dispatch.messages_failed").increment(1);
                warn!(
                    message_id = %message.id,
                    phone = %message.phone,
                    phase = %Phase::Send,
                    error = %e,
                    "Message delivery failed"
                );
                services
                    .store
                    .update_message_status(message.id, MessageStatus::Failed, Some(&e.to_string()))
                    .await?;
                Ok(MessageOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::config::{BridgeConfig, RateLimitConfig, SmartDelayConfig, Span};
    use campaign_core::types::{CampaignPacing, ChipStatus, Contact};
    use campaign_core::{ManualClock, MemoryStore};
    use chrono::Utc;

    struct Fixture {
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        message: Message,
    }

    fn fixture(
        smart_delay: SmartDelayConfig,
        rate_limit: RateLimitConfig,
        warmup_enabled: bool,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(Utc::now()));
        let campaign = store.create_campaign("promo", "Oi {nome}", CampaignPacing::default());
        store
            .add_contacts(
                campaign.id,
                vec![Contact {
                    phone: "5511999990000".into(),
                    variables: HashMap::new(),
                }],
            )
            .unwrap();
        let message = store.messages(campaign.id).remove(0);

        // nothing listens here; tests below stop before the network call
        let bridge = WhatsAppBridge::new(&BridgeConfig {
            hosts: vec!["http://127.0.0.1:9".to_string()],
            ..BridgeConfig::default()
        })
        .unwrap();

        let services = DispatchServices {
            store: store.clone(),
            warmup: Arc::new(WarmUpManager::new(store.clone(), clock.clone(), 40)),
            rate_limiter: Arc::new(RateLimiter::new(&rate_limit)),
            smart_delay: Arc::new(SmartDelay::new(smart_delay, clock)),
            spintax: Arc::new(SpintaxEngine::with_seed(7)),
            bridge: Arc::new(bridge),
        };
        let settings = DispatchSettings {
            warmup_enabled,
            identity: "chip-1".into(),
            ..DispatchSettings::default()
        };
        Fixture {
            pipeline: Pipeline::new(services, settings),
            store,
            message,
        }
    }

    fn open_rate_limit() -> RateLimitConfig {
        RateLimitConfig {
            max_per_hour: 1000,
            max_per_second: 100,
            poll_interval_ms: 500,
        }
    }

    #[test]
    fn test_render_variables_defaults() {
        let fx = fixture(SmartDelayConfig::immediate(), open_rate_limit(), false);
        let vars = Pipeline::render_variables(&fx.message);
        assert_eq!(vars["phone"], "5511999990000");
        assert_eq!(vars["telefone"], "5511999990000");
        assert_eq!(vars["nome"], "5511999990000");
        assert_eq!(fx.pipeline.render(&fx.message), "Oi 5511999990000");
    }

    #[test]
    fn test_contact_name_wins_over_fallback() {
        let fx = fixture(SmartDelayConfig::immediate(), open_rate_limit(), false);
        let mut message = fx.message.clone();
        message.variables.insert("nome".into(), "Ana".into());
        assert_eq!(fx.pipeline.render(&message), "Oi Ana");
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::RateLimit.to_string(), "rate_limit");
        assert_eq!(Phase::Break.to_string(), "break");
        assert_eq!(Phase::Delay.to_string(), "delay");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_delay_leaves_message_pending() {
        let mut slow = SmartDelayConfig::immediate();
        slow.message_delay_min = 30.0;
        slow.message_delay_max = 30.0;
        let fx = fixture(slow, open_rate_limit(), false);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stop_tx.send_replace(true);
            // keep the sender alive until the pipeline has observed the stop
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let outcome = fx.pipeline.process(&fx.message, &mut stop_rx).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Interrupted(Phase::Delay));

        let stored = fx.store.message(fx.message.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_break_leaves_message_pending() {
        let mut breaks = SmartDelayConfig::immediate();
        breaks.short_break_every = Span::new(1, 1);
        breaks.short_break_duration = Span::new(120, 120);
        let fx = fixture(breaks, open_rate_limit(), false);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stop_tx.send_replace(true);
            stop_tx
        });

        let started = tokio::time::Instant::now();
        let outcome = fx.pipeline.process(&fx.message, &mut stop_rx).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Interrupted(Phase::Break));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        drop(stopper.await.unwrap());

        let stored = fx.store.message(fx.message.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.attempt_count, 0);

        // the break was booked before sleeping, so the next one is a full cycle away
        let stats = fx.pipeline.services().smart_delay.get_stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.next_short_break, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_rate_limit_wait() {
        let fx = fixture(
            SmartDelayConfig::immediate(),
            RateLimitConfig {
                max_per_hour: 1,
                max_per_second: 1,
                poll_interval_ms: 500,
            },
            false,
        );
        assert!(fx.pipeline.services().rate_limiter.acquire());

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stop_tx.send_replace(true);
            stop_tx
        });

        let outcome = fx.pipeline.process(&fx.message, &mut stop_rx).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Interrupted(Phase::RateLimit));
        drop(stopper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warmup_refusal_defers_message() {
        let fx = fixture(SmartDelayConfig::immediate(), open_rate_limit(), true);
        let now = Utc::now();
        fx.store
            .save_chip(ChipStatus {
                identity: "chip-1".into(),
                first_connected_at: now - chrono::Duration::hours(1),
                daily_limit: 5,
                messages_sent_today: 5,
                last_reset_date: now.with_timezone(&chrono::Local).date_naive(),
                is_warm: false,
                updated_at: now,
            })
            .await
            .unwrap();

        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let outcome = fx.pipeline.process(&fx.message, &mut stop_rx).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Deferred);

        let stored = fx.store.message(fx.message.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert!(stored.error_message.unwrap().starts_with("Warm-up: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_stopped_passes_through_result() {
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let out = until_stopped(&mut stop_rx, async { 42 }).await;
        assert_eq!(out, Some(42));

        let (stop_tx, mut stop_rx) = watch::channel(true);
        let out = until_stopped(&mut stop_rx, async { 42 }).await;
        assert_eq!(out, None);
        drop(stop_tx);
    }
}
