//! Dispatch loop — a Tokio task that drains one campaign's pending messages
//! batch by batch until the queue is empty or a stop is requested.

use crate::pipeline::{until_stopped, MessageOutcome, Pipeline};
use campaign_core::types::{CampaignStatus, MessageStatus};
use campaign_core::{CampaignError, CampaignResult};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a dispatch loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Clear the active-campaign slot if it still names `campaign_id`.
pub(crate) fn release(current: &watch::Sender<Option<Uuid>>, campaign_id: Uuid) {
    current.send_if_modified(|active| {
        if *active == Some(campaign_id) {
            *active = None;
            true
        } else {
            false
        }
    });
}

/// Spawn the dispatch loop for `campaign_id`. The task marks the campaign
/// `error` itself when the loop fails, and releases `current` on exit.
pub(crate) fn spawn(
    pipeline: Arc<Pipeline>,
    campaign_id: Uuid,
    stop: watch::Receiver<bool>,
    current: Arc<watch::Sender<Option<Uuid>>>,
) -> JoinHandle<LoopOutcome> {
    tokio::spawn(async move {
        info!(campaign_id = %campaign_id, "Dispatch loop started");

        let outcome = match run(&pipeline, campaign_id, stop).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Dispatch loop failed");
                if let Err(e) = pipeline
                    .services()
                    .store
                    .transition_campaign(campaign_id, CampaignStatus::Error)
                    .await
                {
                    error!(campaign_id = %campaign_id, error = %e, "Failed to mark campaign as errored");
                }
                LoopOutcome::Failed(e.to_string())
            }
        };

        release(&current, campaign_id);
        info!(campaign_id = %campaign_id, outcome = ?outcome, "Dispatch loop finished");
        outcome
    })
}

/// The loop body. Any error returned here is loop-level; per-message
/// failures are recorded on the message and do not end the loop.
pub async fn run(
    pipeline: &Pipeline,
    campaign_id: Uuid,
    mut stop: watch::Receiver<bool>,
) -> CampaignResult<LoopOutcome> {
    let store = &pipeline.services().store;
    let settings = pipeline.settings();

    store
        .get_campaign(campaign_id)
        .await?
        .ok_or(CampaignError::NotFound(campaign_id))?;

    loop {
        if *stop.borrow() {
            return Ok(LoopOutcome::Stopped);
        }

        let batch = store
            .get_pending_messages(campaign_id, settings.batch_size)
            .await?;

        if batch.is_empty() {
            let stats = store.message_stats(campaign_id).await?;
            if stats.pending == 0 {
                let campaign = store.update_campaign_counts(campaign_id).await?;
                store
                    .transition_campaign(campaign_id, CampaignStatus::Completed)
                    .await?;
                info!(
                    campaign_id = %campaign_id,
                    sent = campaign.sent_count,
                    failed = campaign.failed_count,
                    "Campaign completed"
                );
                return Ok(LoopOutcome::Completed);
            }
        }

        let mut deferred = 0usize;
        for message in &batch {
            if *stop.borrow() {
                return Ok(LoopOutcome::Stopped);
            }

            let outcome = match pipeline.process(message, &mut stop).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        campaign_id = %campaign_id,
                        message_id = %message.id,
                        error = %e,
                        "Message processing failed"
                    );
                    metrics::counter!("dispatch.messages_failed").increment(1);
                    store
                        .update_message_status(message.id, MessageStatus::Failed, Some(&e.to_string()))
                        .await?;
                    MessageOutcome::Failed
                }
            };

            match outcome {
                MessageOutcome::Interrupted(phase) => {
                    debug!(
                        campaign_id = %campaign_id,
                        message_id = %message.id,
                        phase = %phase,
                        "Stop requested, leaving message pending"
                    );
                    store.update_campaign_counts(campaign_id).await?;
                    return Ok(LoopOutcome::Stopped);
                }
                MessageOutcome::Deferred => deferred += 1,
                MessageOutcome::Sent | MessageOutcome::Failed => {}
            }

            store.update_campaign_counts(campaign_id).await?;
        }

        let pause = if !batch.is_empty() && deferred == batch.len() {
            debug!(
                campaign_id = %campaign_id,
                deferred,
                backoff_ms = settings.deferral_backoff.as_millis() as u64,
                "Whole batch deferred by warm-up, backing off"
            );
            settings.deferral_backoff
        } else {
            settings.batch_pause
        };

        if until_stopped(&mut stop, tokio::time::sleep(pause))
            .await
            .is_none()
        {
            return Ok(LoopOutcome::Stopped);
        }
    }
}
