//! Campaign dispatcher — owns the single active dispatch loop and serializes
//! start, pause and cancel.

use crate::pipeline::{DispatchServices, DispatchSettings, Pipeline};
use crate::worker::{self, LoopOutcome};
use campaign_channels::SpintaxEngine;
use campaign_core::types::CampaignStatus;
use campaign_core::{CampaignError, CampaignResult};
use campaign_intelligent_delivery::{RateLimitStats, SmartDelayStats};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub current_campaign_id: Option<Uuid>,
    pub rate_limit: RateLimitStats,
    pub smart_delay: SmartDelayStats,
}

struct ActiveCampaign {
    id: Uuid,
    stop: watch::Sender<bool>,
    handle: JoinHandle<LoopOutcome>,
}

pub struct CampaignDispatcher {
    pipeline: Arc<Pipeline>,
    /// Held across start/pause/cancel so a start cannot slip in while a
    /// pause is draining the loop.
    control: Mutex<Option<ActiveCampaign>>,
    /// Id of the campaign whose loop is live. Cleared by the loop on exit.
    current: Arc<watch::Sender<Option<Uuid>>>,
}

impl CampaignDispatcher {
    pub fn new(services: DispatchServices, settings: DispatchSettings) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            pipeline: Arc::new(Pipeline::new(services, settings)),
            control: Mutex::new(None),
            current: Arc::new(current),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Start (or resume) a campaign and spawn its dispatch loop.
    pub async fn start_campaign(&self, campaign_id: Uuid) -> CampaignResult<()> {
        let mut active = self.control.lock().await;

        if let Some(running) = active.as_ref() {
            if !running.handle.is_finished() {
                return Err(CampaignError::AlreadyRunning(running.id));
            }
        }
        if let Some(finished) = active.take() {
            if let Err(e) = finished.handle.await {
                self.mark_panicked(finished.id, e).await?;
            }
        }

        let store = &self.pipeline.services().store;
        let campaign = store
            .get_campaign(campaign_id)
            .await?
            .ok_or(CampaignError::NotFound(campaign_id))?;

        if !campaign.status.can_transition_to(CampaignStatus::Running) {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Running,
            });
        }

        if self.pipeline.settings().use_spintax {
            let validation = SpintaxEngine::validate(&campaign.message_template);
            if !validation.valid {
                return Err(CampaignError::Template(
                    validation.error.unwrap_or_else(|| "invalid template".to_string()),
                ));
            }
        }

        store
            .transition_campaign(campaign_id, CampaignStatus::Running)
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.current.send_replace(Some(campaign_id));
        let handle = worker::spawn(
            self.pipeline.clone(),
            campaign_id,
            stop_rx,
            self.current.clone(),
        );
        *active = Some(ActiveCampaign {
            id: campaign_id,
            stop: stop_tx,
            handle,
        });

        info!(
            campaign_id = %campaign_id,
            name = %campaign.name,
            pending = campaign.pending_count,
            "Campaign started"
        );
        Ok(())
    }

    /// Stop the active loop after its in-flight message and persist `paused`.
    /// A no-op when nothing is running.
    pub async fn pause_campaign(&self) -> CampaignResult<()> {
        let mut active = self.control.lock().await;
        self.pause_locked(&mut active).await
    }

    async fn pause_locked(&self, active: &mut Option<ActiveCampaign>) -> CampaignResult<()> {
        let Some(campaign) = active.take() else {
            return Ok(());
        };
        campaign.stop.send_replace(true);

        let store = &self.pipeline.services().store;
        match campaign.handle.await {
            Ok(LoopOutcome::Stopped) => {
                store
                    .transition_campaign(campaign.id, CampaignStatus::Paused)
                    .await?;
                info!(campaign_id = %campaign.id, "Campaign paused");
            }
            Ok(outcome) => {
                debug!(campaign_id = %campaign.id, outcome = ?outcome, "Loop had already finished");
            }
            Err(e) => self.mark_panicked(campaign.id, e).await?,
        }
        Ok(())
    }

    /// A loop that panicked never released its slot or left `running`.
    async fn mark_panicked(&self, campaign_id: Uuid, e: JoinError) -> CampaignResult<()> {
        error!(campaign_id = %campaign_id, error = %e, "Dispatch task panicked");
        worker::release(&self.current, campaign_id);
        self.pipeline
            .services()
            .store
            .transition_campaign(campaign_id, CampaignStatus::Error)
            .await?;
        Ok(())
    }

    /// Mark a campaign cancelled, pausing it first when it is the active one.
    /// Cancel bypasses the state machine; cancelling an already cancelled
    /// campaign is a no-op.
    pub async fn cancel_campaign(&self, campaign_id: Uuid) -> CampaignResult<()> {
        let mut active = self.control.lock().await;
        if active.as_ref().map(|a| a.id) == Some(campaign_id) {
            self.pause_locked(&mut active).await?;
        }

        let store = &self.pipeline.services().store;
        let campaign = store
            .get_campaign(campaign_id)
            .await?
            .ok_or(CampaignError::NotFound(campaign_id))?;
        if campaign.status == CampaignStatus::Cancelled {
            debug!(campaign_id = %campaign_id, "Campaign already cancelled");
            return Ok(());
        }

        store.update_campaign_counts(campaign_id).await?;
        store
            .update_campaign_status(campaign_id, CampaignStatus::Cancelled)
            .await?;
        info!(campaign_id = %campaign_id, previous = %campaign.status, "Campaign cancelled");
        Ok(())
    }

    pub fn get_status(&self) -> DispatcherStatus {
        let current = *self.current.borrow();
        let services = self.pipeline.services();
        DispatcherStatus {
            running: current.is_some(),
            current_campaign_id: current,
            rate_limit: services.rate_limiter.get_stats(),
            smart_delay: services.smart_delay.get_stats(),
        }
    }

    /// Resolves once no dispatch loop is live.
    pub async fn wait_idle(&self) {
        let mut current = self.current.subscribe();
        let _ = current.wait_for(|active| active.is_none()).await;
    }

    /// Pause whatever is running. Call before dropping the dispatcher.
    pub async fn shutdown(&self) -> CampaignResult<()> {
        info!("Dispatcher shutting down");
        self.pause_campaign().await
    }
}
