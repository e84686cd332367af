//! Campaign/message queue and warm-up persistence.
//!
//! The dispatcher only talks to the [`CampaignStore`] and [`ChipStore`] traits.
//! Every call commits before returning. [`MemoryStore`] is the in-process
//! implementation used by the CLI and by tests.

use crate::error::{CampaignError, CampaignResult};
use crate::types::{
    Campaign, CampaignPacing, CampaignStatus, ChipStatus, Contact, Message, MessageStats,
    MessageStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn get_campaign(&self, id: Uuid) -> CampaignResult<Option<Campaign>>;

    /// Pending messages of a campaign in insertion order.
    async fn get_pending_messages(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> CampaignResult<Vec<Message>>;

    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> CampaignResult<()>;

    /// Recompute the sent/failed/pending counters from the message queue.
    async fn update_campaign_counts(&self, campaign_id: Uuid) -> CampaignResult<Campaign>;

    async fn update_campaign_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> CampaignResult<()>;

    async fn message_stats(&self, campaign_id: Uuid) -> CampaignResult<MessageStats>;

    /// Move a campaign to `next` if [`CampaignStatus::can_transition_to`]
    /// allows it. Returns the status it left.
    async fn transition_campaign(
        &self,
        campaign_id: Uuid,
        next: CampaignStatus,
    ) -> CampaignResult<CampaignStatus> {
        let campaign = self
            .get_campaign(campaign_id)
            .await?
            .ok_or(CampaignError::NotFound(campaign_id))?;
        if !campaign.status.can_transition_to(next) {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status,
                to: next,
            });
        }
        self.update_campaign_status(campaign_id, next).await?;
        Ok(campaign.status)
    }
}

#[async_trait]
pub trait ChipStore: Send + Sync {
    async fn get_chip(&self, identity: &str) -> CampaignResult<Option<ChipStatus>>;

    async fn save_chip(&self, chip: ChipStatus) -> CampaignResult<()>;

    /// Add one to today's send counter and return the updated record.
    async fn increment_chip_sent(
        &self,
        identity: &str,
        at: DateTime<Utc>,
    ) -> CampaignResult<ChipStatus>;

    async fn list_chips(&self) -> CampaignResult<Vec<ChipStatus>>;
}

/// In-memory store backed by DashMap.
#[derive(Default)]
pub struct MemoryStore {
    campaigns: DashMap<Uuid, Campaign>,
    /// Message queues keyed by campaign, in insertion order.
    queues: DashMap<Uuid, RwLock<Vec<Message>>>,
    /// message id -> campaign id
    message_index: DashMap<Uuid, Uuid>,
    chips: DashMap<String, ChipStatus>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_campaign(
        &self,
        name: impl Into<String>,
        message_template: impl Into<String>,
        pacing: CampaignPacing,
    ) -> Campaign {
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: name.into(),
            message_template: message_template.into(),
            status: CampaignStatus::Created,
            total_contacts: 0,
            sent_count: 0,
            failed_count: 0,
            pending_count: 0,
            pacing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.queues.insert(campaign.id, RwLock::new(Vec::new()));
        self.campaigns.insert(campaign.id, campaign.clone());
        tracing::debug!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        campaign
    }

    /// Attach contacts to a campaign, queueing one pending message each.
    /// Returns the number of messages queued.
    pub fn add_contacts(&self, campaign_id: Uuid, contacts: Vec<Contact>) -> CampaignResult<usize> {
        let template = self
            .campaigns
            .get(&campaign_id)
            .map(|c| c.message_template.clone())
            .ok_or(CampaignError::NotFound(campaign_id))?;

        let queue = self
            .queues
            .get(&campaign_id)
            .ok_or(CampaignError::NotFound(campaign_id))?;
        let now = Utc::now();
        let count = contacts.len();
        {
            let mut messages = queue.write();
            for contact in contacts {
                let message = Message {
                    id: Uuid::new_v4(),
                    campaign_id,
                    phone: contact.phone,
                    text: template.clone(),
                    variables: contact.variables,
                    status: MessageStatus::Pending,
                    attempt_count: 0,
                    error_message: None,
                    sent_at: None,
                    created_at: now,
                };
                self.message_index.insert(message.id, campaign_id);
                messages.push(message);
            }
        }
        drop(queue);

        self.recount(campaign_id)?;
        Ok(count)
    }

    /// All messages of a campaign in insertion order.
    pub fn messages(&self, campaign_id: Uuid) -> Vec<Message> {
        self.queues
            .get(&campaign_id)
            .map(|q| q.read().clone())
            .unwrap_or_default()
    }

    pub fn message(&self, message_id: Uuid) -> Option<Message> {
        let campaign_id = *self.message_index.get(&message_id)?;
        let queue = self.queues.get(&campaign_id)?;
        let found = queue.read().iter().find(|m| m.id == message_id).cloned();
        found
    }

    fn stats(&self, campaign_id: Uuid) -> CampaignResult<MessageStats> {
        let queue = self
            .queues
            .get(&campaign_id)
            .ok_or(CampaignError::NotFound(campaign_id))?;
        let mut stats = MessageStats::default();
        for message in queue.read().iter() {
            stats.record(message.status);
        }
        Ok(stats)
    }

    fn recount(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        let stats = self.stats(campaign_id)?;
        let mut campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or(CampaignError::NotFound(campaign_id))?;
        campaign.total_contacts = stats.total;
        campaign.sent_count = stats.sent;
        campaign.failed_count = stats.failed;
        campaign.pending_count = stats.pending;
        Ok(campaign.clone())
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn get_campaign(&self, id: Uuid) -> CampaignResult<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|c| c.clone()))
    }

    async fn get_pending_messages(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> CampaignResult<Vec<Message>> {
        let queue = self
            .queues
            .get(&campaign_id)
            .ok_or(CampaignError::NotFound(campaign_id))?;
        let pending = queue
            .read()
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .take(limit)
            .cloned()
            .collect();
        Ok(pending)
    }

    async fn update_message_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> CampaignResult<()> {
        let campaign_id = *self
            .message_index
            .get(&message_id)
            .ok_or(CampaignError::MessageNotFound(message_id))?;
        let queue = self
            .queues
            .get(&campaign_id)
            .ok_or(CampaignError::NotFound(campaign_id))?;
        let mut messages = queue.write();
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(CampaignError::MessageNotFound(message_id))?;

        message.status = status;
        match status {
            MessageStatus::Sending => message.attempt_count += 1,
            MessageStatus::Sent => {
                message.sent_at = Some(Utc::now());
                message.error_message = None;
            }
            _ => {}
        }
        if let Some(error) = error {
            message.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn update_campaign_counts(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        self.recount(campaign_id)
    }

    async fn update_campaign_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> CampaignResult<()> {
        let mut campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or(CampaignError::NotFound(campaign_id))?;
        let now = Utc::now();
        match status {
            CampaignStatus::Running => campaign.started_at = Some(now),
            CampaignStatus::Completed | CampaignStatus::Cancelled => {
                campaign.completed_at = Some(now)
            }
            _ => {}
        }
        campaign.status = status;
        Ok(())
    }

    async fn message_stats(&self, campaign_id: Uuid) -> CampaignResult<MessageStats> {
        self.stats(campaign_id)
    }
}

#[async_trait]
impl ChipStore for MemoryStore {
    async fn get_chip(&self, identity: &str) -> CampaignResult<Option<ChipStatus>> {
        Ok(self.chips.get(identity).map(|c| c.clone()))
    }

    async fn save_chip(&self, chip: ChipStatus) -> CampaignResult<()> {
        self.chips.insert(chip.identity.clone(), chip);
        Ok(())
    }

    async fn increment_chip_sent(
        &self,
        identity: &str,
        at: DateTime<Utc>,
    ) -> CampaignResult<ChipStatus> {
        let mut chip = self
            .chips
            .get_mut(identity)
            .ok_or_else(|| CampaignError::Store(format!("unknown identity: {identity}")))?;
        chip.messages_sent_today += 1;
        chip.updated_at = at;
        Ok(chip.clone())
    }

    async fn list_chips(&self) -> CampaignResult<Vec<ChipStatus>> {
        let mut chips: Vec<ChipStatus> = self.chips.iter().map(|c| c.clone()).collect();
        chips.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(chips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn contact(phone: &str) -> Contact {
        Contact {
            phone: phone.to_string(),
            variables: HashMap::from([("nome".to_string(), format!("user-{phone}"))]),
        }
    }

    #[tokio::test]
    async fn test_add_contacts_sets_counts() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign("Janeiro", "{Oi|Olá} {nome}", CampaignPacing::default());
        let queued = store
            .add_contacts(campaign.id, vec![contact("5511900000001"), contact("5511900000002")])
            .unwrap();
        assert_eq!(queued, 2);

        let campaign = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.total_contacts, 2);
        assert_eq!(campaign.pending_count, 2);
        assert_eq!(campaign.status, CampaignStatus::Created);
    }

    #[tokio::test]
    async fn test_pending_messages_keep_insertion_order() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign("Ordem", "oi", CampaignPacing::default());
        let phones: Vec<String> = (0..5).map(|i| format!("55119000000{i:02}")).collect();
        store
            .add_contacts(campaign.id, phones.iter().map(|p| contact(p)).collect())
            .unwrap();

        let first = store.get_pending_messages(campaign.id, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].phone, phones[0]);
        assert_eq!(first[2].phone, phones[2]);

        store
            .update_message_status(first[0].id, MessageStatus::Sent, None)
            .await
            .unwrap();
        let next = store.get_pending_messages(campaign.id, 10).await.unwrap();
        assert_eq!(next.len(), 4);
        assert_eq!(next[0].phone, phones[1]);
    }

    #[tokio::test]
    async fn test_status_updates_and_recount() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign("Contagem", "oi", CampaignPacing::default());
        store
            .add_contacts(campaign.id, vec![contact("1"), contact("2"), contact("3")])
            .unwrap();
        let messages = store.messages(campaign.id);

        store
            .update_message_status(messages[0].id, MessageStatus::Sending, None)
            .await
            .unwrap();
        store
            .update_message_status(messages[0].id, MessageStatus::Sent, None)
            .await
            .unwrap();
        store
            .update_message_status(messages[1].id, MessageStatus::Failed, Some("HTTP 500"))
            .await
            .unwrap();

        let campaign = store.update_campaign_counts(campaign.id).await.unwrap();
        assert_eq!(campaign.sent_count, 1);
        assert_eq!(campaign.failed_count, 1);
        assert_eq!(campaign.pending_count, 1);
        assert_eq!(
            campaign.sent_count + campaign.failed_count + campaign.pending_count,
            campaign.total_contacts
        );

        let sent = store.message(messages[0].id).unwrap();
        assert_eq!(sent.attempt_count, 1);
        assert!(sent.sent_at.is_some());
        let failed = store.message(messages[1].id).unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn test_campaign_status_timestamps() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign("Datas", "oi", CampaignPacing::default());
        store
            .update_campaign_status(campaign.id, CampaignStatus::Running)
            .await
            .unwrap();
        store
            .update_campaign_status(campaign.id, CampaignStatus::Completed)
            .await
            .unwrap();
        let campaign = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert!(campaign.started_at.is_some());
        assert!(campaign.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_errors() {
        let store = MemoryStore::new();
        let missing = Uuid::new_v4();
        assert!(store.get_campaign(missing).await.unwrap().is_none());
        assert!(matches!(
            store.update_campaign_status(missing, CampaignStatus::Running).await,
            Err(CampaignError::NotFound(_))
        ));
        assert!(matches!(
            store
                .update_message_status(missing, MessageStatus::Sent, None)
                .await,
            Err(CampaignError::MessageNotFound(_))
        ));
        assert!(store.increment_chip_sent("nobody", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_follows_state_machine() {
        let store = MemoryStore::new();
        let campaign = store.create_campaign("Fluxo", "oi", CampaignPacing::default());

        let left = store
            .transition_campaign(campaign.id, CampaignStatus::Running)
            .await
            .unwrap();
        assert_eq!(left, CampaignStatus::Created);

        let err = store
            .transition_campaign(campaign.id, CampaignStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CampaignError::InvalidTransition {
                from: CampaignStatus::Running,
                to: CampaignStatus::Running
            }
        ));

        store
            .transition_campaign(campaign.id, CampaignStatus::Completed)
            .await
            .unwrap();
        assert!(store
            .transition_campaign(campaign.id, CampaignStatus::Paused)
            .await
            .is_err());
        let stored = store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert!(stored.completed_at.is_some());

        assert!(matches!(
            store
                .transition_campaign(Uuid::new_v4(), CampaignStatus::Running)
                .await,
            Err(CampaignError::NotFound(_))
        ));
    }
}
