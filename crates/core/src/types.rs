use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a broadcast campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Created,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl CampaignStatus {
    /// Completed and cancelled have no way out; cancel itself bypasses this
    /// table.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Error)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Error, Running)
                | (Error, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a single queued message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Retrying,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broadcast campaign as owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    /// Spintax template, e.g. `"{Oi|Olá}, {nome}!"`.
    pub message_template: String,
    pub status: CampaignStatus,
    pub total_contacts: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub pending_count: u64,
    pub pacing: CampaignPacing,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-campaign pacing chosen by the operator when the campaign was created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CampaignPacing {
    pub delay_min: u64,
    pub delay_max: u64,
    pub max_per_hour: u32,
}

impl Default for CampaignPacing {
    fn default() -> Self {
        Self {
            delay_min: 5,
            delay_max: 15,
            max_per_hour: 50,
        }
    }
}

/// A single outbound message queued for one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phone: String,
    pub text: String,
    /// Contact variables used when rendering `text`.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A contact attached to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub phone: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Per-status message counts for one campaign.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStats {
    pub total: u64,
    pub pending: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
}

impl MessageStats {
    pub fn record(&mut self, status: MessageStatus) {
        self.total += 1;
        match status {
            MessageStatus::Pending => self.pending += 1,
            MessageStatus::Sending => self.sending += 1,
            MessageStatus::Sent => self.sent += 1,
            MessageStatus::Failed => self.failed += 1,
            MessageStatus::Retrying => self.retrying += 1,
            MessageStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Warm-up record of one sending identity (a connected WhatsApp number).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChipStatus {
    pub identity: String,
    pub first_connected_at: DateTime<Utc>,
    pub daily_limit: u32,
    pub messages_sent_today: u32,
    /// Local calendar date of the last daily counter reset.
    pub last_reset_date: NaiveDate,
    pub is_warm: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        use CampaignStatus::*;
        let all = [Created, Running, Paused, Completed, Cancelled, Error];
        for next in all {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_transitions() {
        use CampaignStatus::*;
        assert!(Created.can_transition_to(Running));
        assert!(Paused.can_transition_to(Running));
        assert!(Error.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Created.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&CampaignStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let status: MessageStatus = serde_json::from_str("\"retrying\"").unwrap();
        assert_eq!(status, MessageStatus::Retrying);
        assert_eq!(MessageStatus::Sent.to_string(), "sent");
    }

    #[test]
    fn test_message_stats_record() {
        let mut stats = MessageStats::default();
        stats.record(MessageStatus::Pending);
        stats.record(MessageStatus::Sent);
        stats.record(MessageStatus::Sent);
        stats.record(MessageStatus::Failed);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.pending + stats.sent + stats.failed, stats.total);
    }
}
