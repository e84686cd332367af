//! JSON campaign definition accepted by `campaign-sender run`.

use anyhow::Context;
use campaign_core::types::{Campaign, CampaignPacing, Contact};
use campaign_core::{CampaignResult, MemoryStore};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct CampaignFile {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub pacing: CampaignPacing,
    pub contacts: Vec<Contact>,
}

impl CampaignFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading campaign file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing campaign file {}", path.display()))
    }

    /// Create the campaign in `store` and attach its contacts. Returns the
    /// new campaign and the number of messages queued.
    pub fn into_store(self, store: &MemoryStore) -> CampaignResult<(Campaign, usize)> {
        let campaign = store.create_campaign(self.name, self.template, self.pacing);
        let queued = store.add_contacts(campaign.id, self.contacts)?;
        Ok((campaign, queued))
    }
}
