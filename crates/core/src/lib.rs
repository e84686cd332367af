pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
pub use store::{CampaignStore, ChipStore, MemoryStore};
