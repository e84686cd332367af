//! Campaign dispatch — the single-flight campaign state machine and the
//! per-message pipeline that drives warm-up, throttling, pacing, variation and
//! delivery.

pub mod dispatcher;
pub mod pipeline;
pub mod worker;

pub use dispatcher::{CampaignDispatcher, DispatcherStatus};
pub use pipeline::{DispatchServices, DispatchSettings, MessageOutcome, Phase, Pipeline};
pub use worker::LoopOutcome;
