//! Forwarding pipeline: triage, album buffering, deferral and sequential dispatch.

pub mod album;
pub mod backlog;
pub mod compose;
pub mod dedup;
pub mod deferral;
pub mod dispatch;
pub mod forwarder;
pub mod outcome;
pub mod rate_limit;
pub mod rules;
pub mod timers;
pub mod types;

pub use backlog::{BacklogReport, HistorySource};
pub use compose::DefaultPayloadBuilder;
pub use forwarder::{Forwarder, ForwarderDeps, ShutdownMode, ShutdownReport, Triage};
pub use outcome::{ItemOutcome, OutcomeEvent, StatsSnapshot};
pub use rules::{Attribution, ContentFilters, FilterEngine, FilterRejection, Rule};
pub use types::{
    AuthorDirectory, AuthorInfo, DispatchUnit, EventKey, InboundMessage, MessageSender,
    PayloadBuilder, RuleResolver,
};
