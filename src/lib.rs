pub mod backoff;
pub mod bbcode;
pub mod canonical;
pub mod cli;
pub mod config;
pub mod extractor;
pub mod fetcher;
pub mod frontier;
pub mod json_utils;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod models;
pub mod network;
pub mod orchestration;
pub mod rulesets;
pub mod state;
pub mod testing;
pub mod url_utils;
pub mod writer;
pub mod writer_thread;

// Re-export main types for library usage
pub use canonical::{Canonicalizer, Rejection};
pub use config::{ArchiveConfig, ConfigError, SessionCredentials};
pub use frontier::{Frontier, FrontierSnapshot, OfferOutcome};
pub use models::{CanonicalUrl, MediaAsset, MediaKind, MediaRef, PostRecord, ThreadPage, ThreadRecord};
pub use network::{HttpClient, RawResponse, Transport, TransportError};
pub use orchestration::{
    ArchiveError, Archiver, RunSummary, ShutdownSignal, ShutdownTrigger, build_archiver,
    build_archiver_with_transport, rebuild_mirror, shutdown_channel,
};
pub use rulesets::{Ruleset, load_ruleset};
pub use state::{CrawlState, StateError};
pub use writer::{IndexEntry, MirrorWriter, PersistenceError};
