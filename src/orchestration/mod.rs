//! Crawl setup, the page/finalizer loop and run reporting.

pub mod archiver;
pub mod assembler;
pub mod builder;
pub mod shutdown;
pub mod summary;

pub use archiver::Archiver;
pub use assembler::{PendingThread, ThreadAssembler};
pub use builder::{build_archiver, build_archiver_with_transport, build_canonicalizer, rebuild_mirror};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, setup_shutdown_handler, shutdown_channel};
pub use summary::{ArchiveError, RunSummary, SUMMARY_FILE};
