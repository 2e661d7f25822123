//! Ferry migration core
//!
//! Moves units (bucket-sized collections of objects) from a source store to
//! a remote file store as size-bounded, possibly split compressed archives,
//! then certifies the copies by sampled re-download before the source may
//! be deleted.
//!
//! # Features
//!
//! - **Resumable pipeline**: every unit walks a durable state machine, and a
//!   restarted run continues from the last completed stage
//! - **Deterministic splitting**: parts are exactly the split threshold in
//!   size except the last, and concatenate back to the sealed stream
//! - **Stratified verification**: units and files are sampled across size
//!   terciles so large and small units are both covered
//! - **Guarded deletion**: only migrated units whose current archive passed
//!   verification are deletable, and only after two distinct operator
//!   confirmations
//!
//! # Examples
//!
//! ```no_run
//! use ferry_core::LoadedConfig;
//! use ferry_migrate::{
//!     LocalRemoteStore, LocalSourceStore, MigrationOptions, MigrationOrchestrator, ProgressStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ferry_core::Result<()> {
//!     let loaded = LoadedConfig::load(None)?;
//!     let config = loaded.config;
//!
//!     let progress = Arc::new(ProgressStore::load(config.workspace.progress_file.as_std_path())?);
//!     let orchestrator = MigrationOrchestrator::new(
//!         &config,
//!         Arc::new(LocalSourceStore::new("/data/source")),
//!         Arc::new(LocalRemoteStore::new("/mnt/remote")),
//!         progress,
//!     );
//!
//!     let summary = orchestrator.run(&MigrationOptions::default()).await?;
//!     println!("{} completed, {} failed", summary.completed, summary.failed());
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod compression;
pub mod deletion;
pub mod manifest;
pub mod orchestrator;
pub mod progress_store;
pub mod reporter;
pub mod sampler;
pub mod space;
pub mod store;
pub mod transfer;
pub mod verify;

// Re-export commonly used types
pub use archive::{ArchiveBuilder, ArchiveConfig, BuiltArchive, UnitWorkspace};
pub use compression::{calculate_checksum, CompressionStats};
pub use deletion::{
    Confirmer, DeletionGuard, DeletionPlan, DeletionRun, ExclusionReason, AFFIRMATIVE_TOKEN,
    STRONG_TOKEN,
};
pub use manifest::{ArchivePart, ManifestObject, UnitManifest, MANIFEST_FILENAME, MANIFEST_VERSION};
pub use orchestrator::{
    MigrationOptions, MigrationOrchestrator, RunSummary, UnitFailure, UnitOutcome,
};
pub use progress_store::{ProgressRecord, ProgressStore, ProgressSummary, UnitStatus};
pub use reporter::MigrationProgress;
pub use sampler::{Sample, StratifiedSampler, Stratum};
pub use space::{SpaceGuard, SpaceQuery};
pub use store::{
    ByteStream, LocalRemoteStore, LocalSourceStore, ObjectEntry, RemoteStore, SourceStore, Unit,
};
pub use transfer::{RemoteLayout, TransferDownloader, TransferUploader};
pub use verify::{
    ReportStore, VerificationEngine, VerificationOptions, VerificationReport,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
