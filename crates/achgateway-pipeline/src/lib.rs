//! # achgateway-pipeline
//!
//! Per-shard ACH aggregation pipeline.
//!
//! Upstream producers hand individual ACH files to a shard's [`Aggregator`],
//! which stages them durably on disk. At each cutoff window (scheduled in
//! the shard's timezone, or triggered manually) the staged files are
//! isolated with a single atomic rename, merged, and, when this process
//! holds the shard's cluster-wide leader lock, uploaded to the banking
//! partner, with an audit record written first and notifications and domain
//! events emitted after.
//!
//! ## Guarantees
//!
//! - **Snapshot isolation**: the staging-directory rename is the
//!   linearization point; a transfer committed after it belongs to the next
//!   cutoff.
//! - **At-most-one uploader**: the leader lock admits one upload callback
//!   per shard per merged file across a horizontally scaled deployment.
//! - **Audit before upload**: the audit artifact is persisted before any
//!   bytes reach the remote agent.
//! - **Post-mortem friendly**: isolated snapshots and content-addressed
//!   merged outputs are never deleted once non-empty.
//!
//! [`Aggregator`]: aggregate::Aggregator

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod audit;
pub mod error;
pub mod events;
pub mod leader;
pub mod merging;
pub mod metrics;
pub mod notify;
pub mod output;
pub mod schedule;
pub mod shard;
pub mod transform;
pub mod upload;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregate::{Aggregator, Alerter, CutoffTrigger, ShardHandle};
    pub use crate::audit::AuditStorage;
    pub use crate::error::{Error, ErrorList, Result};
    pub use crate::events::{Emitter, FileUploaded, InMemoryEmitter};
    pub use crate::leader::{LeaderLock, LockResult};
    pub use crate::merging::{
        CancelAchFile, FilesystemMerging, IncomingAchFile, MergedFileHandler, ProcessedFiles,
    };
    pub use crate::notify::{Message, MultiSender, Sender};
    pub use crate::schedule::CutoffTimes;
    pub use crate::shard::Shard;
    pub use crate::transform::{FileSealer, PreUpload, PreparedUpload};
    pub use crate::upload::{UploadAgent, UploadAgents, UploadFile};
}
