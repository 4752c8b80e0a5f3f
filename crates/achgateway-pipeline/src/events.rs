//! Domain events emitted after successful cutoffs.
//!
//! One [`FileUploaded`] is emitted per input file id observed in the
//! isolated snapshot of a successful run. The event bus itself is an
//! external collaborator behind [`Emitter`]; [`InMemoryEmitter`] captures
//! events for tests.
//!
//! Note that file ids are taken from the pre-merge inputs: an input that
//! failed to parse mid-run still fails the run as a whole, but on a
//! *successful* run every isolated input is reported uploaded.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A staged file's contents reached the banking partner in a cutoff run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileUploaded {
    /// Producer-assigned file id.
    pub file_id: String,
    /// Shard the file was staged under.
    pub shard_key: String,
    /// When the cutoff completed.
    pub uploaded_at: DateTime<Utc>,
}

/// Publishes domain events to the embedding service's bus.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Publishes one event.
    async fn send(&self, event: FileUploaded) -> Result<()>;
}

/// Captures events in memory for tests.
#[derive(Debug, Default)]
pub struct InMemoryEmitter {
    events: Mutex<Vec<FileUploaded>>,
}

impl InMemoryEmitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<FileUploaded> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Emitter for InMemoryEmitter {
    async fn send(&self, event: FileUploaded) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}
