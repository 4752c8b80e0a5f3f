//! Pre-upload transform chain.
//!
//! Transforms run in configured order between merging and formatting; each
//! sees the accumulated [`PreparedUpload`] and may replace it. The only
//! built-in variant is [`Encrypt`], which seals the encoded document through
//! a pluggable [`FileSealer`] engine; the concrete GPG or KMS engine is an
//! external collaborator.

use std::sync::Arc;

use achgateway_core::AchFile;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A document on its way to the remote agent, with the output of any
/// transforms applied so far.
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    /// The merged document.
    pub file: AchFile,
    /// Sealed bytes when an encrypting transform ran.
    pub encrypted: Option<Vec<u8>>,
}

impl PreparedUpload {
    /// Wraps a document with no transforms applied.
    #[must_use]
    pub const fn new(file: AchFile) -> Self {
        Self {
            file,
            encrypted: None,
        }
    }
}

/// A single pre-upload transform.
pub trait PreUpload: Send + Sync {
    /// Applies the transform, seeing and possibly replacing the accumulated
    /// result.
    fn apply(&self, upload: PreparedUpload) -> Result<PreparedUpload>;
}

/// Configured transform variants, in application order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PreUploadConfig {
    /// Seal the encoded document before upload.
    Encrypt,
}

/// Seals plaintext for transmission; the engine (GPG, KMS, ...) is supplied
/// by the embedding service.
pub trait FileSealer: Send + Sync {
    /// Seals the encoded document bytes.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
}

/// The encrypting transform.
pub struct Encrypt {
    sealer: Arc<dyn FileSealer>,
}

impl Encrypt {
    /// Creates the transform around a sealing engine.
    #[must_use]
    pub fn new(sealer: Arc<dyn FileSealer>) -> Self {
        Self { sealer }
    }
}

impl PreUpload for Encrypt {
    fn apply(&self, upload: PreparedUpload) -> Result<PreparedUpload> {
        let plaintext = upload.file.encode()?;
        let encrypted = self.sealer.seal(&plaintext)?;
        Ok(PreparedUpload {
            file: upload.file,
            encrypted: Some(encrypted),
        })
    }
}

/// Builds the transform chain for a shard from its configuration.
///
/// Configuring [`PreUploadConfig::Encrypt`] without a sealing engine is a
/// construction error; the pipeline refuses to start rather than silently
/// uploading plaintext.
pub fn multi(
    configs: &[PreUploadConfig],
    sealer: Option<&Arc<dyn FileSealer>>,
) -> Result<Vec<Box<dyn PreUpload>>> {
    let mut transformers: Vec<Box<dyn PreUpload>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            PreUploadConfig::Encrypt => {
                let sealer = sealer.ok_or_else(|| Error::Internal {
                    message: "encrypt transform configured without a sealing engine".to_string(),
                })?;
                transformers.push(Box::new(Encrypt::new(sealer.clone())));
            }
        }
    }
    Ok(transformers)
}

/// Runs the transform chain over a merged document, preserving order and
/// propagating the first failure.
pub fn for_upload(file: AchFile, transformers: &[Box<dyn PreUpload>]) -> Result<PreparedUpload> {
    let mut upload = PreparedUpload::new(file);
    for transformer in transformers {
        upload = transformer.apply(upload)?;
    }
    Ok(upload)
}
