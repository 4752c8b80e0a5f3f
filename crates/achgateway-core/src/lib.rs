//! # achgateway-core
//!
//! Shared foundation for the ACH gateway: the ACH document model, a
//! NACHA-subset codec, merge/flatten operations over documents, and the
//! observability bootstrap used by every gateway component.
//!
//! ## Core Concepts
//!
//! - **Document**: An [`AchFile`] is a parsed NACHA file: one file header
//!   plus ordered batches of entry details. Control records are computed on
//!   encode and accepted leniently on decode.
//! - **Merge**: Combining many small documents destined for the same
//!   receiving point into few large ones, with trace numbers re-sequenced
//!   ascending from the first entry detail.
//! - **Flatten**: Collapsing batches that share a header into one batch per
//!   distinct header, within a single document.
//!
//! The aggregation pipeline (`achgateway-pipeline`) builds on these
//! primitives; nothing in this crate touches the filesystem or the network.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod file;
pub mod merge;
pub mod observability;

pub use error::{Error, Result};
pub use file::{AchFile, Batch, BatchHeader, EntryDetail, FileHeader};
