//! Per-shard configuration.
//!
//! A [`Shard`] is an immutable bundle created at boot: its cutoff schedule,
//! staging directory, upload agent, pre-upload transforms, output format,
//! audit trail, notification channels, and filename template. One
//! aggregator is constructed per shard.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audit::AuditConfig;
use crate::notify::Notifications;
use crate::output::OutputConfig;
use crate::transform::PreUploadConfig;
use crate::upload::DEFAULT_FILENAME_TEMPLATE;

/// Cutoff schedule for a shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cutoffs {
    /// IANA timezone name the windows are resolved in, e.g.
    /// `America/New_York`.
    pub timezone: String,
    /// `HH:MM` wall-clock windows. Empty means manual triggers only.
    #[serde(default)]
    pub windows: Vec<String>,
}

/// Staging and merge behavior for a shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MergingConfig {
    /// Directory staged files live under; defaults to `./storage`.
    pub directory: Option<PathBuf>,
    /// Whether merged files are flattened before upload.
    pub flatten_batches: bool,
}

/// A logical partition of the outbound workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    /// Shard name; keys the staging directory, leader lock, and events.
    pub name: String,
    /// Cutoff schedule.
    pub cutoffs: Cutoffs,
    /// Id of the upload agent files are delivered through.
    pub upload_agent: String,
    /// Staging and merge behavior.
    #[serde(default)]
    pub merging: MergingConfig,
    /// Pre-upload transforms, in application order.
    #[serde(default)]
    pub pre_upload: Vec<PreUploadConfig>,
    /// Wire format for uploaded files.
    #[serde(default)]
    pub output: OutputConfig,
    /// Audit trail; absent disables it.
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    /// Notification channels; absent disables fan-out.
    #[serde(default)]
    pub notifications: Option<Notifications>,
    /// Filename template override.
    #[serde(default)]
    pub filename_template: Option<String>,
}

impl Shard {
    /// The shard's filename template, falling back to the default.
    #[must_use]
    pub fn filename_template(&self) -> &str {
        self.filename_template
            .as_deref()
            .unwrap_or(DEFAULT_FILENAME_TEMPLATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_minimal_shard() {
        let shard: Shard = serde_json::from_value(serde_json::json!({
            "name": "testing",
            "cutoffs": { "timezone": "America/New_York", "windows": ["16:30"] },
            "uploadAgent": "mock-odfi",
        }))
        .expect("deserialize");

        assert_eq!(shard.name, "testing");
        assert_eq!(shard.cutoffs.windows, vec!["16:30"]);
        assert!(!shard.merging.flatten_batches);
        assert!(shard.pre_upload.is_empty());
        assert_eq!(shard.output, OutputConfig::Nacha);
        assert_eq!(shard.filename_template(), DEFAULT_FILENAME_TEMPLATE);
    }

    #[test]
    fn filename_template_override_wins() {
        let shard = Shard {
            name: "testing".into(),
            cutoffs: Cutoffs {
                timezone: "UTC".into(),
                windows: Vec::new(),
            },
            upload_agent: "mock-odfi".into(),
            merging: MergingConfig::default(),
            pre_upload: Vec::new(),
            output: OutputConfig::default(),
            audit: None,
            notifications: None,
            filename_template: Some("{{ routingNumber }}.ach".into()),
        };
        assert_eq!(shard.filename_template(), "{{ routingNumber }}.ach");
    }
}
