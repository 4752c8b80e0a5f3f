//! Upload agents and outbound filename rendering.
//!
//! The remote transport (SFTP, FTP, object storage) is an external
//! collaborator behind the [`UploadAgent`] trait. The registry builds one
//! agent per configured id and reuses it across cutoffs; an unknown id is an
//! agent-construction error, which aborts the cutoff run that asked for it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A formatted payload ready for transmission.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Remote filename rendered from the shard's template.
    pub filename: String,
    /// Wire bytes.
    pub contents: Vec<u8>,
}

/// Remote delivery endpoint for one banking partner.
#[async_trait]
pub trait UploadAgent: Send + Sync {
    /// Configured agent identifier.
    fn id(&self) -> &str;

    /// Hostname of the remote endpoint; feeds audit paths and
    /// notifications.
    fn hostname(&self) -> &str;

    /// Delivers one file. Not retried here; the next cutoff is the retry.
    async fn upload(&self, file: UploadFile) -> Result<()>;
}

/// Notification sender ids cross-referenced per agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadNotifiers {
    /// Email sender ids.
    pub email: Vec<String>,
    /// Paging sender ids.
    pub paging: Vec<String>,
    /// Chat sender ids.
    pub chat: Vec<String>,
}

/// Delivery target variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentTarget {
    /// Deliver into a local drop directory (e.g. an SFTP-mounted path).
    Directory {
        /// The drop directory.
        path: PathBuf,
    },
    /// Record uploads in memory; used by tests and dry runs.
    Mock,
}

/// Configuration for one upload agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadAgentConfig {
    /// Agent identifier referenced by shards.
    pub id: String,
    /// Remote hostname, recorded in audit paths and notifications.
    pub hostname: String,
    /// Delivery target.
    pub target: AgentTarget,
    /// Notification senders tied to this agent.
    #[serde(default)]
    pub notifications: UploadNotifiers,
}

/// Registry of configured upload agents.
///
/// Agents are constructed on first use and cached, so every cutoff for a
/// shard observes the same instance.
pub struct UploadAgents {
    configs: Vec<UploadAgentConfig>,
    built: Mutex<HashMap<String, Arc<dyn UploadAgent>>>,
}

impl UploadAgents {
    /// Creates a registry over the configured agents.
    #[must_use]
    pub fn new(configs: Vec<UploadAgentConfig>) -> Self {
        Self {
            configs,
            built: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up an agent's configuration by id.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&UploadAgentConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    /// Installs a pre-built agent under its id, bypassing construction.
    ///
    /// The entry point for custom transports; tests use it to observe
    /// uploads through a shared [`MockAgent`].
    pub fn register_agent(&self, agent: Arc<dyn UploadAgent>) {
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.id().to_string(), agent);
    }

    /// Returns the agent for an id, constructing it on first use.
    pub fn build_agent(&self, id: &str) -> Result<Arc<dyn UploadAgent>> {
        let mut built = self.built.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = built.get(id) {
            return Ok(agent.clone());
        }

        let config = self.find(id).ok_or_else(|| Error::AgentConstruction {
            message: format!("no upload agent configured for id={id}"),
        })?;

        let agent: Arc<dyn UploadAgent> = match &config.target {
            AgentTarget::Directory { path } => Arc::new(DirectoryAgent {
                id: config.id.clone(),
                hostname: config.hostname.clone(),
                path: path.clone(),
            }),
            AgentTarget::Mock => Arc::new(MockAgent::new(&config.id, &config.hostname)),
        };
        built.insert(id.to_string(), agent.clone());
        Ok(agent)
    }
}

/// Delivers files into a local drop directory.
#[derive(Debug)]
pub struct DirectoryAgent {
    id: String,
    hostname: String,
    path: PathBuf,
}

#[async_trait]
impl UploadAgent for DirectoryAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn upload(&self, file: UploadFile) -> Result<()> {
        if file.filename.contains(['/', '\\']) {
            return Err(Error::upload(format!(
                "filename contains a path separator: {:?}",
                file.filename
            )));
        }
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|err| Error::storage_with_source("creating drop directory", err))?;
        tokio::fs::write(self.path.join(&file.filename), &file.contents)
            .await
            .map_err(|err| {
                Error::storage_with_source(format!("delivering {}", file.filename), err)
            })
    }
}

/// Records uploads in memory; optionally fails on demand.
#[derive(Debug)]
pub struct MockAgent {
    id: String,
    hostname: String,
    uploaded: Mutex<Vec<UploadFile>>,
    error: Mutex<Option<String>>,
}

impl MockAgent {
    /// Creates a mock agent.
    #[must_use]
    pub fn new(id: &str, hostname: &str) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname.to_string(),
            uploaded: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }

    /// Makes every subsequent upload fail with the given message, or
    /// succeed again when `None`.
    pub fn set_error(&self, message: Option<&str>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) =
            message.map(ToString::to_string);
    }

    /// Files uploaded so far.
    #[must_use]
    pub fn uploaded(&self) -> Vec<UploadFile> {
        self.uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl UploadAgent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn upload(&self, file: UploadFile) -> Result<()> {
        if let Some(message) = self
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(Error::upload(message));
        }
        self.uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file);
        Ok(())
    }
}

/// Default outbound filename template.
pub const DEFAULT_FILENAME_TEMPLATE: &str =
    "{{ shardName }}-{{ routingNumber }}-{{ index }}.ach{{ gpgSuffix }}";

/// Inputs available to the filename template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameData {
    /// `ImmediateDestination` of the outgoing file.
    pub routing_number: String,
    /// Whether an encrypting transform sealed the payload.
    pub gpg: bool,
    /// Shard name, uppercased with spaces replaced by hyphens.
    pub shard_name: String,
    /// Position of the file within the cutoff run.
    pub index: usize,
}

/// Uppercases a shard name and replaces spaces with hyphens for use in
/// filenames.
#[must_use]
pub fn prepare_shard_name(shard_name: &str) -> String {
    shard_name.replace(' ', "-").to_uppercase()
}

/// Renders an outbound filename from a `{{ var }}` template.
///
/// Recognized variables: `shardName`, `routingNumber`, `index`, and
/// `gpgSuffix` (which renders `.gpg` when the payload is sealed and nothing
/// otherwise). Unknown variables fail rendering.
pub fn render_ach_filename(template: &str, data: &FilenameData) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(Error::Template {
                message: format!("unterminated variable in template {template:?}"),
            });
        };
        let var = after[..end].trim();
        match var {
            "shardName" => out.push_str(&data.shard_name),
            "routingNumber" => out.push_str(&data.routing_number),
            "index" => out.push_str(&data.index.to_string()),
            "gpgSuffix" => {
                if data.gpg {
                    out.push_str(".gpg");
                }
            }
            other => {
                return Err(Error::Template {
                    message: format!("unknown template variable {other:?}"),
                });
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> FilenameData {
        FilenameData {
            routing_number: "231380104".into(),
            gpg: false,
            shard_name: prepare_shard_name("live odfi"),
            index: 0,
        }
    }

    #[test]
    fn prepares_shard_names() {
        assert_eq!(prepare_shard_name("live odfi"), "LIVE-ODFI");
        assert_eq!(prepare_shard_name("testing"), "TESTING");
    }

    #[test]
    fn renders_the_default_template() {
        let filename = render_ach_filename(DEFAULT_FILENAME_TEMPLATE, &data()).expect("render");
        assert_eq!(filename, "LIVE-ODFI-231380104-0.ach");
    }

    #[test]
    fn gpg_suffix_appears_only_when_sealed() {
        let mut d = data();
        d.gpg = true;
        let filename = render_ach_filename(DEFAULT_FILENAME_TEMPLATE, &d).expect("render");
        assert_eq!(filename, "LIVE-ODFI-231380104-0.ach.gpg");
    }

    #[test]
    fn unknown_variable_fails_rendering() {
        let err = render_ach_filename("{{ nope }}.ach", &data()).unwrap_err();
        assert!(err.to_string().contains("unknown template variable"));
    }

    #[test]
    fn unterminated_variable_fails_rendering() {
        let err = render_ach_filename("{{ shardName.ach", &data()).unwrap_err();
        assert!(err.to_string().contains("unterminated variable"));
    }

    #[test]
    fn registry_builds_and_caches_agents() -> Result<()> {
        let agents = UploadAgents::new(vec![UploadAgentConfig {
            id: "mock-odfi".into(),
            hostname: "sftp.bank.example.com".into(),
            target: AgentTarget::Mock,
            notifications: UploadNotifiers::default(),
        }]);

        let first = agents.build_agent("mock-odfi")?;
        let second = agents.build_agent("mock-odfi")?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.hostname(), "sftp.bank.example.com");
        Ok(())
    }

    #[test]
    fn unknown_agent_id_is_a_construction_error() {
        let agents = UploadAgents::new(Vec::new());
        let err = match agents.build_agent("missing") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, Error::AgentConstruction { .. }));
    }

    #[tokio::test]
    async fn directory_agent_delivers_into_the_drop_directory() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let agents = UploadAgents::new(vec![UploadAgentConfig {
            id: "drop".into(),
            hostname: "localhost".into(),
            target: AgentTarget::Directory {
                path: dir.path().join("outbound"),
            },
            notifications: UploadNotifiers::default(),
        }]);

        let agent = agents.build_agent("drop")?;
        agent
            .upload(UploadFile {
                filename: "TESTING-231380104-0.ach".into(),
                contents: b"records".to_vec(),
            })
            .await?;

        let written =
            std::fs::read(dir.path().join("outbound/TESTING-231380104-0.ach")).expect("read back");
        assert_eq!(written, b"records");
        Ok(())
    }

    #[tokio::test]
    async fn directory_agent_rejects_path_separators() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = DirectoryAgent {
            id: "drop".into(),
            hostname: "localhost".into(),
            path: dir.path().to_path_buf(),
        };

        let err = agent
            .upload(UploadFile {
                filename: "../escape.ach".into(),
                contents: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path separator"));
    }

    #[tokio::test]
    async fn mock_agent_records_and_fails_on_demand() -> Result<()> {
        let agent = MockAgent::new("mock", "localhost");
        agent
            .upload(UploadFile {
                filename: "a.ach".into(),
                contents: Vec::new(),
            })
            .await?;
        assert_eq!(agent.uploaded().len(), 1);

        agent.set_error(Some("connection reset"));
        let err = agent
            .upload(UploadFile {
                filename: "b.ach".into(),
                contents: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(agent.uploaded().len(), 1);
        Ok(())
    }
}
