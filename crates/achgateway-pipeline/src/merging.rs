//! Durable staging and cutoff merging for one shard.
//!
//! Incoming transfers are staged as individual files under
//! `<root>/mergable/<shard>/<file_id>.ach`; cancellations rename the staged
//! file (or leave a tombstone) with a `.canceled` suffix. At cutoff,
//! [`FilesystemMerging::with_each_merged`] atomically renames the staging
//! directory aside (the linearization point between "this cutoff" and "the
//! next one"), then merges whatever it captured and offers each merged file
//! to the caller's handler behind the shard's leader lock.
//!
//! The isolated snapshot is kept on disk whenever it produced output;
//! post-mortem inspection is a primary design goal, so the engine never
//! deletes a non-empty isolation directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use achgateway_core::{merge, AchFile};

use crate::error::{Error, ErrorList, Result};
use crate::leader::{outbound_lock_key, LeaderLock, LockResult};
use crate::shard::Shard;
use crate::upload::{UploadAgent, UploadAgents};

/// An ACH file accepted from an upstream producer.
#[derive(Debug, Clone)]
pub struct IncomingAchFile {
    /// Producer-assigned identifier; staging is idempotent per id.
    pub file_id: String,
    /// The parsed document.
    pub file: AchFile,
    /// Shard the producer routed the file to.
    pub shard_key: String,
}

/// Cancels a previously submitted (or still in-flight) file.
#[derive(Debug, Clone)]
pub struct CancelAchFile {
    /// The file id to cancel.
    pub file_id: String,
}

/// Input file ids whose bytes went into a successful cutoff run.
///
/// Ids are derived from the pre-merge matches in the isolated snapshot, not
/// from the merged outputs: on a successful run every isolated input is
/// reported, which is what downstream `FileUploaded` consumers expect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedFiles {
    /// Shard the run belonged to.
    pub shard_key: String,
    /// Input file ids, in match order.
    pub file_ids: Vec<String>,
}

impl ProcessedFiles {
    fn from_matches(shard_key: &str, matches: &[PathBuf]) -> Self {
        let file_ids = matches
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| {
                let name = name.to_string_lossy();
                name.strip_suffix(".ach").unwrap_or(&name).to_string()
            })
            .collect();
        Self {
            shard_key: shard_key.to_string(),
            file_ids,
        }
    }
}

/// Receives each merged file during a cutoff run.
///
/// Passing the handler as a parameter (rather than storing a back-reference
/// to the aggregator) keeps the aggregator/merger relationship acyclic.
#[async_trait]
pub trait MergedFileHandler: Send + Sync {
    /// Called once per merged file, in order, while this process holds the
    /// shard's leader lock.
    async fn handle(&self, index: usize, agent: &dyn UploadAgent, file: &AchFile) -> Result<()>;
}

/// Filesystem-backed staging and merging for one shard.
///
/// Producers call [`handle_xfer`](Self::handle_xfer) and
/// [`handle_cancel`](Self::handle_cancel) from any task; they contend only
/// at the filesystem. Cutoff runs must be serialized by the caller; the
/// aggregator's single-threaded loop guarantees that.
pub struct FilesystemMerging {
    root: PathBuf,
    shard: Shard,
    agents: Arc<UploadAgents>,
    leader: Arc<dyn LeaderLock>,
}

impl FilesystemMerging {
    /// Creates the merging engine, establishing the staging root.
    pub fn new(shard: Shard, agents: Arc<UploadAgents>, leader: Arc<dyn LeaderLock>) -> Result<Self> {
        let configured = shard
            .merging
            .directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("storage"));
        let root = std::path::absolute(&configured).map_err(|err| {
            Error::storage_with_source(format!("unable to expand {}", configured.display()), err)
        })?;
        std::fs::create_dir_all(root.join("mergable"))
            .map_err(|err| Error::storage_with_source("creating mergable directory", err))?;

        Ok(Self {
            root,
            shard,
            agents,
            leader,
        })
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("mergable").join(&self.shard.name)
    }

    fn staged_path(&self, file_id: &str) -> PathBuf {
        self.staging_dir().join(format!("{file_id}.ach"))
    }

    /// Durably stages an incoming file. Overwrites are allowed, making the
    /// operation idempotent per file id.
    pub async fn handle_xfer(&self, xfer: IncomingAchFile) -> Result<()> {
        validate_file_id(&xfer.file_id)?;
        let data = xfer.file.encode()?;

        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::storage_with_source("creating staging directory", err))?;

        let path = self.staged_path(&xfer.file_id);
        tokio::fs::write(&path, &data).await.map_err(|err| {
            Error::storage_with_source(format!("problem writing ACH file {}", path.display()), err)
        })
    }

    /// Marks a file id canceled.
    ///
    /// Cancellations may arrive before or after the original: an existing
    /// staged file is renamed aside, otherwise an empty tombstone is
    /// written so a later transfer is still excluded at cutoff.
    pub async fn handle_cancel(&self, cancel: CancelAchFile) -> Result<()> {
        validate_file_id(&cancel.file_id)?;

        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::storage_with_source("creating staging directory", err))?;

        let path = self.staged_path(&cancel.file_id);
        let canceled = canceled_path(&path);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::rename(&path, &canceled).await.map_err(|err| {
                Error::storage_with_source(
                    format!("canceling staged file {}", path.display()),
                    err,
                )
            })
        } else {
            tokio::fs::write(&canceled, b"").await.map_err(|err| {
                Error::storage_with_source(
                    format!("writing cancellation tombstone {}", canceled.display()),
                    err,
                )
            })
        }
    }

    /// Renames the staging directory aside so this run is its only
    /// accessor; transfers committing afterwards land in a fresh staging
    /// directory and belong to the next cutoff.
    async fn isolate_mergable_dir(&self) -> Result<PathBuf> {
        let staging = self.staging_dir();
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();

        // Same-second cutoffs get a monotonic suffix instead of colliding.
        let mut isolated = self.root.join(format!("{}-{stamp}", self.shard.name));
        let mut attempt = 0u32;
        while tokio::fs::try_exists(&isolated).await.unwrap_or(false) {
            attempt += 1;
            isolated = self
                .root
                .join(format!("{}-{stamp}-{attempt}", self.shard.name));
        }

        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::rename(&staging, &isolated)
                .await
                .map_err(|source| Error::Isolation {
                    dir: isolated.clone(),
                    source,
                })?;
        } else {
            tokio::fs::create_dir_all(&isolated)
                .await
                .map_err(|source| Error::Isolation {
                    dir: isolated.clone(),
                    source,
                })?;
        }
        Ok(isolated)
    }

    /// Runs one cutoff: isolate, merge, and offer each merged file to the
    /// handler behind the shard's leader lock.
    ///
    /// Per-file problems (unreadable input, flatten failure, merged-copy
    /// write, handler error) are accumulated and fail the run as a whole
    /// after every file has been attempted; isolation and agent
    /// construction failures abort immediately. Not holding the leader lock
    /// skips the handler without error.
    pub async fn with_each_merged(&self, handler: &dyn MergedFileHandler) -> Result<ProcessedFiles> {
        let mut errors = ErrorList::new();

        let mut dir = self.isolate_mergable_dir().await?;

        let matches = non_canceled_matches(&dir)?;
        info!(
            shard = %self.shard.name,
            count = matches.len(),
            "found matching ACH files"
        );

        let mut files = Vec::with_capacity(matches.len());
        for path in &matches {
            match read_ach_file(path).await {
                Ok(file) => files.push(file),
                Err(err) => errors.push(Error::storage(format!(
                    "problem reading {}: {err}",
                    path.display()
                ))),
            }
        }

        let mut merged = match merge::merge_files(files) {
            Ok(merged) => merged,
            Err(err) => {
                errors.push(Error::storage(format!("unable to merge files: {err}")));
                Vec::new()
            }
        };

        if !matches.is_empty() {
            info!(
                shard = %self.shard.name,
                inputs = matches.len(),
                outputs = merged.len(),
                "merged ACH files"
            );
        }

        // An empty run leaves nothing worth inspecting; otherwise set up the
        // content-addressed output directory inside the snapshot.
        if merged.is_empty() {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                errors.push(Error::storage_with_source(
                    "removing empty isolation directory",
                    err,
                ));
            }
        } else {
            dir = dir.join("uploaded");
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| Error::storage_with_source("creating uploaded directory", err))?;
        }

        let agent = self.agents.build_agent(&self.shard.upload_agent)?;

        let mut successful_remote_writes = 0usize;
        for (index, file) in merged.iter_mut().enumerate() {
            if self.shard.merging.flatten_batches {
                match merge::flatten_batches(file) {
                    Ok(flattened) => *file = flattened,
                    // The pre-flatten form still uploads.
                    Err(err) => errors.push(err.into()),
                }
            }

            if let Err(err) = save_merged_file(&dir, file).await {
                errors.push(Error::storage(format!("problem writing merged file: {err}")));
            }

            let leader_key = outbound_lock_key(&self.shard.name);
            info!(
                shard = %self.shard.name,
                key = %leader_key,
                "attempting to acquire outbound leadership"
            );

            match self.leader.acquire_lock(&leader_key).await {
                Ok(LockResult::Acquired) => {
                    match handler.handle(index, agent.as_ref(), file).await {
                        Ok(()) => successful_remote_writes += 1,
                        Err(err) => {
                            errors.push(Error::upload(format!("problem from callback: {err}")));
                        }
                    }
                }
                Ok(LockResult::NotLeader {
                    key,
                    current_leader,
                }) => {
                    info!(
                        shard = %self.shard.name,
                        key = %key,
                        current_leader = ?current_leader,
                        "skipping file upload: not the shard leader"
                    );
                }
                Err(err) => {
                    warn!(
                        shard = %self.shard.name,
                        %err,
                        "skipping file upload: leadership check failed"
                    );
                }
            }
        }

        info!(
            shard = %self.shard.name,
            uploaded = successful_remote_writes,
            total = merged.len(),
            "wrote files to remote agent"
        );

        errors.into_result(ProcessedFiles::from_matches(&self.shard.name, &matches))
    }
}

fn validate_file_id(file_id: &str) -> Result<()> {
    if file_id.is_empty()
        || file_id == "."
        || file_id == ".."
        || file_id.contains(['/', '\\'])
    {
        return Err(Error::storage(format!("invalid file id {file_id:?}")));
    }
    Ok(())
}

fn canceled_path(path: &Path) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(".canceled");
    PathBuf::from(os)
}

/// Globs `*.ach` in the isolated directory, excluding any match with a
/// sibling `.canceled` marker. Lone tombstones match nothing and are
/// ignored.
fn non_canceled_matches(dir: &Path) -> Result<Vec<PathBuf>> {
    let positives = glob_paths(&dir.join("*.ach"))?;
    let negatives = glob_paths(&dir.join("*.ach.canceled"))?;
    let negatives: Vec<String> = negatives
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    let mut out: Vec<PathBuf> = positives
        .into_iter()
        .filter(|p| {
            let path = p.to_string_lossy();
            // X.ach is excluded when X.ach.canceled exists.
            !negatives.iter().any(|n| n.starts_with(path.as_ref()))
        })
        .collect();
    out.sort();
    Ok(out)
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern = pattern
        .to_str()
        .ok_or_else(|| Error::storage("staging path is not valid UTF-8"))?;
    let entries = glob::glob(pattern)
        .map_err(|err| Error::storage_with_source(format!("problem with {pattern} glob"), err))?;

    let mut out = Vec::new();
    for entry in entries {
        out.push(entry.map_err(|err| Error::storage_with_source("reading glob entry", err))?);
    }
    Ok(out)
}

async fn read_ach_file(path: &Path) -> Result<AchFile> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|err| Error::storage_with_source(path.display().to_string(), err))?;
    Ok(AchFile::decode(&data)?)
}

/// Writes the content-addressed copy `<dir>/<sha256>.ach` of a merged file.
async fn save_merged_file(dir: &Path, file: &AchFile) -> Result<()> {
    let data = file.encode()?;
    let filename = format!("{}.ach", hash(&data));
    tokio::fs::write(dir.join(filename), &data)
        .await
        .map_err(|err| Error::storage_with_source("writing merged file", err))
}

fn hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::leader::memory::{InMemoryLockBackend, SessionLock};
    use crate::shard::{Cutoffs, MergingConfig};
    use crate::upload::{AgentTarget, UploadAgentConfig, UploadNotifiers};

    struct CountingHandler {
        calls: Mutex<Vec<usize>>,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MergedFileHandler for CountingHandler {
        async fn handle(
            &self,
            index: usize,
            _agent: &dyn UploadAgent,
            _file: &AchFile,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(index);
            Ok(())
        }
    }

    fn shard(dir: &Path) -> Shard {
        Shard {
            name: "testing".into(),
            cutoffs: Cutoffs {
                timezone: "America/New_York".into(),
                windows: Vec::new(),
            },
            upload_agent: "mock-odfi".into(),
            merging: MergingConfig {
                directory: Some(dir.to_path_buf()),
                flatten_batches: false,
            },
            pre_upload: Vec::new(),
            output: crate::output::OutputConfig::default(),
            audit: None,
            notifications: None,
            filename_template: None,
        }
    }

    fn agents() -> Arc<UploadAgents> {
        Arc::new(UploadAgents::new(vec![UploadAgentConfig {
            id: "mock-odfi".into(),
            hostname: "sftp.bank.example.com".into(),
            target: AgentTarget::Mock,
            notifications: UploadNotifiers::default(),
        }]))
    }

    fn merging(dir: &Path) -> FilesystemMerging {
        let leader: Arc<dyn LeaderLock> =
            Arc::new(SessionLock::connect(Arc::new(InMemoryLockBackend::default())));
        FilesystemMerging::new(shard(dir), agents(), leader).expect("merging engine")
    }

    fn incoming(file_id: &str) -> IncomingAchFile {
        IncomingAchFile {
            file_id: file_id.into(),
            file: sample_ach_file(),
            shard_key: "testing".into(),
        }
    }

    fn sample_ach_file() -> AchFile {
        use achgateway_core::{Batch, BatchHeader, EntryDetail, FileHeader};
        AchFile {
            header: FileHeader {
                immediate_destination: "231380104".into(),
                immediate_origin: "121042882".into(),
                file_creation_date: "250114".into(),
                file_creation_time: "0830".into(),
                file_id_modifier: "A".into(),
                immediate_destination_name: "Receiving Bank".into(),
                immediate_origin_name: "Origin Bank".into(),
            },
            batches: vec![Batch {
                header: BatchHeader {
                    service_class_code: 220,
                    company_name: "Acme Payroll".into(),
                    company_identification: "121042882".into(),
                    standard_entry_class: "PPD".into(),
                    entry_description: "PAYROLL".into(),
                    effective_entry_date: "250115".into(),
                    originator_status: "1".into(),
                    odfi_identification: "12104288".into(),
                    batch_number: 1,
                },
                entries: vec![EntryDetail {
                    transaction_code: 22,
                    rdfi_identification: "23138010".into(),
                    check_digit: "4".into(),
                    dfi_account_number: "81967038518".into(),
                    amount: 100_000,
                    individual_identification: String::new(),
                    individual_name: "Jane Receiver".into(),
                    discretionary_data: String::new(),
                    addenda_record_indicator: 0,
                    trace_number: 121_042_880_000_001,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn cancel_after_stage_excludes_the_file() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        engine.handle_xfer(incoming("f1")).await?;
        engine
            .handle_cancel(CancelAchFile {
                file_id: "f1".into(),
            })
            .await?;

        let handler = CountingHandler::new();
        let processed = engine.with_each_merged(&handler).await?;

        assert!(processed.file_ids.is_empty());
        assert!(handler.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_before_stage_excludes_the_file() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        engine
            .handle_cancel(CancelAchFile {
                file_id: "f1".into(),
            })
            .await?;
        engine.handle_xfer(incoming("f1")).await?;

        let handler = CountingHandler::new();
        let processed = engine.with_each_merged(&handler).await?;

        assert!(processed.file_ids.is_empty());
        assert!(handler.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn empty_cutoff_deletes_the_isolated_directory() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        let handler = CountingHandler::new();
        let processed = engine.with_each_merged(&handler).await?;
        assert!(processed.file_ids.is_empty());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read root")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("testing-"))
            .collect();
        assert!(leftovers.is_empty(), "isolated dir should be removed");
        Ok(())
    }

    #[tokio::test]
    async fn merged_output_is_content_addressed() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        engine.handle_xfer(incoming("f1")).await?;

        let handler = CountingHandler::new();
        let processed = engine.with_each_merged(&handler).await?;
        assert_eq!(processed.file_ids, vec!["f1"]);
        assert_eq!(handler.calls(), vec![0]);

        let isolated: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read root")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("testing-"))
            .collect();
        assert_eq!(isolated.len(), 1);

        let uploaded_dir = isolated[0].path().join("uploaded");
        let uploaded: Vec<_> = std::fs::read_dir(&uploaded_dir)
            .expect("read uploaded")
            .filter_map(std::result::Result::ok)
            .collect();
        assert_eq!(uploaded.len(), 1);

        let data = std::fs::read(uploaded[0].path()).expect("read merged file");
        let expected = format!("{}.ach", hash(&data));
        assert_eq!(uploaded[0].file_name().to_string_lossy(), expected);
        Ok(())
    }

    #[tokio::test]
    async fn staging_is_idempotent_per_file_id() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        engine.handle_xfer(incoming("f1")).await?;
        engine.handle_xfer(incoming("f1")).await?;

        let handler = CountingHandler::new();
        let processed = engine.with_each_merged(&handler).await?;
        assert_eq!(processed.file_ids, vec!["f1"]);
        Ok(())
    }

    #[tokio::test]
    async fn transfers_after_isolation_belong_to_the_next_cutoff() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        engine.handle_xfer(incoming("f1")).await?;
        let handler = CountingHandler::new();
        let first = engine.with_each_merged(&handler).await?;
        assert_eq!(first.file_ids, vec!["f1"]);

        // Committed after the isolation rename, so it waits for the next run.
        engine.handle_xfer(incoming("f2")).await?;
        let second = engine.with_each_merged(&handler).await?;
        assert_eq!(second.file_ids, vec!["f2"]);
        Ok(())
    }

    #[tokio::test]
    async fn consecutive_isolations_never_collide() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        engine.handle_xfer(incoming("f1")).await?;
        let first = engine.isolate_mergable_dir().await?;
        engine.handle_xfer(incoming("f2")).await?;
        let second = engine.isolate_mergable_dir().await?;

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_path_like_file_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = merging(dir.path());

        let err = engine.handle_xfer(incoming("../escape")).await.unwrap_err();
        assert!(err.to_string().contains("invalid file id"));
    }

    #[test]
    fn tombstones_do_not_shadow_longer_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("f1.ach"), b"x").unwrap();
        std::fs::write(dir.path().join("f10.ach"), b"x").unwrap();
        std::fs::write(dir.path().join("f1.ach.canceled"), b"").unwrap();
        // A lone tombstone matches nothing.
        std::fs::write(dir.path().join("f9.ach.canceled"), b"").unwrap();

        let matches = non_canceled_matches(dir.path()).expect("matches");
        let names: Vec<String> = matches
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["f10.ach"]);
    }

    #[test]
    fn processed_files_strip_the_extension() {
        let processed = ProcessedFiles::from_matches(
            "testing",
            &[PathBuf::from("/x/f1.ach"), PathBuf::from("/x/f2.ach")],
        );
        assert_eq!(processed.shard_key, "testing");
        assert_eq!(processed.file_ids, vec!["f1", "f2"]);
    }
}
