//! The per-shard aggregator: a single-threaded event loop that turns
//! scheduler ticks and manual triggers into cutoff runs.
//!
//! Ordering within one uploaded file is fixed: transforms run first, then
//! the filename is rendered and the payload formatted, the audit record is
//! written, the upload happens, notifications follow the upload, and domain
//! events are emitted once the whole cutoff completes. The loop always
//! accepts the next tick; cutoff errors are logged and optionally alerted,
//! never fatal.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use achgateway_core::AchFile;

use crate::audit::{self, AuditStorage};
use crate::error::{Error, ErrorList, Result};
use crate::events::{Emitter, FileUploaded};
use crate::leader::LeaderLock;
use crate::merging::{
    CancelAchFile, FilesystemMerging, IncomingAchFile, MergedFileHandler, ProcessedFiles,
};
use crate::metrics::PipelineMetrics;
use crate::notify::{Message, MultiSender};
use crate::output::{self, OutputFormatter};
use crate::schedule::CutoffTimes;
use crate::shard::Shard;
use crate::transform::{self, FileSealer, PreUpload, PreparedUpload};
use crate::upload::{
    prepare_shard_name, render_ach_filename, FilenameData, UploadAgent, UploadAgents, UploadFile,
};

/// Receives cutoff-run errors the loop would otherwise only log.
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Forwards one error to the alerting backend.
    async fn alert_error(&self, err: &Error) -> Result<()>;
}

/// A manually requested cutoff waiting on its outcome.
struct ManualCutoff {
    reply: oneshot::Sender<Result<()>>,
}

/// Requests an immediate cutoff and waits for its result.
///
/// The underlying channel has depth one: at most one manual cutoff can be
/// pending while another runs.
#[derive(Clone)]
pub struct CutoffTrigger {
    tx: mpsc::Sender<ManualCutoff>,
}

impl CutoffTrigger {
    /// Runs a cutoff now, returning once it completes.
    ///
    /// Upload and merge errors propagate; event-emission problems are only
    /// logged by the aggregator.
    pub async fn trigger(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManualCutoff { reply: reply_tx })
            .await
            .map_err(|_| Error::internal("aggregator is not running"))?;
        reply_rx
            .await
            .map_err(|_| Error::internal("aggregator dropped the manual cutoff"))?
    }
}

/// Producer-facing handle for one shard, cheap to clone.
#[derive(Clone)]
pub struct ShardHandle {
    shard_name: String,
    merger: Arc<FilesystemMerging>,
    trigger: CutoffTrigger,
}

impl ShardHandle {
    /// The shard this handle routes to.
    #[must_use]
    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// Durably stages an incoming file for the next cutoff.
    pub async fn accept_file(&self, xfer: IncomingAchFile) -> Result<()> {
        self.merger.handle_xfer(xfer).await
    }

    /// Cancels a previously submitted file id.
    pub async fn accept_cancellation(&self, cancel: CancelAchFile) -> Result<()> {
        self.merger.handle_cancel(cancel).await
    }

    /// Triggers a cutoff immediately and waits for the outcome.
    pub async fn trigger_cutoff(&self) -> Result<()> {
        self.trigger.trigger().await
    }
}

/// One shard's aggregation pipeline.
pub struct Aggregator {
    shard: Shard,
    merger: Arc<FilesystemMerging>,
    cutoffs: CutoffTimes,
    trigger_tx: mpsc::Sender<ManualCutoff>,
    trigger_rx: mpsc::Receiver<ManualCutoff>,
    agents: Arc<UploadAgents>,
    emitter: Arc<dyn Emitter>,
    audit: Arc<dyn AuditStorage>,
    transformers: Vec<Box<dyn PreUpload>>,
    formatter: Box<dyn OutputFormatter>,
    alerter: Option<Arc<dyn Alerter>>,
    metrics: PipelineMetrics,
}

impl Aggregator {
    /// Wires up one shard's pipeline.
    ///
    /// A sealing engine is required iff the shard configures an encrypting
    /// transform. Must be called within a Tokio runtime (the cutoff
    /// scheduler spawns immediately).
    pub fn new(
        shard: Shard,
        agents: Arc<UploadAgents>,
        leader: Arc<dyn LeaderLock>,
        emitter: Arc<dyn Emitter>,
        sealer: Option<Arc<dyn FileSealer>>,
        alerter: Option<Arc<dyn Alerter>>,
    ) -> Result<Self> {
        let merger = Arc::new(FilesystemMerging::new(
            shard.clone(),
            agents.clone(),
            leader,
        )?);
        let audit = audit::new_storage(shard.audit.as_ref())?;
        let transformers = transform::multi(&shard.pre_upload, sealer.as_ref())?;
        let formatter = output::new_formatter(&shard.output);
        let cutoffs = CutoffTimes::for_cutoff_times(&shard.cutoffs.timezone, &shard.cutoffs.windows)?;
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        Ok(Self {
            shard,
            merger,
            cutoffs,
            trigger_tx,
            trigger_rx,
            agents,
            emitter,
            audit,
            transformers,
            formatter,
            alerter,
            metrics: PipelineMetrics::new(),
        })
    }

    /// Returns the producer-facing handle for this shard.
    #[must_use]
    pub fn handle(&self) -> ShardHandle {
        ShardHandle {
            shard_name: self.shard.name.clone(),
            merger: self.merger.clone(),
            trigger: CutoffTrigger {
                tx: self.trigger_tx.clone(),
            },
        }
    }

    /// Runs the event loop until the token is cancelled.
    ///
    /// Ticks and manual triggers are processed strictly sequentially, which
    /// serializes all cutoff-side mutation of the staging directory.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                Some(when) = self.cutoffs.recv() => {
                    if let Err(err) = self.with_each_file(when).await {
                        error!(shard = %self.shard.name, %err, "merging files");
                        if let Some(alerter) = &self.alerter {
                            if let Err(alert_err) = alerter.alert_error(&err).await {
                                error!(shard = %self.shard.name, %alert_err, "sending alert");
                            }
                        }
                    }
                }
                Some(waiter) = self.trigger_rx.recv() => {
                    self.manual_cutoff(waiter).await;
                }
                () = shutdown.cancelled() => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    async fn shutdown(&self) {
        info!(shard = %self.shard.name, "shutting down outbound aggregation");
        self.cutoffs.stop();
        if let Err(err) = self.audit.close().await {
            error!(shard = %self.shard.name, %err, "closing audit storage");
        }
    }

    async fn with_each_file(&self, when: DateTime<Tz>) -> Result<()> {
        let window = when.format("%H:%M").to_string();
        let tz = when.timezone().name();
        info!(
            shard = %self.shard.name,
            window = %window,
            tz = %tz,
            "starting cutoff window processing"
        );

        let started = Instant::now();
        let result = self.merger.with_each_merged(self).await;
        self.metrics
            .observe_cutoff_duration(&self.shard.name, started.elapsed());

        let outcome = match result {
            Ok(processed) => {
                if let Err(err) = self.emit_files_uploaded(&processed).await {
                    error!(shard = %self.shard.name, %err, "sending files uploaded events");
                }
                Ok(())
            }
            Err(err) => Err(err),
        };

        info!(
            shard = %self.shard.name,
            window = %window,
            tz = %tz,
            "ended cutoff window processing"
        );
        outcome
    }

    async fn manual_cutoff(&self, waiter: ManualCutoff) {
        info!(shard = %self.shard.name, "starting manual cutoff processing");

        let started = Instant::now();
        let result = self.merger.with_each_merged(self).await;
        self.metrics
            .observe_cutoff_duration(&self.shard.name, started.elapsed());

        let reply = match result {
            Ok(processed) => {
                // Emission problems are logged, not surfaced to the waiter;
                // upload errors are.
                if let Err(err) = self.emit_files_uploaded(&processed).await {
                    error!(shard = %self.shard.name, %err, "sending files uploaded events");
                }
                Ok(())
            }
            Err(err) => {
                error!(shard = %self.shard.name, %err, "manual cutoff failed");
                Err(err)
            }
        };

        if waiter.reply.send(reply).is_err() {
            warn!(shard = %self.shard.name, "manual cutoff requester went away");
        }
        info!(shard = %self.shard.name, "ended manual cutoff processing");
    }

    async fn emit_files_uploaded(&self, processed: &ProcessedFiles) -> Result<()> {
        let mut errors = ErrorList::new();
        let uploaded_at = Utc::now();
        for file_id in &processed.file_ids {
            let event = FileUploaded {
                file_id: file_id.clone(),
                shard_key: processed.shard_key.clone(),
                uploaded_at,
            };
            if let Err(err) = self.emitter.send(event).await {
                errors.push(err);
            }
        }
        errors.into_result(())
    }

    async fn upload_file(
        &self,
        index: usize,
        agent: &dyn UploadAgent,
        res: PreparedUpload,
    ) -> Result<()> {
        let data = FilenameData {
            routing_number: res.file.header.immediate_destination.clone(),
            gpg: res.encrypted.is_some(),
            shard_name: prepare_shard_name(&self.shard.name),
            index,
        };
        let filename = match render_ach_filename(self.shard.filename_template(), &data) {
            Ok(filename) => filename,
            Err(err) => {
                self.metrics.record_upload_error(&self.shard.name);
                return Err(err);
            }
        };

        let mut buf = Vec::new();
        if let Err(err) = self.formatter.format(&mut buf, &res) {
            self.metrics.record_upload_error(&self.shard.name);
            return Err(err);
        }

        // The audit record strictly precedes the upload; it is the ground
        // truth for "we attempted this upload".
        let audit_path = format!(
            "outbound/{}/{}/{}",
            agent.hostname(),
            Utc::now().format("%Y-%m-%d"),
            filename,
        );
        if let Err(err) = self.audit.save_file(&audit_path, &buf).await {
            self.metrics.record_upload_error(&self.shard.name);
            return Err(err);
        }

        let upload_result = agent
            .upload(UploadFile {
                filename: filename.clone(),
                contents: buf,
            })
            .await;

        if let Err(err) = self
            .notify_after_upload(&filename, &res.file, agent, upload_result.as_ref().err())
            .await
        {
            error!(shard = %self.shard.name, %err, "sending upload notification");
        }

        match upload_result {
            Ok(()) => {
                self.metrics.record_uploaded(&self.shard.name);
                Ok(())
            }
            Err(err) => {
                self.metrics.record_upload_error(&self.shard.name);
                Err(err)
            }
        }
    }

    async fn notify_after_upload(
        &self,
        filename: &str,
        file: &AchFile,
        agent: &dyn UploadAgent,
        upload_err: Option<&Error>,
    ) -> Result<()> {
        let Some(agent_config) = self.agents.find(agent.id()) else {
            return Err(Error::internal(format!(
                "no upload agent configured for id={}",
                agent.id()
            )));
        };

        let msg = Message::for_upload(filename, agent.hostname(), file);
        let notifier = MultiSender::new(
            self.shard.notifications.as_ref(),
            &agent_config.notifications,
        )?;

        if upload_err.is_some() {
            notifier.critical(&msg).await
        } else {
            notifier.info(&msg).await
        }
    }
}

#[async_trait]
impl MergedFileHandler for Aggregator {
    async fn handle(&self, index: usize, agent: &dyn UploadAgent, file: &AchFile) -> Result<()> {
        let result = transform::for_upload(file.clone(), &self.transformers)?;
        self.upload_file(index, agent, result).await
    }
}
