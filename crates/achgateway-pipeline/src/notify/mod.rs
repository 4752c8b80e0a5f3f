//! Notification fan-out after uploads.
//!
//! A [`MultiSender`] is built per upload from the shard's notification
//! configuration cross-referenced with the agent's sender ids. `info` and
//! `critical` attempt **every** sender regardless of prior failures and
//! return the first error encountered. When a retry configuration is
//! present, each sender call is wrapped in Fibonacci backoff, but only
//! transient network failures (timeouts, `"no such host"`) are retried;
//! everything else is permanent.

pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use achgateway_core::AchFile;

use crate::error::{Error, Result};
use crate::metrics::names;
use crate::upload::UploadNotifiers;
use webhook::{ChatConfig, ChatSender, EmailConfig, EmailSender, PagingConfig, PagingSender};

/// Transfer direction a notification describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// A file we sent to the banking partner.
    Upload,
    /// A file we retrieved from the banking partner.
    Download,
}

/// A rendered notification about one transferred file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Transfer direction.
    pub direction: Direction,
    /// Remote filename.
    pub filename: String,
    /// Remote hostname.
    pub hostname: String,
    /// Entry details in the file.
    pub entries: usize,
    /// Total debits in cents.
    pub debit_total: u64,
    /// Total credits in cents.
    pub credit_total: u64,
}

impl Message {
    /// Builds an upload notification from the outgoing document.
    #[must_use]
    pub fn for_upload(filename: &str, hostname: &str, file: &AchFile) -> Self {
        Self {
            direction: Direction::Upload,
            filename: filename.to_string(),
            hostname: hostname.to_string(),
            entries: file.entry_count(),
            debit_total: file.debit_total(),
            credit_total: file.credit_total(),
        }
    }
}

/// Formats cents as a dollar string for human-facing notifications.
#[must_use]
pub fn format_amount(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

/// One notification channel.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Channel name for logging.
    fn name(&self) -> &str;

    /// Sends a routine success notification.
    async fn info(&self, msg: &Message) -> Result<()>;

    /// Sends an upload-failure notification.
    async fn critical(&self, msg: &Message) -> Result<()>;
}

/// Backoff configuration for transient notification failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRetries {
    /// Base interval multiplied by the Fibonacci sequence.
    #[serde(default = "default_interval")]
    pub interval: Duration,
    /// Retries allowed after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retries() -> u32 {
    3
}

/// Per-shard notification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Notifications {
    /// Configured email channels.
    pub email: Vec<EmailConfig>,
    /// Configured paging channels.
    pub paging: Vec<PagingConfig>,
    /// Configured chat channels.
    pub chat: Vec<ChatConfig>,
    /// Retry policy; absent means a single attempt per sender.
    pub retry: Option<NotificationRetries>,
}

impl Notifications {
    fn find_emails(&self, ids: &[String]) -> Vec<&EmailConfig> {
        self.email.iter().filter(|c| ids.contains(&c.id)).collect()
    }

    fn find_paging(&self, ids: &[String]) -> Vec<&PagingConfig> {
        self.paging.iter().filter(|c| ids.contains(&c.id)).collect()
    }

    fn find_chat(&self, ids: &[String]) -> Vec<&ChatConfig> {
        self.chat.iter().filter(|c| ids.contains(&c.id)).collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Severity {
    Info,
    Critical,
}

/// Fans one message out across every configured sender.
pub struct MultiSender {
    senders: Vec<Box<dyn Sender>>,
    retry: Option<NotificationRetries>,
}

impl MultiSender {
    /// Builds the fan-out for one agent: the shard's channels filtered down
    /// to the sender ids the agent references.
    pub fn new(config: Option<&Notifications>, notifiers: &UploadNotifiers) -> Result<Self> {
        let Some(config) = config else {
            return Ok(Self {
                senders: Vec::new(),
                retry: None,
            });
        };

        let mut senders: Vec<Box<dyn Sender>> = Vec::new();
        for email in config.find_emails(&notifiers.email) {
            senders.push(Box::new(EmailSender::new(email.clone())));
        }
        for paging in config.find_paging(&notifiers.paging) {
            senders.push(Box::new(PagingSender::new(paging.clone())));
        }
        for chat in config.find_chat(&notifiers.chat) {
            senders.push(Box::new(ChatSender::new(chat.clone())));
        }

        tracing::debug!(
            senders = ?senders.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "multi-sender created"
        );

        Ok(Self {
            senders,
            retry: config.retry.clone(),
        })
    }

    /// Builds a fan-out over pre-constructed senders.
    #[must_use]
    pub fn with_senders(senders: Vec<Box<dyn Sender>>, retry: Option<NotificationRetries>) -> Self {
        Self { senders, retry }
    }

    /// Sends a routine notification to every sender.
    pub async fn info(&self, msg: &Message) -> Result<()> {
        self.send_all(Severity::Info, msg).await
    }

    /// Sends a failure notification to every sender.
    pub async fn critical(&self, msg: &Message) -> Result<()> {
        self.send_all(Severity::Critical, msg).await
    }

    async fn send_all(&self, severity: Severity, msg: &Message) -> Result<()> {
        let mut first_error = None;
        for sender in &self.senders {
            if let Err(err) = self.send_with_retry(sender.as_ref(), severity, msg).await {
                warn!(sender = sender.name(), %err, "notification failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_with_retry(
        &self,
        sender: &dyn Sender,
        severity: Severity,
        msg: &Message,
    ) -> Result<()> {
        let Some(retry) = &self.retry else {
            return deliver(sender, severity, msg).await;
        };

        let mut delays = fibonacci_delays(retry.interval);
        let mut attempt: u32 = 0;
        loop {
            match deliver(sender, severity, msg).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if !is_retryable(&err) || attempt > retry.max_retries {
                        return Err(err);
                    }
                    counter!(names::NOTIFICATION_RETRIES_TOTAL).increment(1);
                    let delay = delays.next().unwrap_or(retry.interval);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn deliver(sender: &dyn Sender, severity: Severity, msg: &Message) -> Result<()> {
    match severity {
        Severity::Info => sender.info(msg).await,
        Severity::Critical => sender.critical(msg).await,
    }
}

/// Transient-failure predicate: network timeouts and unresolved hosts are
/// worth retrying, everything else is permanent.
#[must_use]
pub fn is_retryable(err: &Error) -> bool {
    if matches!(err, Error::Notification { timeout: true, .. }) {
        return true;
    }
    err.to_string().contains("no such host")
}

/// `interval * 1, 1, 2, 3, 5, 8, ...`
fn fibonacci_delays(interval: Duration) -> impl Iterator<Item = Duration> {
    let mut pair = (1u32, 1u32);
    std::iter::from_fn(move || {
        let current = pair.0;
        pair = (pair.1, pair.0.saturating_add(pair.1));
        Some(interval.saturating_mul(current))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails with timeouts a fixed number of times, then succeeds.
    struct FlakySender {
        name: String,
        failures_remaining: AtomicUsize,
        calls: Arc<AtomicUsize>,
    }

    impl FlakySender {
        fn new(failures: usize, calls: Arc<AtomicUsize>) -> Self {
            Self {
                name: "flaky".to_string(),
                failures_remaining: AtomicUsize::new(failures),
                calls,
            }
        }

        fn attempt(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::notification("i/o timeout", true));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Sender for FlakySender {
        fn name(&self) -> &str {
            &self.name
        }

        async fn info(&self, _msg: &Message) -> Result<()> {
            self.attempt()
        }

        async fn critical(&self, _msg: &Message) -> Result<()> {
            self.attempt()
        }
    }

    /// Always fails permanently, counting calls.
    struct BrokenSender {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sender for BrokenSender {
        fn name(&self) -> &str {
            "broken"
        }

        async fn info(&self, _msg: &Message) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::notification("410 gone", false))
        }

        async fn critical(&self, _msg: &Message) -> Result<()> {
            self.info(_msg).await
        }
    }

    fn message() -> Message {
        Message {
            direction: Direction::Upload,
            filename: "TESTING-231380104-0.ach".into(),
            hostname: "sftp.bank.example.com".into(),
            entries: 1,
            debit_total: 0,
            credit_total: 12_345,
        }
    }

    fn retries() -> NotificationRetries {
        NotificationRetries {
            interval: Duration::from_millis(1),
            max_retries: 3,
        }
    }

    #[test]
    fn retry_predicate() {
        assert!(is_retryable(&Error::notification("i/o timeout", true)));
        assert!(is_retryable(&Error::notification(
            "dial tcp: lookup smtp.bank.example.com: no such host",
            false,
        )));
        assert!(!is_retryable(&Error::notification("401 unauthorized", false)));
        assert!(!is_retryable(&Error::storage("disk full")));
    }

    #[test]
    fn fibonacci_delays_scale_the_interval() {
        let delays: Vec<Duration> = fibonacci_delays(Duration::from_millis(10)).take(5).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
                Duration::from_millis(50),
            ]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sender = FlakySender::new(2, calls.clone());
        let ms = MultiSender::with_senders(vec![Box::new(sender)], Some(retries()));

        ms.info(&message()).await.expect("retried to success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ms = MultiSender::with_senders(
            vec![Box::new(BrokenSender {
                calls: calls.clone(),
            })],
            Some(retries()),
        );

        let err = ms.info(&message()).await.unwrap_err();
        assert!(err.to_string().contains("410 gone"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_after_the_configured_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sender = FlakySender::new(usize::MAX, calls.clone());
        let ms = MultiSender::with_senders(vec![Box::new(sender)], Some(retries()));

        let err = ms.info(&message()).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn all_senders_are_attempted_and_first_error_wins() {
        let broken_calls = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let ms = MultiSender::with_senders(
            vec![
                Box::new(BrokenSender {
                    calls: broken_calls.clone(),
                }),
                Box::new(FlakySender::new(0, flaky_calls.clone())),
            ],
            None,
        );

        let err = ms.critical(&message()).await.unwrap_err();
        assert!(err.to_string().contains("410 gone"));
        assert_eq!(broken_calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_retry_config_means_a_single_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sender = FlakySender::new(1, calls.clone());
        let ms = MultiSender::with_senders(vec![Box::new(sender)], None);

        let err = ms.info(&message()).await.unwrap_err();
        assert!(is_retryable(&err));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn formats_amounts_in_dollars() {
        assert_eq!(format_amount(12_345), "123.45");
        assert_eq!(format_amount(5), "0.05");
    }
}
