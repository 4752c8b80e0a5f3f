//! HTTP-backed notification senders.
//!
//! Each channel posts a JSON payload to a configured endpoint: a mail-relay
//! API for email, an events API for paging, an incoming webhook for chat.
//! Delivery infrastructure beyond HTTP (SMTP relays, paging providers) is an
//! external collaborator behind those endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{format_amount, Message, Sender};
use crate::error::{Error, Result};

/// Email channel configuration (HTTP mail-relay API).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    /// Sender id referenced by upload agents.
    pub id: String,
    /// Mail-relay endpoint.
    pub endpoint: String,
    /// From address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
}

/// Paging channel configuration (events API).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PagingConfig {
    /// Sender id referenced by upload agents.
    pub id: String,
    /// Events API endpoint.
    pub endpoint: String,
    /// Integration routing key.
    pub routing_key: String,
}

/// Chat channel configuration (incoming webhook).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Sender id referenced by upload agents.
    pub id: String,
    /// Incoming webhook URL.
    pub endpoint: String,
}

fn summary(severity: &str, msg: &Message) -> String {
    let verb = match severity {
        "critical" => "FAILED to upload",
        _ => "successfully uploaded",
    };
    format!(
        "{verb} {} to {} ({} entries, debits {}, credits {})",
        msg.filename,
        msg.hostname,
        msg.entries,
        format_amount(msg.debit_total),
        format_amount(msg.credit_total),
    )
}

async fn post_json(client: &reqwest::Client, endpoint: &str, payload: serde_json::Value) -> Result<()> {
    let response = client
        .post(endpoint)
        .json(&payload)
        .send()
        .await
        .map_err(map_reqwest_err)?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::notification(
            format!("{endpoint} returned status {status}"),
            false,
        ));
    }
    Ok(())
}

fn map_reqwest_err(err: reqwest::Error) -> Error {
    Error::notification(err.to_string(), err.is_timeout())
}

/// Email over an HTTP mail-relay API.
pub struct EmailSender {
    config: EmailConfig,
    client: reqwest::Client,
}

impl EmailSender {
    /// Creates the sender.
    #[must_use]
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, severity: &str, msg: &Message) -> Result<()> {
        let payload = json!({
            "from": self.config.from,
            "to": self.config.to,
            "subject": format!("ACH upload {}: {}", severity, msg.filename),
            "body": summary(severity, msg),
        });
        post_json(&self.client, &self.config.endpoint, payload).await
    }
}

#[async_trait]
impl Sender for EmailSender {
    fn name(&self) -> &str {
        "email"
    }

    async fn info(&self, msg: &Message) -> Result<()> {
        self.send("info", msg).await
    }

    async fn critical(&self, msg: &Message) -> Result<()> {
        self.send("critical", msg).await
    }
}

/// Paging over an events API.
pub struct PagingSender {
    config: PagingConfig,
    client: reqwest::Client,
}

impl PagingSender {
    /// Creates the sender.
    #[must_use]
    pub fn new(config: PagingConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, severity: &str, msg: &Message) -> Result<()> {
        let payload = json!({
            "routing_key": self.config.routing_key,
            "event_action": "trigger",
            "payload": {
                "severity": severity,
                "summary": summary(severity, msg),
                "source": msg.hostname,
            },
        });
        post_json(&self.client, &self.config.endpoint, payload).await
    }
}

#[async_trait]
impl Sender for PagingSender {
    fn name(&self) -> &str {
        "paging"
    }

    async fn info(&self, msg: &Message) -> Result<()> {
        self.send("info", msg).await
    }

    async fn critical(&self, msg: &Message) -> Result<()> {
        self.send("critical", msg).await
    }
}

/// Chat over an incoming webhook.
pub struct ChatSender {
    config: ChatConfig,
    client: reqwest::Client,
}

impl ChatSender {
    /// Creates the sender.
    #[must_use]
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, severity: &str, msg: &Message) -> Result<()> {
        let payload = json!({ "text": summary(severity, msg) });
        post_json(&self.client, &self.config.endpoint, payload).await
    }
}

#[async_trait]
impl Sender for ChatSender {
    fn name(&self) -> &str {
        "chat"
    }

    async fn info(&self, msg: &Message) -> Result<()> {
        self.send("info", msg).await
    }

    async fn critical(&self, msg: &Message) -> Result<()> {
        self.send("critical", msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Direction;

    #[test]
    fn summary_names_the_outcome() {
        let msg = Message {
            direction: Direction::Upload,
            filename: "TESTING-231380104-0.ach".into(),
            hostname: "sftp.bank.example.com".into(),
            entries: 2,
            debit_total: 0,
            credit_total: 100_002_000,
        };

        let ok = summary("info", &msg);
        assert!(ok.contains("successfully uploaded TESTING-231380104-0.ach"), "{ok}");
        assert!(ok.contains("credits 1000020.00"), "{ok}");

        let bad = summary("critical", &msg);
        assert!(bad.contains("FAILED to upload"), "{bad}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_a_notification_error() {
        // A connection refused locally is a permanent (non-timeout) failure.
        let sender = ChatSender::new(ChatConfig {
            id: "ops".into(),
            endpoint: "http://127.0.0.1:1/webhook".into(),
        });
        let msg = Message {
            direction: Direction::Upload,
            filename: "a.ach".into(),
            hostname: "host".into(),
            entries: 0,
            debit_total: 0,
            credit_total: 0,
        };

        let err = sender.info(&msg).await.unwrap_err();
        assert!(matches!(err, Error::Notification { .. }));
    }
}
