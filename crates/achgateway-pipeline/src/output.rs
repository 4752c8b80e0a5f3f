//! Output formatting: serializing a prepared upload to wire bytes.
//!
//! Formatters prefer sealed bytes when an encrypting transform ran; the
//! plaintext document is only encoded when no transform replaced it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transform::PreparedUpload;

/// Configured wire format for uploaded files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OutputConfig {
    /// Raw NACHA records (or sealed bytes verbatim).
    #[default]
    Nacha,
    /// Base64-armored payload for transports that cannot carry raw bytes.
    Base64,
}

/// Serializes a prepared upload into the configured wire format.
pub trait OutputFormatter: Send + Sync {
    /// Appends the formatted payload to `buf`.
    fn format(&self, buf: &mut Vec<u8>, res: &PreparedUpload) -> Result<()>;
}

/// Builds the formatter for a shard's output configuration.
#[must_use]
pub fn new_formatter(config: &OutputConfig) -> Box<dyn OutputFormatter> {
    match config {
        OutputConfig::Nacha => Box::new(NachaFormatter),
        OutputConfig::Base64 => Box::new(Base64Formatter),
    }
}

fn payload(res: &PreparedUpload) -> Result<Vec<u8>> {
    match &res.encrypted {
        Some(sealed) => Ok(sealed.clone()),
        None => Ok(res.file.encode()?),
    }
}

struct NachaFormatter;

impl OutputFormatter for NachaFormatter {
    fn format(&self, buf: &mut Vec<u8>, res: &PreparedUpload) -> Result<()> {
        buf.extend_from_slice(&payload(res)?);
        Ok(())
    }
}

struct Base64Formatter;

impl OutputFormatter for Base64Formatter {
    fn format(&self, buf: &mut Vec<u8>, res: &PreparedUpload) -> Result<()> {
        let armored = STANDARD.encode(payload(res)?);
        buf.extend_from_slice(armored.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use achgateway_core::AchFile;

    #[test]
    fn nacha_formats_the_encoded_document() {
        let res = PreparedUpload::new(AchFile::default());
        let formatter = new_formatter(&OutputConfig::Nacha);

        let mut buf = Vec::new();
        formatter.format(&mut buf, &res).expect("format");
        assert_eq!(buf, res.file.encode().expect("encode"));
    }

    #[test]
    fn sealed_bytes_win_over_plaintext() {
        let mut res = PreparedUpload::new(AchFile::default());
        res.encrypted = Some(b"sealed".to_vec());
        let formatter = new_formatter(&OutputConfig::Nacha);

        let mut buf = Vec::new();
        formatter.format(&mut buf, &res).expect("format");
        assert_eq!(buf, b"sealed");
    }

    #[test]
    fn base64_armors_the_payload() {
        let mut res = PreparedUpload::new(AchFile::default());
        res.encrypted = Some(b"sealed".to_vec());
        let formatter = new_formatter(&OutputConfig::Base64);

        let mut buf = Vec::new();
        formatter.format(&mut buf, &res).expect("format");
        assert_eq!(buf, STANDARD.encode(b"sealed").into_bytes());
    }
}
