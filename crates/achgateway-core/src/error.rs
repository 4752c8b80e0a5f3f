//! Error types and result alias shared across the gateway.

/// The result type used throughout achgateway-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the ACH document model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A document could not be parsed from its on-disk form.
    #[error("parse error{}: {message}", line.map_or_else(String::new, |l| format!(" (line {l})")))]
    Parse {
        /// Description of what failed to parse.
        message: String,
        /// One-indexed record line, when known.
        line: Option<usize>,
    },

    /// A document violates a structural constraint and cannot be encoded.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violated constraint.
        message: String,
    },
}

impl Error {
    /// Creates a parse error without line context.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            line: None,
        }
    }

    /// Creates a parse error pointing at a one-indexed record line.
    #[must_use]
    pub fn parse_at(message: impl Into<String>, line: usize) -> Self {
        Self::Parse {
            message: message.into(),
            line: Some(line),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display_includes_line() {
        let err = Error::parse_at("bad record type", 7);
        assert_eq!(err.to_string(), "parse error (line 7): bad record type");

        let err = Error::parse("truncated file");
        assert_eq!(err.to_string(), "parse error: truncated file");
    }

    #[test]
    fn validation_error_display() {
        let err = Error::validation("amount exceeds ten digits");
        assert!(err.to_string().contains("amount exceeds ten digits"));
    }
}
