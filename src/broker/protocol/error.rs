use thiserror::Error;

pub const E_INVALID: &str = "E_INVALID";
pub const E_BAD_PROTOCOL: &str = "E_BAD_PROTOCOL";
pub const E_BAD_TOPIC: &str = "E_BAD_TOPIC";
pub const E_BAD_CHANNEL: &str = "E_BAD_CHANNEL";
pub const E_BAD_MESSAGE: &str = "E_BAD_MESSAGE";
pub const E_BAD_BODY: &str = "E_BAD_BODY";
pub const E_PUB_FAILED: &str = "E_PUB_FAILED";
pub const E_MPUB_FAILED: &str = "E_MPUB_FAILED";
pub const E_DPUB_FAILED: &str = "E_DPUB_FAILED";
pub const E_FIN_FAILED: &str = "E_FIN_FAILED";
pub const E_REQ_FAILED: &str = "E_REQ_FAILED";
pub const E_TOUCH_FAILED: &str = "E_TOUCH_FAILED";
pub const E_AUTH_FAILED: &str = "E_AUTH_FAILED";
pub const E_AUTH_DISABLED: &str = "E_AUTH_DISABLED";
pub const E_UNAUTHORIZED: &str = "E_UNAUTHORIZED";
pub const E_TOO_MANY_CHANNEL_CONSUMERS: &str = "E_TOO_MANY_CHANNEL_CONSUMERS";

/// An error reported to the client as an error frame.
///
/// Fatal errors close the connection once the frame has been written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {message}")]
pub struct ProtocolError {
    pub code: &'static str,
    pub message: String,
    pub fatal: bool,
}

impl ProtocolError {
    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
        }
    }

    pub fn soft(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::fatal(E_INVALID, message)
    }

    /// Frame payload: `"<CODE> <message>"`.
    pub fn wire_text(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_text_leads_with_code() {
        let err = ProtocolError::soft(E_FIN_FAILED, "FIN 0a failed");
        assert_eq!(err.wire_text(), "E_FIN_FAILED FIN 0a failed");
        assert!(!err.fatal);
        assert!(ProtocolError::invalid("x").fatal);
    }
}
