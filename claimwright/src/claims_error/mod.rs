//! Claims error handling utilities
//!
//! This module provides a unified approach to error handling that combines:
//! - Strongly typed error variants for specific, known error cases
//! - Generic error handling for complex anyhow-based error chains
//!
//! Use the `#[claims_error]` macro to automatically add generic error handling
//! capabilities to your error enums.

pub use claimwright_macros::claims_error;

/// Re-export anyhow for convenience
pub use anyhow;

/// Helper trait for converting anyhow errors to generic error messages
pub trait AnyhowErrorExt {
    /// Convert an anyhow error to a string, preserving the error chain
    fn to_generic_message(self) -> String;

    /// Convert an anyhow error to a string with a custom prefix
    fn to_generic_message_with_prefix(self, prefix: &str) -> String;
}

impl AnyhowErrorExt for anyhow::Error {
    fn to_generic_message(self) -> String {
        let mut message = self.to_string();

        let chain: Vec<String> = self.chain().skip(1).map(ToString::to_string).collect();
        if !chain.is_empty() {
            message.push_str(" (caused by: ");
            message.push_str(&chain.join(" -> "));
            message.push(')');
        }

        message
    }

    fn to_generic_message_with_prefix(self, prefix: &str) -> String {
        format!("{}: {}", prefix, self.to_generic_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_error_ext() {
        use anyhow::Context;

        let error = anyhow::anyhow!("expected value at line 1 column 1")
            .context("parsing seed")
            .context("compiling schema email");

        let message = error.to_generic_message();
        assert!(message.starts_with("compiling schema email"));
        assert!(message.contains("caused by"));
        assert!(message.contains("parsing seed"));
        assert!(message.contains("expected value"));
    }

    #[test]
    fn test_anyhow_error_ext_with_prefix() {
        let error = anyhow::anyhow!("connection reset");
        let message = error.to_generic_message_with_prefix("Lock release failed");
        assert!(message.starts_with("Lock release failed:"));
        assert!(message.contains("connection reset"));
    }
}
