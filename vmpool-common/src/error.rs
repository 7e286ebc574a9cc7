use serde::{Deserialize, Serialize};
use thiserror::Error;

// -----------------------------------------------------------------------------
// Taxonomy
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Remote call failed (network, HTTP status, undecodable payload).
    Cloud,
    Timeout,
    /// The IaaS accepted the request but could not satisfy it (e.g. no disk capacity on the host).
    ResourceExhausted,
    VmNotFound,
    NotSupported,
    InvalidRequest,
    CredentialDisallowed,
    VmCreationFailed,
    /// Conditional pool update rejected because the entry was not in the expected state.
    PoolConflict,
    /// A compensating pool update failed; the registry no longer matches reality.
    PoolInconsistent,
    Cancelled,
}

impl ErrorKind {
    /// Stable tag the protocol layer maps onto its own error types.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::Cloud => "cloud_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::VmNotFound => "vm_not_found",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::CredentialDisallowed => "credential_disallowed",
            ErrorKind::VmCreationFailed => "vm_creation_failed",
            ErrorKind::PoolConflict => "pool_conflict",
            ErrorKind::PoolInconsistent => "pool_inconsistent",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

// -----------------------------------------------------------------------------
// Error value
// -----------------------------------------------------------------------------

/// Structured driver error.
///
/// `context` grows as the error travels up through workflow steps (innermost
/// first) and is rendered outermost-first, so the message reads
/// `"creating vm: waiting for service setup: <root cause>"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_chain(.context, .message))]
pub struct CpiError {
    kind: ErrorKind,
    message: String,
    context: Vec<String>,
    can_retry: bool,
    secondary: Option<Box<CpiError>>,
}

pub type CpiResult<T> = Result<T, CpiError>;

impl CpiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            can_retry: false,
            secondary: None,
        }
    }

    pub fn cloud(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cloud, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VmNotFound, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn timeout(cid: u64, condition: &str, elapsed: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "timed out after {:?} waiting for instance {} to reach condition '{}'",
                elapsed, cid, condition
            ),
        )
    }

    pub fn cancelled(cid: u64, condition: &str) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            format!("wait for instance {} condition '{}' was cancelled", cid, condition),
        )
    }

    /// Original failure plus the failure of its compensating action.
    pub fn compensation_failed(original: CpiError, compensation: CpiError) -> Self {
        let mut err = Self::new(
            ErrorKind::PoolInconsistent,
            format!(
                "{}; compensating pool update also failed: {}",
                original, compensation
            ),
        );
        err.can_retry = false;
        err.secondary = Some(Box::new(compensation));
        err
    }

    pub fn retryable(mut self, can_retry: bool) -> Self {
        self.can_retry = can_retry;
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn push_context(mut self, ctx: impl Into<String>) -> Self {
        self.context.push(ctx.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn can_retry(&self) -> bool {
        self.can_retry
    }

    pub fn root_message(&self) -> &str {
        &self.message
    }

    /// Context frames, outermost first.
    pub fn context_chain(&self) -> impl Iterator<Item = &str> {
        self.context.iter().rev().map(String::as_str)
    }

    pub fn secondary(&self) -> Option<&CpiError> {
        self.secondary.as_deref()
    }
}

fn render_chain(context: &[String], message: &str) -> String {
    let mut out = String::new();
    for ctx in context.iter().rev() {
        out.push_str(ctx);
        out.push_str(": ");
    }
    out.push_str(message);
    out
}

impl From<serde_json::Error> for CpiError {
    fn from(err: serde_json::Error) -> Self {
        CpiError::cloud(format!("decoding payload: {}", err))
    }
}

/// `anyhow::Context`-style helpers for `CpiResult`.
pub trait ResultExt<T> {
    fn context(self, ctx: impl Into<String>) -> CpiResult<T>;
    fn with_context<F, S>(self, f: F) -> CpiResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for CpiResult<T> {
    fn context(self, ctx: impl Into<String>) -> CpiResult<T> {
        self.map_err(|e| e.push_context(ctx))
    }

    fn with_context<F, S>(self, f: F) -> CpiResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.push_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_renders_outermost_first() {
        let res: CpiResult<()> = Err(CpiError::cloud("connection reset"));
        let err = res
            .context("fetching instance 7")
            .context("creating vm")
            .unwrap_err();
        assert_eq!(err.to_string(), "creating vm: fetching instance 7: connection reset");
        assert_eq!(err.root_message(), "connection reset");
        assert_eq!(err.kind(), ErrorKind::Cloud);
    }

    #[test]
    fn compensation_keeps_both_messages() {
        let original = CpiError::cloud("os reload rejected").push_context("reloading 42");
        let comp = CpiError::cloud("registry unavailable");
        let err = CpiError::compensation_failed(original, comp.clone());
        let msg = err.to_string();
        assert!(msg.contains("os reload rejected"));
        assert!(msg.contains("registry unavailable"));
        assert_eq!(err.kind(), ErrorKind::PoolInconsistent);
        assert_eq!(err.secondary(), Some(&comp));
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(ErrorKind::NotSupported.tag(), "not_supported");
        assert_eq!(ErrorKind::VmCreationFailed.tag(), "vm_creation_failed");
        assert!(!CpiError::invalid("x").can_retry());
        assert!(CpiError::new(ErrorKind::VmCreationFailed, "x").retryable(true).can_retry());
    }
}
