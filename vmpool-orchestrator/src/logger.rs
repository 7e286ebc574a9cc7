use std::time::Instant;

use tracing_subscriber::EnvFilter;
use vmpool_common::CpiError;

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// `info` level. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Structured action log for one orchestrator operation on an instance.
/// `cid` is 0 until the IaaS has assigned one.
pub struct ActionLog {
    action_type: &'static str,
    cid: u64,
    started: Instant,
}

impl ActionLog {
    pub fn start(action_type: &'static str, cid: u64) -> Self {
        tracing::info!(action_type, cid, status = "in_progress", "action started");
        Self {
            action_type,
            cid,
            started: Instant::now(),
        }
    }

    pub fn set_cid(&mut self, cid: u64) {
        self.cid = cid;
    }

    pub fn success(self) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(
            action_type = self.action_type,
            cid = self.cid,
            status = "success",
            duration_ms,
            "action completed"
        );
    }

    pub fn failed(self, err: &CpiError) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::error!(
            action_type = self.action_type,
            cid = self.cid,
            status = "failed",
            duration_ms,
            error_kind = err.kind().tag(),
            can_retry = err.can_retry(),
            error = %err,
            "action failed"
        );
    }

    /// Log the outcome and hand the result back unchanged.
    pub fn finish<T>(self, result: Result<T, CpiError>) -> Result<T, CpiError> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failed(e),
        }
        result
    }
}
