//! Instance-level wait conditions built on [`Waiter`].

use std::time::Duration;

use vmpool_common::{CpiError, CpiResult, ErrorKind, PowerState, TX_STATUS_COMPLETE};
use vmpool_providers::ComputeProvider;

use crate::waiter::Waiter;

#[derive(Clone, Copy)]
pub struct InstanceWaits<'a> {
    compute: &'a dyn ComputeProvider,
    waiter: &'a Waiter,
}

/// Reachability probes go through the IaaS API. A failed probe means
/// "not reachable yet", not a broken workflow.
fn probe_failure_as_unreachable(cid: u64, result: CpiResult<bool>) -> CpiResult<bool> {
    match result {
        Err(e) if e.kind() == ErrorKind::Cloud => {
            tracing::debug!(cid, error = %e, "reachability probe failed; treating as unreachable");
            Ok(false)
        }
        other => other,
    }
}

impl<'a> InstanceWaits<'a> {
    pub fn new(compute: &'a dyn ComputeProvider, waiter: &'a Waiter) -> Self {
        Self { compute, waiter }
    }

    pub fn waiter(&self) -> &'a Waiter {
        self.waiter
    }

    pub async fn no_active_transactions(&self, cid: u64) -> CpiResult<()> {
        self.no_active_transactions_within(cid, self.waiter.config().timeout)
            .await
    }

    pub async fn no_active_transactions_within(&self, cid: u64, timeout: Duration) -> CpiResult<()> {
        let compute = self.compute;
        self.waiter
            .wait_until(cid, "no active transactions", timeout, move || async move {
                compute
                    .get_active_transactions(cid)
                    .await
                    .map(|txs| txs.is_empty())
            })
            .await
    }

    pub async fn has_active_transaction(&self, cid: u64) -> CpiResult<()> {
        let compute = self.compute;
        self.waiter
            .wait_until(
                cid,
                "active transaction present",
                self.waiter.config().timeout,
                move || async move {
                    compute
                        .get_active_transactions(cid)
                        .await
                        .map(|txs| !txs.is_empty())
                },
            )
            .await
    }

    pub async fn power_state(&self, cid: u64, target: PowerState) -> CpiResult<()> {
        let compute = self.compute;
        let condition = format!("power state {}", target.key_name());
        self.waiter
            .wait_until(cid, &condition, self.waiter.config().timeout, || {
                let target = target.clone();
                async move { compute.get_power_state(cid).await.map(|state| state == target) }
            })
            .await
    }

    /// Last transaction belongs to one of `groups` and is COMPLETE.
    pub async fn last_transaction_complete(&self, cid: u64, groups: &[&str]) -> CpiResult<()> {
        if groups.is_empty() {
            return Err(CpiError::invalid(
                "last transaction wait needs at least one group",
            ));
        }
        let compute = self.compute;
        let condition = format!("last transaction {} in [{}]", TX_STATUS_COMPLETE, groups.join(", "));
        self.waiter
            .wait_until(cid, &condition, self.waiter.config().timeout, move || async move {
                compute.get_last_transaction(cid).await.map(|last| match last {
                    Some(tx) => tx.is_complete() && groups.iter().any(|g| tx.in_group(g)),
                    None => false,
                })
            })
            .await
    }

    pub async fn pingable(&self, cid: u64) -> CpiResult<()> {
        let compute = self.compute;
        self.waiter
            .wait_until(cid, "pingable", self.waiter.config().timeout, move || async move {
                probe_failure_as_unreachable(cid, compute.is_pingable(cid).await)
            })
            .await
    }

    pub async fn not_pingable(&self, cid: u64) -> CpiResult<()> {
        let compute = self.compute;
        self.waiter
            .wait_until(cid, "not pingable", self.waiter.config().timeout, move || async move {
                probe_failure_as_unreachable(cid, compute.is_pingable(cid).await).map(|up| !up)
            })
            .await
    }
}
