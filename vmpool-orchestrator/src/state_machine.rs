//! Pool entry transitions. Every write carries the state the caller last
//! observed, so the registry rejects it if another writer got there first.

use vmpool_common::{CpiError, CpiResult, PoolEntry, ResultExt, VmState};
use vmpool_providers::PoolRegistry;

async fn transition(
    registry: &dyn PoolRegistry,
    cid: u64,
    from: VmState,
    to: VmState,
    reason: &str,
) -> CpiResult<()> {
    if !from.can_transition_to(to) {
        return Err(CpiError::invalid(format!(
            "pool entry {}: transition {} -> {} is not allowed",
            cid,
            from.as_str(),
            to.as_str()
        )));
    }
    registry
        .update_state(cid, Some(from), to)
        .await
        .with_context(|| {
            format!(
                "updating pool entry {} from {} to {}",
                cid,
                from.as_str(),
                to.as_str()
            )
        })?;
    tracing::info!(
        cid,
        from = from.as_str(),
        to = to.as_str(),
        reason,
        "pool state transition"
    );
    Ok(())
}

/// Free -> Provisioning (claim)
pub async fn claim(registry: &dyn PoolRegistry, cid: u64) -> CpiResult<()> {
    transition(registry, cid, VmState::Free, VmState::Provisioning, "claimed for reuse").await
}

/// Provisioning -> Using
pub async fn mark_using(registry: &dyn PoolRegistry, cid: u64) -> CpiResult<()> {
    transition(registry, cid, VmState::Provisioning, VmState::Using, "reuse succeeded").await
}

/// Provisioning -> Free (compensation)
pub async fn rollback_claim(registry: &dyn PoolRegistry, cid: u64) -> CpiResult<()> {
    transition(registry, cid, VmState::Provisioning, VmState::Free, "reuse failed").await
}

/// Return an entry to the pool from whatever state it is in. An entry that is
/// already free is left untouched.
pub async fn release(registry: &dyn PoolRegistry, entry: &PoolEntry) -> CpiResult<()> {
    if entry.state == VmState::Free {
        tracing::info!(cid = entry.cid, "pool entry already free");
        return Ok(());
    }
    transition(registry, entry.cid, entry.state, VmState::Free, "released").await
}
