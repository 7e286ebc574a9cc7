use vmpool_common::{CpiResult, PoolEntry, ResultExt, VmState};
use vmpool_providers::{ComputeProvider, PoolRegistry};

use crate::logger::ActionLog;
use crate::state_machine;

/// Returns instances to the pool. Never terminates anything.
pub struct Deleter<'a> {
    compute: &'a dyn ComputeProvider,
    registry: &'a dyn PoolRegistry,
}

impl<'a> Deleter<'a> {
    pub fn new(compute: &'a dyn ComputeProvider, registry: &'a dyn PoolRegistry) -> Self {
        Self { compute, registry }
    }

    pub async fn delete(&self, cid: u64) -> CpiResult<()> {
        let log = ActionLog::start("release_instance", cid);
        let result = self.release(cid).await;
        log.finish(result)
    }

    async fn release(&self, cid: u64) -> CpiResult<()> {
        let entry = self
            .registry
            .get_entry(cid)
            .await
            .with_context(|| format!("looking up pool entry {}", cid))?;

        match entry {
            Some(entry) => state_machine::release(self.registry, &entry)
                .await
                .with_context(|| format!("releasing instance {} to pool", cid)),
            None => self.heal(cid).await,
        }
    }

    /// The registry lost track of a live instance: record it as free.
    async fn heal(&self, cid: u64) -> CpiResult<()> {
        let instance = self
            .compute
            .get_instance(cid)
            .await
            .with_context(|| format!("fetching instance {} to heal pool registry", cid))?;
        let entry = PoolEntry::from_instance(&instance, VmState::Free);
        self.registry
            .add_entry(&entry)
            .await
            .with_context(|| format!("adding missing pool entry {}", cid))?;
        tracing::warn!(
            cid,
            cpu = entry.cpu,
            memory_mb = entry.memory_mb,
            "pool registry had no record of instance; added as free"
        );
        Ok(())
    }
}
