use vmpool_common::network::is_private_address;
use vmpool_common::{
    CpiError, CpiResult, ErrorKind, Instance, PoolEntry, ProvisionRequest, ResultExt,
    ValidatedNetworks, VmFilter, VmState,
};
use vmpool_providers::{ComputeProvider, HostAliases, PoolRegistry};

use crate::config::AgentOptions;
use crate::provision::ProvisionWorkflow;
use crate::reclaim::{ReclaimTarget, ReclaimWorkflow};
use crate::state_machine;
use crate::waiter::Waiter;

/// Filter for free pool entries of the requested shape.
pub fn build_filter(request: &ProvisionRequest, networks: &ValidatedNetworks) -> VmFilter {
    VmFilter {
        cpu: request.vm.cpu,
        memory_mb: request.vm.memory_mb,
        private_vlan: networks.private_vlan(),
        public_vlan: networks.public_vlan(),
        state: VmState::Free,
    }
}

/// Entry point for instance allocation: reuse a free pooled instance when one
/// fits, build a new one otherwise.
pub struct PoolAllocator<'a> {
    compute: &'a dyn ComputeProvider,
    registry: &'a dyn PoolRegistry,
    waiter: &'a Waiter,
    aliases: &'a dyn HostAliases,
    options: &'a AgentOptions,
}

impl<'a> PoolAllocator<'a> {
    pub fn new(
        compute: &'a dyn ComputeProvider,
        registry: &'a dyn PoolRegistry,
        waiter: &'a Waiter,
        aliases: &'a dyn HostAliases,
        options: &'a AgentOptions,
    ) -> Self {
        Self {
            compute,
            registry,
            waiter,
            aliases,
            options,
        }
    }

    fn reclaim(&self) -> ReclaimWorkflow<'a> {
        ReclaimWorkflow::new(self.compute, self.waiter, self.aliases, self.options)
    }

    pub async fn allocate(&self, request: &ProvisionRequest) -> CpiResult<Instance> {
        let networks = ValidatedNetworks::validate(&request.networks)
            .with_context(|| format!("validating networks for agent {}", request.agent_id))?;

        if let Some(ip) = networks.fixed_ip() {
            tracing::info!(
                agent_id = %request.agent_id,
                %ip,
                private = is_private_address(&ip),
                "fixed ip requested; reusing its instance without the pool"
            );
            return self
                .reclaim()
                .run(ReclaimTarget::Ip(ip), request, &networks)
                .await
                .with_context(|| format!("reusing instance at {}", ip));
        }

        let filter = build_filter(request, &networks);
        let candidates = self
            .registry
            .find_by_filter(&filter)
            .await
            .context("querying pool for free instances")?;

        match candidates.into_iter().next() {
            None => self.provision_new(request, &networks).await,
            Some(entry) => self.reuse(entry, request, &networks).await,
        }
    }

    async fn provision_new(
        &self,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
    ) -> CpiResult<Instance> {
        tracing::info!(agent_id = %request.agent_id, "pool miss; provisioning a new instance");
        let instance = ProvisionWorkflow::new(self.compute, self.waiter, self.aliases, self.options)
            .run(request, networks)
            .await?;

        let entry = PoolEntry::from_instance(&instance, VmState::Using);
        self.registry
            .add_entry(&entry)
            .await
            .with_context(|| format!("registering instance {} in pool", instance.cid))?;
        tracing::info!(cid = instance.cid, "new instance registered in pool as using");
        Ok(instance)
    }

    async fn reuse(
        &self,
        entry: PoolEntry,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
    ) -> CpiResult<Instance> {
        let cid = entry.cid;
        tracing::info!(agent_id = %request.agent_id, cid, "pool hit; reusing instance");

        state_machine::claim(self.registry, cid).await.map_err(|e| {
            // Someone else claimed it between the query and the claim.
            let retry = e.kind() == ErrorKind::PoolConflict;
            e.retryable(retry)
        })?;

        match self
            .reclaim()
            .run(ReclaimTarget::Cid(cid), request, networks)
            .await
        {
            Ok(instance) => {
                state_machine::mark_using(self.registry, cid).await?;
                Ok(instance)
            }
            Err(err) => {
                let err = err.push_context(format!("reusing pooled instance {}", cid));
                match state_machine::rollback_claim(self.registry, cid).await {
                    Ok(()) => Err(err),
                    Err(comp) => {
                        tracing::error!(
                            cid,
                            error = %err,
                            compensation_error = %comp,
                            "pool entry could not be returned to free; registry diverges from the instance"
                        );
                        Err(CpiError::compensation_failed(err, comp))
                    }
                }
            }
        }
    }
}
