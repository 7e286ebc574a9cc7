use std::net::IpAddr;

use vmpool_common::network::is_private_address;
use vmpool_common::{CpiResult, Instance, ProvisionRequest, ResultExt, ValidatedNetworks};
use vmpool_providers::{ComputeProvider, HostAliases};

use crate::agent_bootstrap::AgentBootstrap;
use crate::config::AgentOptions;
use crate::logger::ActionLog;
use crate::transactions::InstanceWaits;
use crate::waiter::Waiter;

/// How the instance to reuse is identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimTarget {
    Cid(u64),
    Ip(IpAddr),
}

/// Reuses an existing instance: reinstall its OS from the requested
/// stemcell, then run the shared agent bootstrap.
pub struct ReclaimWorkflow<'a> {
    compute: &'a dyn ComputeProvider,
    waiter: &'a Waiter,
    aliases: &'a dyn HostAliases,
    options: &'a AgentOptions,
}

impl<'a> ReclaimWorkflow<'a> {
    pub fn new(
        compute: &'a dyn ComputeProvider,
        waiter: &'a Waiter,
        aliases: &'a dyn HostAliases,
        options: &'a AgentOptions,
    ) -> Self {
        Self {
            compute,
            waiter,
            aliases,
            options,
        }
    }

    async fn locate(&self, target: ReclaimTarget) -> CpiResult<Instance> {
        match target {
            ReclaimTarget::Cid(cid) => self
                .compute
                .get_instance(cid)
                .await
                .with_context(|| format!("looking up instance {}", cid)),
            ReclaimTarget::Ip(ip) if is_private_address(&ip) => self
                .compute
                .get_instance_by_private_ip(ip)
                .await
                .with_context(|| format!("looking up instance by private ip {}", ip)),
            ReclaimTarget::Ip(ip) => self
                .compute
                .get_instance_by_public_ip(ip)
                .await
                .with_context(|| format!("looking up instance by public ip {}", ip)),
        }
    }

    pub async fn run(
        &self,
        target: ReclaimTarget,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
    ) -> CpiResult<Instance> {
        let mut log = ActionLog::start("reload_os", 0);
        let result = self.run_steps(target, request, networks, &mut log).await;
        log.finish(result)
    }

    async fn run_steps(
        &self,
        target: ReclaimTarget,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
        log: &mut ActionLog,
    ) -> CpiResult<Instance> {
        let instance = self.locate(target).await?;
        let cid = instance.cid;
        log.set_cid(cid);

        self.compute
            .os_reload(cid, &request.stemcell)
            .await
            .with_context(|| format!("reloading OS of instance {} from stemcell {}", cid, request.stemcell.id))?;
        tracing::info!(cid, stemcell = request.stemcell.id, "os reload submitted");

        let waits = InstanceWaits::new(self.compute, self.waiter);
        waits
            .has_active_transaction(cid)
            .await
            .context("waiting for os reload to start")?;
        waits
            .no_active_transactions_within(cid, self.waiter.config().os_reload_timeout)
            .await
            .context("waiting for os reload to finish")?;

        let bootstrap = AgentBootstrap::new(self.compute, waits, self.aliases, self.options);
        bootstrap
            .settle(cid, request.vm.ephemeral_disk_size_gb)
            .await?;
        let endpoints = bootstrap
            .resolve_endpoints(&instance, request.external_ip)
            .await?;

        // The reload can change what the IaaS reports about the instance.
        let refreshed = self
            .compute
            .get_instance(cid)
            .await
            .with_context(|| format!("refreshing instance {} after os reload", cid))?;

        bootstrap
            .configure_agent(&refreshed, request, networks, &endpoints)
            .await?;
        bootstrap.apply_credential(cid).await?;
        Ok(refreshed)
    }
}
