use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vmpool_common::{CpiResult, Instance, ProvisionRequest};
use vmpool_providers::{ComputeProvider, HostAliases, PoolRegistry};

use crate::allocator::PoolAllocator;
use crate::config::{AgentOptions, DriverConfig};
use crate::deleter::Deleter;
use crate::provider_manager::ProviderManager;
use crate::vm_ops;
use crate::waiter::{WaitConfig, Waiter};

/// Operations exposed to the protocol layer. Cheap to clone; every call
/// builds its own workflow objects from the shared handles.
#[derive(Clone)]
pub struct Driver {
    compute: Arc<dyn ComputeProvider>,
    registry: Arc<dyn PoolRegistry>,
    aliases: Arc<dyn HostAliases>,
    waits: WaitConfig,
    agent: AgentOptions,
}

impl Driver {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        registry: Arc<dyn PoolRegistry>,
        aliases: Arc<dyn HostAliases>,
        waits: WaitConfig,
        agent: AgentOptions,
    ) -> Self {
        Self {
            compute,
            registry,
            aliases,
            waits,
            agent,
        }
    }

    pub fn from_config(config: &DriverConfig) -> anyhow::Result<Self> {
        let compute = ProviderManager::compute(config)?;
        let registry = ProviderManager::registry(config)?;
        let aliases = ProviderManager::host_aliases(config);
        tracing::info!(
            provider = %config.provider,
            wait_timeout_secs = config.waits.timeout.as_secs(),
            wait_interval_secs = config.waits.interval.as_secs(),
            os_reload_timeout_secs = config.waits.os_reload_timeout.as_secs(),
            "driver configured"
        );
        Ok(Self::new(
            compute,
            registry,
            aliases,
            config.waits,
            config.agent.clone(),
        ))
    }

    /// Logging, `.env` and environment configuration in one step.
    pub fn from_env() -> anyhow::Result<Self> {
        crate::logger::init();
        let config = DriverConfig::from_env()?;
        Self::from_config(&config)
    }

    /// Cancelling `cancel` aborts whatever wait is in flight.
    pub async fn create_vm(
        &self,
        request: &ProvisionRequest,
        cancel: CancellationToken,
    ) -> CpiResult<Instance> {
        let waiter = Waiter::new(self.waits, cancel);
        PoolAllocator::new(
            self.compute.as_ref(),
            self.registry.as_ref(),
            &waiter,
            self.aliases.as_ref(),
            &self.agent,
        )
        .allocate(request)
        .await
    }

    pub async fn delete_vm(&self, cid: u64) -> CpiResult<()> {
        Deleter::new(self.compute.as_ref(), self.registry.as_ref())
            .delete(cid)
            .await
    }

    pub async fn has_vm(&self, cid: u64) -> CpiResult<bool> {
        vm_ops::has_vm(self.compute.as_ref(), cid).await
    }

    pub async fn reboot_vm(&self, cid: u64, cancel: CancellationToken) -> CpiResult<()> {
        let waiter = Waiter::new(self.waits, cancel);
        vm_ops::reboot_vm(self.compute.as_ref(), &waiter, cid).await
    }
}
