use std::fmt;

use vmpool_common::{
    CpiError, CpiResult, ErrorKind, Instance, ProvisionRequest, ResultExt, ValidatedNetworks,
};
use vmpool_providers::inventory::InstanceTemplate;
use vmpool_providers::{ComputeProvider, HostAliases};

use crate::agent_bootstrap::AgentBootstrap;
use crate::config::AgentOptions;
use crate::logger::ActionLog;
use crate::transactions::InstanceWaits;
use crate::waiter::Waiter;

const DEFAULT_HOSTNAME_PREFIX: &str = "vm";

/// `<prefix>-<12 hex chars>`.
pub fn generate_hostname(prefix: &str) -> String {
    let prefix = prefix.trim().trim_end_matches('-');
    let prefix = if prefix.is_empty() {
        DEFAULT_HOSTNAME_PREFIX
    } else {
        prefix
    };
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..12])
}

/// Provider-neutral create order for `request`.
pub fn render_template(
    request: &ProvisionRequest,
    networks: &ValidatedNetworks,
    hostname: String,
) -> InstanceTemplate {
    let vm = &request.vm;
    InstanceTemplate {
        hostname,
        domain: vm.domain.clone(),
        start_cpus: vm.cpu,
        max_memory_mb: vm.memory_mb,
        datacenter: vm.datacenter.clone(),
        hourly_billing: vm.hourly_billing,
        local_disk: vm.local_disk,
        dedicated_host: vm.dedicated_host,
        max_network_speed: vm.max_network_speed,
        image_global_id: request.stemcell.uuid.clone(),
        private_vlan_id: networks.dynamic.cloud_properties.private_vlan_id,
        public_vlan_id: networks.dynamic.cloud_properties.public_vlan_id,
        ssh_key_ids: vm.ssh_key_ids.clone(),
        user_data: vm.user_data.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStep {
    TemplateRendered,
    InstanceCreated(u64),
    InstanceSettled,
    EndpointsResolved,
    AgentConfigured,
    CredentialApplied,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStep::TemplateRendered => write!(f, "template rendered"),
            ProvisionStep::InstanceCreated(cid) => write!(f, "instance {} created", cid),
            ProvisionStep::InstanceSettled => write!(f, "instance settled"),
            ProvisionStep::EndpointsResolved => write!(f, "endpoints resolved"),
            ProvisionStep::AgentConfigured => write!(f, "agent configured"),
            ProvisionStep::CredentialApplied => write!(f, "credential applied"),
        }
    }
}

/// Completed steps of one provisioning run. On failure the compensation
/// hooks run in reverse order. None of them destroys billable resources;
/// they report what was left behind.
#[derive(Debug, Default)]
pub struct ProvisionSaga {
    completed: Vec<ProvisionStep>,
}

impl ProvisionSaga {
    pub fn record(&mut self, step: ProvisionStep) {
        tracing::debug!(step = %step, "provision step completed");
        self.completed.push(step);
    }

    pub fn completed(&self) -> &[ProvisionStep] {
        &self.completed
    }

    /// True once the IaaS holds a billable instance for this run.
    pub fn created_instance(&self) -> bool {
        self.completed
            .iter()
            .any(|s| matches!(s, ProvisionStep::InstanceCreated(_)))
    }

    pub fn describe(&self) -> String {
        if self.completed.is_empty() {
            return "none".to_string();
        }
        self.completed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn compensate(&self, err: &CpiError) {
        for step in self.completed.iter().rev() {
            match step {
                ProvisionStep::InstanceCreated(cid) => tracing::warn!(
                    cid,
                    error = %err,
                    "instance left in place after failed provisioning; it stays billable until released"
                ),
                ProvisionStep::EndpointsResolved => tracing::info!(
                    error = %err,
                    "host alias from failed provisioning kept; it is overwritten on the next upsert"
                ),
                other => tracing::debug!(step = %other, "no compensation needed"),
            }
        }
    }
}

/// Creates a brand-new instance and brings its agent up.
pub struct ProvisionWorkflow<'a> {
    compute: &'a dyn ComputeProvider,
    waiter: &'a Waiter,
    aliases: &'a dyn HostAliases,
    options: &'a AgentOptions,
}

impl<'a> ProvisionWorkflow<'a> {
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

    pub async fn run(
        &self,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
    ) -> CpiResult<Instance> {
        let mut log = ActionLog::start("provision_instance", 0);
        let mut saga = ProvisionSaga::default();
        let result = self.run_steps(request, networks, &mut saga, &mut log).await;
        let result = result.map_err(|err| {
            saga.compensate(&err);
            // A failed create leaves nothing behind, so the caller may retry.
            let err = if !saga.created_instance() && err.kind() == ErrorKind::Cloud {
                err.with_kind(ErrorKind::VmCreationFailed).retryable(true)
            } else {
                err
            };
            err.push_context(format!(
                "provisioning instance for agent {} (completed steps: {})",
                request.agent_id,
                saga.describe()
            ))
        });
        log.finish(result)
    }

    async fn run_steps(
        &self,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
        saga: &mut ProvisionSaga,
        log: &mut ActionLog,
    ) -> CpiResult<Instance> {
        let hostname = generate_hostname(&request.vm.hostname_prefix);
        let template = render_template(request, networks, hostname);
        saga.record(ProvisionStep::TemplateRendered);

        let instance = self
            .compute
            .create_instance(&template)
            .await
            .with_context(|| format!("creating instance {}", template.hostname))?;
        let cid = instance.cid;
        log.set_cid(cid);
        saga.record(ProvisionStep::InstanceCreated(cid));
        tracing::info!(cid, hostname = %template.hostname, "instance created");

        let waits = InstanceWaits::new(self.compute, self.waiter);
        let bootstrap = AgentBootstrap::new(self.compute, waits, self.aliases, self.options);

        bootstrap
            .settle(cid, request.vm.ephemeral_disk_size_gb)
            .await?;
        saga.record(ProvisionStep::InstanceSettled);

        // The create response lacks addresses and VLANs.
        let instance = self
            .compute
            .get_instance(cid)
            .await
            .with_context(|| format!("refreshing instance {} after create", cid))?;

        let endpoints = bootstrap
            .resolve_endpoints(&instance, request.external_ip)
            .await?;
        saga.record(ProvisionStep::EndpointsResolved);

        bootstrap
            .configure_agent(&instance, request, networks, &endpoints)
            .await?;
        saga.record(ProvisionStep::AgentConfigured);

        if self.options.credential.is_some() {
            bootstrap.apply_credential(cid).await?;
            saga.record(ProvisionStep::CredentialApplied);
        }

        Ok(instance)
    }
}
