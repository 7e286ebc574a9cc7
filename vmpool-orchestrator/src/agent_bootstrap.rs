//! Post-create steps shared by fresh provisioning and OS-reload reuse:
//! settle the instance, resolve the agent endpoints, push the agent
//! configuration and apply the admin credential.

use std::collections::BTreeMap;
use std::net::IpAddr;

use vmpool_common::agent_settings::{AgentDisks, AgentNetwork, AgentSettings, AgentVm};
use vmpool_common::{
    CpiError, CpiResult, Instance, NetworkDefinition, ProvisionRequest, ResultExt,
    ValidatedNetworks, TX_GROUP_SERVICE_SETUP,
};
use vmpool_providers::{ComputeProvider, HostAliases};

use crate::config::AgentOptions;
use crate::disk_attacher::EphemeralDiskAttacher;
use crate::transactions::InstanceWaits;

pub const SYSTEM_DISK: &str = "/dev/xvda";
pub const EPHEMERAL_DISK: &str = "/dev/xvdc";

/// Where the agent of one instance is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ip: IpAddr,
    pub mbus: String,
    pub blobstore: Option<String>,
}

/// Replace the host part of `url`, keeping scheme, userinfo, port and path.
pub fn replace_url_host(url: &str, host: IpAddr) -> CpiResult<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| CpiError::invalid(format!("malformed URL '{}'", url)))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let (userinfo, hostport) = match authority.rfind('@') {
        Some(i) => (&authority[..=i], &authority[i + 1..]),
        None => ("", authority),
    };
    let port = if hostport.starts_with('[') {
        hostport
            .find(']')
            .map(|i| &hostport[i + 1..])
            .unwrap_or_default()
    } else {
        hostport.rfind(':').map(|i| &hostport[i..]).unwrap_or_default()
    };
    let host = match host {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    Ok(format!("{}://{}{}{}{}", scheme, userinfo, host, port, path))
}

pub fn render_endpoints(options: &AgentOptions, ip: IpAddr) -> CpiResult<Endpoints> {
    let mbus = if options.mbus.starts_with("https://") {
        replace_url_host(&options.mbus, ip)?
    } else {
        options.mbus.clone()
    };
    Ok(Endpoints {
        ip,
        mbus,
        blobstore: options.blobstore.clone(),
    })
}

fn agent_network(kind: &str, def: &NetworkDefinition, ip: Option<IpAddr>) -> AgentNetwork {
    AgentNetwork {
        kind: kind.to_string(),
        ip: ip.map(|ip| ip.to_string()),
        netmask: def.netmask.clone(),
        gateway: def.gateway.map(|g| g.to_string()),
        dns: def.dns.clone(),
        default: def.default.clone(),
    }
}

/// Agent configuration for `instance` as the request describes it.
pub fn render_agent_settings(
    instance: &Instance,
    request: &ProvisionRequest,
    networks: &ValidatedNetworks,
    endpoints: &Endpoints,
    options: &AgentOptions,
) -> AgentSettings {
    let mut agent_networks = BTreeMap::new();
    agent_networks.insert(
        networks.dynamic_name.clone(),
        agent_network(
            "dynamic",
            &networks.dynamic,
            instance.primary_backend_ip.or(networks.dynamic.ip),
        ),
    );
    for (name, def) in &networks.manual {
        agent_networks.insert(name.clone(), agent_network("manual", def, def.ip));
    }

    AgentSettings {
        agent_id: request.agent_id.clone(),
        vm: AgentVm {
            name: instance.fqdn(),
        },
        mbus: endpoints.mbus.clone(),
        blobstore: endpoints.blobstore.clone(),
        ntp: options.ntp.clone(),
        disks: AgentDisks {
            system: SYSTEM_DISK.to_string(),
            ephemeral: request
                .vm
                .ephemeral_disk_size_gb
                .filter(|size| *size > 0)
                .map(|_| EPHEMERAL_DISK.to_string()),
            persistent: BTreeMap::new(),
        },
        networks: agent_networks,
        env: request.env.clone(),
    }
}

pub struct AgentBootstrap<'a> {
    compute: &'a dyn ComputeProvider,
    waits: InstanceWaits<'a>,
    aliases: &'a dyn HostAliases,
    options: &'a AgentOptions,
}

impl<'a> AgentBootstrap<'a> {
    pub fn new(
        compute: &'a dyn ComputeProvider,
        waits: InstanceWaits<'a>,
        aliases: &'a dyn HostAliases,
        options: &'a AgentOptions,
    ) -> Self {
        Self {
            compute,
            waits,
            aliases,
            options,
        }
    }

    /// Without an ephemeral disk, wait for the setup transaction; with one,
    /// the disk upgrade covers the settle waits.
    pub async fn settle(&self, cid: u64, ephemeral_disk_size_gb: Option<u64>) -> CpiResult<()> {
        match ephemeral_disk_size_gb.filter(|size| *size > 0) {
            Some(size_gb) => EphemeralDiskAttacher::new(self.compute, self.waits)
                .attach(cid, size_gb)
                .await
                .with_context(|| format!("attaching ephemeral disk to instance {}", cid)),
            None => self
                .waits
                .last_transaction_complete(cid, &[TX_GROUP_SERVICE_SETUP])
                .await
                .with_context(|| format!("waiting for instance {} setup", cid)),
        }
    }

    /// The caller-supplied external IP wins and leaves host aliases alone.
    /// Otherwise the private address is used and aliased under the FQDN.
    pub async fn resolve_endpoints(
        &self,
        instance: &Instance,
        external_ip: Option<IpAddr>,
    ) -> CpiResult<Endpoints> {
        let ip = match external_ip {
            Some(ip) => ip,
            None => {
                let ip = instance
                    .primary_backend_ip
                    .or(instance.primary_ip)
                    .ok_or_else(|| {
                        CpiError::cloud(format!("instance {} has no IP address", instance.cid))
                    })?;
                self.aliases
                    .upsert(&instance.fqdn(), ip)
                    .await
                    .with_context(|| format!("recording host alias for instance {}", instance.cid))?;
                ip
            }
        };
        render_endpoints(self.options, ip)
    }

    pub async fn configure_agent(
        &self,
        instance: &Instance,
        request: &ProvisionRequest,
        networks: &ValidatedNetworks,
        endpoints: &Endpoints,
    ) -> CpiResult<AgentSettings> {
        let settings = render_agent_settings(instance, request, networks, endpoints, self.options);
        self.compute
            .push_agent_settings(instance.cid, &settings)
            .await
            .with_context(|| format!("pushing agent settings to instance {}", instance.cid))?;
        tracing::info!(cid = instance.cid, agent_id = %settings.agent_id, "agent settings pushed");
        Ok(settings)
    }

    /// No-op without a configured credential.
    pub async fn apply_credential(&self, cid: u64) -> CpiResult<()> {
        let Some(credential) = &self.options.credential else {
            return Ok(());
        };
        credential.validate()?;
        self.compute
            .set_credential(cid, credential)
            .await
            .with_context(|| format!("setting credential on instance {}", cid))?;
        tracing::info!(cid, username = %credential.username, "credential applied");
        Ok(())
    }
}
