// Shared fixtures for orchestrator integration tests.
// Everything runs against the in-memory doubles from `vmpool-providers/mock`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vmpool_common::{
    Instance, NetworkCloudProperties, NetworkDefinition, NetworkType, PoolEntry,
    ProvisionRequest, StemcellRef, VmSpec, VmState,
};
use vmpool_orchestrator::{AgentOptions, PoolAllocator, WaitConfig, Waiter};
use vmpool_providers::host_aliases::MemoryHostAliases;
use vmpool_providers::mock::{MockCompute, MockPoolRegistry};

pub const PRIVATE_VLAN: u64 = 1201;
pub const PUBLIC_VLAN: u64 = 1202;

pub fn fast_waits() -> WaitConfig {
    WaitConfig {
        timeout: Duration::from_secs(60),
        interval: Duration::from_secs(1),
        os_reload_timeout: Duration::from_secs(180),
    }
}

pub fn dynamic_network() -> NetworkDefinition {
    NetworkDefinition {
        kind: NetworkType::Dynamic,
        dns: vec!["10.0.80.11".into()],
        default: vec!["dns".into(), "gateway".into()],
        cloud_properties: NetworkCloudProperties {
            private_vlan_id: Some(PRIVATE_VLAN),
            public_vlan_id: Some(PUBLIC_VLAN),
        },
        ..Default::default()
    }
}

pub fn request_with(networks: BTreeMap<String, NetworkDefinition>) -> ProvisionRequest {
    ProvisionRequest {
        agent_id: "agent-e2e".into(),
        stemcell: StemcellRef {
            id: 77,
            uuid: "stemcell-77".into(),
        },
        vm: VmSpec {
            cpu: 4,
            memory_mb: 8192,
            hostname_prefix: "worker".into(),
            domain: "vmpool.test".into(),
            datacenter: "dal10".into(),
            hourly_billing: true,
            local_disk: true,
            dedicated_host: false,
            max_network_speed: 100,
            ephemeral_disk_size_gb: None,
            ssh_key_ids: vec![],
            user_data: None,
        },
        networks,
        env: serde_json::json!({ "persistent_disk_fs": "ext4" }),
        external_ip: None,
    }
}

pub fn request() -> ProvisionRequest {
    let mut networks = BTreeMap::new();
    networks.insert("default".to_string(), dynamic_network());
    request_with(networks)
}

pub fn pooled_instance(cid: u64) -> Instance {
    let octet = (cid % 250) as u8 + 1;
    Instance {
        cid,
        hostname: format!("pooled-{}", cid),
        domain: "vmpool.test".into(),
        start_cpus: 4,
        max_memory_mb: 8192,
        primary_ip: Some(format!("169.60.0.{}", octet).parse().unwrap()),
        primary_backend_ip: Some(format!("10.60.0.{}", octet).parse().unwrap()),
        private_vlan: Some(PRIVATE_VLAN),
        public_vlan: Some(PUBLIC_VLAN),
        ..Default::default()
    }
}

pub fn free_entry(instance: &Instance) -> PoolEntry {
    PoolEntry::from_instance(instance, VmState::Free)
}

/// Doubles plus everything a workflow borrows.
pub struct Harness {
    pub compute: MockCompute,
    pub registry: MockPoolRegistry,
    pub aliases: MemoryHostAliases,
    pub waiter: Waiter,
    pub options: AgentOptions,
}

impl Harness {
    pub fn new(registry: MockPoolRegistry) -> Self {
        Self {
            compute: MockCompute::new(),
            registry,
            aliases: MemoryHostAliases::new(),
            waiter: Waiter::new(fast_waits(), CancellationToken::new()),
            options: AgentOptions::default(),
        }
    }

    pub fn allocator(&self) -> PoolAllocator<'_> {
        PoolAllocator::new(
            &self.compute,
            &self.registry,
            &self.waiter,
            &self.aliases,
            &self.options,
        )
    }
}
