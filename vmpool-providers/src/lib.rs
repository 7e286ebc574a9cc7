use std::net::IpAddr;

use async_trait::async_trait;
use vmpool_common::agent_settings::AgentSettings;
use vmpool_common::{
    BlockDevice, CpiResult, Credential, Instance, PoolEntry, PowerState, StemcellRef,
    Transaction, VmFilter, VmState,
};

pub mod host_aliases;

/// Typed operations against the IaaS. Every call is a single remote request;
/// none of them wait for the asynchronous work they trigger.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Submit a create order. Returns as soon as the IaaS assigns a cid.
    async fn create_instance(&self, template: &inventory::InstanceTemplate) -> CpiResult<Instance>;

    /// Fails with `ErrorKind::VmNotFound` when the cid is unknown.
    async fn get_instance(&self, cid: u64) -> CpiResult<Instance>;

    async fn get_active_transactions(&self, cid: u64) -> CpiResult<Vec<Transaction>>;
    async fn get_last_transaction(&self, cid: u64) -> CpiResult<Option<Transaction>>;
    async fn get_power_state(&self, cid: u64) -> CpiResult<PowerState>;
    async fn is_pingable(&self, cid: u64) -> CpiResult<bool>;

    /// Place a metered upgrade order for an ephemeral disk. Returns the order id;
    /// 0 means nothing was ordered.
    async fn attach_ephemeral_disk(&self, cid: u64, size_gb: u64) -> CpiResult<u64>;

    async fn get_block_devices(&self, cid: u64) -> CpiResult<Vec<BlockDevice>>;
    async fn get_instance_by_private_ip(&self, ip: IpAddr) -> CpiResult<Instance>;
    async fn get_instance_by_public_ip(&self, ip: IpAddr) -> CpiResult<Instance>;

    /// Wipe and reinstall the OS from `stemcell`, keeping the hardware.
    async fn os_reload(&self, cid: u64, stemcell: &StemcellRef) -> CpiResult<()>;

    async fn push_agent_settings(&self, cid: u64, settings: &AgentSettings) -> CpiResult<()>;
    async fn set_credential(&self, cid: u64, credential: &Credential) -> CpiResult<()>;

    // Optional: soft reboot. Default is unsupported.
    async fn reboot_instance(&self, cid: u64) -> CpiResult<()> {
        Err(vmpool_common::CpiError::not_supported(format!(
            "reboot of instance {} is not supported by this provider",
            cid
        )))
    }
}

/// External registry of reusable instances.
#[async_trait]
pub trait PoolRegistry: Send + Sync {
    /// Entries in registry order.
    async fn find_by_filter(&self, filter: &VmFilter) -> CpiResult<Vec<PoolEntry>>;
    async fn add_entry(&self, entry: &PoolEntry) -> CpiResult<()>;

    /// Conditional update: when `expected` is set and the stored state differs,
    /// fails with `ErrorKind::PoolConflict` instead of overwriting.
    async fn update_state(&self, cid: u64, expected: Option<VmState>, next: VmState)
        -> CpiResult<()>;

    /// `Ok(None)` when the registry has no record for `cid`.
    async fn get_entry(&self, cid: u64) -> CpiResult<Option<PoolEntry>>;
}

/// Hostname -> address bookkeeping for instances reached through their own IP.
#[async_trait]
pub trait HostAliases: Send + Sync {
    async fn upsert(&self, hostname: &str, ip: IpAddr) -> CpiResult<()>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    /// Provider-neutral rendering of a create order.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InstanceTemplate {
        pub hostname: String,
        pub domain: String,
        pub start_cpus: u32,
        pub max_memory_mb: u64,
        pub datacenter: String,
        pub hourly_billing: bool,
        pub local_disk: bool,
        pub dedicated_host: bool,
        pub max_network_speed: u32,
        pub image_global_id: String,
        pub private_vlan_id: Option<u64>,
        pub public_vlan_id: Option<u64>,
        pub ssh_key_ids: Vec<u64>,
        pub user_data: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "softlayer")]
pub mod softlayer;

#[cfg(feature = "vps")]
pub mod vps;
