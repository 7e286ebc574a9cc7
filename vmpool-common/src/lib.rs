use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod agent_settings;
pub mod error;
pub mod network;

pub use error::{CpiError, CpiResult, ErrorKind, ResultExt};
pub use network::{NetworkCloudProperties, NetworkDefinition, NetworkType, ValidatedNetworks};

pub const TX_STATUS_COMPLETE: &str = "COMPLETE";
pub const TX_GROUP_SERVICE_SETUP: &str = "Service Setup";
pub const TX_GROUP_CLOUD_MIGRATE: &str = "Cloud Migrate";
pub const TX_GROUP_INSTANCE_UPGRADE: &str = "Cloud Instance Upgrade";

// --- Enums ---

/// Availability of a pooled instance as tracked by the pool registry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Free,
    Provisioning,
    Using,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Free => "free",
            VmState::Provisioning => "provisioning",
            VmState::Using => "using",
        }
    }

    /// Free -> Provisioning -> Using, Using -> Free (release), Provisioning -> Free (rollback).
    pub fn can_transition_to(&self, next: VmState) -> bool {
        matches!(
            (self, next),
            (VmState::Free, VmState::Provisioning)
                | (VmState::Provisioning, VmState::Using)
                | (VmState::Using, VmState::Free)
                | (VmState::Provisioning, VmState::Free)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Halted,
    Paused,
    Other(String),
}

impl PowerState {
    pub fn from_key_name(key: &str) -> Self {
        match key.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => PowerState::Running,
            "HALTED" => PowerState::Halted,
            "PAUSED" => PowerState::Paused,
            other => PowerState::Other(other.to_string()),
        }
    }

    pub fn key_name(&self) -> &str {
        match self {
            PowerState::Running => "RUNNING",
            PowerState::Halted => "HALTED",
            PowerState::Paused => "PAUSED",
            PowerState::Other(s) => s,
        }
    }
}

// --- Pool registry ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub cid: u64,
    pub cpu: u32,
    pub memory_mb: u64,
    pub ip: Option<IpAddr>,
    pub hostname: String,
    pub private_vlan: u64,
    pub public_vlan: u64,
    pub state: VmState,
}

impl PoolEntry {
    /// Snapshot the live instance attributes into a registry record.
    pub fn from_instance(instance: &Instance, state: VmState) -> Self {
        Self {
            cid: instance.cid,
            cpu: instance.start_cpus,
            memory_mb: instance.max_memory_mb,
            ip: instance.primary_backend_ip.or(instance.primary_ip),
            hostname: instance.fqdn(),
            private_vlan: instance.private_vlan.unwrap_or_default(),
            public_vlan: instance.public_vlan.unwrap_or_default(),
            state,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VmFilter {
    pub cpu: u32,
    pub memory_mb: u64,
    pub private_vlan: u64,
    pub public_vlan: u64,
    pub state: VmState,
}

impl VmFilter {
    pub fn matches(&self, entry: &PoolEntry) -> bool {
        entry.cpu == self.cpu
            && entry.memory_mb == self.memory_mb
            && entry.private_vlan == self.private_vlan
            && entry.public_vlan == self.public_vlan
            && entry.state == self.state
    }
}

// --- Live instance ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: u64,
    pub group: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some(TX_STATUS_COMPLETE)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub id: u64,
    pub device: String,
    pub capacity_gb: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NetworkComponent {
    pub id: u64,
    pub port: u32,
    pub primary_ip: Option<IpAddr>,
    pub max_speed: Option<u32>,
    pub vlan_id: Option<u64>,
}

/// The live compute resource as reported by the IaaS.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Instance {
    pub cid: u64,
    pub hostname: String,
    pub domain: String,
    pub start_cpus: u32,
    pub max_memory_mb: u64,
    pub primary_ip: Option<IpAddr>,
    pub primary_backend_ip: Option<IpAddr>,
    pub power_state: Option<PowerState>,
    pub private_vlan: Option<u64>,
    pub public_vlan: Option<u64>,
    pub active_transactions: Vec<Transaction>,
    pub last_transaction: Option<Transaction>,
    pub block_devices: Vec<BlockDevice>,
    pub network_components: Vec<NetworkComponent>,
}

impl Instance {
    pub fn fqdn(&self) -> String {
        if self.domain.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}.{}", self.hostname, self.domain)
        }
    }
}

// --- Requests ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StemcellRef {
    pub id: u64,
    pub uuid: String,
}

/// Compute shape and placement requested for an instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub cpu: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub hostname_prefix: String,
    #[serde(default)]
    pub domain: String,
    pub datacenter: String,
    #[serde(default = "default_true")]
    pub hourly_billing: bool,
    #[serde(default = "default_true")]
    pub local_disk: bool,
    #[serde(default)]
    pub dedicated_host: bool,
    #[serde(default = "default_network_speed")]
    pub max_network_speed: u32,
    #[serde(default)]
    pub ephemeral_disk_size_gb: Option<u64>,
    #[serde(default)]
    pub ssh_key_ids: Vec<u64>,
    /// Passed through to the IaaS metadata service at create time.
    #[serde(default)]
    pub user_data: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_network_speed() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub agent_id: String,
    pub stemcell: StemcellRef,
    pub vm: VmSpec,
    pub networks: BTreeMap<String, NetworkDefinition>,
    #[serde(default)]
    pub env: serde_json::Value,
    /// Externally reachable address supplied by the caller; overrides the
    /// instance IP for agent endpoints.
    #[serde(default)]
    pub external_ip: Option<IpAddr>,
}

/// Administrative login applied to an instance after provisioning.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

pub const MIN_CREDENTIAL_PASSWORD_LEN: usize = 8;

impl Credential {
    pub fn validate(&self) -> CpiResult<()> {
        if self.username.trim().is_empty() {
            return Err(CpiError::new(
                ErrorKind::CredentialDisallowed,
                "credential username must not be empty",
            ));
        }
        if self.password.chars().count() < MIN_CREDENTIAL_PASSWORD_LEN {
            return Err(CpiError::new(
                ErrorKind::CredentialDisallowed,
                format!(
                    "credential password for '{}' must be at least {} characters",
                    self.username, MIN_CREDENTIAL_PASSWORD_LEN
                ),
            ));
        }
        Ok(())
    }
}
