//! In-memory doubles for the IaaS and the pool registry.
//!
//! `MockCompute` simulates the asynchronous behaviour the workflows wait on:
//! a disk upgrade or OS reload enqueues one transaction that is reported as
//! active on the next poll and completes on the poll after that. Both doubles
//! journal every call so tests can assert on exact sequences.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use vmpool_common::agent_settings::AgentSettings;
use vmpool_common::{
    BlockDevice, CpiError, CpiResult, Credential, ErrorKind, Instance, PoolEntry, PowerState,
    StemcellRef, Transaction, VmFilter, VmState, TX_GROUP_INSTANCE_UPGRADE,
    TX_GROUP_SERVICE_SETUP, TX_STATUS_COMPLETE,
};

use crate::{inventory, ComputeProvider, PoolRegistry};

const BASELINE_BLOCK_DEVICES: usize = 2;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// -----------------------------------------------------------------------------
// Compute
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeCall {
    CreateInstance { hostname: String },
    GetInstance(u64),
    GetActiveTransactions(u64),
    GetLastTransaction(u64),
    GetPowerState(u64),
    IsPingable(u64),
    AttachEphemeralDisk { cid: u64, size_gb: u64 },
    GetBlockDevices(u64),
    GetInstanceByPrivateIp(IpAddr),
    GetInstanceByPublicIp(IpAddr),
    OsReload { cid: u64, stemcell_id: u64 },
    PushAgentSettings(u64),
    SetCredential(u64),
    RebootInstance(u64),
}

impl ComputeCall {
    /// Read-only calls issued by waiters.
    pub fn is_poll(&self) -> bool {
        matches!(
            self,
            ComputeCall::GetActiveTransactions(_)
                | ComputeCall::GetLastTransaction(_)
                | ComputeCall::GetPowerState(_)
                | ComputeCall::IsPingable(_)
        )
    }
}

struct SimInstance {
    instance: Instance,
    queued: Option<Transaction>,
    observed: bool,
    unpingable_polls: u32,
}

struct ComputeState {
    next_cid: u64,
    next_tx: u64,
    instances: BTreeMap<u64, SimInstance>,
    calls: Vec<ComputeCall>,
    failures: HashMap<&'static str, CpiError>,
    attach_order_id: Option<u64>,
    attach_error: Option<CpiError>,
    attach_adds_device: bool,
    settings: HashMap<u64, AgentSettings>,
}

pub struct MockCompute {
    state: Mutex<ComputeState>,
}

impl Default for MockCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCompute {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ComputeState {
                next_cid: 1000,
                next_tx: 1,
                instances: BTreeMap::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                attach_order_id: None,
                attach_error: None,
                attach_adds_device: true,
                settings: HashMap::new(),
            }),
        }
    }

    /// Seed a running instance with a completed "Service Setup" and baseline disks.
    pub fn insert_instance(&self, mut instance: Instance) {
        if instance.power_state.is_none() {
            instance.power_state = Some(PowerState::Running);
        }
        let mut st = lock(&self.state);
        if instance.last_transaction.is_none() {
            let id = st.bump_tx();
            instance.last_transaction = Some(complete_tx(id, TX_GROUP_SERVICE_SETUP));
        }
        if instance.block_devices.is_empty() {
            instance.block_devices = baseline_devices();
        }
        st.instances.insert(
            instance.cid,
            SimInstance {
                instance,
                queued: None,
                observed: false,
                unpingable_polls: 0,
            },
        );
    }

    /// Make every call to `op` fail with `err` (op names match the trait methods).
    pub fn fail(&self, op: &'static str, err: CpiError) {
        lock(&self.state).failures.insert(op, err);
    }

    /// Force the order id returned by `attach_ephemeral_disk`.
    pub fn set_attach_order_id(&self, order_id: u64) {
        lock(&self.state).attach_order_id = Some(order_id);
    }

    /// The order is still placed, but the call reports `err`.
    pub fn set_attach_error(&self, err: CpiError) {
        lock(&self.state).attach_error = Some(err);
    }

    /// When false, a completed upgrade leaves the block device list unchanged.
    pub fn set_attach_adds_device(&self, adds: bool) {
        lock(&self.state).attach_adds_device = adds;
    }

    pub fn calls(&self) -> Vec<ComputeCall> {
        lock(&self.state).calls.clone()
    }

    pub fn pushed_settings(&self, cid: u64) -> Option<AgentSettings> {
        lock(&self.state).settings.get(&cid).cloned()
    }

    pub fn instance(&self, cid: u64) -> Option<Instance> {
        lock(&self.state).instances.get(&cid).map(|s| s.instance.clone())
    }

    fn enter(&self, call: ComputeCall, op: &'static str) -> CpiResult<MutexGuard<'_, ComputeState>> {
        let mut st = lock(&self.state);
        st.calls.push(call);
        if let Some(err) = st.failures.get(op) {
            return Err(err.clone());
        }
        Ok(st)
    }
}

impl ComputeState {
    fn bump_tx(&mut self) -> u64 {
        let id = self.next_tx;
        self.next_tx += 1;
        id
    }

    fn sim(&mut self, cid: u64) -> CpiResult<&mut SimInstance> {
        self.instances
            .get_mut(&cid)
            .ok_or_else(|| CpiError::not_found(format!("instance {} not found", cid)))
    }

    fn enqueue(&mut self, cid: u64, group: &str) -> CpiResult<()> {
        let id = self.bump_tx();
        let sim = self.sim(cid)?;
        sim.queued = Some(Transaction {
            id,
            group: Some(group.to_string()),
            status: Some("PENDING".to_string()),
            created_at: None,
        });
        sim.observed = false;
        Ok(())
    }

    fn by_ip(&self, ip: IpAddr, private: bool) -> CpiResult<Instance> {
        self.instances
            .values()
            .map(|s| &s.instance)
            .find(|i| {
                if private {
                    i.primary_backend_ip == Some(ip)
                } else {
                    i.primary_ip == Some(ip)
                }
            })
            .cloned()
            .ok_or_else(|| CpiError::not_found(format!("no instance with ip {}", ip)))
    }
}

fn complete_tx(id: u64, group: &str) -> Transaction {
    Transaction {
        id,
        group: Some(group.to_string()),
        status: Some(TX_STATUS_COMPLETE.to_string()),
        created_at: None,
    }
}

fn baseline_devices() -> Vec<BlockDevice> {
    (0..BASELINE_BLOCK_DEVICES)
        .map(|i| BlockDevice {
            id: i as u64 + 1,
            device: i.to_string(),
            capacity_gb: Some(25),
        })
        .collect()
}

#[async_trait]
impl ComputeProvider for MockCompute {
    async fn create_instance(&self, template: &inventory::InstanceTemplate) -> CpiResult<Instance> {
        let mut st = self.enter(
            ComputeCall::CreateInstance {
                hostname: template.hostname.clone(),
            },
            "create_instance",
        )?;
        let cid = st.next_cid;
        st.next_cid += 1;
        let octet = (cid % 250) as u8 + 1;
        let tx = st.bump_tx();
        let instance = Instance {
            cid,
            hostname: template.hostname.clone(),
            domain: template.domain.clone(),
            start_cpus: template.start_cpus,
            max_memory_mb: template.max_memory_mb,
            primary_ip: Some(IpAddr::V4(Ipv4Addr::new(169, 50, 0, octet))),
            primary_backend_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet))),
            power_state: Some(PowerState::Running),
            private_vlan: template.private_vlan_id,
            public_vlan: template.public_vlan_id,
            last_transaction: Some(complete_tx(tx, TX_GROUP_SERVICE_SETUP)),
            block_devices: baseline_devices(),
            ..Default::default()
        };
        // The order receipt carries identity and shape only. Addresses,
        // VLANs and power state appear once the instance is fetched.
        let receipt = Instance {
            cid,
            hostname: instance.hostname.clone(),
            domain: instance.domain.clone(),
            start_cpus: instance.start_cpus,
            max_memory_mb: instance.max_memory_mb,
            ..Default::default()
        };
        st.instances.insert(
            cid,
            SimInstance {
                instance,
                queued: None,
                observed: false,
                unpingable_polls: 0,
            },
        );
        Ok(receipt)
    }

    async fn get_instance(&self, cid: u64) -> CpiResult<Instance> {
        let mut st = self.enter(ComputeCall::GetInstance(cid), "get_instance")?;
        Ok(st.sim(cid)?.instance.clone())
    }

    async fn get_active_transactions(&self, cid: u64) -> CpiResult<Vec<Transaction>> {
        let mut st = self.enter(
            ComputeCall::GetActiveTransactions(cid),
            "get_active_transactions",
        )?;
        let attach_adds_device = st.attach_adds_device;
        let sim = st.sim(cid)?;
        let Some(tx) = sim.queued.clone() else {
            return Ok(vec![]);
        };
        if !sim.observed {
            sim.observed = true;
            return Ok(vec![tx]);
        }
        // Second poll after the order: it has finished.
        sim.queued = None;
        if tx.in_group(TX_GROUP_INSTANCE_UPGRADE) && attach_adds_device {
            let next = sim.instance.block_devices.len() as u64 + 1;
            sim.instance.block_devices.push(BlockDevice {
                id: next,
                device: (next - 1).to_string(),
                capacity_gb: None,
            });
        }
        let group = tx.group.clone().unwrap_or_default();
        sim.instance.last_transaction = Some(complete_tx(tx.id, &group));
        Ok(vec![])
    }

    async fn get_last_transaction(&self, cid: u64) -> CpiResult<Option<Transaction>> {
        let mut st = self.enter(ComputeCall::GetLastTransaction(cid), "get_last_transaction")?;
        Ok(st.sim(cid)?.instance.last_transaction.clone())
    }

    async fn get_power_state(&self, cid: u64) -> CpiResult<PowerState> {
        let mut st = self.enter(ComputeCall::GetPowerState(cid), "get_power_state")?;
        Ok(st
            .sim(cid)?
            .instance
            .power_state
            .clone()
            .unwrap_or(PowerState::Halted))
    }

    async fn is_pingable(&self, cid: u64) -> CpiResult<bool> {
        let mut st = self.enter(ComputeCall::IsPingable(cid), "is_pingable")?;
        let sim = st.sim(cid)?;
        if sim.unpingable_polls > 0 {
            sim.unpingable_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn attach_ephemeral_disk(&self, cid: u64, size_gb: u64) -> CpiResult<u64> {
        let mut st = self.enter(
            ComputeCall::AttachEphemeralDisk { cid, size_gb },
            "attach_ephemeral_disk",
        )?;
        let order_id = st.attach_order_id.unwrap_or(cid + 500_000);
        if order_id == 0 {
            return Ok(0);
        }
        st.enqueue(cid, TX_GROUP_INSTANCE_UPGRADE)?;
        if let Some(err) = st.attach_error.clone() {
            return Err(err);
        }
        Ok(order_id)
    }

    async fn get_block_devices(&self, cid: u64) -> CpiResult<Vec<BlockDevice>> {
        let mut st = self.enter(ComputeCall::GetBlockDevices(cid), "get_block_devices")?;
        Ok(st.sim(cid)?.instance.block_devices.clone())
    }

    async fn get_instance_by_private_ip(&self, ip: IpAddr) -> CpiResult<Instance> {
        let st = self.enter(
            ComputeCall::GetInstanceByPrivateIp(ip),
            "get_instance_by_private_ip",
        )?;
        st.by_ip(ip, true)
    }

    async fn get_instance_by_public_ip(&self, ip: IpAddr) -> CpiResult<Instance> {
        let st = self.enter(
            ComputeCall::GetInstanceByPublicIp(ip),
            "get_instance_by_public_ip",
        )?;
        st.by_ip(ip, false)
    }

    async fn os_reload(&self, cid: u64, stemcell: &StemcellRef) -> CpiResult<()> {
        let mut st = self.enter(
            ComputeCall::OsReload {
                cid,
                stemcell_id: stemcell.id,
            },
            "os_reload",
        )?;
        st.enqueue(cid, TX_GROUP_SERVICE_SETUP)?;
        let sim = st.sim(cid)?;
        sim.instance.last_transaction = None;
        sim.instance.block_devices = baseline_devices();
        Ok(())
    }

    async fn push_agent_settings(&self, cid: u64, settings: &AgentSettings) -> CpiResult<()> {
        let mut st = self.enter(ComputeCall::PushAgentSettings(cid), "push_agent_settings")?;
        st.sim(cid)?;
        st.settings.insert(cid, settings.clone());
        Ok(())
    }

    async fn set_credential(&self, cid: u64, _credential: &Credential) -> CpiResult<()> {
        let mut st = self.enter(ComputeCall::SetCredential(cid), "set_credential")?;
        st.sim(cid)?;
        Ok(())
    }

    async fn reboot_instance(&self, cid: u64) -> CpiResult<()> {
        let mut st = self.enter(ComputeCall::RebootInstance(cid), "reboot_instance")?;
        st.sim(cid)?.unpingable_polls = 1;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Pool registry
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Find(VmFilter),
    Add(PoolEntry),
    UpdateState {
        cid: u64,
        expected: Option<VmState>,
        next: VmState,
    },
    Get(u64),
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<PoolEntry>,
    calls: Vec<RegistryCall>,
    failures: HashMap<&'static str, CpiError>,
    update_failures: HashMap<(u64, VmState), CpiError>,
}

#[derive(Default)]
pub struct MockPoolRegistry {
    state: Mutex<RegistryState>,
}

impl MockPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<PoolEntry>) -> Self {
        let registry = Self::new();
        lock(&registry.state).entries = entries;
        registry
    }

    pub fn fail(&self, op: &'static str, err: CpiError) {
        lock(&self.state).failures.insert(op, err);
    }

    /// Fail only the transition of `cid` into `next`.
    pub fn fail_update(&self, cid: u64, next: VmState, err: CpiError) {
        lock(&self.state).update_failures.insert((cid, next), err);
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        lock(&self.state).calls.clone()
    }

    pub fn entries(&self) -> Vec<PoolEntry> {
        lock(&self.state).entries.clone()
    }

    pub fn entry(&self, cid: u64) -> Option<PoolEntry> {
        lock(&self.state).entries.iter().find(|e| e.cid == cid).cloned()
    }

    /// Change an entry behind the caller's back (simulates a concurrent writer).
    pub fn force_state(&self, cid: u64, state: VmState) {
        if let Some(e) = lock(&self.state).entries.iter_mut().find(|e| e.cid == cid) {
            e.state = state;
        }
    }

    fn enter(&self, call: RegistryCall, op: &'static str) -> CpiResult<MutexGuard<'_, RegistryState>> {
        let mut st = lock(&self.state);
        st.calls.push(call);
        if let Some(err) = st.failures.get(op) {
            return Err(err.clone());
        }
        Ok(st)
    }
}

#[async_trait]
impl PoolRegistry for MockPoolRegistry {
    async fn find_by_filter(&self, filter: &VmFilter) -> CpiResult<Vec<PoolEntry>> {
        let st = self.enter(RegistryCall::Find(filter.clone()), "find_by_filter")?;
        Ok(st.entries.iter().filter(|e| filter.matches(e)).cloned().collect())
    }

    async fn add_entry(&self, entry: &PoolEntry) -> CpiResult<()> {
        let mut st = self.enter(RegistryCall::Add(entry.clone()), "add_entry")?;
        if st.entries.iter().any(|e| e.cid == entry.cid) {
            return Err(CpiError::cloud(format!("pool entry {} already exists", entry.cid)));
        }
        st.entries.push(entry.clone());
        Ok(())
    }

    async fn update_state(
        &self,
        cid: u64,
        expected: Option<VmState>,
        next: VmState,
    ) -> CpiResult<()> {
        let mut st = self.enter(
            RegistryCall::UpdateState {
                cid,
                expected,
                next,
            },
            "update_state",
        )?;
        if let Some(err) = st.update_failures.get(&(cid, next)) {
            return Err(err.clone());
        }
        let entry = st
            .entries
            .iter_mut()
            .find(|e| e.cid == cid)
            .ok_or_else(|| CpiError::not_found(format!("pool entry {} not found", cid)))?;
        if let Some(expected) = expected {
            if entry.state != expected {
                return Err(CpiError::new(
                    ErrorKind::PoolConflict,
                    format!(
                        "pool entry {} is {}, expected {}",
                        cid,
                        entry.state.as_str(),
                        expected.as_str()
                    ),
                ));
            }
        }
        entry.state = next;
        Ok(())
    }

    async fn get_entry(&self, cid: u64) -> CpiResult<Option<PoolEntry>> {
        let st = self.enter(RegistryCall::Get(cid), "get_entry")?;
        Ok(st.entries.iter().find(|e| e.cid == cid).cloned())
    }
}
