// Integration tests for pool allocation (miss, hit, compensation, validation)

mod common;

use std::collections::BTreeMap;

use common::{
    dynamic_network, free_entry, pooled_instance, request, request_with, Harness, PRIVATE_VLAN,
    PUBLIC_VLAN,
};
use vmpool_common::{CpiError, ErrorKind, NetworkDefinition, NetworkType, VmState};
use vmpool_providers::mock::{ComputeCall, MockPoolRegistry, RegistryCall};

fn update(cid: u64, expected: VmState, next: VmState) -> RegistryCall {
    RegistryCall::UpdateState {
        cid,
        expected: Some(expected),
        next,
    }
}

#[tokio::test(start_paused = true)]
async fn test_pool_miss_provisions_once_and_registers_as_using() {
    let h = Harness::new(MockPoolRegistry::new());

    let instance = h.allocator().allocate(&request()).await.unwrap();

    let creates = h
        .compute
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ComputeCall::CreateInstance { .. }))
        .count();
    assert_eq!(creates, 1);

    let calls = h.registry.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], RegistryCall::Find(_)));
    match &calls[1] {
        RegistryCall::Add(entry) => {
            assert_eq!(entry.cid, instance.cid);
            assert_eq!(entry.state, VmState::Using);
            assert_eq!(entry.cpu, 4);
            assert_eq!(entry.memory_mb, 8192);
        }
        other => panic!("expected add, got {:?}", other),
    }
    assert!(!calls
        .iter()
        .any(|c| matches!(c, RegistryCall::UpdateState { .. })));

    let settings = h.compute.pushed_settings(instance.cid).unwrap();
    assert_eq!(settings.agent_id, "agent-e2e");
    assert_eq!(
        h.aliases.get(&instance.fqdn()),
        instance.primary_backend_ip
    );
}

#[tokio::test(start_paused = true)]
async fn test_pool_miss_with_ephemeral_disk() {
    let h = Harness::new(MockPoolRegistry::new());
    let mut req = request();
    req.vm.ephemeral_disk_size_gb = Some(100);

    let instance = h.allocator().allocate(&req).await.unwrap();

    assert!(h.compute.calls().contains(&ComputeCall::AttachEphemeralDisk {
        cid: instance.cid,
        size_gb: 100
    }));
    let settings = h.compute.pushed_settings(instance.cid).unwrap();
    assert!(settings.disks.ephemeral.is_some());
    assert_eq!(h.registry.entries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_miss_registers_addresses_fetched_after_create() {
    let h = Harness::new(MockPoolRegistry::new());

    let instance = h.allocator().allocate(&request()).await.unwrap();

    // The create receipt has no addresses; the workflow must fetch them.
    let calls = h.compute.calls();
    let created = calls
        .iter()
        .position(|c| matches!(c, ComputeCall::CreateInstance { .. }))
        .unwrap();
    assert!(calls[created + 1..].contains(&ComputeCall::GetInstance(instance.cid)));

    let backend_ip = h.compute.instance(instance.cid).unwrap().primary_backend_ip;
    assert!(backend_ip.is_some());
    assert_eq!(instance.primary_backend_ip, backend_ip);
    assert_eq!(h.aliases.get(&instance.fqdn()), backend_ip);

    let entry = h.registry.entry(instance.cid).unwrap();
    assert_eq!(entry.ip, backend_ip);
    assert_eq!(entry.private_vlan, PRIVATE_VLAN);
    assert_eq!(entry.public_vlan, PUBLIC_VLAN);
    assert_eq!(entry.state, VmState::Using);
}

#[tokio::test(start_paused = true)]
async fn test_pool_miss_missing_ephemeral_device_is_not_registered() {
    let h = Harness::new(MockPoolRegistry::new());
    h.compute.set_attach_adds_device(false);
    let mut req = request();
    req.vm.ephemeral_disk_size_gb = Some(100);

    let err = h.allocator().allocate(&req).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(err.to_string().contains("instance 1000 created"));
    assert!(h.compute.pushed_settings(1000).is_none());
    assert!(!h
        .registry
        .calls()
        .iter()
        .any(|c| matches!(c, RegistryCall::Add(_))));
    assert!(h.registry.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pool_miss_create_failure_is_retryable_and_unregistered() {
    let h = Harness::new(MockPoolRegistry::new());
    h.compute
        .fail("create_instance", CpiError::cloud("capacity not available in dal10"));

    let err = h.allocator().allocate(&request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VmCreationFailed);
    assert!(err.can_retry());
    assert!(err.to_string().contains("capacity not available"));
    assert!(err.to_string().contains("completed steps: template rendered"));
    assert_eq!(h.registry.calls().len(), 1);
    assert!(h.registry.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pool_miss_failure_after_create_reports_instance() {
    let h = Harness::new(MockPoolRegistry::new());
    h.compute
        .fail("push_agent_settings", CpiError::cloud("metadata service unavailable"));

    let err = h.allocator().allocate(&request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cloud);
    assert!(!err.can_retry());
    let rendered = err.to_string();
    assert!(rendered.contains("instance 1000 created"));
    assert!(rendered.contains("endpoints resolved"));
    assert!(!rendered.contains("agent configured"));
    assert!(h.registry.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pool_hit_takes_first_entry_and_marks_using() {
    let first = pooled_instance(42);
    let second = pooled_instance(43);
    let h = Harness::new(MockPoolRegistry::with_entries(vec![
        free_entry(&first),
        free_entry(&second),
    ]));
    h.compute.insert_instance(first.clone());
    h.compute.insert_instance(second.clone());

    let instance = h.allocator().allocate(&request()).await.unwrap();

    assert_eq!(instance.cid, 42);
    let calls = h.registry.calls();
    assert!(matches!(calls[0], RegistryCall::Find(_)));
    assert_eq!(
        calls[1..].to_vec(),
        vec![
            update(42, VmState::Free, VmState::Provisioning),
            update(42, VmState::Provisioning, VmState::Using),
        ]
    );
    assert_eq!(h.registry.entry(42).unwrap().state, VmState::Using);
    assert_eq!(h.registry.entry(43).unwrap().state, VmState::Free);

    let compute_calls = h.compute.calls();
    assert_eq!(compute_calls[0], ComputeCall::GetInstance(42));
    assert_eq!(
        compute_calls[1],
        ComputeCall::OsReload {
            cid: 42,
            stemcell_id: 77
        }
    );
    assert!(!compute_calls
        .iter()
        .any(|c| matches!(c, ComputeCall::CreateInstance { .. })));
    assert!(h.compute.pushed_settings(42).is_some());
    assert!(h.compute.pushed_settings(43).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pool_hit_reload_failure_returns_entry_to_free() {
    let vm = pooled_instance(42);
    let h = Harness::new(MockPoolRegistry::with_entries(vec![free_entry(&vm)]));
    h.compute.insert_instance(vm);
    h.compute
        .fail("os_reload", CpiError::cloud("reload rejected: outstanding transaction"));

    let err = h.allocator().allocate(&request()).await.unwrap_err();

    let calls = h.registry.calls();
    assert_eq!(
        calls[1..].to_vec(),
        vec![
            update(42, VmState::Free, VmState::Provisioning),
            update(42, VmState::Provisioning, VmState::Free),
        ]
    );
    assert_eq!(
        h.compute.calls(),
        vec![
            ComputeCall::GetInstance(42),
            ComputeCall::OsReload {
                cid: 42,
                stemcell_id: 77
            },
        ]
    );
    assert!(err.to_string().contains("reload rejected"));
    assert!(err.secondary().is_none());
    assert_eq!(err.kind(), ErrorKind::Cloud);
    assert!(!err.can_retry());
    assert_eq!(h.registry.entry(42).unwrap().state, VmState::Free);
}

#[tokio::test(start_paused = true)]
async fn test_pool_hit_with_ephemeral_disk_attaches_after_reload() {
    let vm = pooled_instance(42);
    let h = Harness::new(MockPoolRegistry::with_entries(vec![free_entry(&vm)]));
    h.compute.insert_instance(vm);
    let mut req = request();
    req.vm.ephemeral_disk_size_gb = Some(50);

    let instance = h.allocator().allocate(&req).await.unwrap();

    assert_eq!(instance.cid, 42);
    let calls = h.compute.calls();
    let reload = calls
        .iter()
        .position(|c| matches!(c, ComputeCall::OsReload { .. }))
        .unwrap();
    let attach = calls
        .iter()
        .position(|c| *c == ComputeCall::AttachEphemeralDisk { cid: 42, size_gb: 50 })
        .unwrap();
    assert!(reload < attach);
    assert!(h.compute.pushed_settings(42).unwrap().disks.ephemeral.is_some());
    assert_eq!(h.registry.entry(42).unwrap().state, VmState::Using);
}

#[tokio::test(start_paused = true)]
async fn test_pool_hit_missing_ephemeral_device_returns_entry_to_free() {
    let vm = pooled_instance(42);
    let h = Harness::new(MockPoolRegistry::with_entries(vec![free_entry(&vm)]));
    h.compute.insert_instance(vm);
    h.compute.set_attach_adds_device(false);
    let mut req = request();
    req.vm.ephemeral_disk_size_gb = Some(50);

    let err = h.allocator().allocate(&req).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(err.secondary().is_none());
    assert_eq!(
        h.registry.calls()[1..].to_vec(),
        vec![
            update(42, VmState::Free, VmState::Provisioning),
            update(42, VmState::Provisioning, VmState::Free),
        ]
    );
    assert_eq!(h.registry.entry(42).unwrap().state, VmState::Free);
    assert!(h.compute.pushed_settings(42).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pool_hit_failed_compensation_surfaces_both_errors() {
    let vm = pooled_instance(42);
    let h = Harness::new(MockPoolRegistry::with_entries(vec![free_entry(&vm)]));
    h.compute.insert_instance(vm);
    h.compute
        .fail("os_reload", CpiError::cloud("reload rejected: outstanding transaction"));
    h.registry
        .fail_update(42, VmState::Free, CpiError::cloud("pool registry unavailable"));

    let err = h.allocator().allocate(&request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PoolInconsistent);
    let rendered = err.to_string();
    assert!(rendered.contains("reload rejected"));
    assert!(rendered.contains("pool registry unavailable"));
    assert!(err
        .secondary()
        .unwrap()
        .to_string()
        .contains("pool registry unavailable"));
    assert_eq!(h.registry.entry(42).unwrap().state, VmState::Provisioning);
}

#[tokio::test(start_paused = true)]
async fn test_pool_hit_lost_claim_is_retryable() {
    let vm = pooled_instance(42);
    let h = Harness::new(MockPoolRegistry::with_entries(vec![free_entry(&vm)]));
    h.compute.insert_instance(vm);
    h.registry.fail_update(
        42,
        VmState::Provisioning,
        CpiError::new(ErrorKind::PoolConflict, "pool entry 42 is provisioning, expected free"),
    );

    let err = h.allocator().allocate(&request()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PoolConflict);
    assert!(err.can_retry());
    assert!(h.compute.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_dynamic_network_makes_no_calls() {
    let h = Harness::new(MockPoolRegistry::new());
    let mut networks = BTreeMap::new();
    networks.insert(
        "private".to_string(),
        NetworkDefinition {
            kind: NetworkType::Manual,
            ip: Some("10.0.0.9".parse().unwrap()),
            ..Default::default()
        },
    );

    let err = h
        .allocator()
        .allocate(&request_with(networks))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(h.registry.calls().is_empty());
    assert!(h.compute.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_vip_network_is_not_supported() {
    let h = Harness::new(MockPoolRegistry::new());
    let mut networks = BTreeMap::new();
    networks.insert("default".to_string(), dynamic_network());
    networks.insert(
        "public".to_string(),
        NetworkDefinition {
            kind: NetworkType::Vip,
            ..Default::default()
        },
    );

    let err = h
        .allocator()
        .allocate(&request_with(networks))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert!(err.to_string().contains("not supported"));
    assert!(h.registry.calls().is_empty());
    assert!(h.compute.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fixed_private_ip_bypasses_pool() {
    let vm = pooled_instance(55);
    let ip = vm.primary_backend_ip.unwrap();
    let h = Harness::new(MockPoolRegistry::with_entries(vec![free_entry(&vm)]));
    h.compute.insert_instance(vm);

    let mut dynamic = dynamic_network();
    dynamic.ip = Some(ip);
    let mut networks = BTreeMap::new();
    networks.insert("default".to_string(), dynamic);

    let instance = h
        .allocator()
        .allocate(&request_with(networks))
        .await
        .unwrap();

    assert_eq!(instance.cid, 55);
    assert!(h.registry.calls().is_empty());
    let calls = h.compute.calls();
    assert_eq!(calls[0], ComputeCall::GetInstanceByPrivateIp(ip));
    assert!(calls.contains(&ComputeCall::OsReload {
        cid: 55,
        stemcell_id: 77
    }));
    let settings = h.compute.pushed_settings(55).unwrap();
    assert_eq!(settings.networks["default"].ip, Some(ip.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_fixed_public_ip_uses_public_lookup() {
    let vm = pooled_instance(56);
    let ip = vm.primary_ip.unwrap();
    let h = Harness::new(MockPoolRegistry::new());
    h.compute.insert_instance(vm);

    let mut dynamic = dynamic_network();
    dynamic.ip = Some(ip);
    let mut networks = BTreeMap::new();
    networks.insert("default".to_string(), dynamic);

    let instance = h
        .allocator()
        .allocate(&request_with(networks))
        .await
        .unwrap();

    assert_eq!(instance.cid, 56);
    assert_eq!(h.compute.calls()[0], ComputeCall::GetInstanceByPublicIp(ip));
}
