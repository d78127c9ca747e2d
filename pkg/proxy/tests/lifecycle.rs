use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use pkg_metrics::{
    DEGRADED_SERVICES, EXECUTOR_RETRIES, MetricsRegistry, ORPHAN_ENDPOINTS_DROPPED,
};
use pkg_proxy::datapath::{Packet, Verdict};
use pkg_proxy::executor::{BridgeCall, Fault, MemoryBridge};
use pkg_proxy::reconciler::Phase;
use pkg_proxy::retry::RetryConfig;
use pkg_proxy::{ProxyConfig, ServiceProxy};
use pkg_types::config::NoEndpointsPolicy;
use pkg_types::endpoint::{Endpoint, EndpointAddress, EndpointPort};
use pkg_types::service::{
    Protocol, Service, ServiceKey, ServicePort, ServiceSpec, ServiceType, SessionAffinity,
    SessionAffinityConfig,
};
use pkg_types::watch::{Object, ObjectEvent, ObjectKind};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 5);
const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn make_service(name: &str, cluster_ip: &str, affinity_timeout: Option<u32>) -> Service {
    Service {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        spec: ServiceSpec {
            selector: HashMap::new(),
            ports: vec![ServicePort {
                name: "http".to_string(),
                port: 80,
                target_port: 80,
                protocol: Protocol::Tcp,
                node_port: None,
            }],
            service_type: ServiceType::ClusterIP,
            session_affinity: if affinity_timeout.is_some() {
                SessionAffinity::ClientIP
            } else {
                SessionAffinity::None
            },
            session_affinity_config: affinity_timeout
                .map(|timeout_seconds| SessionAffinityConfig { timeout_seconds }),
        },
        cluster_ip: Some(cluster_ip.to_string()),
        created_at: Utc::now(),
    }
}

fn make_endpoint(name: &str, addresses: &[(&str, u16)]) -> Endpoint {
    Endpoint {
        id: format!("{}-ep", name),
        service_id: format!("{}-id", name),
        service_name: name.to_string(),
        namespace: "default".to_string(),
        addresses: addresses
            .iter()
            .map(|(ip, weight)| EndpointAddress {
                ip: ip.to_string(),
                node_id: None,
                pod_id: None,
                ready: true,
                weight: *weight,
            })
            .collect(),
        ports: vec![EndpointPort {
            name: "http".to_string(),
            port: 80,
            protocol: Protocol::Tcp,
        }],
        created_at: Utc::now(),
    }
}

fn web() -> ServiceKey {
    ServiceKey::new("default", "web")
}

fn fast_config() -> ProxyConfig {
    ProxyConfig {
        executor_timeout: Duration::from_millis(50),
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        },
        resync_interval: Duration::from_millis(50),
        pending_endpoints_ttl: Duration::from_millis(100),
        ..ProxyConfig::default()
    }
}

async fn start_proxy(config: ProxyConfig) -> (Arc<MemoryBridge>, ServiceProxy) {
    let bridge = Arc::new(MemoryBridge::new());
    let proxy = ServiceProxy::new(
        bridge.clone(),
        config,
        Arc::new(MetricsRegistry::for_proxy()),
    );
    proxy.start().await.unwrap();
    (bridge, proxy)
}

async fn apply(proxy: &ServiceProxy, events: Vec<ObjectEvent>) {
    for event in events {
        proxy.handle(event);
    }
    proxy.settle().await;
}

fn add_service(svc: Service) -> ObjectEvent {
    ObjectEvent::add(Object::Service(svc))
}

fn update_endpoints(ep: Endpoint) -> ObjectEvent {
    ObjectEvent::update(Object::Endpoint(ep))
}

fn tcp(src: Ipv4Addr, src_port: u16) -> Packet {
    Packet::tcp(src, src_port, VIP, 80)
}

fn forwarded_to(verdict: Verdict) -> Option<Ipv4Addr> {
    match verdict {
        Verdict::Forward { dst, .. } => Some(*dst.ip()),
        _ => None,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_single_endpoint_install_and_teardown() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;

    let lb = proxy.dump_flows(Some(41)).await.unwrap();
    assert!(lb.contains(
        &"table=41, priority=200,tcp,reg4=0x10000/0x70000,nw_dst=10.0.0.1,tp_dst=80 actions=group:1"
            .to_string()
    ));
    assert_eq!(proxy.dump_groups().await.unwrap(), vec![
        "group_id=1,type=select,bucket=bucket_id:0,weight:100,actions=load:0xa000002->NXM_NX_REG3[],\
         load:0x50->NXM_NX_REG4[0..15],load:0x2->NXM_NX_REG4[16..18],load:0x1->NXM_NX_REG5[],resubmit(,42)"
            .to_string()
    ]);
    let nat = proxy.dump_flows(Some(42)).await.unwrap();
    assert_eq!(nat.len(), 2);
    assert!(nat.iter().all(|l| l.contains("nat(dst=10.0.0.2:80)")));

    let verdict = proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(verdict, Verdict::Forward {
        src: SocketAddrV4::new(CLIENT, 40000),
        dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
    });
    let status = proxy.status(&web()).unwrap();
    assert_eq!(status.phase, Phase::Installed);
    assert_eq!(status.ready_endpoints, 1);

    // Last endpoint gone: no NAT rule, no group, traffic goes nowhere.
    apply(&proxy, vec![update_endpoints(make_endpoint("web", &[]))]).await;
    assert!(proxy.dump_flows(Some(42)).await.unwrap().is_empty());
    assert!(proxy.dump_groups().await.unwrap().is_empty());
    let verdict = proxy.datapath().process(tcp(CLIENT, 40001)).await.unwrap();
    assert_eq!(verdict, Verdict::Drop);
}

#[tokio::test]
async fn test_delete_restores_pre_install_state() {
    let (bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    let before_flows = bridge.dump_flows_text(None).await;

    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", Some(300))),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100), ("10.0.0.3", 100)])),
    ])
    .await;
    proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(proxy.affinity().len(), 1);

    apply(&proxy, vec![
        ObjectEvent::delete(ObjectKind::Service, web()),
        ObjectEvent::delete(ObjectKind::Endpoint, web()),
    ])
    .await;

    assert_eq!(bridge.dump_flows_text(None).await, before_flows);
    assert!(bridge.dump_groups_text().await.is_empty());
    assert!(proxy.affinity().is_empty());
    assert!(
        proxy
            .status(&web())
            .is_none_or(|s| s.phase == Phase::Absent)
    );
    let verdict = proxy.datapath().process(tcp(CLIENT, 40001)).await.unwrap();
    assert_eq!(verdict, Verdict::NoMatch);
}

#[tokio::test]
async fn test_removing_one_endpoint_touches_only_its_entries() {
    let (bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint(
            "web",
            &[("10.0.0.2", 100), ("10.0.0.3", 100), ("10.0.0.4", 100)],
        )),
    ])
    .await;
    let dispatch_before = proxy.dump_flows(Some(41)).await.unwrap();
    bridge.clear_calls();

    apply(&proxy, vec![update_endpoints(make_endpoint(
        "web",
        &[("10.0.0.2", 100), ("10.0.0.3", 100)],
    ))])
    .await;

    let calls = bridge.calls();
    assert_eq!(calls.first(), Some(&BridgeCall::InstallGroup(1)));
    assert_eq!(calls.len(), 3);
    for call in &calls[1..] {
        match call {
            BridgeCall::RemoveFlow(key) => {
                assert_eq!(key.table, 42);
                assert_eq!(key.matcher.reg3, Some(0x0a00_0004));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    assert_eq!(proxy.dump_flows(Some(41)).await.unwrap(), dispatch_before);
    let nat = proxy.dump_flows(Some(42)).await.unwrap();
    assert_eq!(nat.len(), 4);
    assert!(!nat.iter().any(|l| l.contains("10.0.0.4")));
    let groups = proxy.dump_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].matches("bucket=").count(), 2);
}

#[tokio::test]
async fn test_duplicate_events_issue_no_calls() {
    let (bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    let svc = make_service("web", "10.0.0.1", None);
    let ep = make_endpoint("web", &[("10.0.0.2", 100)]);
    apply(&proxy, vec![add_service(svc.clone()), update_endpoints(ep.clone())]).await;
    let flows = bridge.dump_flows_text(None).await;
    bridge.clear_calls();

    apply(&proxy, vec![add_service(svc), update_endpoints(ep)]).await;

    assert!(bridge.calls().is_empty());
    assert_eq!(bridge.dump_flows_text(None).await, flows);
}

#[tokio::test]
async fn test_affinity_sticks_until_ttl_expires() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", Some(300))),
        update_endpoints(make_endpoint(
            "web",
            &[("10.0.0.2", 100), ("10.0.0.3", 100), ("10.0.0.4", 100)],
        )),
    ])
    .await;
    let datapath = proxy.datapath();
    let t0 = Instant::now();

    let first = forwarded_to(datapath.process_at(tcp(CLIENT, 40000), t0).await.unwrap()).unwrap();
    for (i, port) in (40001..40040).enumerate() {
        let at = t0 + Duration::from_secs(i as u64);
        let chosen = forwarded_to(datapath.process_at(tcp(CLIENT, port), at).await.unwrap());
        assert_eq!(chosen, Some(first));
    }
    let learned = proxy.dump_flows(Some(40)).await.unwrap();
    assert!(
        learned
            .iter()
            .any(|l| l.contains("nw_src=10.0.1.5,nw_dst=10.0.0.1,tp_dst=80"))
    );

    // Other clients are spread over the endpoints by the group.
    let mut spread = HashSet::new();
    for i in 0..40u8 {
        let packet = tcp(Ipv4Addr::new(10, 0, 2, i), 40000);
        if let Some(ip) = forwarded_to(datapath.process_at(packet, t0).await.unwrap()) {
            spread.insert(ip);
        }
    }
    assert!(spread.len() > 1);

    // Idle past the timeout: the binding is gone and selection starts over.
    let later = t0 + Duration::from_secs(38 + 301);
    let chosen = forwarded_to(datapath.process_at(tcp(CLIENT, 50000), later).await.unwrap());
    assert!(chosen.is_some());
    let bindings = proxy.affinity().bindings();
    assert_eq!(bindings.len(), 41);
    let (_, binding) = bindings.iter().find(|(k, _)| k.client == CLIENT).unwrap();
    assert_eq!(binding.last_seen, later);
}

#[tokio::test]
async fn test_removed_endpoint_loses_its_clients() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    let all = [("10.0.0.2", 100), ("10.0.0.3", 100), ("10.0.0.4", 100)];
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", Some(300))),
        update_endpoints(make_endpoint("web", &all)),
    ])
    .await;
    let datapath = proxy.datapath();
    let sticky = forwarded_to(datapath.process(tcp(CLIENT, 40000)).await.unwrap()).unwrap();

    let remaining: Vec<(&str, u16)> = all
        .iter()
        .copied()
        .filter(|(ip, _)| *ip != sticky.to_string())
        .collect();
    apply(&proxy, vec![update_endpoints(make_endpoint("web", &remaining))]).await;

    assert!(proxy.affinity().is_empty());
    for port in 40001..40020 {
        let chosen = forwarded_to(datapath.process(tcp(CLIENT, port)).await.unwrap()).unwrap();
        assert_ne!(chosen, sticky);
    }
}

#[tokio::test]
async fn test_disabling_affinity_drops_bindings() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", Some(300))),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100), ("10.0.0.3", 100)])),
    ])
    .await;
    proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(proxy.affinity().len(), 1);

    apply(&proxy, vec![ObjectEvent::update(Object::Service(make_service(
        "web", "10.0.0.1", None,
    )))])
    .await;
    assert!(proxy.affinity().is_empty());
    let lb = proxy.dump_flows(Some(41)).await.unwrap();
    assert!(!lb.iter().any(|l| l.contains("learn(")));
}

#[tokio::test]
async fn test_binding_learned_during_group_retry_is_dropped() {
    let config = ProxyConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 1.0,
        },
        ..ProxyConfig::default()
    };
    let (bridge, proxy) = start_proxy(config).await;
    let removed = Ipv4Addr::new(10, 0, 0, 3);
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", Some(300))),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100), ("10.0.0.3", 100)])),
    ])
    .await;

    // The group rewrite fails once and waits out its backoff.
    bridge.inject(Fault::Reject("busy".to_string()));
    proxy.handle(update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(proxy.status(&web()).map(|s| s.phase), Some(Phase::Pending));

    // Meanwhile the old group still sends new clients to the removed endpoint.
    let datapath = proxy.datapath();
    let mut stuck = None;
    for i in 1..=100u8 {
        let client = Ipv4Addr::new(10, 0, 3, i);
        if forwarded_to(datapath.process(tcp(client, 40000)).await.unwrap()) == Some(removed) {
            stuck = Some(client);
            break;
        }
    }
    let client = stuck.expect("no client was sent to 10.0.0.3");

    proxy.settle().await;
    assert_eq!(proxy.status(&web()).unwrap().phase, Phase::Installed);
    assert!(
        proxy
            .affinity()
            .bindings()
            .iter()
            .all(|(_, binding)| binding.endpoint.ipv4() != removed)
    );
    let verdict = datapath.process(tcp(client, 40001)).await.unwrap();
    assert_eq!(forwarded_to(verdict), Some(Ipv4Addr::new(10, 0, 0, 2)));
}

#[tokio::test]
async fn test_service_delete_discards_its_endpoints() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;

    apply(&proxy, vec![ObjectEvent::delete(ObjectKind::Service, web())]).await;
    assert!(
        proxy
            .status(&web())
            .is_none_or(|s| !s.buffered_endpoints && s.last_error.is_none())
    );

    // Re-created before any pending-endpoints TTL: the old endpoints stay gone.
    apply(&proxy, vec![add_service(make_service("web", "10.0.0.1", None))]).await;
    assert!(proxy.dump_groups().await.unwrap().is_empty());
    let verdict = proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(verdict, Verdict::Drop);
}

#[tokio::test]
async fn test_hairpin_rewrites_source() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;
    let backend = Ipv4Addr::new(10, 0, 0, 2);
    let verdict = proxy.datapath().process(tcp(backend, 5555)).await.unwrap();
    assert_eq!(verdict, Verdict::Forward {
        src: SocketAddrV4::new(VIP, 5555),
        dst: SocketAddrV4::new(backend, 80),
    });

    let hairpin = Ipv4Addr::new(169, 254, 169, 252);
    let (_bridge, proxy) = start_proxy(ProxyConfig {
        hairpin_address: Some(hairpin),
        ..ProxyConfig::default()
    })
    .await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;
    let verdict = proxy.datapath().process(tcp(backend, 5555)).await.unwrap();
    assert_eq!(verdict, Verdict::Forward {
        src: SocketAddrV4::new(hairpin, 5555),
        dst: SocketAddrV4::new(backend, 80),
    });
    let nat = proxy.dump_flows(Some(42)).await.unwrap();
    assert!(
        nat.iter()
            .any(|l| l.contains("nw_src=10.0.0.2") && l.contains("set_field:169.254.169.252->nw_src"))
    );
}

#[tokio::test]
async fn test_weighted_share_is_proportional() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100), ("10.0.0.3", 300)])),
    ])
    .await;
    let datapath = proxy.datapath();
    let heavy = Ipv4Addr::new(10, 0, 0, 3);

    let mut hits = 0;
    for port in 20000..22000u16 {
        let packet = tcp(CLIENT, port);
        let first = forwarded_to(datapath.process(packet).await.unwrap());
        // Same 5-tuple, same backend.
        assert_eq!(forwarded_to(datapath.process(packet).await.unwrap()), first);
        if first == Some(heavy) {
            hits += 1;
        }
    }
    // Expect roughly 1500 of 2000.
    assert!((1300..=1700).contains(&hits), "heavy endpoint got {}", hits);
}

#[tokio::test]
async fn test_reject_policy_without_endpoints() {
    let (_bridge, proxy) = start_proxy(ProxyConfig {
        no_endpoints_policy: NoEndpointsPolicy::Reject,
        ..ProxyConfig::default()
    })
    .await;
    apply(&proxy, vec![add_service(make_service("web", "10.0.0.1", None))]).await;
    let verdict = proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(verdict, Verdict::Reject);
    assert!(proxy.dump_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hung_call_times_out_and_is_retried() {
    let (bridge, proxy) = start_proxy(fast_config()).await;
    bridge.inject(Fault::Hang);
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;

    let status = proxy.status(&web()).unwrap();
    assert_eq!(status.phase, Phase::Installed);
    assert!(!status.degraded);
    assert!(proxy.metrics().counter_get(EXECUTOR_RETRIES) >= 1);
    assert_eq!(proxy.dump_groups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_degraded_after_exhausted_retries_then_recovers() {
    let (bridge, proxy) = start_proxy(fast_config()).await;
    bridge.set_persistent_fault(Some(Fault::Reject("table full".to_string())));
    apply(&proxy, vec![
        add_service(make_service("web", "10.0.0.1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;

    let status = proxy.status(&web()).unwrap();
    assert!(status.degraded);
    assert_eq!(status.phase, Phase::Pending);
    assert!(status.last_error.unwrap().contains("table full"));
    assert_eq!(proxy.metrics().gauge_get(DEGRADED_SERVICES), 1);

    bridge.set_persistent_fault(None);
    eventually(|| {
        proxy
            .status(&web())
            .is_some_and(|s| s.phase == Phase::Installed && !s.degraded)
    })
    .await;
    assert_eq!(proxy.metrics().gauge_get(DEGRADED_SERVICES), 0);
    assert_eq!(proxy.dump_groups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_during_failing_install_converges_to_absent() {
    let config = ProxyConfig {
        retry: RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        },
        ..fast_config()
    };
    let (bridge, proxy) = start_proxy(config).await;
    let before = bridge.dump_flows_text(None).await;
    bridge.set_persistent_fault(Some(Fault::Reject("busy".to_string())));

    proxy.handle(add_service(make_service("web", "10.0.0.1", None)));
    proxy.handle(update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])));
    tokio::time::sleep(Duration::from_millis(50)).await;

    proxy.handle(ObjectEvent::delete(ObjectKind::Service, web()));
    proxy.handle(ObjectEvent::delete(ObjectKind::Endpoint, web()));
    bridge.set_persistent_fault(None);
    proxy.settle().await;

    assert_eq!(bridge.dump_flows_text(None).await, before);
    assert!(bridge.dump_groups_text().await.is_empty());
    assert!(
        proxy
            .status(&web())
            .is_none_or(|s| s.phase == Phase::Absent && !s.degraded)
    );
}

#[tokio::test]
async fn test_buffered_endpoints_apply_when_service_arrives() {
    let (_bridge, proxy) = start_proxy(fast_config()).await;
    apply(&proxy, vec![update_endpoints(make_endpoint(
        "web",
        &[("10.0.0.2", 100)],
    ))])
    .await;
    let status = proxy.status(&web()).unwrap();
    assert!(status.buffered_endpoints);
    assert_eq!(status.flows, 0);

    apply(&proxy, vec![add_service(make_service("web", "10.0.0.1", None))]).await;
    let status = proxy.status(&web()).unwrap();
    assert!(!status.buffered_endpoints);
    assert_eq!(status.ready_endpoints, 1);
    let verdict = proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(forwarded_to(verdict), Some(Ipv4Addr::new(10, 0, 0, 2)));
}

#[tokio::test]
async fn test_buffered_endpoints_expire() {
    let (_bridge, proxy) = start_proxy(fast_config()).await;
    apply(&proxy, vec![update_endpoints(make_endpoint(
        "web",
        &[("10.0.0.2", 100)],
    ))])
    .await;
    eventually(|| proxy.metrics().counter_get(ORPHAN_ENDPOINTS_DROPPED) == 1).await;

    apply(&proxy, vec![add_service(make_service("web", "10.0.0.1", None))]).await;
    assert!(proxy.dump_groups().await.unwrap().is_empty());
    let verdict = proxy.datapath().process(tcp(CLIENT, 40000)).await.unwrap();
    assert_eq!(verdict, Verdict::Drop);
}

#[tokio::test]
async fn test_services_converge_independently() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    let mut events = Vec::new();
    for i in 0..10u8 {
        let name = format!("svc-{}", i);
        let vip = format!("10.96.0.{}", i + 1);
        let backend = format!("10.244.0.{}", i + 1);
        events.push(add_service(make_service(&name, &vip, None)));
        events.push(update_endpoints(make_endpoint(&name, &[(backend.as_str(), 100)])));
    }
    apply(&proxy, events).await;

    let statuses = proxy.statuses();
    assert_eq!(statuses.len(), 10);
    assert!(statuses.iter().all(|s| s.phase == Phase::Installed));
    let groups = proxy.dump_groups().await.unwrap();
    assert_eq!(groups.len(), 10);

    let verdict = proxy
        .datapath()
        .process(Packet::tcp(CLIENT, 40000, Ipv4Addr::new(10, 96, 0, 7), 80))
        .await
        .unwrap();
    assert_eq!(forwarded_to(verdict), Some(Ipv4Addr::new(10, 244, 0, 7)));
}

#[tokio::test]
async fn test_ipv6_service_is_reported_not_programmed() {
    let (_bridge, proxy) = start_proxy(ProxyConfig::default()).await;
    apply(&proxy, vec![
        add_service(make_service("web", "fd00::1", None)),
        update_endpoints(make_endpoint("web", &[("10.0.0.2", 100)])),
    ])
    .await;
    let status = proxy.status(&web()).unwrap();
    assert_eq!(status.phase, Phase::Pending);
    assert!(
        status
            .last_error
            .unwrap()
            .contains("unsupported address family")
    );
    assert_eq!(proxy.dump_flows(Some(41)).await.unwrap().len(), 1);
}
