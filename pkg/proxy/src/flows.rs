//! Flow synthesis: desired table state for a Service snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use pkg_constants::flow::{
    CONNTRACK_STATE_TABLE, ENDPOINT_DNAT_TABLE, PRIORITY_ENDPOINT_NAT, PRIORITY_HAIRPIN_NAT,
    PRIORITY_LEARN, PRIORITY_LEARNED, PRIORITY_MISS, PRIORITY_NORMAL, PRIORITY_SERVICE_EXACT,
    PRIORITY_SERVICE_WILDCARD, SERVICE_LB_TABLE, SESSION_AFFINITY_TABLE, STATE_SELECTED,
    STATE_TO_LEARN, STATE_TO_SELECT,
};
use pkg_types::config::NoEndpointsPolicy;
use pkg_types::endpoint::Endpoint;
use pkg_types::service::{Service, ServiceKey, ServicePortName};
use tracing::warn;

use crate::affinity::{AffinityBinding, AffinityKey};
use crate::error::ProxyError;
use crate::group::{Backend, build_group, ready_backends};
use crate::registers::{EndpointRegisters, GroupId, parse_ipv4};
use crate::table::{Action, FlowEntry, FlowKey, FlowMatch, FlowOwner, Group, LearnSpec, RegField};

/// Knobs that change the shape of synthesized flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisConfig {
    /// Source address written on hairpin traffic. `None` uses the Service VIP.
    pub hairpin_address: Option<Ipv4Addr>,
    pub no_endpoints_policy: NoEndpointsPolicy,
}

/// A set of groups and flows, either desired or installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    pub groups: BTreeMap<GroupId, Group>,
    pub flows: BTreeMap<FlowKey, FlowEntry>,
}

impl TableState {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.flows.is_empty()
    }

    pub fn insert_flow(&mut self, flow: FlowEntry) {
        self.flows.insert(flow.key(), flow);
    }
}

/// Output of synthesizing one Service.
#[derive(Debug, Clone, Default)]
pub struct Synthesized {
    pub desired: TableState,
    /// Ready backends per Service port, for affinity invalidation.
    pub backends: BTreeMap<ServicePortName, BTreeSet<EndpointRegisters>>,
    /// Ports with session affinity enabled.
    pub affinity_ports: BTreeSet<ServicePortName>,
    /// Non-fatal encoding failures (skipped endpoints or the whole Service).
    pub errors: Vec<ProxyError>,
    /// The Service as a whole cannot be programmed.
    pub rejected: bool,
}

/// Load-balanced port names of a Service, one group each.
pub fn service_port_names(service: &Service) -> Vec<ServicePortName> {
    let key = service.key();
    service
        .spec
        .ports
        .iter()
        .map(|p| ServicePortName {
            service: key.clone(),
            port: p.name.clone(),
            protocol: p.protocol,
        })
        .collect()
}

/// Flows every packet walks through regardless of Services.
pub fn pipeline_flows() -> Vec<FlowEntry> {
    vec![
        FlowEntry {
            table: CONNTRACK_STATE_TABLE,
            priority: PRIORITY_NORMAL,
            matcher: FlowMatch::default(),
            actions: vec![
                Action::Resubmit(SESSION_AFFINITY_TABLE),
                Action::Resubmit(SERVICE_LB_TABLE),
            ],
            owner: FlowOwner::Pipeline,
        },
        FlowEntry {
            table: SESSION_AFFINITY_TABLE,
            priority: PRIORITY_MISS,
            matcher: FlowMatch::default(),
            actions: vec![Action::load(
                pkg_constants::flow::ENDPOINT_PORT_REG,
                RegField::Bits(16, 18),
                STATE_TO_SELECT,
            )],
            owner: FlowOwner::Pipeline,
        },
        FlowEntry {
            table: SERVICE_LB_TABLE,
            priority: PRIORITY_MISS,
            matcher: FlowMatch::default().with_state(STATE_SELECTED),
            actions: vec![Action::Resubmit(ENDPOINT_DNAT_TABLE)],
            owner: FlowOwner::Pipeline,
        },
    ]
}

/// Desired table state of one Service given its Endpoint snapshot.
///
/// `group_ids` must hold an id for every port in
/// [`service_port_names`]; ports without one are skipped.
pub fn synthesize(
    service: &Service,
    endpoint: Option<&Endpoint>,
    group_ids: &BTreeMap<ServicePortName, GroupId>,
    config: &SynthesisConfig,
) -> Synthesized {
    let mut out = Synthesized::default();
    let key = service.key();

    let Some(cluster_ip) = service.cluster_ip.as_deref() else {
        return out;
    };
    let vip = match parse_ipv4(cluster_ip) {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Service {} not programmed: {}", key, e);
            out.errors.push(e);
            out.rejected = true;
            return out;
        }
    };
    let affinity_timeout = service.affinity_timeout();
    let hairpin_src = config.hairpin_address.unwrap_or(vip);

    for (port, name) in service.spec.ports.iter().zip(service_port_names(service)) {
        let Some(&group_id) = group_ids.get(&name) else {
            continue;
        };
        let (backends, errors) = ready_backends(port, endpoint, group_id);
        out.errors.extend(errors);

        let target = ServiceTarget {
            vip,
            port: port.port,
            matcher: dispatch_match(vip, port.port, port.protocol),
        };
        let group = build_group(&key, group_id, &backends, affinity_timeout.is_some());

        for backend in &backends {
            for flow in nat_flows(&key, backend, hairpin_src) {
                out.desired.insert_flow(flow);
            }
        }
        if let (Some(timeout), Some(_)) = (affinity_timeout, &group) {
            out.desired
                .insert_flow(learn_flow(&key, &name, &target, port.protocol, timeout));
            out.affinity_ports.insert(name.clone());
        }
        out.desired.insert_flow(dispatch_flow(
            &key,
            &target,
            group.as_ref().map(|g| g.id),
            config.no_endpoints_policy,
        ));
        if let Some(group) = group {
            out.desired.groups.insert(group.id, group);
        }
        out.backends
            .insert(name, backends.iter().map(|b| b.registers).collect());
    }
    out
}

struct ServiceTarget {
    vip: Ipv4Addr,
    port: u16,
    matcher: FlowMatch,
}

fn dispatch_match(vip: Ipv4Addr, port: u16, protocol: pkg_types::service::Protocol) -> FlowMatch {
    FlowMatch {
        protocol: Some(protocol),
        nw_dst: Some(vip),
        tp_dst: (port != 0).then_some(port),
        ..Default::default()
    }
}

fn dispatch_priority(target: &ServiceTarget) -> u16 {
    if target.port == 0 {
        PRIORITY_SERVICE_WILDCARD
    } else {
        PRIORITY_SERVICE_EXACT
    }
}

/// Dispatch rule: Service VIP/port → group, or the no-endpoints policy.
fn dispatch_flow(
    owner: &ServiceKey,
    target: &ServiceTarget,
    group: Option<GroupId>,
    policy: NoEndpointsPolicy,
) -> FlowEntry {
    let action = match (group, policy) {
        (Some(id), _) => Action::Group(id),
        (None, NoEndpointsPolicy::Blackhole) => Action::Drop,
        (None, NoEndpointsPolicy::Reject) => Action::Reject,
    };
    FlowEntry {
        table: SERVICE_LB_TABLE,
        priority: dispatch_priority(target),
        matcher: target.matcher.clone().with_state(STATE_TO_SELECT),
        actions: vec![action],
        owner: FlowOwner::Service(owner.clone()),
    }
}

/// Learn rule: record the group's choice for the client, then DNAT.
fn learn_flow(
    owner: &ServiceKey,
    name: &ServicePortName,
    target: &ServiceTarget,
    protocol: pkg_types::service::Protocol,
    idle_timeout: u32,
) -> FlowEntry {
    FlowEntry {
        table: SERVICE_LB_TABLE,
        priority: PRIORITY_LEARN,
        matcher: target.matcher.clone().with_state(STATE_TO_LEARN),
        actions: vec![
            Action::Learn(LearnSpec {
                table: SESSION_AFFINITY_TABLE,
                idle_timeout,
                priority: PRIORITY_LEARNED,
                protocol,
                owner: name.clone(),
            }),
            Action::load(
                pkg_constants::flow::ENDPOINT_PORT_REG,
                RegField::Bits(16, 18),
                STATE_SELECTED,
            ),
            Action::Resubmit(ENDPOINT_DNAT_TABLE),
        ],
        owner: FlowOwner::Service(owner.clone()),
    }
}

/// DNAT rule for one backend plus its hairpin variant.
fn nat_flows(owner: &ServiceKey, backend: &Backend, hairpin_src: Ipv4Addr) -> [FlowEntry; 2] {
    let regs = backend.registers;
    let matcher = FlowMatch {
        reg3: Some(regs.ip),
        reg4: Some((regs.port_reg(STATE_SELECTED), 0x7ffff)),
        reg5: Some(regs.group),
        ..Default::default()
    };
    let nat = Action::CtNat {
        dst: regs.socket_addr(),
    };
    [
        FlowEntry {
            table: ENDPOINT_DNAT_TABLE,
            priority: PRIORITY_ENDPOINT_NAT,
            matcher: matcher.clone(),
            actions: vec![nat.clone()],
            owner: FlowOwner::Service(owner.clone()),
        },
        FlowEntry {
            table: ENDPOINT_DNAT_TABLE,
            priority: PRIORITY_HAIRPIN_NAT,
            matcher: FlowMatch {
                nw_src: Some(regs.ipv4()),
                ..matcher
            },
            actions: vec![Action::SetSrc(hairpin_src), nat],
            owner: FlowOwner::Service(owner.clone()),
        },
    ]
}

/// Table-40 rendering of a learned affinity binding.
pub fn learned_flow(key: &AffinityKey, binding: &AffinityBinding) -> FlowEntry {
    FlowEntry {
        table: SESSION_AFFINITY_TABLE,
        priority: PRIORITY_LEARNED,
        matcher: FlowMatch {
            protocol: Some(key.protocol),
            nw_src: Some(key.client),
            nw_dst: Some(key.vip),
            tp_dst: Some(key.port),
            ..Default::default()
        },
        actions: binding.endpoint.load_actions(STATE_SELECTED),
        owner: FlowOwner::Service(binding.owner.service.clone()),
    }
}
