//! Packet evaluator over the installed tables.
//!
//! Walks a packet through the pipeline the way the switch would: highest
//! priority match per table, register loads, resubmits, select groups and
//! the conntrack NAT at the end. Used by the status endpoint to trace a
//! packet and by the tests to observe forwarding behaviour.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pkg_constants::flow::{
    CONNTRACK_STATE_TABLE, ENDPOINT_IP_REG, ENDPOINT_PORT_REG, GROUP_ID_REG, MAX_RESUBMIT_DEPTH,
    SESSION_AFFINITY_TABLE, STATE_SELECTED,
};
use pkg_types::service::Protocol;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::affinity::{AffinityKey, AffinityStore};
use crate::error::Result;
use crate::executor::FlowExecutor;
use crate::registers::{EndpointRegisters, GroupId};
use crate::table::{Action, FlowEntry, Group, MatchFields, TableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Packet {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Packet {
    pub fn tcp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src,
            src_port,
            dst,
            dst_port,
            protocol: Protocol::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    /// Leaves the pipeline with the (possibly rewritten) addresses.
    Forward {
        src: SocketAddrV4,
        dst: SocketAddrV4,
    },
    Drop,
    Reject,
    /// No Service handled the packet; it continues unmodified.
    NoMatch,
}

pub struct Datapath {
    executor: Arc<dyn FlowExecutor>,
    affinity: Arc<AffinityStore>,
}

/// Per-packet evaluation state.
struct Walk<'a> {
    packet: Packet,
    now: Instant,
    flows: BTreeMap<TableId, Vec<&'a FlowEntry>>,
    groups: BTreeMap<GroupId, &'a Group>,
    fields: MatchFields,
    dnat: Option<SocketAddrV4>,
    snat: Option<Ipv4Addr>,
    done: Option<Verdict>,
}

impl Datapath {
    pub fn new(executor: Arc<dyn FlowExecutor>, affinity: Arc<AffinityStore>) -> Self {
        Self { executor, affinity }
    }

    pub async fn process(&self, packet: Packet) -> Result<Verdict> {
        self.process_at(packet, Instant::now()).await
    }

    /// Evaluate `packet` as if it arrived at `now`.
    pub async fn process_at(&self, packet: Packet, now: Instant) -> Result<Verdict> {
        let flows = self.executor.dump_flows(None).await?;
        let groups = self.executor.dump_groups().await?;

        let mut by_table: BTreeMap<TableId, Vec<&FlowEntry>> = BTreeMap::new();
        for flow in &flows {
            by_table.entry(flow.table).or_default().push(flow);
        }
        for table in by_table.values_mut() {
            // Stable sort keeps key order among equal priorities.
            table.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        let mut walk = Walk {
            packet,
            now,
            flows: by_table,
            groups: groups.iter().map(|g| (g.id, g)).collect(),
            fields: MatchFields {
                protocol: packet.protocol,
                nw_src: packet.src,
                nw_dst: packet.dst,
                tp_dst: packet.dst_port,
                regs: [0; 8],
            },
            dnat: None,
            snat: None,
            done: None,
        };
        self.table(&mut walk, CONNTRACK_STATE_TABLE, 0);

        let verdict = walk.done.unwrap_or(Verdict::NoMatch);
        trace!("{:?} -> {:?}", packet, verdict);
        Ok(verdict)
    }

    fn table(&self, walk: &mut Walk<'_>, table: TableId, depth: usize) {
        if depth > MAX_RESUBMIT_DEPTH {
            warn!("Resubmit depth exceeded at table {}, dropping", table);
            walk.done = Some(Verdict::Drop);
            return;
        }

        if table == SESSION_AFFINITY_TABLE && self.affinity_hit(walk) {
            return;
        }

        let flow = walk
            .flows
            .get(&table)
            .and_then(|flows| flows.iter().find(|f| f.matcher.matches(&walk.fields)))
            .copied();
        if let Some(flow) = flow {
            self.actions(walk, &flow.actions, depth);
        }
    }

    fn affinity_hit(&self, walk: &mut Walk<'_>) -> bool {
        let key = affinity_key(&walk.packet);
        let Some(endpoint) = self.affinity.lookup(&key, walk.now) else {
            return false;
        };
        walk.fields.regs[ENDPOINT_IP_REG as usize] = endpoint.ip;
        walk.fields.regs[ENDPOINT_PORT_REG as usize] = endpoint.port_reg(STATE_SELECTED);
        walk.fields.regs[GROUP_ID_REG as usize] = endpoint.group;
        true
    }

    fn actions(&self, walk: &mut Walk<'_>, actions: &[Action], depth: usize) {
        for action in actions {
            if walk.done.is_some() {
                return;
            }
            match action {
                Action::Load { reg, field, value } => {
                    let slot = &mut walk.fields.regs[*reg as usize];
                    *slot = field.apply(*slot, *value);
                }
                Action::Resubmit(table) => self.table(walk, *table, depth + 1),
                Action::Group(id) => {
                    let Some(group) = walk.groups.get(id).copied() else {
                        warn!("Dispatch to missing group {}, dropping", id);
                        walk.done = Some(Verdict::Drop);
                        return;
                    };
                    if let Some(bucket) = select_bucket(group, &walk.packet) {
                        self.actions(walk, &bucket.actions, depth + 1);
                    } else {
                        walk.done = Some(Verdict::Drop);
                    }
                }
                Action::Learn(spec) => {
                    let regs = &walk.fields.regs;
                    let endpoint = EndpointRegisters::from_raw(
                        regs[ENDPOINT_IP_REG as usize],
                        regs[ENDPOINT_PORT_REG as usize],
                        regs[GROUP_ID_REG as usize],
                    );
                    self.affinity.learn(
                        affinity_key(&walk.packet),
                        spec.owner.clone(),
                        endpoint,
                        Duration::from_secs(u64::from(spec.idle_timeout)),
                        walk.now,
                    );
                }
                Action::CtNat { dst } => {
                    walk.dnat = Some(*dst);
                    let src = walk.snat.unwrap_or(walk.packet.src);
                    walk.done = Some(Verdict::Forward {
                        src: SocketAddrV4::new(src, walk.packet.src_port),
                        dst: *dst,
                    });
                }
                Action::SetSrc(ip) => walk.snat = Some(*ip),
                Action::Drop => walk.done = Some(Verdict::Drop),
                Action::Reject => walk.done = Some(Verdict::Reject),
            }
        }
    }
}

fn affinity_key(packet: &Packet) -> AffinityKey {
    AffinityKey {
        client: packet.src,
        vip: packet.dst,
        port: packet.dst_port,
        protocol: packet.protocol,
    }
}

/// Weighted pick keyed on the 5-tuple, so a flow always lands on the same bucket.
fn select_bucket<'g>(group: &'g Group, packet: &Packet) -> Option<&'g crate::table::Bucket> {
    let total = group.total_weight();
    if total == 0 {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    packet.hash(&mut hasher);
    let mut point = hasher.finish() % total;
    for bucket in &group.buckets {
        let weight = u64::from(bucket.weight);
        if point < weight {
            return Some(bucket);
        }
        point -= weight;
    }
    None
}
