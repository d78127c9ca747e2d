//! Typed flow-table and group entries, rendered in `ovs-ofctl` dump style.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use pkg_constants::flow::{
    CT_ZONE, ENDPOINT_IP_REG, ENDPOINT_PORT_REG, GROUP_ID_REG, SELECTION_STATE_MASK,
    SELECTION_STATE_SHIFT,
};
use pkg_types::service::{Protocol, ServiceKey, ServicePortName};

use crate::registers::GroupId;

pub type TableId = u8;

/// Match predicate of a flow. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowMatch {
    pub protocol: Option<Protocol>,
    pub reg3: Option<u32>,
    /// `(value, mask)` on `REG4`.
    pub reg4: Option<(u32, u32)>,
    pub reg5: Option<u32>,
    pub nw_src: Option<Ipv4Addr>,
    pub nw_dst: Option<Ipv4Addr>,
    pub tp_dst: Option<u16>,
}

impl FlowMatch {
    /// Match only packets in the given endpoint selection state.
    pub fn with_state(mut self, state: u32) -> Self {
        let (value, mask) = self.reg4.unwrap_or((0, 0));
        self.reg4 = Some((
            (value & !SELECTION_STATE_MASK) | (state << SELECTION_STATE_SHIFT),
            mask | SELECTION_STATE_MASK,
        ));
        self
    }

    /// Does a packet with the given header fields and registers satisfy this match?
    pub fn matches(&self, fields: &MatchFields) -> bool {
        if let Some(proto) = self.protocol
            && proto != fields.protocol
        {
            return false;
        }
        if self.reg3.is_some_and(|v| v != fields.regs[ENDPOINT_IP_REG as usize]) {
            return false;
        }
        if let Some((value, mask)) = self.reg4
            && fields.regs[ENDPOINT_PORT_REG as usize] & mask != value & mask
        {
            return false;
        }
        if self.reg5.is_some_and(|v| v != fields.regs[GROUP_ID_REG as usize]) {
            return false;
        }
        if self.nw_src.is_some_and(|ip| ip != fields.nw_src) {
            return false;
        }
        if self.nw_dst.is_some_and(|ip| ip != fields.nw_dst) {
            return false;
        }
        if self.tp_dst.is_some_and(|port| port != fields.tp_dst) {
            return false;
        }
        true
    }
}

/// Header fields and registers a match is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchFields {
    pub protocol: Protocol,
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub tp_dst: u16,
    pub regs: [u32; 8],
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Some(proto) => write!(f, "{}", proto)?,
            None => write!(f, "ip")?,
        }
        if let Some(v) = self.reg3 {
            write!(f, ",reg{}={:#x}", ENDPOINT_IP_REG, v)?;
        }
        if let Some((v, mask)) = self.reg4 {
            if mask == u32::MAX {
                write!(f, ",reg{}={:#x}", ENDPOINT_PORT_REG, v)?;
            } else {
                write!(f, ",reg{}={:#x}/{:#x}", ENDPOINT_PORT_REG, v, mask)?;
            }
        }
        if let Some(v) = self.reg5 {
            write!(f, ",reg{}={:#x}", GROUP_ID_REG, v)?;
        }
        if let Some(ip) = self.nw_src {
            write!(f, ",nw_src={}", ip)?;
        }
        if let Some(ip) = self.nw_dst {
            write!(f, ",nw_dst={}", ip)?;
        }
        if let Some(port) = self.tp_dst {
            write!(f, ",tp_dst={}", port)?;
        }
        Ok(())
    }
}

/// Which bits of a register a load writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegField {
    Full,
    /// Inclusive bit range `[lo..hi]`.
    Bits(u8, u8),
}

impl RegField {
    fn mask(&self) -> u32 {
        match *self {
            RegField::Full => u32::MAX,
            RegField::Bits(lo, hi) => {
                let width = u32::from(hi - lo) + 1;
                let ones = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
                ones << lo
            }
        }
    }

    fn shift(&self) -> u32 {
        match *self {
            RegField::Full => 0,
            RegField::Bits(lo, _) => u32::from(lo),
        }
    }

    /// Write `value` into this field of `reg`.
    pub fn apply(&self, reg: u32, value: u32) -> u32 {
        let mask = self.mask();
        (reg & !mask) | ((value << self.shift()) & mask)
    }
}

/// Template of the affinity learn action.
///
/// Executing it binds the packet's client address to the endpoint in the
/// registers for `idle_timeout` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LearnSpec {
    pub table: TableId,
    pub idle_timeout: u32,
    pub priority: u16,
    pub protocol: Protocol,
    pub owner: ServicePortName,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Load { reg: u8, field: RegField, value: u32 },
    Resubmit(TableId),
    Group(GroupId),
    Learn(LearnSpec),
    /// Commit the connection and DNAT it to the endpoint.
    CtNat { dst: SocketAddrV4 },
    /// Rewrite the source address (hairpin SNAT).
    SetSrc(Ipv4Addr),
    Drop,
    Reject,
}

impl Action {
    pub fn load(reg: u8, field: RegField, value: u32) -> Self {
        Action::Load { reg, field, value }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Load { reg, field, value } => match field {
                RegField::Full => write!(f, "load:{:#x}->NXM_NX_REG{}[]", value, reg),
                RegField::Bits(lo, hi) => {
                    write!(f, "load:{:#x}->NXM_NX_REG{}[{}..{}]", value, reg, lo, hi)
                }
            },
            Action::Resubmit(table) => write!(f, "resubmit(,{})", table),
            Action::Group(id) => write!(f, "group:{}", id),
            Action::Learn(spec) => {
                let proto_dst = match spec.protocol {
                    Protocol::Tcp => "NXM_OF_TCP_DST[]",
                    Protocol::Udp => "NXM_OF_UDP_DST[]",
                    Protocol::Sctp => "OXM_OF_SCTP_DST[]",
                };
                write!(
                    f,
                    "learn(table={},idle_timeout={},priority={},delete_learned,eth_type=0x800,nw_proto={},\
                     {},NXM_OF_IP_DST[],NXM_OF_IP_SRC[],\
                     load:NXM_NX_REG{ip}[]->NXM_NX_REG{ip}[],\
                     load:NXM_NX_REG{port}[0..15]->NXM_NX_REG{port}[0..15],\
                     load:0x2->NXM_NX_REG{port}[16..18],\
                     load:NXM_NX_REG{grp}[]->NXM_NX_REG{grp}[])",
                    spec.table,
                    spec.idle_timeout,
                    spec.priority,
                    spec.protocol.number(),
                    proto_dst,
                    ip = ENDPOINT_IP_REG,
                    port = ENDPOINT_PORT_REG,
                    grp = GROUP_ID_REG,
                )
            }
            Action::CtNat { dst } => write!(f, "ct(commit,zone={},nat(dst={}))", CT_ZONE, dst),
            Action::SetSrc(ip) => write!(f, "set_field:{}->nw_src", ip),
            Action::Drop => write!(f, "drop"),
            Action::Reject => write!(f, "controller(reason=no_match,userdata=reject)"),
        }
    }
}

/// Object an installed entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowOwner {
    /// Static pipeline flows installed once at startup.
    Pipeline,
    Service(ServiceKey),
}

/// Identity of a flow within the forwarding table: what `RemoveFlow` takes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub table: TableId,
    pub priority: u16,
    pub matcher: FlowMatch,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={}, priority={},{}", self.table, self.priority, self.matcher)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowEntry {
    pub table: TableId,
    pub priority: u16,
    pub matcher: FlowMatch,
    pub actions: Vec<Action>,
    pub owner: FlowOwner,
}

impl FlowEntry {
    pub fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            matcher: self.matcher.clone(),
        }
    }

    pub fn is_learn(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Learn(_)))
    }
}

impl fmt::Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} actions=", self.key())?;
        write_actions(f, &self.actions)
    }
}

fn write_actions(f: &mut fmt::Formatter<'_>, actions: &[Action]) -> fmt::Result {
    for (i, action) in actions.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", action)?;
    }
    Ok(())
}

/// One weighted choice of a select group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub id: u32,
    pub weight: u16,
    pub actions: Vec<Action>,
}

/// Select group: one bucket per ready endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group {
    pub id: GroupId,
    pub buckets: Vec<Bucket>,
    pub owner: FlowOwner,
}

impl Group {
    pub fn total_weight(&self) -> u64 {
        self.buckets.iter().map(|b| u64::from(b.weight)).sum()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group_id={},type=select", self.id)?;
        for bucket in &self.buckets {
            write!(
                f,
                ",bucket=bucket_id:{},weight:{},actions=",
                bucket.id, bucket.weight
            )?;
            write_actions(f, &bucket.actions)?;
        }
        Ok(())
    }
}
