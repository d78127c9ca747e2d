//! Endpoint register allocation.
//!
//! A selected endpoint travels between tables as packet metadata:
//! `REG3` holds its IPv4 address, `REG4[0..15]` its port, `REG4[16..18]`
//! the selection state, and `REG5` the group that selected it.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use pkg_constants::flow::{
    ENDPOINT_IP_REG, ENDPOINT_PORT_MASK, ENDPOINT_PORT_REG, GROUP_ID_REG, SELECTION_STATE_MASK,
    SELECTION_STATE_SHIFT,
};

use crate::error::{ProxyError, Result};
use crate::table::{Action, RegField};

/// Group identifier, stable for the lifetime of a Service port.
pub type GroupId = u32;

/// Parse an address that must fit the 32-bit endpoint register.
pub fn parse_ipv4(address: &str) -> Result<Ipv4Addr> {
    match address.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(ip),
        _ => Err(ProxyError::unsupported_address(address)),
    }
}

/// Register encoding of one endpoint within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointRegisters {
    pub ip: u32,
    pub port: u16,
    pub group: GroupId,
}

impl EndpointRegisters {
    /// Encode `(address, port)` for `group`. Same input, same registers.
    pub fn encode(address: &str, port: u16, group: GroupId) -> Result<Self> {
        let ip = parse_ipv4(address)?;
        Ok(Self::from_ipv4(ip, port, group))
    }

    pub fn from_ipv4(ip: Ipv4Addr, port: u16, group: GroupId) -> Self {
        Self {
            ip: u32::from(ip),
            port,
            group,
        }
    }

    /// Rebuild from raw register values.
    pub fn from_raw(reg3: u32, reg4: u32, reg5: u32) -> Self {
        Self {
            ip: reg3,
            port: (reg4 & ENDPOINT_PORT_MASK) as u16,
            group: reg5,
        }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ipv4(), self.port)
    }

    /// Full `REG4` value: port plus selection state.
    pub fn port_reg(&self, state: u32) -> u32 {
        u32::from(self.port) | (state << SELECTION_STATE_SHIFT)
    }

    /// Register loads that hand this endpoint to the next table in `state`.
    pub fn load_actions(&self, state: u32) -> Vec<Action> {
        vec![
            Action::load(ENDPOINT_IP_REG, RegField::Full, self.ip),
            Action::load(ENDPOINT_PORT_REG, RegField::Bits(0, 15), u32::from(self.port)),
            Action::load(ENDPOINT_PORT_REG, RegField::Bits(16, 18), state),
            Action::load(GROUP_ID_REG, RegField::Full, self.group),
        ]
    }
}

/// Extract the selection state from a `REG4` value.
pub fn selection_state(reg4: u32) -> u32 {
    (reg4 & SELECTION_STATE_MASK) >> SELECTION_STATE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::flow::STATE_SELECTED;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_encode_ipv4() {
        let regs = EndpointRegisters::encode("10.0.0.2", 80, 1).unwrap();
        assert_eq!(regs.ip, 0x0a00_0002);
        assert_eq!(regs.port, 80);
        assert_eq!(regs.port_reg(STATE_SELECTED), 0x20050);
        assert_eq!(regs.socket_addr().to_string(), "10.0.0.2:80");
        assert_eq!(selection_state(regs.port_reg(STATE_SELECTED)), STATE_SELECTED);
    }

    #[test]
    fn test_rejects_other_families() {
        assert_eq!(
            EndpointRegisters::encode("fd00::2", 80, 1),
            Err(ProxyError::unsupported_address("fd00::2"))
        );
        assert!(EndpointRegisters::encode("not-an-ip", 80, 1).is_err());
        assert!(EndpointRegisters::encode("", 80, 1).is_err());
    }

    #[test]
    fn test_raw_roundtrip() {
        let regs = EndpointRegisters::encode("192.168.1.7", 8443, 12).unwrap();
        let back = EndpointRegisters::from_raw(regs.ip, regs.port_reg(STATE_SELECTED), regs.group);
        assert_eq!(back, regs);
    }

    #[test]
    fn test_load_actions_render() {
        let regs = EndpointRegisters::encode("10.0.0.2", 80, 1).unwrap();
        let rendered: Vec<String> = regs
            .load_actions(STATE_SELECTED)
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(
            rendered.join(","),
            "load:0xa000002->NXM_NX_REG3[],load:0x50->NXM_NX_REG4[0..15],\
             load:0x2->NXM_NX_REG4[16..18],load:0x1->NXM_NX_REG5[]"
        );
    }

    proptest! {
        #[test]
        fn encoding_is_injective_within_group(
            endpoints in proptest::collection::hash_set((any::<u32>(), any::<u16>()), 1..64),
            group in any::<u32>(),
        ) {
            let encoded: HashSet<EndpointRegisters> = endpoints
                .iter()
                .map(|(ip, port)| EndpointRegisters::from_ipv4(Ipv4Addr::from(*ip), *port, group))
                .collect();
            prop_assert_eq!(encoded.len(), endpoints.len());
        }

        #[test]
        fn encoding_is_stable(ip in any::<u32>(), port in any::<u16>(), group in any::<u32>()) {
            let text = Ipv4Addr::from(ip).to_string();
            let a = EndpointRegisters::encode(&text, port, group).unwrap();
            let b = EndpointRegisters::encode(&text, port, group).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
