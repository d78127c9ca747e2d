//! Flow table layout: table ids, priorities, and packet metadata registers.

/// Connection-state table. New connections are resubmitted to the
/// affinity table and then the service LB table.
pub const CONNTRACK_STATE_TABLE: u8 = 31;

/// Session affinity table (learned client → endpoint bindings).
pub const SESSION_AFFINITY_TABLE: u8 = 40;

/// Service load-balancing table (dispatch + learn rules).
pub const SERVICE_LB_TABLE: u8 = 41;

/// Endpoint DNAT table.
pub const ENDPOINT_DNAT_TABLE: u8 = 42;

/// Priority of pipeline default (miss) flows.
pub const PRIORITY_MISS: u16 = 0;

/// Priority of static pipeline flows.
pub const PRIORITY_NORMAL: u16 = 100;

/// Dispatch rule matching an exact protocol + port.
pub const PRIORITY_SERVICE_EXACT: u16 = 200;

/// Dispatch rule for any-port Services (port 0).
pub const PRIORITY_SERVICE_WILDCARD: u16 = 150;

/// Affinity learn rule in the service LB table.
pub const PRIORITY_LEARN: u16 = 190;

/// Learned affinity binding in the session affinity table.
pub const PRIORITY_LEARNED: u16 = 200;

/// Endpoint DNAT rule.
pub const PRIORITY_ENDPOINT_NAT: u16 = 200;

/// Hairpin variant of the DNAT rule (source == selected endpoint).
pub const PRIORITY_HAIRPIN_NAT: u16 = 210;

/// Register holding the selected endpoint IPv4 address.
pub const ENDPOINT_IP_REG: u8 = 3;

/// Register holding endpoint port (bits 0..15) and selection state (bits 16..18).
pub const ENDPOINT_PORT_REG: u8 = 4;

/// Register holding the owning group id.
pub const GROUP_ID_REG: u8 = 5;

/// Bit offset of the selection state inside `ENDPOINT_PORT_REG`.
pub const SELECTION_STATE_SHIFT: u32 = 16;

/// Mask of the selection state inside `ENDPOINT_PORT_REG`.
pub const SELECTION_STATE_MASK: u32 = 0x7 << SELECTION_STATE_SHIFT;

/// Mask of the endpoint port inside `ENDPOINT_PORT_REG`.
pub const ENDPOINT_PORT_MASK: u32 = 0xffff;

/// Endpoint not yet selected: go through the Service group.
pub const STATE_TO_SELECT: u32 = 0b001;

/// Endpoint selected: registers hold a valid endpoint.
pub const STATE_SELECTED: u32 = 0b010;

/// Endpoint selected by the group, affinity binding still to be learned.
pub const STATE_TO_LEARN: u32 = 0b011;

/// Maximum nested resubmits before the datapath gives up on a packet.
pub const MAX_RESUBMIT_DEPTH: usize = 16;

/// Conntrack zone used for Service DNAT.
pub const CT_ZONE: u16 = 65520;
