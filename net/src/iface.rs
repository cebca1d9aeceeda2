//! Per-interface configuration and the link-driver boundary.
//!
//! Every interface slot carries the IPv4 parameters the protocol
//! layers consult (`ip_local`, `ip_mask`, `ip_gateway`, `ip_dns`) plus
//! the local MAC for ARP and DHCP. Configuration is supplied at
//! initialisation or committed by the DHCP client; nothing persists.
//!
//! # Driver boundary
//!
//! Outbound frames leave through a [`LinkSender`] registered per
//! interface. The core hands the driver the finished layer-3 frame,
//! the ethertype, and the next-hop IPv4 address; MAC-level concerns
//! (Ethernet framing, ARP lookup of the next hop) belong to the
//! driver. A driver that resolves synchronously should consult
//! [`crate::arp::lookup`] and queue the frame on a miss rather than
//! calling back into the stack from inside `transmit`.

use spin::Mutex;

use crate::config::MAX_INTERFACES;
use crate::types::{EtherType, IfaceId, Ipv4Addr, MacAddr, NetError};

// =============================================================================
// IfaceConfig
// =============================================================================

/// IPv4 parameters of one interface.
#[derive(Clone, Copy)]
pub struct IfaceConfig {
    pub ip_local: Ipv4Addr,
    pub ip_mask: Ipv4Addr,
    pub ip_gateway: Ipv4Addr,
    pub ip_dns: Ipv4Addr,
    pub mac_local: MacAddr,
}

impl IfaceConfig {
    const fn unconfigured() -> Self {
        Self {
            ip_local: Ipv4Addr::UNSPECIFIED,
            ip_mask: Ipv4Addr::UNSPECIFIED,
            ip_gateway: Ipv4Addr::UNSPECIFIED,
            ip_dns: Ipv4Addr::UNSPECIFIED,
            mac_local: MacAddr::ZERO,
        }
    }
}

static IFACES: Mutex<[IfaceConfig; MAX_INTERFACES]> =
    Mutex::new([const { IfaceConfig::unconfigured() }; MAX_INTERFACES]);

/// Assign the IPv4 parameters of an interface (static configuration
/// or a committed DHCP lease).
pub fn configure(iface: IfaceId, ip: Ipv4Addr, mask: Ipv4Addr, gateway: Ipv4Addr) {
    let mut ifaces = IFACES.lock();
    let cfg = &mut ifaces[iface.index()];
    cfg.ip_local = ip;
    cfg.ip_mask = mask;
    cfg.ip_gateway = gateway;
    log::debug!("iface: dev {} -> {} mask {} gw {}", iface, ip, mask, gateway);
}

pub fn set_dns(iface: IfaceId, dns: Ipv4Addr) {
    IFACES.lock()[iface.index()].ip_dns = dns;
}

pub fn set_netmask(iface: IfaceId, mask: Ipv4Addr) {
    IFACES.lock()[iface.index()].ip_mask = mask;
}

pub fn set_gateway(iface: IfaceId, gateway: Ipv4Addr) {
    IFACES.lock()[iface.index()].ip_gateway = gateway;
}

pub fn set_mac(iface: IfaceId, mac: MacAddr) {
    IFACES.lock()[iface.index()].mac_local = mac;
}

pub fn config(iface: IfaceId) -> IfaceConfig {
    IFACES.lock()[iface.index()]
}

pub fn ip_local(iface: IfaceId) -> Ipv4Addr {
    IFACES.lock()[iface.index()].ip_local
}

pub fn set_ip_local(iface: IfaceId, ip: Ipv4Addr) {
    IFACES.lock()[iface.index()].ip_local = ip;
}

pub fn netmask(iface: IfaceId) -> Ipv4Addr {
    IFACES.lock()[iface.index()].ip_mask
}

pub fn gateway(iface: IfaceId) -> Ipv4Addr {
    IFACES.lock()[iface.index()].ip_gateway
}

pub fn dns_server(iface: IfaceId) -> Ipv4Addr {
    IFACES.lock()[iface.index()].ip_dns
}

pub fn mac_local(iface: IfaceId) -> MacAddr {
    IFACES.lock()[iface.index()].mac_local
}

/// Wipe every interface back to the unconfigured state. For tests.
pub fn reset_all() {
    let mut ifaces = IFACES.lock();
    for cfg in ifaces.iter_mut() {
        *cfg = IfaceConfig::unconfigured();
    }
}

/// Next-hop selection: broadcast and on-subnet destinations go
/// straight out; everything else goes to the gateway when one is
/// configured.
pub fn next_hop(iface: IfaceId, dst: Ipv4Addr) -> Ipv4Addr {
    let cfg = IFACES.lock()[iface.index()];
    if dst.is_broadcast()
        || cfg.ip_gateway.is_unspecified()
        || Ipv4Addr::in_subnet(dst, cfg.ip_local, cfg.ip_mask)
    {
        dst
    } else {
        cfg.ip_gateway
    }
}

// =============================================================================
// Link drivers
// =============================================================================

/// Outbound half of a link driver.
pub trait LinkSender: Send {
    /// Hand a finished frame to the link.
    ///
    /// `frame` starts at the layer carried by `ethertype` (the IP or
    /// ARP header); the driver adds its own link framing. `next_hop`
    /// is the IPv4 address the link layer must deliver to.
    fn transmit(
        &self,
        next_hop: Ipv4Addr,
        ethertype: EtherType,
        frame: &[u8],
    ) -> Result<(), NetError>;
}

static DRIVERS: Mutex<[Option<Box<dyn LinkSender>>; MAX_INTERFACES]> =
    Mutex::new([const { None }; MAX_INTERFACES]);

/// Register (or replace) the driver behind an interface.
pub fn register_driver(iface: IfaceId, driver: Box<dyn LinkSender>) {
    DRIVERS.lock()[iface.index()] = Some(driver);
}

/// Drop the driver behind an interface. For tests.
pub fn unregister_driver(iface: IfaceId) {
    DRIVERS.lock()[iface.index()] = None;
}

/// Forward a frame to the interface's driver.
pub(crate) fn transmit(
    iface: IfaceId,
    next_hop: Ipv4Addr,
    ethertype: EtherType,
    frame: &[u8],
) -> Result<(), NetError> {
    let drivers = DRIVERS.lock();
    match &drivers[iface.index()] {
        Some(driver) => driver.transmit(next_hop, ethertype, frame),
        None => {
            log::debug!("iface: no driver on dev {}, dropping tx", iface);
            Err(NetError::NetworkUnreachable)
        }
    }
}
