//! Stack-wide tunables.
//!
//! Everything here is a compile-time constant sized for a
//! resource-constrained target. Per-protocol timing constants live
//! next to the protocol that uses them.

/// Number of network interfaces the stack can drive.
pub const MAX_INTERFACES: usize = 2;

/// Number of slots in the shared buffer pool.
pub const NUM_BUFFERS: usize = 8;

/// Number of UDP sockets.
pub const MAX_SOCKETS_UDP: usize = 8;

/// Number of TCP sockets.
pub const MAX_SOCKETS_TCP: usize = 4;

/// Number of ARP cache entries.
pub const MAX_CACHE_ARP: usize = 8;

/// TCP maximum segment size, also the advertised window.
pub const MSS: u16 = 512;

/// UDP socket reserved for application use.
pub const SOCKET_APP: usize = 0;

/// UDP socket dedicated to the DHCP client.
pub const SOCKET_DHCP: usize = 1;

/// UDP socket dedicated to the DNS client.
pub const SOCKET_DNS: usize = 2;

/// TCP socket dedicated to the SMTP client.
pub const SOCKET_SMTP: usize = 3;

/// Ephemeral port range shared by TCP and UDP.
pub const MIN_LOCAL_PORT: u16 = 1024;
pub const MAX_LOCAL_PORT: u16 = 32767;
