//! The OS façade the coordinator drives.
//!
//! Every kernel-visible side effect of bringing translation up or down goes
//! through [`Platform`] (and its interface-configuration companion
//! [`Netd`]), so tests can script each step and inject failures. Everything
//! outside these traits is deterministic pure code.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{BorrowedFd, OwnedFd};

use anyhow::Result;
use ip_network::Ipv6Network;

use crate::maps::{
    ClatEgress4Key, ClatEgress4Value, ClatIngress6Key, ClatIngress6Value, ClatMap, CookieTagKey,
    CookieTagValue,
};

#[cfg(target_os = "linux")]
pub mod linux;

/// `if_nametoindex` result for an interface that does not exist.
pub const INVALID_IFINDEX: u32 = 0;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;

/// Interface attribute changes, performed by the configuration plane.
pub trait Netd {
    fn set_ipv6_enabled(&self, iface: &str, enabled: bool) -> Result<()>;
    fn set_mtu(&self, iface: &str, mtu: u32) -> Result<()>;
    /// Assigns `v4/prefix_len` and brings the interface up.
    fn set_ipv4_up(&self, iface: &str, v4: Ipv4Addr, prefix_len: u8) -> Result<()>;
}

/// OS primitives needed to run one translator instance.
///
/// Descriptor-producing operations return [`OwnedFd`]; dropping the handle
/// closes it on every exit path.
pub trait Platform {
    fn netd(&self) -> &dyn Netd;

    /// Index of a network interface, [`INVALID_IFINDEX`] if it does not exist.
    fn interface_index(&self, iface: &str) -> u32;

    /// Creates a TUN interface. Fails if the name is taken.
    fn create_tun(&self, name: &str) -> Result<OwnedFd>;

    /// First address in `seed/prefix_len` (starting at `seed`) not currently
    /// configured anywhere on the host.
    fn select_ipv4_address(&self, seed: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Addr>;

    /// Picks the translator's IPv6 source: an address on `iface` whose
    /// interface identifier makes translation checksum-neutral with `v4`.
    fn generate_ipv6_address(
        &self,
        iface: &str,
        v4: Ipv4Addr,
        pfx96: Ipv6Network,
        fwmark: u32,
    ) -> Result<Ipv6Addr>;

    /// Path MTU toward `target` as reachable through the NAT64 prefix.
    fn detect_mtu(&self, pfx96: Ipv6Network, target: Ipv4Addr, fwmark: u32) -> Result<u32>;

    /// `AF_PACKET` socket the daemon reads uplink IPv6 frames from.
    fn open_packet_socket(&self) -> Result<OwnedFd>;

    /// Raw IPv6 socket the daemon writes translated frames to, marked with
    /// `fwmark` so its traffic stays on the uplink network.
    fn open_raw_socket6(&self, fwmark: u32) -> Result<OwnedFd>;

    /// Joins `v6` as an anycast address on the uplink, so the kernel accepts
    /// translated traffic addressed to it.
    fn join_anycast(&self, fd: BorrowedFd<'_>, v6: Ipv6Addr, ifindex: u32) -> Result<()>;

    /// Restricts the packet socket to frames destined to `v6` and binds it
    /// to the uplink.
    fn configure_packet_socket(&self, fd: BorrowedFd<'_>, v6: Ipv6Addr, ifindex: u32)
    -> Result<()>;

    /// Spawns the translator daemon. The daemon duplicates the three
    /// descriptors; the caller's copies can be closed after this returns.
    #[allow(clippy::too_many_arguments)]
    fn start_clatd(
        &self,
        tun_fd: BorrowedFd<'_>,
        read_fd: BorrowedFd<'_>,
        write_fd: BorrowedFd<'_>,
        iface: &str,
        pfx96: &Ipv6Network,
        v4: Ipv4Addr,
        v6: Ipv6Addr,
    ) -> Result<i32>;

    fn stop_clatd(&self, pid: i32) -> Result<()>;

    /// Kernel cookie of a socket, the accounting-tag key.
    fn socket_cookie(&self, fd: BorrowedFd<'_>) -> Result<u64>;

    /// Whether `iface` frames carry an Ethernet header (versus raw IP).
    fn is_ethernet(&self, iface: &str) -> Result<bool>;

    /// Ensures a `clsact` qdisc exists on the interface.
    fn qdisc_add_clsact(&self, ifindex: u32) -> Result<()>;

    /// Attaches the pinned classifier at `prog_path` in direct-action mode.
    fn filter_add_bpf(
        &self,
        ifindex: u32,
        ingress: bool,
        prio: u16,
        proto: u16,
        prog_path: &str,
    ) -> Result<()>;

    fn filter_del(&self, ifindex: u32, ingress: bool, prio: u16, proto: u16) -> Result<()>;

    /// Map accessors return `None` when the pinned path is unavailable; the
    /// coordinator then runs without the eBPF fast path.
    fn open_ingress6_map(&self) -> Option<Box<dyn ClatMap<ClatIngress6Key, ClatIngress6Value>>>;
    fn open_egress4_map(&self) -> Option<Box<dyn ClatMap<ClatEgress4Key, ClatEgress4Value>>>;
    fn open_cookie_tag_map(&self) -> Option<Box<dyn ClatMap<CookieTagKey, CookieTagValue>>>;
}

/// Embeds an IPv4 address into the low 32 bits of a /96 NAT64 prefix.
pub fn embed_v4(pfx96: Ipv6Network, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = pfx96.network_address().octets();
    octets[12..16].copy_from_slice(&v4.octets());

    Ipv6Addr::from(octets)
}

/// Scans `seed/prefix_len` upward from `seed` for an address not in `in_use`.
pub fn first_free_v4(seed: Ipv4Addr, prefix_len: u8, in_use: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let span = 1u32 << (32 - u32::from(prefix_len));
    let base = u32::from(seed) & !(span - 1);

    (u32::from(seed)..base + span)
        .map(Ipv4Addr::from)
        .find(|candidate| !in_use.contains(candidate))
}

/// Rewrites the last 16-bit word of `v6` so that translating between `v6`
/// and `v4` under `pfx96` leaves transport checksums unchanged.
///
/// Translation replaces `(v4 src, v4 dst)` with `(v6 src, pfx96|v4 dst)` in
/// the pseudo-header, so the sums cancel exactly when
/// `sum16(v6) + sum16(pfx96) == sum16(v4)` in one's-complement arithmetic.
pub fn make_checksum_neutral(v6: Ipv6Addr, v4: Ipv4Addr, pfx96: Ipv6Addr) -> Ipv6Addr {
    const MOD: u32 = 0xffff;

    let mut octets = v6.octets();
    let head = sum16(&octets[..14]) % MOD;
    let target = (sum16(&v4.octets()) + 2 * MOD - sum16(&pfx96.octets()) % MOD - head) % MOD;

    octets[14..16].copy_from_slice(&(target as u16).to_be_bytes());

    Ipv6Addr::from(octets)
}

/// Plain sum of the big-endian 16-bit words; `% 0xffff` of this equals the
/// folded one's-complement sum.
fn sum16(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum()
}
