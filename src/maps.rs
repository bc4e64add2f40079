//! Typed views over the pinned CLAT kernel maps.
//!
//! The kernel side pins three hash maps under `/sys/fs/bpf`; their key and
//! value layouts are fixed ABI shared with the tc programs. Records are
//! `#[repr(C)]` with explicit padding so the userspace structs are
//! byte-compatible with what the programs read and write.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Forwarding entries for uplink-ingress IPv6 packets, keyed by receiving
/// interface and translated destination.
pub const INGRESS6_MAP_PATH: &str = "/sys/fs/bpf/net_shared/map_clatd_clat_ingress6_map";
/// Forwarding entries for TUN-egress IPv4 packets.
pub const EGRESS4_MAP_PATH: &str = "/sys/fs/bpf/net_shared/map_clatd_clat_egress4_map";
/// Socket-cookie accounting tags, shared with the traffic accounting plane.
pub const COOKIE_TAG_MAP_PATH: &str = "/sys/fs/bpf/netd_shared/map_netd_cookie_tag_map";

/// Egress classifier for the TUN, which is always a raw-IP device.
pub const PROG_EGRESS4_RAWIP_PATH: &str =
    "/sys/fs/bpf/net_shared/prog_clatd_schedcls_egress4_clat_rawip";
/// Ingress classifiers for the uplink, one per L2 framing.
pub const PROG_INGRESS6_ETHER_PATH: &str =
    "/sys/fs/bpf/net_shared/prog_clatd_schedcls_ingress6_clat_ether";
pub const PROG_INGRESS6_RAWIP_PATH: &str =
    "/sys/fs/bpf/net_shared/prog_clatd_schedcls_ingress6_clat_rawip";

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClatIngress6Key {
    pub iif: u32,
    pub pfx96: [u8; 16],
    pub local6: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClatIngress6Value {
    pub oif: u32,
    pub local4: [u8; 4],
    pub packets: u64,
    pub bytes: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClatEgress4Key {
    pub iif: u32,
    pub local4: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClatEgress4Value {
    pub oif: u32,
    pub local6: [u8; 16],
    pub pfx96: [u8; 16],
    pub oif_is_ethernet: u16,
    pub _pad: [u8; 2],
    pub packets: u64,
    pub bytes: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CookieTagKey {
    pub cookie: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CookieTagValue {
    pub uid: u32,
    pub tag: u32,
}

impl ClatIngress6Key {
    pub fn new(iif: u32, pfx96: Ipv6Addr, local6: Ipv6Addr) -> Self {
        Self {
            iif,
            pfx96: pfx96.octets(),
            local6: local6.octets(),
        }
    }
}

impl ClatIngress6Value {
    pub fn new(oif: u32, local4: Ipv4Addr) -> Self {
        Self {
            oif,
            local4: local4.octets(),
            packets: 0,
            bytes: 0,
        }
    }
}

impl ClatEgress4Key {
    pub fn new(iif: u32, local4: Ipv4Addr) -> Self {
        Self {
            iif,
            local4: local4.octets(),
        }
    }
}

impl ClatEgress4Value {
    pub fn new(oif: u32, local6: Ipv6Addr, pfx96: Ipv6Addr, oif_is_ethernet: bool) -> Self {
        Self {
            oif,
            local6: local6.octets(),
            pfx96: pfx96.octets(),
            oif_is_ethernet: oif_is_ethernet.into(),
            _pad: [0; 2],
            packets: 0,
            bytes: 0,
        }
    }
}

/// A handle to one of the pinned CLAT hash maps.
///
/// Inserts never overwrite: the kernel programs update the packet and byte
/// counters in place, so replacing a live entry would zero them.
pub trait ClatMap<K: bytemuck::Pod, V: bytemuck::Pod> {
    /// Inserts an entry, failing if the key is already present.
    fn insert_new(&mut self, key: K, value: V) -> Result<()>;
    /// Removes an entry, failing if the key is absent.
    fn remove(&mut self, key: &K) -> Result<()>;
    /// Snapshot of all entries.
    fn entries(&self) -> Result<Vec<(K, V)>>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.entries()?.is_empty())
    }
}

/// Writes one `base64(key),base64(value)` line per entry, for regression
/// tooling that diffs raw plane state.
pub fn dump_raw<K, V>(map: &dyn ClatMap<K, V>, w: &mut dyn io::Write) -> io::Result<()>
where
    K: bytemuck::Pod,
    V: bytemuck::Pod,
{
    for (key, value) in map.entries().map_err(io::Error::other)? {
        writeln!(
            w,
            "{},{}",
            BASE64.encode(bytemuck::bytes_of(&key)),
            BASE64.encode(bytemuck::bytes_of(&value))
        )?;
    }

    Ok(())
}

#[cfg(target_os = "linux")]
mod pinned {
    use anyhow::{Context as _, Result};
    use aya::maps::{HashMap, Map, MapData};

    use super::*;

    unsafe impl aya::Pod for ClatIngress6Key {}
    unsafe impl aya::Pod for ClatIngress6Value {}
    unsafe impl aya::Pod for ClatEgress4Key {}
    unsafe impl aya::Pod for ClatEgress4Value {}
    unsafe impl aya::Pod for CookieTagKey {}
    unsafe impl aya::Pod for CookieTagValue {}

    // `BPF_NOEXIST`: fail the update if the key already exists.
    const NO_EXIST: u64 = 1;

    /// A typed handle over a hash map pinned under `/sys/fs/bpf`.
    pub struct PinnedMap<K, V> {
        inner: HashMap<MapData, K, V>,
        path: &'static str,
    }

    impl<K, V> PinnedMap<K, V>
    where
        K: aya::Pod,
        V: aya::Pod,
    {
        pub fn open(path: &'static str) -> Result<Self> {
            let data = MapData::from_pin(path)
                .with_context(|| format!("Failed to open pinned map at {path}"))?;
            let inner = HashMap::try_from(Map::HashMap(data))
                .with_context(|| format!("Pinned object at {path} is not a compatible hash map"))?;

            Ok(Self { inner, path })
        }
    }

    impl<K, V> ClatMap<K, V> for PinnedMap<K, V>
    where
        K: aya::Pod + bytemuck::Pod,
        V: aya::Pod + bytemuck::Pod,
    {
        fn insert_new(&mut self, key: K, value: V) -> Result<()> {
            self.inner
                .insert(key, value, NO_EXIST)
                .with_context(|| format!("Failed to insert into {}", self.path))
        }

        fn remove(&mut self, key: &K) -> Result<()> {
            self.inner
                .remove(key)
                .with_context(|| format!("Failed to delete from {}", self.path))
        }

        fn entries(&self) -> Result<Vec<(K, V)>> {
            self.inner
                .iter()
                .map(|entry| {
                    entry.with_context(|| format!("Failed to iterate {}", self.path))
                })
                .collect()
        }
    }
}

#[cfg(target_os = "linux")]
pub use pinned::PinnedMap;
