//! The translator instance lifecycle.
//!
//! [`Coordinator`] owns at most one running instance. `start` drives the
//! whole bring-up: address selection, sockets, accounting tag, TUN,
//! interface configuration, daemon spawn, then (best-effort) the eBPF fast
//! path. Any failure before the daemon is up unwinds every side effect
//! already committed, so the kernel is back to the idle configuration when
//! the error surfaces. `stop` tears the same state down in reverse.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsFd as _, OwnedFd};

use anyhow::{Context as _, Result, bail};
use ip_network::Ipv6Network;

use crate::maps::{
    self, ClatEgress4Key, ClatEgress4Value, ClatIngress6Key, ClatIngress6Value, ClatMap,
    CookieTagKey, CookieTagValue,
};
use crate::mark::{AID_CLAT, PRIO_CLAT, adjust_mtu, fwmark};
use crate::platform::{ETH_P_IP, ETH_P_IPV6, INVALID_IFINDEX, Platform};

/// Seed of the translator's IPv4 pool (RFC 7335).
pub const INIT_V4ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 4);
pub const INIT_V4ADDR_PREFIX: u8 = 29;

/// The translation TUN is named after its uplink.
pub const CLAT_PREFIX: &str = "v4-";

/// IPv4 host probed (through the NAT64 prefix) to learn the path MTU.
const MTU_PROBE_TARGET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Bindings of a running translator instance.
///
/// Constructed only once every side effect of `start` has committed;
/// `stop` needs nothing but these values to tear everything down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClatdTracker {
    pub iface: String,
    pub ifindex: u32,
    pub v4_iface: String,
    pub v4_ifindex: u32,
    pub v4: Ipv4Addr,
    pub v6: Ipv6Addr,
    pub pfx96: Ipv6Network,
    pub pid: i32,
    pub cookie: u64,
}

impl fmt::Display for ClatdTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} <-> {}/{} {} via {} (pid {}, cookie {})",
            self.v4_iface,
            self.v4_ifindex,
            self.v4,
            self.iface,
            self.ifindex,
            self.v6,
            self.pfx96,
            self.pid,
            self.cookie,
        )
    }
}

/// Brings stateless IPv4-to-IPv6 translation up and down on one uplink.
///
/// Single-owner and synchronous: callers serialize `start`, `stop` and the
/// dump methods on one scheduling context.
pub struct Coordinator<P> {
    platform: P,
    ingress6: Option<Box<dyn ClatMap<ClatIngress6Key, ClatIngress6Value>>>,
    egress4: Option<Box<dyn ClatMap<ClatEgress4Key, ClatEgress4Value>>>,
    cookie_tag: Option<Box<dyn ClatMap<CookieTagKey, CookieTagValue>>>,
    tracker: Option<ClatdTracker>,
}

impl<P: Platform> Coordinator<P> {
    pub fn new(platform: P) -> Self {
        let ingress6 = platform.open_ingress6_map();
        let egress4 = platform.open_egress4_map();
        let cookie_tag = platform.open_cookie_tag_map();

        Self {
            platform,
            ingress6,
            egress4,
            cookie_tag,
            tracker: None,
        }
    }

    /// Starts translation on `iface` and returns the translator's IPv6
    /// source address.
    ///
    /// On error, no side effect survives. A failure to set up the eBPF fast
    /// path alone is not an error: the daemon still translates, only the
    /// in-kernel acceleration is missing.
    pub fn start(&mut self, iface: &str, net_id: u32, nat64_prefix: Ipv6Network) -> Result<Ipv6Addr> {
        if let Some(tracker) = &self.tracker {
            bail!("CLAT is already running on {}", tracker.iface);
        }
        if nat64_prefix.netmask() != 96 {
            bail!("NAT64 prefix must be a /96: {nat64_prefix}");
        }

        let v4 = self
            .platform
            .select_ipv4_address(INIT_V4ADDR, INIT_V4ADDR_PREFIX)
            .context("Failed to pick a translator IPv4 address")?;
        let mark = fwmark(net_id);
        let v6 = self
            .platform
            .generate_ipv6_address(iface, v4, nat64_prefix, mark)
            .context("Failed to pick a translator IPv6 address")?;

        let read_fd = self.platform.open_packet_socket()?;
        let write_fd = self.platform.open_raw_socket6(mark)?;

        let ifindex = self.platform.interface_index(iface);
        if ifindex == INVALID_IFINDEX {
            bail!("No such interface: {iface}");
        }

        self.platform.join_anycast(write_fd.as_fd(), v6, ifindex)?;

        let cookie = self.platform.socket_cookie(write_fd.as_fd())?;
        self.cookie_tag
            .as_mut()
            .context("Socket accounting map unavailable")?
            .insert_new(
                CookieTagKey { cookie },
                CookieTagValue {
                    uid: AID_CLAT,
                    tag: 0,
                },
            )
            .context("Failed to tag the translator write socket")?;

        // The socket is tagged now; every later failure must untag it
        // before surfacing.
        let tracker = match bring_up(
            &self.platform,
            iface,
            ifindex,
            nat64_prefix,
            mark,
            v4,
            v6,
            cookie,
            &read_fd,
            &write_fd,
        ) {
            Ok(tracker) => tracker,
            Err(e) => {
                if let Some(map) = self.cookie_tag.as_mut()
                    && let Err(del) = map.remove(&CookieTagKey { cookie })
                {
                    tracing::warn!("Failed to untag translator socket: {del:#}");
                }

                return Err(e);
            }
        };

        tracing::info!(%tracker, "CLAT started");

        self.maybe_start_bpf(&tracker);
        self.tracker = Some(tracker);

        Ok(v6)
        // `read_fd` and `write_fd` (and the TUN fd inside `bring_up`) close
        // here regardless of outcome; the daemon owns duplicates.
    }

    /// Stops the running instance.
    ///
    /// The coordinator is idle when this returns, even on error: fast-path
    /// teardown is best-effort, and the tracker is cleared up front.
    pub fn stop(&mut self) -> Result<()> {
        let tracker = self.tracker.take().context("CLAT is not running")?;

        self.maybe_stop_bpf(&tracker);

        self.platform.stop_clatd(tracker.pid)?;

        self.cookie_tag
            .as_mut()
            .context("Socket accounting map unavailable")?
            .remove(&CookieTagKey {
                cookie: tracker.cookie,
            })
            .context("Failed to untag the translator write socket")?;

        tracing::info!(iface = %tracker.iface, "CLAT stopped");

        Ok(())
    }

    pub fn tracker(&self) -> Option<&ClatdTracker> {
        self.tracker.as_ref()
    }

    /// Human-readable state: the tracker line plus both forwarding maps.
    pub fn dump(&self, w: &mut dyn io::Write) -> io::Result<()> {
        let Some(tracker) = &self.tracker else {
            return writeln!(w, "<no active CLAT instance>");
        };

        writeln!(w, "{tracker}")?;

        writeln!(w, "BPF ingress map:")?;
        match &self.ingress6 {
            None => writeln!(w, "  <unavailable>")?,
            Some(map) => match map.entries() {
                Err(e) => writeln!(w, "  <error: {e:#}>")?,
                Ok(entries) => {
                    for (key, value) in entries {
                        writeln!(
                            w,
                            "  iif {} {}/96 {} -> oif {} {} ({} pkts, {} bytes)",
                            key.iif,
                            Ipv6Addr::from(key.pfx96),
                            Ipv6Addr::from(key.local6),
                            value.oif,
                            Ipv4Addr::from(value.local4),
                            value.packets,
                            value.bytes,
                        )?;
                    }
                }
            },
        }

        writeln!(w, "BPF egress map:")?;
        match &self.egress4 {
            None => writeln!(w, "  <unavailable>")?,
            Some(map) => match map.entries() {
                Err(e) => writeln!(w, "  <error: {e:#}>")?,
                Ok(entries) => {
                    for (key, value) in entries {
                        writeln!(
                            w,
                            "  iif {} {} -> oif {} {} {}/96 ether {} ({} pkts, {} bytes)",
                            key.iif,
                            Ipv4Addr::from(key.local4),
                            value.oif,
                            Ipv6Addr::from(value.local6),
                            Ipv6Addr::from(value.pfx96),
                            value.oif_is_ethernet,
                            value.packets,
                            value.bytes,
                        )?;
                    }
                }
            },
        }

        Ok(())
    }

    /// Raw plane state, one `base64(key),base64(value)` line per entry.
    pub fn dump_raw_map(&self, w: &mut dyn io::Write, egress4: bool) -> io::Result<()> {
        if egress4 {
            match &self.egress4 {
                Some(map) => maps::dump_raw(map.as_ref(), w),
                None => writeln!(w, "<unavailable>"),
            }
        } else {
            match &self.ingress6 {
                Some(map) => maps::dump_raw(map.as_ref(), w),
                None => writeln!(w, "<unavailable>"),
            }
        }
    }

    /// Installs the eBPF fast path for a freshly started instance.
    ///
    /// Best-effort by contract: a failure here leaves the instance running
    /// on the daemon alone, with every partially-installed piece rolled
    /// back. The clsact qdisc is the exception; its lifetime is tied to the
    /// interface, not to CLAT.
    fn maybe_start_bpf(&mut self, tracker: &ClatdTracker) {
        if self.ingress6.is_none() || self.egress4.is_none() {
            tracing::debug!("Fast-path maps unavailable; translating through the daemon only");
            return;
        }

        let is_ethernet = match self.platform.is_ethernet(&tracker.iface) {
            Ok(is_ethernet) => is_ethernet,
            Err(e) => {
                tracing::warn!("Failed to probe L2 framing of {}: {e:#}", tracker.iface);
                return;
            }
        };

        let pfx96 = tracker.pfx96.network_address();
        let egress_key = ClatEgress4Key::new(tracker.v4_ifindex, tracker.v4);
        let ingress_key = ClatIngress6Key::new(tracker.ifindex, pfx96, tracker.v6);

        {
            let Some(egress4) = self.egress4.as_mut() else {
                return;
            };
            let value = ClatEgress4Value::new(tracker.ifindex, tracker.v6, pfx96, is_ethernet);
            if let Err(e) = egress4.insert_new(egress_key, value) {
                tracing::warn!("Failed to insert egress fast-path entry: {e:#}");
                return;
            }
        }

        {
            let Some(ingress6) = self.ingress6.as_mut() else {
                return;
            };
            let value = ClatIngress6Value::new(tracker.v4_ifindex, tracker.v4);
            if let Err(e) = ingress6.insert_new(ingress_key, value) {
                tracing::warn!("Failed to insert ingress fast-path entry: {e:#}");
                self.delete_egress_entry(&egress_key);
                return;
            }
        }

        if let Err(e) = self.platform.qdisc_add_clsact(tracker.v4_ifindex) {
            tracing::warn!("Failed to add clsact on {}: {e:#}", tracker.v4_iface);
            self.delete_ingress_entry(&ingress_key);
            self.delete_egress_entry(&egress_key);
            return;
        }

        // The TUN is always a raw-IP device.
        if let Err(e) = self.platform.filter_add_bpf(
            tracker.v4_ifindex,
            false,
            PRIO_CLAT,
            ETH_P_IP,
            maps::PROG_EGRESS4_RAWIP_PATH,
        ) {
            tracing::warn!("Failed to attach egress classifier: {e:#}");
            self.delete_ingress_entry(&ingress_key);
            self.delete_egress_entry(&egress_key);
            return;
        }

        let ingress_prog = if is_ethernet {
            maps::PROG_INGRESS6_ETHER_PATH
        } else {
            maps::PROG_INGRESS6_RAWIP_PATH
        };
        if let Err(e) =
            self.platform
                .filter_add_bpf(tracker.ifindex, true, PRIO_CLAT, ETH_P_IPV6, ingress_prog)
        {
            tracing::warn!("Failed to attach ingress classifier: {e:#}");
            if let Err(del) = self
                .platform
                .filter_del(tracker.v4_ifindex, false, PRIO_CLAT, ETH_P_IP)
            {
                tracing::warn!("Failed to detach egress classifier: {del:#}");
            }
            self.delete_ingress_entry(&ingress_key);
            self.delete_egress_entry(&egress_key);
        }
    }

    /// Removes the fast path. Filters first, map entries last: leftover
    /// entries reveal what still needs cleanup if a filter detach failed.
    /// Every step is best-effort.
    fn maybe_stop_bpf(&mut self, tracker: &ClatdTracker) {
        if self.ingress6.is_none() || self.egress4.is_none() {
            return;
        }

        if let Err(e) = self
            .platform
            .filter_del(tracker.ifindex, true, PRIO_CLAT, ETH_P_IPV6)
        {
            tracing::warn!("Failed to detach ingress classifier: {e:#}");
        }
        if let Err(e) = self
            .platform
            .filter_del(tracker.v4_ifindex, false, PRIO_CLAT, ETH_P_IP)
        {
            tracing::warn!("Failed to detach egress classifier: {e:#}");
        }

        self.delete_egress_entry(&ClatEgress4Key::new(tracker.v4_ifindex, tracker.v4));
        self.delete_ingress_entry(&ClatIngress6Key::new(
            tracker.ifindex,
            tracker.pfx96.network_address(),
            tracker.v6,
        ));
    }

    fn delete_egress_entry(&mut self, key: &ClatEgress4Key) {
        if let Some(map) = self.egress4.as_mut()
            && let Err(e) = map.remove(key)
        {
            tracing::warn!("Failed to delete egress fast-path entry: {e:#}");
        }
    }

    fn delete_ingress_entry(&mut self, key: &ClatIngress6Key) {
        if let Some(map) = self.ingress6.as_mut()
            && let Err(e) = map.remove(key)
        {
            tracing::warn!("Failed to delete ingress fast-path entry: {e:#}");
        }
    }
}

/// Steps between tagging the write socket and spawning the daemon. Failures
/// bubble up to `start`, which untags before surfacing them.
#[allow(clippy::too_many_arguments)]
fn bring_up<P: Platform>(
    platform: &P,
    iface: &str,
    ifindex: u32,
    pfx96: Ipv6Network,
    mark: u32,
    v4: Ipv4Addr,
    v6: Ipv6Addr,
    cookie: u64,
    read_fd: &OwnedFd,
    write_fd: &OwnedFd,
) -> Result<ClatdTracker> {
    platform.configure_packet_socket(read_fd.as_fd(), v6, ifindex)?;

    let v4_iface = format!("{CLAT_PREFIX}{iface}");
    let tun_fd = platform
        .create_tun(&v4_iface)
        .with_context(|| format!("Failed to create TUN interface {v4_iface}"))?;

    let v4_ifindex = platform.interface_index(&v4_iface);
    if v4_ifindex == INVALID_IFINDEX {
        bail!("TUN interface {v4_iface} has no index");
    }

    platform.netd().set_ipv6_enabled(&v4_iface, false)?;

    let mtu = adjust_mtu(platform.detect_mtu(pfx96, MTU_PROBE_TARGET, mark)?);
    platform.netd().set_mtu(&v4_iface, mtu)?;
    platform.netd().set_ipv4_up(&v4_iface, v4, 32)?;

    let pid = platform.start_clatd(
        tun_fd.as_fd(),
        read_fd.as_fd(),
        write_fd.as_fd(),
        iface,
        &pfx96,
        v4,
        v6,
    )?;

    Ok(ClatdTracker {
        iface: iface.to_string(),
        ifindex,
        v4_iface,
        v4_ifindex,
        v4,
        v6,
        pfx96,
        pid,
        cookie,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashSet};
    use std::fs::File;
    use std::os::fd::BorrowedFd;
    use std::rc::Rc;

    use crate::platform::Netd;

    const UPLINK: &str = "wlan0";
    const UPLINK_IFINDEX: u32 = 42;
    const TUN_IFINDEX: u32 = 13;
    const NET_ID: u32 = 100;
    const DAEMON_PID: i32 = 4242;
    const COOKIE: u64 = 0xfeed;
    const GENERATED_V6: &str = "2001:db8::a5c4:6b1";

    fn pfx96() -> Ipv6Network {
        "2001:db8::/96".parse().unwrap()
    }

    struct State {
        calls: Vec<String>,
        fail: HashSet<&'static str>,
        uplink_exists: bool,
        tun_created: bool,
        tun_gets_index: bool,
        is_ethernet: bool,
        qdiscs: HashSet<u32>,
        filters: HashSet<(u32, bool, u16, u16)>,
        stopped_pids: Vec<i32>,
    }

    impl Default for State {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                fail: HashSet::new(),
                uplink_exists: true,
                tun_created: false,
                tun_gets_index: true,
                is_ethernet: false,
                qdiscs: HashSet::new(),
                filters: HashSet::new(),
                stopped_pids: Vec::new(),
            }
        }
    }

    impl State {
        fn record(&mut self, call: impl Into<String>, gate: &str) -> Result<()> {
            self.calls.push(call.into());

            if self.fail.contains(gate) {
                bail!("{gate} failed (injected)");
            }

            Ok(())
        }
    }

    type Shared = Rc<RefCell<State>>;
    type Entries<K, V> = Rc<RefCell<BTreeMap<Vec<u8>, (K, V)>>>;

    struct FakeMap<K, V> {
        name: &'static str,
        entries: Entries<K, V>,
        state: Shared,
    }

    impl<K: bytemuck::Pod, V: bytemuck::Pod> ClatMap<K, V> for FakeMap<K, V> {
        fn insert_new(&mut self, key: K, value: V) -> Result<()> {
            let gate = match self.name {
                "ingress6" => "ingress6.insert",
                "egress4" => "egress4.insert",
                _ => "cookie_tag.insert",
            };
            self.state.borrow_mut().record(gate, gate)?;

            let raw = bytemuck::bytes_of(&key).to_vec();
            let mut entries = self.entries.borrow_mut();
            if entries.contains_key(&raw) {
                bail!("{}: key already exists", self.name);
            }
            entries.insert(raw, (key, value));

            Ok(())
        }

        fn remove(&mut self, key: &K) -> Result<()> {
            let gate = match self.name {
                "ingress6" => "ingress6.remove",
                "egress4" => "egress4.remove",
                _ => "cookie_tag.remove",
            };
            self.state.borrow_mut().record(gate, gate)?;

            self.entries
                .borrow_mut()
                .remove(bytemuck::bytes_of(key))
                .map(drop)
                .with_context(|| format!("{}: no such key", self.name))
        }

        fn entries(&self) -> Result<Vec<(K, V)>> {
            Ok(self.entries.borrow().values().copied().collect())
        }
    }

    struct FakePlatform {
        state: Shared,
        ingress6: Entries<ClatIngress6Key, ClatIngress6Value>,
        egress4: Entries<ClatEgress4Key, ClatEgress4Value>,
        cookie_tag: Entries<CookieTagKey, CookieTagValue>,
        provide_ingress6: bool,
        provide_egress4: bool,
        provide_cookie_tag: bool,
    }

    fn dummy_fd() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    impl Netd for FakePlatform {
        fn set_ipv6_enabled(&self, iface: &str, enabled: bool) -> Result<()> {
            self.state.borrow_mut().record(
                format!("netd.set_ipv6_enabled({iface}, {enabled})"),
                "netd.set_ipv6_enabled",
            )
        }

        fn set_mtu(&self, iface: &str, mtu: u32) -> Result<()> {
            self.state
                .borrow_mut()
                .record(format!("netd.set_mtu({iface}, {mtu})"), "netd.set_mtu")
        }

        fn set_ipv4_up(&self, iface: &str, v4: Ipv4Addr, prefix_len: u8) -> Result<()> {
            self.state.borrow_mut().record(
                format!("netd.set_ipv4_up({iface}, {v4}/{prefix_len})"),
                "netd.set_ipv4_up",
            )
        }
    }

    impl Platform for FakePlatform {
        fn netd(&self) -> &dyn Netd {
            self
        }

        fn interface_index(&self, iface: &str) -> u32 {
            let state = self.state.borrow();

            if iface == UPLINK && state.uplink_exists {
                UPLINK_IFINDEX
            } else if iface == "v4-wlan0" && state.tun_created && state.tun_gets_index {
                TUN_IFINDEX
            } else {
                INVALID_IFINDEX
            }
        }

        fn create_tun(&self, name: &str) -> Result<OwnedFd> {
            let mut state = self.state.borrow_mut();
            state.record(format!("create_tun({name})"), "create_tun")?;
            state.tun_created = true;

            Ok(dummy_fd())
        }

        fn select_ipv4_address(&self, seed: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Addr> {
            self.state.borrow_mut().record(
                format!("select_ipv4_address({seed}/{prefix_len})"),
                "select_ipv4_address",
            )?;

            Ok(seed)
        }

        fn generate_ipv6_address(
            &self,
            iface: &str,
            v4: Ipv4Addr,
            pfx96: Ipv6Network,
            fwmark: u32,
        ) -> Result<Ipv6Addr> {
            self.state.borrow_mut().record(
                format!("generate_ipv6_address({iface}, {v4}, {pfx96}, {fwmark:#x})"),
                "generate_ipv6_address",
            )?;

            Ok(GENERATED_V6.parse().unwrap())
        }

        fn detect_mtu(&self, pfx96: Ipv6Network, target: Ipv4Addr, fwmark: u32) -> Result<u32> {
            self.state.borrow_mut().record(
                format!("detect_mtu({pfx96}, {target}, {fwmark:#x})"),
                "detect_mtu",
            )?;

            Ok(1420)
        }

        fn open_packet_socket(&self) -> Result<OwnedFd> {
            self.state
                .borrow_mut()
                .record("open_packet_socket", "open_packet_socket")?;

            Ok(dummy_fd())
        }

        fn open_raw_socket6(&self, fwmark: u32) -> Result<OwnedFd> {
            self.state
                .borrow_mut()
                .record(format!("open_raw_socket6({fwmark:#x})"), "open_raw_socket6")?;

            Ok(dummy_fd())
        }

        fn join_anycast(&self, _fd: BorrowedFd<'_>, v6: Ipv6Addr, ifindex: u32) -> Result<()> {
            self.state
                .borrow_mut()
                .record(format!("join_anycast({v6}, {ifindex})"), "join_anycast")
        }

        fn configure_packet_socket(
            &self,
            _fd: BorrowedFd<'_>,
            v6: Ipv6Addr,
            ifindex: u32,
        ) -> Result<()> {
            self.state.borrow_mut().record(
                format!("configure_packet_socket({v6}, {ifindex})"),
                "configure_packet_socket",
            )
        }

        fn start_clatd(
            &self,
            _tun_fd: BorrowedFd<'_>,
            _read_fd: BorrowedFd<'_>,
            _write_fd: BorrowedFd<'_>,
            iface: &str,
            pfx96: &Ipv6Network,
            v4: Ipv4Addr,
            v6: Ipv6Addr,
        ) -> Result<i32> {
            self.state.borrow_mut().record(
                format!("start_clatd({iface}, {pfx96}, {v4}, {v6})"),
                "start_clatd",
            )?;

            Ok(DAEMON_PID)
        }

        fn stop_clatd(&self, pid: i32) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.record(format!("stop_clatd({pid})"), "stop_clatd")?;
            state.stopped_pids.push(pid);

            Ok(())
        }

        fn socket_cookie(&self, _fd: BorrowedFd<'_>) -> Result<u64> {
            self.state
                .borrow_mut()
                .record("socket_cookie", "socket_cookie")?;

            Ok(COOKIE)
        }

        fn is_ethernet(&self, iface: &str) -> Result<bool> {
            let mut state = self.state.borrow_mut();
            state.record(format!("is_ethernet({iface})"), "is_ethernet")?;

            Ok(state.is_ethernet)
        }

        fn qdisc_add_clsact(&self, ifindex: u32) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.record(format!("qdisc_add_clsact({ifindex})"), "qdisc_add_clsact")?;
            state.qdiscs.insert(ifindex);

            Ok(())
        }

        fn filter_add_bpf(
            &self,
            ifindex: u32,
            ingress: bool,
            prio: u16,
            proto: u16,
            prog_path: &str,
        ) -> Result<()> {
            let gate = if ingress {
                "filter_add_bpf.ingress"
            } else {
                "filter_add_bpf.egress"
            };
            let mut state = self.state.borrow_mut();
            state.record(format!("{gate}({ifindex}, {prog_path})"), gate)?;
            state.filters.insert((ifindex, ingress, prio, proto));

            Ok(())
        }

        fn filter_del(&self, ifindex: u32, ingress: bool, prio: u16, proto: u16) -> Result<()> {
            let gate = if ingress {
                "filter_del.ingress"
            } else {
                "filter_del.egress"
            };
            let mut state = self.state.borrow_mut();
            state.record(format!("{gate}({ifindex})"), gate)?;

            if !state.filters.remove(&(ifindex, ingress, prio, proto)) {
                bail!("no filter on ifindex {ifindex}");
            }

            Ok(())
        }

        fn open_ingress6_map(
            &self,
        ) -> Option<Box<dyn ClatMap<ClatIngress6Key, ClatIngress6Value>>> {
            self.provide_ingress6.then(|| {
                Box::new(FakeMap {
                    name: "ingress6",
                    entries: self.ingress6.clone(),
                    state: self.state.clone(),
                }) as Box<dyn ClatMap<ClatIngress6Key, ClatIngress6Value>>
            })
        }

        fn open_egress4_map(&self) -> Option<Box<dyn ClatMap<ClatEgress4Key, ClatEgress4Value>>> {
            self.provide_egress4.then(|| {
                Box::new(FakeMap {
                    name: "egress4",
                    entries: self.egress4.clone(),
                    state: self.state.clone(),
                }) as Box<dyn ClatMap<ClatEgress4Key, ClatEgress4Value>>
            })
        }

        fn open_cookie_tag_map(&self) -> Option<Box<dyn ClatMap<CookieTagKey, CookieTagValue>>> {
            self.provide_cookie_tag.then(|| {
                Box::new(FakeMap {
                    name: "cookie_tag",
                    entries: self.cookie_tag.clone(),
                    state: self.state.clone(),
                }) as Box<dyn ClatMap<CookieTagKey, CookieTagValue>>
            })
        }
    }

    struct Fixture {
        state: Shared,
        ingress6: Entries<ClatIngress6Key, ClatIngress6Value>,
        egress4: Entries<ClatEgress4Key, ClatEgress4Value>,
        cookie_tag: Entries<CookieTagKey, CookieTagValue>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: Rc::new(RefCell::new(State::default())),
                ingress6: Rc::new(RefCell::new(BTreeMap::new())),
                egress4: Rc::new(RefCell::new(BTreeMap::new())),
                cookie_tag: Rc::new(RefCell::new(BTreeMap::new())),
            }
        }

        fn coordinator(&self) -> Coordinator<FakePlatform> {
            self.coordinator_with_maps(true, true)
        }

        fn coordinator_with_maps(
            &self,
            provide_ingress6: bool,
            provide_egress4: bool,
        ) -> Coordinator<FakePlatform> {
            Coordinator::new(FakePlatform {
                state: self.state.clone(),
                ingress6: self.ingress6.clone(),
                egress4: self.egress4.clone(),
                cookie_tag: self.cookie_tag.clone(),
                provide_ingress6,
                provide_egress4,
                provide_cookie_tag: true,
            })
        }

        fn fail(&self, gate: &'static str) {
            self.state.borrow_mut().fail.insert(gate);
        }

        fn calls(&self) -> Vec<String> {
            self.state.borrow().calls.clone()
        }

        fn called(&self, prefix: &str) -> bool {
            self.state
                .borrow()
                .calls
                .iter()
                .any(|call| call.starts_with(prefix))
        }

        fn assert_idle_and_clean(&self) {
            assert!(self.ingress6.borrow().is_empty());
            assert!(self.egress4.borrow().is_empty());
            assert!(self.cookie_tag.borrow().is_empty());
            assert!(self.state.borrow().filters.is_empty());
        }
    }

    fn position(calls: &[String], prefix: &str) -> usize {
        calls
            .iter()
            .position(|call| call.starts_with(prefix))
            .unwrap_or_else(|| panic!("{prefix} was never called"))
    }

    #[test]
    fn happy_path_commits_every_side_effect() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        let v6 = coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        assert_eq!(v6, GENERATED_V6.parse::<Ipv6Addr>().unwrap());

        let tracker = coordinator.tracker().unwrap();
        assert_eq!(tracker.iface, UPLINK);
        assert_eq!(tracker.ifindex, UPLINK_IFINDEX);
        assert_eq!(tracker.v4_iface, "v4-wlan0");
        assert_eq!(tracker.v4_ifindex, TUN_IFINDEX);
        assert_eq!(tracker.v4, INIT_V4ADDR);
        assert_eq!(tracker.v6, v6);
        assert_eq!(tracker.pfx96, pfx96());
        assert_eq!(tracker.pid, DAEMON_PID);
        assert_eq!(tracker.cookie, COOKIE);

        let cookie_entries = fixture.cookie_tag.borrow();
        assert_eq!(cookie_entries.len(), 1);
        let (key, value) = cookie_entries.values().next().unwrap();
        assert_eq!(key.cookie, COOKIE);
        assert_eq!(value.uid, AID_CLAT);
        assert_eq!(value.tag, 0);
        drop(cookie_entries);

        let egress_entries = fixture.egress4.borrow();
        let (key, value) = egress_entries.values().next().unwrap();
        assert_eq!((key.iif, key.local4), (TUN_IFINDEX, INIT_V4ADDR.octets()));
        assert_eq!(value.oif, UPLINK_IFINDEX);
        assert_eq!(value.oif_is_ethernet, 0);
        drop(egress_entries);

        let ingress_entries = fixture.ingress6.borrow();
        let (key, value) = ingress_entries.values().next().unwrap();
        assert_eq!(key.iif, UPLINK_IFINDEX);
        assert_eq!(Ipv6Addr::from(key.pfx96), pfx96().network_address());
        assert_eq!(Ipv6Addr::from(key.local6), v6);
        assert_eq!((value.oif, value.local4), (TUN_IFINDEX, INIT_V4ADDR.octets()));
        drop(ingress_entries);

        let state = fixture.state.borrow();
        assert!(state.qdiscs.contains(&TUN_IFINDEX));
        assert_eq!(
            state.filters,
            HashSet::from([
                (TUN_IFINDEX, false, PRIO_CLAT, ETH_P_IP),
                (UPLINK_IFINDEX, true, PRIO_CLAT, ETH_P_IPV6),
            ])
        );
    }

    #[test]
    fn start_steps_run_in_order() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        let calls = fixture.calls();
        let order = [
            "select_ipv4_address",
            "generate_ipv6_address",
            "open_packet_socket",
            "open_raw_socket6",
            "join_anycast",
            "socket_cookie",
            "cookie_tag.insert",
            "configure_packet_socket",
            "create_tun",
            "netd.set_ipv6_enabled",
            "detect_mtu",
            "netd.set_mtu",
            "netd.set_ipv4_up",
            "start_clatd",
            "is_ethernet",
            "egress4.insert",
            "ingress6.insert",
            "qdisc_add_clsact",
            "filter_add_bpf.egress",
            "filter_add_bpf.ingress",
        ];

        for pair in order.windows(2) {
            assert!(
                position(&calls, pair[0]) < position(&calls, pair[1]),
                "{} must run before {}",
                pair[0],
                pair[1],
            );
        }
    }

    #[test]
    fn adjusted_mtu_reaches_the_tun() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        // Probed 1420, minus the translation overhead.
        assert!(fixture.called("netd.set_mtu(v4-wlan0, 1392)"));
    }

    #[test]
    fn rejects_prefix_that_is_not_a_slash_96() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        let result = coordinator.start(UPLINK, NET_ID, "2001:db8::/64".parse().unwrap());

        assert!(result.is_err());
        assert!(coordinator.tracker().is_none());
        assert!(fixture.calls().is_empty());
    }

    #[test]
    fn second_start_fails_and_keeps_the_running_instance() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();
        let before = coordinator.tracker().unwrap().clone();
        let calls_before = fixture.calls().len();

        let result = coordinator.start("eth0", 7, pfx96());

        assert!(result.is_err());
        assert_eq!(coordinator.tracker(), Some(&before));
        assert_eq!(fixture.calls().len(), calls_before);
    }

    #[test]
    fn stop_without_running_instance_fails() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.stop().is_err());
        assert!(fixture.calls().is_empty());
    }

    #[test]
    fn any_failing_start_step_unwinds_to_idle() {
        let gates = [
            "select_ipv4_address",
            "generate_ipv6_address",
            "open_packet_socket",
            "open_raw_socket6",
            "join_anycast",
            "socket_cookie",
            "cookie_tag.insert",
            "configure_packet_socket",
            "create_tun",
            "netd.set_ipv6_enabled",
            "detect_mtu",
            "netd.set_mtu",
            "netd.set_ipv4_up",
            "start_clatd",
        ];

        for gate in gates {
            let fixture = Fixture::new();
            fixture.fail(gate);
            let mut coordinator = fixture.coordinator();

            let result = coordinator.start(UPLINK, NET_ID, pfx96());

            assert!(result.is_err(), "{gate}: start must fail");
            assert!(coordinator.tracker().is_none(), "{gate}: must stay idle");
            fixture.assert_idle_and_clean();

            // A tagged socket must be untagged on the way out.
            if fixture.called("configure_packet_socket") {
                assert!(fixture.called("cookie_tag.remove"), "{gate}: leaked tag");
            }

            // A failure before the daemon spawn must never leave one running.
            if gate != "start_clatd" {
                assert!(!fixture.called("start_clatd"), "{gate}: daemon started");
            }
        }
    }

    #[test]
    fn missing_uplink_interface_fails_start() {
        let fixture = Fixture::new();
        fixture.state.borrow_mut().uplink_exists = false;
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_err());
        assert!(coordinator.tracker().is_none());
        fixture.assert_idle_and_clean();
    }

    #[test]
    fn missing_tun_index_unwinds_tag() {
        let fixture = Fixture::new();
        fixture.state.borrow_mut().tun_gets_index = false;
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_err());
        assert!(coordinator.tracker().is_none());
        fixture.assert_idle_and_clean();
        assert!(fixture.called("cookie_tag.remove"));
    }

    #[test]
    fn ingress_filter_failure_degrades_to_daemon_only() {
        let fixture = Fixture::new();
        fixture.fail("filter_add_bpf.ingress");
        let mut coordinator = fixture.coordinator();

        let result = coordinator.start(UPLINK, NET_ID, pfx96());

        assert!(result.is_ok());
        assert!(coordinator.tracker().is_some());
        // The fast path is fully rolled back, except the clsact.
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(fixture.state.borrow().filters.is_empty());
        assert!(fixture.state.borrow().qdiscs.contains(&TUN_IFINDEX));
        // The instance itself is intact.
        assert_eq!(fixture.cookie_tag.borrow().len(), 1);
    }

    #[test]
    fn egress_filter_failure_degrades_to_daemon_only() {
        let fixture = Fixture::new();
        fixture.fail("filter_add_bpf.egress");
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_ok());
        assert!(coordinator.tracker().is_some());
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(fixture.state.borrow().filters.is_empty());
        assert!(!fixture.called("filter_add_bpf.ingress"));
    }

    #[test]
    fn ingress_map_failure_rolls_back_egress_entry() {
        let fixture = Fixture::new();
        fixture.fail("ingress6.insert");
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_ok());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(!fixture.called("qdisc_add_clsact"));
    }

    #[test]
    fn egress_map_failure_installs_nothing() {
        let fixture = Fixture::new();
        fixture.fail("egress4.insert");
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_ok());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(!fixture.called("qdisc_add_clsact"));
        assert!(!fixture.called("filter_add_bpf"));
    }

    #[test]
    fn framing_probe_failure_skips_the_fast_path() {
        let fixture = Fixture::new();
        fixture.fail("is_ethernet");
        let mut coordinator = fixture.coordinator();

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_ok());
        assert!(coordinator.tracker().is_some());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(!fixture.called("qdisc_add_clsact"));
    }

    #[test]
    fn ethernet_uplink_uses_the_ether_classifier() {
        let fixture = Fixture::new();
        fixture.state.borrow_mut().is_ethernet = true;
        let mut coordinator = fixture.coordinator();

        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        let (_, value) = *fixture.egress4.borrow().values().next().unwrap();
        assert_eq!(value.oif_is_ethernet, 1);
        assert!(
            fixture
                .calls()
                .iter()
                .any(|call| call.starts_with("filter_add_bpf.ingress") && call.contains("ether"))
        );
    }

    #[test]
    fn absent_maps_still_translate_through_the_daemon() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator_with_maps(false, true);

        let result = coordinator.start(UPLINK, NET_ID, pfx96());

        assert!(result.is_ok());
        assert!(coordinator.tracker().is_some());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(!fixture.called("is_ethernet"));
        assert!(!fixture.called("filter_add_bpf"));

        coordinator.stop().unwrap();

        assert!(coordinator.tracker().is_none());
        assert!(!fixture.called("filter_del"));
        assert!(fixture.cookie_tag.borrow().is_empty());
        assert_eq!(fixture.state.borrow().stopped_pids, vec![DAEMON_PID]);
    }

    #[test]
    fn stop_tears_everything_down() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        coordinator.stop().unwrap();

        assert!(coordinator.tracker().is_none());
        fixture.assert_idle_and_clean();
        assert_eq!(fixture.state.borrow().stopped_pids, vec![DAEMON_PID]);

        let calls = fixture.calls();
        // Filters come off before the map entries, daemon and tag last.
        assert!(position(&calls, "filter_del.ingress") < position(&calls, "egress4.remove"));
        assert!(position(&calls, "egress4.remove") < position(&calls, "ingress6.remove"));
        assert!(position(&calls, "ingress6.remove") < position(&calls, "stop_clatd"));
        assert!(position(&calls, "stop_clatd") < position(&calls, "cookie_tag.remove"));
    }

    #[test]
    fn stop_survives_failing_filter_removal() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        fixture.fail("filter_del.ingress");

        assert!(coordinator.stop().is_ok());
        assert!(coordinator.tracker().is_none());
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(fixture.egress4.borrow().is_empty());
        assert!(fixture.cookie_tag.borrow().is_empty());
        assert_eq!(fixture.state.borrow().stopped_pids, vec![DAEMON_PID]);
    }

    #[test]
    fn stop_goes_idle_even_when_the_daemon_will_not_die() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        fixture.fail("stop_clatd");

        assert!(coordinator.stop().is_err());
        assert!(coordinator.tracker().is_none());
        // The fast path is gone even though the error surfaced.
        assert!(fixture.ingress6.borrow().is_empty());
        assert!(fixture.egress4.borrow().is_empty());
    }

    #[test]
    fn restart_after_stop_works() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();

        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();
        coordinator.stop().unwrap();
        fixture.state.borrow_mut().tun_created = false;

        assert!(coordinator.start(UPLINK, NET_ID, pfx96()).is_ok());
        assert!(coordinator.tracker().is_some());
    }

    #[test]
    fn dump_renders_tracker_and_both_maps() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        let mut out = Vec::new();
        coordinator.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("v4-wlan0/13"));
        assert!(text.contains("BPF ingress map:"));
        assert!(text.contains("BPF egress map:"));
        assert!(text.contains("192.0.0.4"));
    }

    #[test]
    fn dump_when_idle_says_so() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator();

        let mut out = Vec::new();
        coordinator.dump(&mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "<no active CLAT instance>\n");
    }

    #[test]
    fn raw_dump_emits_one_line_per_entry() {
        let fixture = Fixture::new();
        let mut coordinator = fixture.coordinator();
        coordinator.start(UPLINK, NET_ID, pfx96()).unwrap();

        for egress4 in [false, true] {
            let mut out = Vec::new();
            coordinator.dump_raw_map(&mut out, egress4).unwrap();
            let text = String::from_utf8(out).unwrap();

            assert_eq!(text.lines().count(), 1);
            assert!(text.trim().contains(','));
        }
    }
}
