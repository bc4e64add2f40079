//! Linux implementation of the OS façade.
//!
//! Sockets and the TUN control descriptor come straight from `libc` and
//! `socket2`; interface attributes go over rtnetlink; the fast-path plumbing
//! (pinned maps, clsact, tc classifiers) goes through aya.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd as _, BorrowedFd, FromRawFd as _, IntoRawFd as _, OwnedFd, RawFd};
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::{Child, Command};

use anyhow::{Context as _, Result, bail};
use aya::programs::links::Link as _;
use aya::programs::tc::{
    NlOptions, SchedClassifier, SchedClassifierLink, TcAttachOptions, TcAttachType,
    qdisc_add_clsact,
};
use futures::TryStreamExt as _;
use ip_network::Ipv6Network;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::{Handle, LinkUnspec};
use socket2::{Domain, Protocol, Socket, Type};

use crate::maps::{
    COOKIE_TAG_MAP_PATH, ClatEgress4Key, ClatEgress4Value, ClatIngress6Key, ClatIngress6Value,
    ClatMap, CookieTagKey, CookieTagValue, EGRESS4_MAP_PATH, INGRESS6_MAP_PATH, PinnedMap,
};
use crate::platform::{ETH_P_IPV6, INVALID_IFINDEX, Netd, Platform, embed_v4, make_checksum_neutral};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_FILE: &std::ffi::CStr = c"/dev/net/tun";
// TUNSETIFF must create the interface, never attach to an existing one.
const IFF_TUN_EXCL: u16 = 0x8000;

const SO_COOKIE: libc::c_int = 57;
const IPV6_JOIN_ANYCAST: libc::c_int = 27;
const IPV6_MTU: libc::c_int = 24;

const PROBE_PORT: u16 = 53;

/// The real [`Platform`]: every method talks to the running kernel.
pub struct OsPlatform {
    netd: LinuxNetd,
    clatd_path: PathBuf,
    /// tc filters we attached, keyed by `(ifindex, ingress)`. Detaching on
    /// `filter_del` requires the link handle aya returned at attach time.
    links: RefCell<HashMap<(u32, bool), SchedClassifierLink>>,
    /// Spawned daemons, retained so `stop_clatd` can reap them.
    children: RefCell<HashMap<i32, Child>>,
}

impl OsPlatform {
    pub fn new() -> Result<Self> {
        Self::with_clatd_path(PathBuf::from("clatd"))
    }

    pub fn with_clatd_path(clatd_path: PathBuf) -> Result<Self> {
        Ok(Self {
            netd: LinuxNetd::new()?,
            clatd_path,
            links: RefCell::new(HashMap::new()),
            children: RefCell::new(HashMap::new()),
        })
    }
}

impl Platform for OsPlatform {
    fn netd(&self) -> &dyn Netd {
        &self.netd
    }

    fn interface_index(&self, iface: &str) -> u32 {
        let Ok(name) = CString::new(iface) else {
            return INVALID_IFINDEX;
        };

        unsafe { libc::if_nametoindex(name.as_ptr()) }
    }

    fn create_tun(&self, name: &str) -> Result<OwnedFd> {
        let fd = match unsafe { libc::open(TUN_FILE.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) } {
            -1 => {
                return Err(get_last_error())
                    .with_context(|| format!("Failed to open {}", TUN_FILE.to_string_lossy()));
            }
            fd => unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let mut request = TunRequest::new(name)?;
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut request) } == -1 {
            return Err(get_last_error())
                .with_context(|| format!("Failed to create TUN interface {name}"));
        }

        Ok(fd)
    }

    fn select_ipv4_address(&self, seed: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Addr> {
        let in_use = self.netd.ipv4_addresses()?;

        crate::platform::first_free_v4(seed, prefix_len, &in_use)
            .with_context(|| format!("No free IPv4 address in {seed}/{prefix_len}"))
    }

    fn generate_ipv6_address(
        &self,
        iface: &str,
        v4: Ipv4Addr,
        pfx96: Ipv6Network,
        fwmark: u32,
    ) -> Result<Ipv6Addr> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)
            .context("Failed to open probe socket")?;
        socket.set_mark(fwmark).context("Failed to mark probe socket")?;
        socket
            .bind_device(Some(iface.as_bytes()))
            .with_context(|| format!("Failed to bind probe socket to {iface}"))?;

        let probe = embed_v4(pfx96, Ipv4Addr::new(8, 8, 8, 8));
        socket
            .connect(&SocketAddrV6::new(probe, PROBE_PORT, 0, 0).into())
            .with_context(|| format!("No route toward {probe} on {iface}"))?;

        let local = socket
            .local_addr()
            .context("Failed to read probe socket address")?
            .as_socket_ipv6()
            .context("Probe socket has no IPv6 address")?;

        // Keep the on-link /64, randomize the rest, then fix the last word
        // so translation stays checksum-neutral.
        let mut octets = local.ip().octets();
        let iid: [u8; 8] = rand::random();
        octets[8..16].copy_from_slice(&iid);

        Ok(make_checksum_neutral(
            Ipv6Addr::from(octets),
            v4,
            pfx96.network_address(),
        ))
    }

    fn detect_mtu(&self, pfx96: Ipv6Network, target: Ipv4Addr, fwmark: u32) -> Result<u32> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)
            .context("Failed to open MTU probe socket")?;
        socket
            .set_mark(fwmark)
            .context("Failed to mark MTU probe socket")?;

        let probe = embed_v4(pfx96, target);
        socket
            .connect(&SocketAddrV6::new(probe, PROBE_PORT, 0, 0).into())
            .with_context(|| format!("No route toward {probe}"))?;

        let mtu: libc::c_int = getsockopt(socket.as_raw_fd(), libc::IPPROTO_IPV6, IPV6_MTU)
            .context("Failed to read path MTU")?;

        Ok(mtu as u32)
    }

    fn open_packet_socket(&self) -> Result<OwnedFd> {
        // Protocol 0: receive nothing until the filter is attached and the
        // socket is bound.
        let socket = Socket::new(Domain::PACKET, Type::DGRAM, None)
            .context("Failed to open packet socket")?;

        Ok(unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) })
    }

    fn open_raw_socket6(&self, fwmark: u32) -> Result<OwnedFd> {
        let socket = Socket::new(
            Domain::IPV6,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .context("Failed to open raw IPv6 socket")?;
        socket
            .set_mark(fwmark)
            .context("Failed to mark raw IPv6 socket")?;

        Ok(unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) })
    }

    fn join_anycast(&self, fd: BorrowedFd<'_>, v6: Ipv6Addr, ifindex: u32) -> Result<()> {
        let request = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: v6.octets(),
            },
            ipv6mr_interface: ifindex,
        };

        setsockopt(fd.as_raw_fd(), libc::IPPROTO_IPV6, IPV6_JOIN_ANYCAST, &request)
            .with_context(|| format!("Failed to join anycast group {v6} on ifindex {ifindex}"))
    }

    fn configure_packet_socket(
        &self,
        fd: BorrowedFd<'_>,
        v6: Ipv6Addr,
        ifindex: u32,
    ) -> Result<()> {
        let filter = dst_match_filter(v6);
        let program = libc::sock_fprog {
            len: filter.len() as u16,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };
        setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &program,
        )
        .context("Failed to attach packet filter")?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = ETH_P_IPV6.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;

        if unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        } == -1
        {
            return Err(get_last_error())
                .with_context(|| format!("Failed to bind packet socket to ifindex {ifindex}"));
        }

        Ok(())
    }

    fn start_clatd(
        &self,
        tun_fd: BorrowedFd<'_>,
        read_fd: BorrowedFd<'_>,
        write_fd: BorrowedFd<'_>,
        iface: &str,
        pfx96: &Ipv6Network,
        v4: Ipv4Addr,
        v6: Ipv6Addr,
    ) -> Result<i32> {
        let fds = [tun_fd.as_raw_fd(), read_fd.as_raw_fd(), write_fd.as_raw_fd()];

        let mut command = Command::new(&self.clatd_path);
        command
            .arg("-i")
            .arg(iface)
            .arg("-p")
            .arg(pfx96.network_address().to_string())
            .arg("-4")
            .arg(v4.to_string())
            .arg("-6")
            .arg(v6.to_string())
            .arg("-t")
            .arg(fds[0].to_string())
            .arg("-r")
            .arg(fds[1].to_string())
            .arg("-w")
            .arg(fds[2].to_string());

        // The descriptors are close-on-exec; hand the daemon its copies.
        unsafe {
            command.pre_exec(move || {
                for fd in fds {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                    {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.clatd_path.display()))?;
        let pid = child.id() as i32;
        self.children.borrow_mut().insert(pid, child);

        tracing::info!(%pid, %iface, "Started translator daemon");

        Ok(pid)
    }

    fn stop_clatd(&self, pid: i32) -> Result<()> {
        if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
            return Err(get_last_error())
                .with_context(|| format!("Failed to signal translator daemon {pid}"));
        }

        if let Some(mut child) = self.children.borrow_mut().remove(&pid) {
            child
                .wait()
                .with_context(|| format!("Failed to reap translator daemon {pid}"))?;
        }

        tracing::info!(%pid, "Stopped translator daemon");

        Ok(())
    }

    fn socket_cookie(&self, fd: BorrowedFd<'_>) -> Result<u64> {
        getsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, SO_COOKIE).context("Failed to read socket cookie")
    }

    fn is_ethernet(&self, iface: &str) -> Result<bool> {
        let path = format!("/sys/class/net/{iface}/type");
        let link_type = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {path}"))?
            .trim()
            .parse::<u16>()
            .with_context(|| format!("Malformed link type in {path}"))?;

        Ok(link_type == libc::ARPHRD_ETHER)
    }

    fn qdisc_add_clsact(&self, ifindex: u32) -> Result<()> {
        let iface = interface_name(ifindex)?;

        match qdisc_add_clsact(&iface) {
            Ok(()) => Ok(()),
            // A clsact left over from a previous run is as good as ours; its
            // lifetime is tied to the interface, not to CLAT.
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to add clsact qdisc on {iface}"))
            }
        }
    }

    fn filter_add_bpf(
        &self,
        ifindex: u32,
        ingress: bool,
        prio: u16,
        proto: u16,
        prog_path: &str,
    ) -> Result<()> {
        let iface = interface_name(ifindex)?;
        let attach_type = if ingress {
            TcAttachType::Ingress
        } else {
            TcAttachType::Egress
        };

        let mut program = SchedClassifier::from_pin(prog_path)
            .with_context(|| format!("Failed to load pinned program {prog_path}"))?;
        let link_id = program
            .attach_with_options(
                &iface,
                attach_type,
                TcAttachOptions::Netlink(NlOptions {
                    priority: prio,
                    handle: 1,
                }),
            )
            .with_context(|| {
                format!("Failed to attach {prog_path} to {iface} (proto {proto:#06x})")
            })?;
        let link = program.take_link(link_id).context("Failed to take tc link")?;

        self.links.borrow_mut().insert((ifindex, ingress), link);

        Ok(())
    }

    fn filter_del(&self, ifindex: u32, ingress: bool, prio: u16, proto: u16) -> Result<()> {
        let Some(link) = self.links.borrow_mut().remove(&(ifindex, ingress)) else {
            bail!(
                "No CLAT filter attached on ifindex {ifindex} (ingress {ingress}, prio {prio}, proto {proto:#06x})"
            );
        };

        link.detach()
            .with_context(|| format!("Failed to detach tc filter from ifindex {ifindex}"))
    }

    fn open_ingress6_map(&self) -> Option<Box<dyn ClatMap<ClatIngress6Key, ClatIngress6Value>>> {
        open_map(INGRESS6_MAP_PATH)
    }

    fn open_egress4_map(&self) -> Option<Box<dyn ClatMap<ClatEgress4Key, ClatEgress4Value>>> {
        open_map(EGRESS4_MAP_PATH)
    }

    fn open_cookie_tag_map(&self) -> Option<Box<dyn ClatMap<CookieTagKey, CookieTagValue>>> {
        open_map(COOKIE_TAG_MAP_PATH)
    }
}

fn open_map<K, V>(path: &'static str) -> Option<Box<dyn ClatMap<K, V>>>
where
    K: aya::Pod + bytemuck::Pod + 'static,
    V: aya::Pod + bytemuck::Pod + 'static,
{
    match PinnedMap::open(path) {
        Ok(map) => Some(Box::new(map)),
        Err(e) => {
            tracing::warn!("Map at {path} unavailable: {e:#}");

            None
        }
    }
}

/// Interface-configuration plane, backed by rtnetlink and procfs.
///
/// rtnetlink is async; the client owns a current-thread runtime and blocks
/// on each request, keeping the coordinator's call contract synchronous.
pub struct LinuxNetd {
    runtime: tokio::runtime::Runtime,
    handle: Handle,
}

impl LinuxNetd {
    fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .context("Failed to build netlink runtime")?;

        let guard = runtime.enter();
        let (connection, handle, _) =
            rtnetlink::new_connection().context("Failed to create netlink connection")?;
        runtime.spawn(connection);
        drop(guard);

        Ok(Self { runtime, handle })
    }

    fn index_of(&self, iface: &str) -> Result<u32> {
        let handle = self.handle.clone();
        let name = iface.to_string();

        self.runtime.block_on(async move {
            let link = handle
                .link()
                .get()
                .match_name(name.clone())
                .execute()
                .try_next()
                .await
                .with_context(|| format!("Failed to look up {name}"))?
                .with_context(|| format!("No such interface: {name}"))?;

            Ok(link.header.index)
        })
    }

    fn ipv4_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let handle = self.handle.clone();

        self.runtime.block_on(async move {
            let mut addresses = HashSet::new();
            let mut stream = handle.address().get().execute();

            while let Some(message) = stream
                .try_next()
                .await
                .context("Failed to dump addresses")?
            {
                for attribute in &message.attributes {
                    if let AddressAttribute::Address(IpAddr::V4(v4))
                    | AddressAttribute::Local(IpAddr::V4(v4)) = attribute
                    {
                        addresses.insert(*v4);
                    }
                }
            }

            Ok(addresses)
        })
    }
}

impl Netd for LinuxNetd {
    fn set_ipv6_enabled(&self, iface: &str, enabled: bool) -> Result<()> {
        let path = format!("/proc/sys/net/ipv6/conf/{iface}/disable_ipv6");

        fs::write(&path, if enabled { "0\n" } else { "1\n" })
            .with_context(|| format!("Failed to write {path}"))
    }

    fn set_mtu(&self, iface: &str, mtu: u32) -> Result<()> {
        let index = self.index_of(iface)?;
        let handle = self.handle.clone();
        let name = iface.to_string();

        self.runtime.block_on(async move {
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).mtu(mtu).build())
                .execute()
                .await
                .with_context(|| format!("Failed to set MTU {mtu} on {name}"))
        })
    }

    fn set_ipv4_up(&self, iface: &str, v4: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let index = self.index_of(iface)?;
        let handle = self.handle.clone();
        let name = iface.to_string();

        self.runtime.block_on(async move {
            handle
                .address()
                .add(index, IpAddr::V4(v4), prefix_len)
                .execute()
                .await
                .with_context(|| format!("Failed to add {v4}/{prefix_len} to {name}"))?;

            handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
                .with_context(|| format!("Failed to bring up {name}"))
        })
    }
}

#[repr(C)]
struct TunRequest {
    name: [u8; libc::IFNAMSIZ],
    flags: u16,
    _padding: [u8; 22],
}

impl TunRequest {
    fn new(name: &str) -> Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            bail!("Interface name too long: {name}");
        }

        let mut request = Self {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as u16 | IFF_TUN_EXCL,
            _padding: [0; 22],
        };
        request.name[..name.len()].copy_from_slice(name.as_bytes());

        Ok(request)
    }
}

// Classic BPF opcodes, pre-combined: load a word at an absolute offset,
// compare against an immediate, return an immediate.
const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

/// Accepts only packets whose IPv6 destination equals `v6`.
///
/// The packet socket is `SOCK_DGRAM`, so the data starts at the IPv6 header
/// and the destination address occupies bytes 24..40.
fn dst_match_filter(v6: Ipv6Addr) -> Vec<libc::sock_filter> {
    let octets = v6.octets();
    let mut program = Vec::with_capacity(10);

    for (i, word) in octets.chunks_exact(4).enumerate() {
        program.push(libc::sock_filter {
            code: BPF_LD_W_ABS,
            jt: 0,
            jf: 0,
            k: 24 + 4 * i as u32,
        });
        program.push(libc::sock_filter {
            code: BPF_JMP_JEQ_K,
            jt: 0,
            // Jump to the trailing "return 0" on mismatch.
            jf: 7 - 2 * i as u8,
            k: u32::from_be_bytes([word[0], word[1], word[2], word[3]]),
        });
    }

    program.push(libc::sock_filter {
        code: BPF_RET_K,
        jt: 0,
        jf: 0,
        k: u32::MAX,
    });
    program.push(libc::sock_filter {
        code: BPF_RET_K,
        jt: 0,
        jf: 0,
        k: 0,
    });

    program
}

fn interface_name(ifindex: u32) -> Result<String> {
    let mut buffer = [0u8; libc::IF_NAMESIZE];

    if unsafe { libc::if_indextoname(ifindex, buffer.as_mut_ptr().cast()) }.is_null() {
        return Err(get_last_error()).with_context(|| format!("No interface with index {ifindex}"));
    }

    let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());

    Ok(String::from_utf8_lossy(&buffer[..len]).into_owned())
}

fn get_last_error() -> io::Error {
    io::Error::last_os_error()
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, option: libc::c_int, value: &T) -> io::Result<()> {
    match unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    } {
        -1 => Err(get_last_error()),
        _ => Ok(()),
    }
}

fn getsockopt<T: Copy>(fd: RawFd, level: libc::c_int, option: libc::c_int) -> io::Result<T> {
    let mut value = std::mem::MaybeUninit::<T>::zeroed();
    let mut len = std::mem::size_of::<T>() as libc::socklen_t;

    match unsafe {
        libc::getsockopt(
            fd,
            level,
            option,
            value.as_mut_ptr().cast(),
            &mut len,
        )
    } {
        -1 => Err(get_last_error()),
        _ => Ok(unsafe { value.assume_init() }),
    }
}
