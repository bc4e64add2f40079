//! Control-plane coordinator for customer-side 464XLAT (CLAT).
//!
//! On an IPv6-only uplink, IPv4-only applications still expect a working
//! IPv4 path. The coordinator provides one: it brings up a `v4-*` TUN
//! interface, picks the translator's IPv4/IPv6 source addresses, starts the
//! userspace translator daemon and, where the pinned kernel objects are
//! available, wires up the eBPF fast path (one tc classifier per direction
//! plus the forwarding map entries the programs read).
//!
//! The coordinator itself is synchronous and single-owner: `start` and
//! `stop` block the caller and either commit every side effect or unwind
//! all of them. All OS access goes through the [`platform::Platform`] trait
//! so the whole sequence can be exercised against a scripted fake.

pub mod coordinator;
pub mod maps;
pub mod mark;
pub mod platform;

pub use coordinator::{ClatdTracker, Coordinator};
pub use platform::{Netd, Platform};

#[cfg(target_os = "linux")]
pub use platform::linux::OsPlatform;
