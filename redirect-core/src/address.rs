//! Local address tracking
//!
//! Derives the set of destination prefixes that belong to this host and must
//! never be redirected: every prefix on the loopback interface plus every
//! globally routable unicast prefix on any other interface.

use indexmap::{IndexMap, IndexSet};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use nix::ifaddrs::getifaddrs;
use nix::sys::socket::SockaddrStorage;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::sync::Mutex;

/// An address with its prefix length. Equality is by exact (address, length),
/// host bits included.
pub type AddressPrefix = IpNet;

const LOOPBACK_INTERFACE: &str = "lo";

/// One host interface and its configured prefixes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<AddressPrefix>,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, addresses: Vec<AddressPrefix>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }
}

/// Source of interface snapshots. Every call must return a fresh view.
pub trait InterfaceFinder: Send + Sync {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>>;
}

/// Interface snapshot read from the kernel with getifaddrs(3)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceFinder for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>> {
        let mut by_name: IndexMap<String, Vec<AddressPrefix>> = IndexMap::new();

        for ifaddr in getifaddrs().map_err(io::Error::from)? {
            let prefixes = by_name.entry(ifaddr.interface_name.clone()).or_default();
            if let Some(prefix) = prefix_of(ifaddr.address.as_ref(), ifaddr.netmask.as_ref()) {
                prefixes.push(prefix);
            }
        }

        Ok(by_name
            .into_iter()
            .map(|(name, addresses)| NetworkInterface { name, addresses })
            .collect())
    }
}

fn prefix_of(
    address: Option<&SockaddrStorage>,
    netmask: Option<&SockaddrStorage>,
) -> Option<AddressPrefix> {
    let address = address?;

    if let Some(sin) = address.as_sockaddr_in() {
        let ip = *SocketAddrV4::from(*sin).ip();
        let len = netmask
            .and_then(|m| m.as_sockaddr_in())
            .and_then(|m| ipnet::ipv4_mask_to_prefix(*SocketAddrV4::from(*m).ip()).ok())
            .unwrap_or(32);
        return Ipv4Net::new(ip, len).ok().map(IpNet::V4);
    }

    if let Some(sin6) = address.as_sockaddr_in6() {
        let ip = *SocketAddrV6::from(*sin6).ip();
        let len = netmask
            .and_then(|m| m.as_sockaddr_in6())
            .and_then(|m| ipnet::ipv6_mask_to_prefix(*SocketAddrV6::from(*m).ip()).ok())
            .unwrap_or(128);
        return Ipv6Net::new(ip, len).ok().map(IpNet::V6);
    }

    // Link-layer (AF_PACKET) entries carry no IP prefix
    None
}

/// Fixed interface snapshot that can be swapped at runtime
#[derive(Debug, Default)]
pub struct StaticInterfaces {
    interfaces: Mutex<Vec<NetworkInterface>>,
}

impl StaticInterfaces {
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        Self {
            interfaces: Mutex::new(interfaces),
        }
    }

    /// Replace the snapshot returned by subsequent calls
    pub fn set(&self, interfaces: Vec<NetworkInterface>) {
        if let Ok(mut current) = self.interfaces.lock() {
            *current = interfaces;
        }
    }
}

impl InterfaceFinder for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetworkInterface>> {
        self.interfaces
            .lock()
            .map(|it| it.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "interface snapshot lock poisoned"))
    }
}

/// Whether `addr` is a globally routable unicast address: not unspecified,
/// loopback, multicast, link-local or limited broadcast. Private ranges count
/// as global unicast.
pub fn is_global_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4 == Ipv4Addr::BROADCAST)
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || is_unicast_link_local_v6(&v6))
        }
    }
}

fn is_unicast_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Prefixes that are local to this host, in discovery order.
///
/// Comparison ignores order: two sets holding the same prefixes are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddressSet {
    prefixes: IndexSet<AddressPrefix>,
}

/// Element changes between two local address sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressDiff {
    pub added: Vec<AddressPrefix>,
    pub removed: Vec<AddressPrefix>,
}

impl AddressDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl LocalAddressSet {
    /// Select loopback-interface prefixes and global unicast prefixes
    pub fn compute(interfaces: &[NetworkInterface]) -> Self {
        let prefixes = interfaces
            .iter()
            .flat_map(|it| {
                let loopback = it.name == LOOPBACK_INTERFACE;
                it.addresses
                    .iter()
                    .filter(move |prefix| loopback || is_global_unicast(prefix.addr()))
                    .copied()
            })
            .collect();
        Self { prefixes }
    }

    /// Compute from a fresh snapshot of `finder`
    pub fn discover(finder: &dyn InterfaceFinder) -> io::Result<Self> {
        Ok(Self::compute(&finder.interfaces()?))
    }

    /// Element changes that turn `old` into `new`
    pub fn diff(old: &Self, new: &Self) -> AddressDiff {
        if old == new {
            return AddressDiff::default();
        }
        AddressDiff {
            added: new.prefixes.difference(&old.prefixes).copied().collect(),
            removed: old.prefixes.difference(&new.prefixes).copied().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressPrefix> {
        self.prefixes.iter()
    }

    pub fn contains(&self, prefix: &AddressPrefix) -> bool {
        self.prefixes.contains(prefix)
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl FromIterator<AddressPrefix> for LocalAddressSet {
    fn from_iter<T: IntoIterator<Item = AddressPrefix>>(iter: T) -> Self {
        Self {
            prefixes: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn snapshot() -> Vec<NetworkInterface> {
        vec![
            NetworkInterface::new("lo", vec![net("127.0.0.1/8"), net("::1/128")]),
            NetworkInterface::new(
                "eth0",
                vec![
                    net("10.0.0.5/24"),
                    net("fe80::1/64"),
                    net("2001:db8::5/64"),
                ],
            ),
            NetworkInterface::new(
                "wlan0",
                vec![net("169.254.3.4/16"), net("192.168.1.20/24")],
            ),
            NetworkInterface::new("dummy0", vec![net("127.0.0.2/8"), net("0.0.0.0/0")]),
        ]
    }

    #[test]
    fn test_compute_selection() {
        let set = LocalAddressSet::compute(&snapshot());
        let prefixes: Vec<_> = set.iter().copied().collect();

        assert_eq!(
            prefixes,
            vec![
                net("127.0.0.1/8"),
                net("::1/128"),
                net("10.0.0.5/24"),
                net("2001:db8::5/64"),
                net("192.168.1.20/24"),
            ]
        );
        // Loopback by address on a non-lo interface is not local
        assert!(!set.contains(&net("127.0.0.2/8")));
        assert!(!set.contains(&net("fe80::1/64")));
        assert!(!set.contains(&net("169.254.3.4/16")));
    }

    #[test]
    fn test_compute_is_idempotent() {
        let first = LocalAddressSet::compute(&snapshot());
        let second = LocalAddressSet::compute(&snapshot());
        assert_eq!(first, second);
        assert!(LocalAddressSet::diff(&first, &second).is_empty());
    }

    #[test]
    fn test_equality_ignores_order() {
        let a: LocalAddressSet = vec![net("10.0.0.5/24"), net("127.0.0.1/8")].into_iter().collect();
        let b: LocalAddressSet = vec![net("127.0.0.1/8"), net("10.0.0.5/24")].into_iter().collect();
        assert_eq!(a, b);
        assert!(LocalAddressSet::diff(&a, &b).is_empty());
    }

    #[test]
    fn test_diff_add_and_remove() {
        let old: LocalAddressSet = vec![net("127.0.0.1/8"), net("10.0.0.5/24")].into_iter().collect();
        let new: LocalAddressSet = vec![net("127.0.0.1/8"), net("10.0.0.6/24")].into_iter().collect();

        let diff = LocalAddressSet::diff(&old, &new);
        assert_eq!(diff.added, vec![net("10.0.0.6/24")]);
        assert_eq!(diff.removed, vec![net("10.0.0.5/24")]);
    }

    #[test]
    fn test_prefix_equality_is_exact() {
        // Same network, different host address
        let old: LocalAddressSet = vec![net("10.0.0.5/24")].into_iter().collect();
        let new: LocalAddressSet = vec![net("10.0.0.5/24"), net("10.0.0.6/24")].into_iter().collect();

        let diff = LocalAddressSet::diff(&old, &new);
        assert_eq!(diff.added, vec![net("10.0.0.6/24")]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast("8.8.8.8".parse().unwrap()));
        assert!(is_global_unicast("10.1.2.3".parse().unwrap()));
        assert!(!is_global_unicast("255.255.255.255".parse().unwrap()));
        assert!(!is_global_unicast("224.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast("fe80::1".parse().unwrap()));
        assert!(!is_global_unicast("ff02::1".parse().unwrap()));
        assert!(is_global_unicast("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_static_interfaces() {
        let finder = StaticInterfaces::new(snapshot());
        assert_eq!(LocalAddressSet::discover(&finder).unwrap().len(), 5);

        finder.set(vec![NetworkInterface::new("lo", vec![net("127.0.0.1/8")])]);
        assert_eq!(LocalAddressSet::discover(&finder).unwrap().len(), 1);
    }

    #[test]
    fn test_system_interfaces() {
        // Every Linux host has a loopback interface
        let interfaces = SystemInterfaces.interfaces().unwrap();
        assert!(!interfaces.is_empty());
    }
}
