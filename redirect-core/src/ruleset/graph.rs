//! Abstract rule graph: sets, chains and rules of one inet table

use ipnet::IpNet;
use std::fmt;

/// nftables base chain priority of the mangle stage
pub const PRIORITY_MANGLE: i32 = -150;

pub const LOCAL_ADDRESS_SET_V4: &str = "inet4_local_address_set";
pub const LOCAL_ADDRESS_SET_V6: &str = "inet6_local_address_set";
pub const ROUTE_ADDRESS_SET_V4: &str = "inet4_route_address_set";
pub const ROUTE_ADDRESS_SET_V6: &str = "inet6_route_address_set";
pub const ROUTE_EXCLUDE_ADDRESS_SET_V4: &str = "inet4_route_exclude_address_set";
pub const ROUTE_EXCLUDE_ADDRESS_SET_V6: &str = "inet6_route_exclude_address_set";

pub const CHAIN_OUTPUT: &str = "output";
pub const CHAIN_OUTPUT_UDP: &str = "output_udp";
pub const CHAIN_PREROUTING: &str = "prerouting";
pub const CHAIN_PREROUTING_UDP: &str = "prerouting_udp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn of(prefix: &IpNet) -> Self {
        match prefix {
            IpNet::V4(_) => Family::Ipv4,
            IpNet::V6(_) => Family::Ipv6,
        }
    }

    pub fn local_address_set(self) -> &'static str {
        match self {
            Family::Ipv4 => LOCAL_ADDRESS_SET_V4,
            Family::Ipv6 => LOCAL_ADDRESS_SET_V6,
        }
    }

    pub fn route_address_set(self) -> &'static str {
        match self {
            Family::Ipv4 => ROUTE_ADDRESS_SET_V4,
            Family::Ipv6 => ROUTE_ADDRESS_SET_V6,
        }
    }

    pub fn route_exclude_address_set(self) -> &'static str {
        match self {
            Family::Ipv4 => ROUTE_EXCLUDE_ADDRESS_SET_V4,
            Family::Ipv6 => ROUTE_EXCLUDE_ADDRESS_SET_V6,
        }
    }

    /// nft name of the family for `meta nfproto`
    pub fn nfproto(self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
        }
    }

    /// nft payload protocol carrying the destination address
    pub fn payload_protocol(self) -> &'static str {
        match self {
            Family::Ipv4 => "ip",
            Family::Ipv6 => "ip6",
        }
    }

    /// Prefixes of this family merged into disjoint networks. Interval sets
    /// reject overlapping elements, so everything written to a set goes
    /// through here.
    pub fn networks<'a>(self, prefixes: impl IntoIterator<Item = &'a IpNet>) -> Vec<IpNet> {
        let own: Vec<IpNet> = prefixes
            .into_iter()
            .filter(|it| Family::of(it) == self)
            .copied()
            .collect();
        IpNet::aggregate(&own)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Output,
    Prerouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Nat,
    Route,
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A single match or action primitive. Rules evaluate them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `meta iifname` equal to (or, negated, not in) the given names
    Iifname { names: Vec<String>, negate: bool },
    /// `meta oifname` equal to (or, negated, not in) the given names
    Oifname { names: Vec<String>, negate: bool },
    L4Proto(Protocol),
    NfProto(Family),
    /// Destination address membership in a named set
    DaddrInSet {
        family: Family,
        set: String,
        negate: bool,
    },
    Mark(u32),
    CtMark(u32),
    Counter,
    SetMark(u32),
    /// `ct mark set meta mark`
    CtMarkFromMark,
    /// `meta mark set ct mark`
    MarkFromCtMark,
    Redirect { port: u16 },
    /// icmpx admin-prohibited
    Reject,
    Return,
    Accept,
}

/// Role of a rule within its chain; drives the ordering invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    InterfaceExclude,
    MarkExclude,
    AddressExclude,
    Unreachable,
    Redirect,
    Mark,
    RestoreMark,
    Passthrough,
}

impl RuleKind {
    /// Evaluation tier: interface exclusions, then address and mark
    /// exclusions with the unreachable short-circuit, then actions.
    pub fn tier(self) -> u8 {
        match self {
            RuleKind::InterfaceExclude => 0,
            RuleKind::MarkExclude | RuleKind::AddressExclude | RuleKind::Unreachable => 1,
            RuleKind::Redirect | RuleKind::Mark | RuleKind::RestoreMark | RuleKind::Passthrough => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub exprs: Vec<Expr>,
    pub comment: Option<String>,
}

impl Rule {
    pub fn new(kind: RuleKind, exprs: Vec<Expr>) -> Self {
        Self {
            kind,
            exprs,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn is_redirect(&self) -> bool {
        self.exprs.iter().any(|it| matches!(it, Expr::Redirect { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub hook: Hook,
    pub priority: i32,
    pub chain_type: ChainType,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: &str, hook: Hook, priority: i32, chain_type: ChainType) -> Self {
        Self {
            name: name.to_string(),
            hook,
            priority,
            chain_type,
            rules: Vec::new(),
        }
    }

    /// Whether rule kinds never step back to an earlier tier
    pub fn is_ordered(&self) -> bool {
        self.rules
            .windows(2)
            .all(|pair| pair[0].kind.tier() <= pair[1].kind.tier())
    }
}

/// Named interval set of destination prefixes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    pub name: String,
    pub family: Family,
    pub elements: Vec<IpNet>,
}

/// Everything one install writes into the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGraph {
    pub table: String,
    pub sets: Vec<AddressSet>,
    pub chains: Vec<Chain>,
}

impl RuleGraph {
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|it| it.name == name)
    }

    pub fn set(&self, name: &str) -> Option<&AddressSet> {
        self.sets.iter().find(|it| it.name == name)
    }

    pub fn rule_count(&self) -> usize {
        self.chains.iter().map(|it| it.rules.len()).sum()
    }
}

impl fmt::Display for RuleGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table inet {} ({} sets, {} chains, {} rules)",
            self.table,
            self.sets.len(),
            self.chains.len(),
            self.rule_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_networks_merge_overlaps() {
        let prefixes = vec![
            net("2001:db8::5/64"),
            net("2001:db8::abcd/128"),
            net("10.0.0.5/24"),
            net("10.0.9.9/16"),
            net("127.0.0.1/8"),
        ];
        assert_eq!(
            Family::Ipv4.networks(&prefixes),
            vec![net("10.0.0.0/16"), net("127.0.0.0/8")]
        );
        assert_eq!(Family::Ipv6.networks(&prefixes), vec![net("2001:db8::/64")]);
    }

    #[test]
    fn test_networks_merge_adjacent() {
        let prefixes = vec![net("192.168.0.0/24"), net("192.168.1.0/24")];
        assert_eq!(Family::Ipv4.networks(&prefixes), vec![net("192.168.0.0/23")]);
        assert!(Family::Ipv6.networks(&prefixes).is_empty());
    }
}
