//! Rule graph construction from a redirect policy
//!
//! Mode selection happens once in [`RuleGraph::build`]; each mode has its own
//! construction function. Every chain is assembled in the same tiers:
//! interface exclusions first, then mark and destination-address exclusions
//! plus the strict-route short-circuit, then the redirect or mark action.

use super::graph::{
    AddressSet, Chain, ChainType, Expr, Family, Hook, Protocol, Rule, RuleGraph, RuleKind,
    CHAIN_OUTPUT, CHAIN_OUTPUT_UDP, CHAIN_PREROUTING, CHAIN_PREROUTING_UDP, PRIORITY_MANGLE,
};
use crate::address::LocalAddressSet;
use crate::config::{ConfigValidator, RedirectMode, RedirectPolicy, RouteAddresses};
use crate::error::Result;

impl RuleGraph {
    /// Build the full rule graph for one install
    pub fn build(
        policy: &RedirectPolicy,
        local: &LocalAddressSet,
        routes: &RouteAddresses,
    ) -> Result<RuleGraph> {
        ConfigValidator::validate(policy)?;
        ConfigValidator::validate_routes(policy, routes)?;

        let ctx = BuildContext::new(policy, routes);
        let chains = match policy.mode() {
            RedirectMode::Simple => build_simple(&ctx),
            RedirectMode::MarkSplit => build_mark_split(&ctx),
        };

        Ok(RuleGraph {
            table: policy.table_name.clone(),
            sets: ctx.address_sets(local),
            chains,
        })
    }
}

/// Output and pre-routing chains that redirect TCP to the local port
fn build_simple(ctx: &BuildContext<'_>) -> Vec<Chain> {
    let mut chains = Vec::new();

    if ctx.intercepts_output() {
        let mut output = Chain::new(CHAIN_OUTPUT, Hook::Output, PRIORITY_MANGLE, ChainType::Nat);
        output.rules = ctx.exclusions(Hook::Output);
        output.rules.push(ctx.redirect(Some(ctx.policy.tun_name.as_str())));
        chains.push(output);
    }

    chains.push(ctx.prerouting());
    chains
}

/// Output chains only mark; routing sends marked traffic through the tun.
/// Marked UDP coming back is restored from conntrack in `prerouting_udp`.
fn build_mark_split(ctx: &BuildContext<'_>) -> Vec<Chain> {
    let mut chains = Vec::new();

    if ctx.intercepts_output() {
        let mut output = Chain::new(CHAIN_OUTPUT, Hook::Output, PRIORITY_MANGLE, ChainType::Route);
        output.rules = ctx.exclusions(Hook::Output);
        output.rules.push(ctx.mark(Some(Protocol::Tcp)));
        chains.push(output);

        let mut output_udp =
            Chain::new(CHAIN_OUTPUT_UDP, Hook::Output, PRIORITY_MANGLE, ChainType::Route);
        output_udp.rules = ctx.exclusions(Hook::Output);
        output_udp.rules.push(ctx.mark(Some(Protocol::Udp)));
        chains.push(output_udp);
    }

    chains.push(ctx.prerouting());

    let mut prerouting_udp = Chain::new(
        CHAIN_PREROUTING_UDP,
        Hook::Prerouting,
        PRIORITY_MANGLE + 1,
        ChainType::Filter,
    );
    prerouting_udp.rules = ctx.interface_exclusions(Hook::Prerouting);
    prerouting_udp.rules.extend(ctx.local_exclusions());
    prerouting_udp.rules.push(Rule::new(
        RuleKind::RestoreMark,
        vec![
            Expr::L4Proto(Protocol::Udp),
            Expr::CtMark(ctx.policy.input_mark),
            Expr::MarkFromCtMark,
            Expr::Counter,
        ],
    ));
    chains.push(prerouting_udp);

    chains
}

struct BuildContext<'a> {
    policy: &'a RedirectPolicy,
    routes: &'a RouteAddresses,
    families: Vec<Family>,
}

impl<'a> BuildContext<'a> {
    fn new(policy: &'a RedirectPolicy, routes: &'a RouteAddresses) -> Self {
        let mut families = Vec::with_capacity(2);
        if policy.enable_ipv4 {
            families.push(Family::Ipv4);
        }
        if policy.enable_ipv6 {
            families.push(Family::Ipv6);
        }
        Self {
            policy,
            routes,
            families,
        }
    }

    fn intercepts_output(&self) -> bool {
        self.policy.intercepts(&self.policy.tun_name)
    }

    /// The only enabled family, when exactly one is enabled
    fn single_family(&self) -> Option<Family> {
        match self.families.as_slice() {
            [family] => Some(*family),
            _ => None,
        }
    }

    fn has_route_address(&self, family: Family) -> bool {
        self.routes
            .route_address
            .iter()
            .any(|it| Family::of(it) == family)
    }

    fn address_sets(&self, local: &LocalAddressSet) -> Vec<AddressSet> {
        let mut sets = Vec::new();

        for &family in &self.families {
            sets.push(AddressSet {
                name: family.local_address_set().to_string(),
                family,
                elements: family.networks(local.iter()),
            });

            if self.has_route_address(family) {
                sets.push(AddressSet {
                    name: family.route_address_set().to_string(),
                    family,
                    elements: family.networks(&self.routes.route_address),
                });
            }

            sets.push(AddressSet {
                name: family.route_exclude_address_set().to_string(),
                family,
                elements: family.networks(&self.routes.route_exclude_address),
            });
        }

        sets
    }

    /// All exclusion tiers for a chain on `hook`
    fn exclusions(&self, hook: Hook) -> Vec<Rule> {
        let mut rules = self.interface_exclusions(hook);

        if hook == Hook::Output && self.policy.mode() == RedirectMode::MarkSplit {
            rules.push(Rule::new(
                RuleKind::MarkExclude,
                vec![Expr::Mark(self.policy.output_mark), Expr::Return],
            ));
        }

        rules.extend(self.local_exclusions());
        rules.extend(self.route_exclusions());
        rules.extend(self.unreachable());
        rules
    }

    /// Incoming interface on pre-routing, outgoing interface on output
    fn interface_exclusions(&self, hook: Hook) -> Vec<Rule> {
        let matcher = |names: Vec<String>, negate: bool| match hook {
            Hook::Output => Expr::Oifname { names, negate },
            Hook::Prerouting => Expr::Iifname { names, negate },
        };

        let mut rules = Vec::new();

        if !self.policy.include_interface.is_empty() {
            rules.push(Rule::new(
                RuleKind::InterfaceExclude,
                vec![matcher(self.policy.include_interface.clone(), true), Expr::Return],
            ));
        }

        for name in &self.policy.exclude_interface {
            rules.push(Rule::new(
                RuleKind::InterfaceExclude,
                vec![matcher(vec![name.clone()], false), Expr::Return],
            ));
        }

        rules
    }

    fn local_exclusions(&self) -> Vec<Rule> {
        self.families
            .iter()
            .map(|&family| set_match(family, family.local_address_set(), false))
            .collect()
    }

    fn route_exclusions(&self) -> Vec<Rule> {
        let mut rules = Vec::new();
        for &family in &self.families {
            if self.has_route_address(family) {
                rules.push(set_match(family, family.route_address_set(), true));
            }
            rules.push(set_match(family, family.route_exclude_address_set(), false));
        }
        rules
    }

    /// With strict routing and one family enabled, the disabled family is
    /// rejected instead of leaking past the tunnel
    fn unreachable(&self) -> Option<Rule> {
        if !self.policy.strict_route {
            return None;
        }
        let disabled = match self.single_family()? {
            Family::Ipv4 => Family::Ipv6,
            Family::Ipv6 => Family::Ipv4,
        };
        Some(Rule::new(
            RuleKind::Unreachable,
            vec![Expr::NfProto(disabled), Expr::Reject],
        ))
    }

    fn redirect(&self, out_interface: Option<&str>) -> Rule {
        let mut exprs = Vec::new();
        if let Some(name) = out_interface {
            exprs.push(Expr::Oifname {
                names: vec![name.to_string()],
                negate: false,
            });
        }
        if let Some(family) = self.single_family() {
            exprs.push(Expr::NfProto(family));
        }
        exprs.push(Expr::L4Proto(Protocol::Tcp));
        exprs.push(Expr::Counter);
        exprs.push(Expr::Redirect {
            port: self.policy.redirect_port,
        });
        Rule::new(RuleKind::Redirect, exprs)
    }

    /// Tag traffic bound for the tun with the input mark, mirrored into
    /// conntrack so `prerouting_udp` can restore it on later packets. The
    /// output mark stays reserved for the proxy's own sockets.
    fn mark(&self, protocol: Option<Protocol>) -> Rule {
        let mut exprs = Vec::new();
        if let Some(protocol) = protocol {
            exprs.push(Expr::L4Proto(protocol));
        }
        exprs.push(Expr::SetMark(self.policy.input_mark));
        exprs.push(Expr::CtMarkFromMark);
        exprs.push(Expr::Counter);
        Rule::new(RuleKind::Mark, exprs)
    }

    fn prerouting(&self) -> Chain {
        let mut chain = Chain::new(
            CHAIN_PREROUTING,
            Hook::Prerouting,
            PRIORITY_MANGLE,
            ChainType::Nat,
        );
        chain.rules = self.exclusions(Hook::Prerouting);
        chain.rules.push(self.redirect(None));
        chain.rules.push(self.mark(None));
        chain
    }
}

fn set_match(family: Family, set: &str, negate: bool) -> Rule {
    Rule::new(
        RuleKind::AddressExclude,
        vec![
            Expr::DaddrInSet {
                family,
                set: set.to_string(),
                negate,
            },
            Expr::Return,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkInterface;
    use crate::ruleset::graph::{
        LOCAL_ADDRESS_SET_V4, LOCAL_ADDRESS_SET_V6, ROUTE_ADDRESS_SET_V4, ROUTE_ADDRESS_SET_V6,
        ROUTE_EXCLUDE_ADDRESS_SET_V4, ROUTE_EXCLUDE_ADDRESS_SET_V6,
    };
    use crate::error::{RedirectError, ValidationError};
    use ipnet::IpNet;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ipv4_policy() -> RedirectPolicy {
        RedirectPolicy {
            redirect_port: 9090,
            enable_ipv6: false,
            ..Default::default()
        }
    }

    fn local() -> LocalAddressSet {
        LocalAddressSet::compute(&[
            NetworkInterface::new("lo", vec![net("127.0.0.1/8")]),
            NetworkInterface::new("eth0", vec![net("10.0.0.5/24")]),
        ])
    }

    fn build(policy: &RedirectPolicy) -> RuleGraph {
        RuleGraph::build(policy, &local(), &policy.route_addresses()).unwrap()
    }

    fn excludes_set(chain: &Chain, set: &str) -> bool {
        chain.rules.iter().any(|rule| {
            rule.kind == RuleKind::AddressExclude
                && rule.exprs.iter().any(|it| {
                    matches!(it, Expr::DaddrInSet { set: name, negate: false, .. } if name == set)
                })
        })
    }

    #[test]
    fn test_simple_local_exclusion() {
        let graph = build(&ipv4_policy());

        let set = graph.set(LOCAL_ADDRESS_SET_V4).unwrap();
        assert_eq!(set.elements, vec![net("10.0.0.0/24"), net("127.0.0.0/8")]);
        assert!(graph.set(LOCAL_ADDRESS_SET_V6).is_none());

        for name in [CHAIN_OUTPUT, CHAIN_PREROUTING] {
            let chain = graph.chain(name).unwrap();
            assert!(excludes_set(chain, LOCAL_ADDRESS_SET_V4), "{}", name);
            assert!(chain.is_ordered());
        }

        let output = graph.chain(CHAIN_OUTPUT).unwrap();
        let redirect = output.rules.last().unwrap();
        assert_eq!(redirect.kind, RuleKind::Redirect);
        assert!(redirect.exprs.contains(&Expr::Redirect { port: 9090 }));
        assert!(redirect.exprs.contains(&Expr::NfProto(Family::Ipv4)));
        assert!(graph.chain(CHAIN_PREROUTING_UDP).is_none());
    }

    #[test]
    fn test_interface_exclude_first() {
        let policy = RedirectPolicy {
            exclude_interface: vec!["eth1".to_string()],
            mark_mode: true,
            ..Default::default()
        };
        let local = LocalAddressSet::compute(&[
            NetworkInterface::new("lo", vec![net("127.0.0.1/8")]),
            NetworkInterface::new("eth1", vec![net("203.0.113.7/24")]),
        ]);
        let graph = RuleGraph::build(&policy, &local, &RouteAddresses::default()).unwrap();

        assert_eq!(graph.chains.len(), 4);
        for chain in &graph.chains {
            let first = &chain.rules[0];
            assert_eq!(first.kind, RuleKind::InterfaceExclude, "{}", chain.name);
            let names = match &first.exprs[0] {
                Expr::Iifname { names, negate: false } | Expr::Oifname { names, negate: false } => {
                    names
                }
                other => panic!("unexpected matcher {:?}", other),
            };
            assert_eq!(names, &vec!["eth1".to_string()]);
            assert!(chain.is_ordered(), "{}", chain.name);
        }
    }

    #[test]
    fn test_mark_mode_restores_input_mark() {
        let policy = RedirectPolicy {
            mark_mode: true,
            input_mark: 100,
            ..Default::default()
        };
        let graph = build(&policy);

        let chain = graph.chain(CHAIN_PREROUTING_UDP).unwrap();
        assert_eq!(chain.priority, PRIORITY_MANGLE + 1);
        let restore = chain
            .rules
            .iter()
            .find(|it| it.kind == RuleKind::RestoreMark)
            .unwrap();
        assert!(restore.exprs.contains(&Expr::L4Proto(Protocol::Udp)));
        assert!(restore.exprs.contains(&Expr::CtMark(100)));
        assert!(restore.exprs.contains(&Expr::MarkFromCtMark));
    }

    #[test]
    fn test_mark_mode_marks_agree() {
        let policy = RedirectPolicy {
            mark_mode: true,
            input_mark: 100,
            output_mark: 200,
            ..Default::default()
        };
        let graph = build(&policy);

        let marking: Vec<&Rule> = graph
            .chains
            .iter()
            .flat_map(|it| &it.rules)
            .filter(|it| it.kind == RuleKind::Mark)
            .collect();
        // output, output_udp and prerouting each tag their traffic
        assert_eq!(marking.len(), 3);
        for rule in &marking {
            assert!(rule.exprs.contains(&Expr::SetMark(100)), "{:?}", rule);
            assert!(rule.exprs.contains(&Expr::CtMarkFromMark), "{:?}", rule);
        }
        assert!(!graph
            .chains
            .iter()
            .flat_map(|it| &it.rules)
            .any(|it| it.exprs.contains(&Expr::SetMark(200))));

        // The restored conntrack mark is the one the marking rules write
        let restore = graph
            .chain(CHAIN_PREROUTING_UDP)
            .unwrap()
            .rules
            .iter()
            .find(|it| it.kind == RuleKind::RestoreMark)
            .unwrap();
        assert!(restore.exprs.contains(&Expr::CtMark(100)));

        // The loop guard still returns the proxy's own traffic
        for name in [CHAIN_OUTPUT, CHAIN_OUTPUT_UDP] {
            let guard = &graph.chain(name).unwrap().rules[0];
            assert_eq!(guard.exprs, vec![Expr::Mark(200), Expr::Return]);
        }
    }

    #[test]
    fn test_overlapping_prefixes_merged() {
        let policy = RedirectPolicy {
            route_exclude_address: vec![net("192.168.0.0/16"), net("192.168.1.0/24")],
            ..Default::default()
        };
        let local = LocalAddressSet::compute(&[
            NetworkInterface::new("lo", vec![net("127.0.0.1/8")]),
            NetworkInterface::new("eth0", vec![net("2001:db8::5/64"), net("2001:db8::abcd/128")]),
        ]);
        let graph = RuleGraph::build(&policy, &local, &policy.route_addresses()).unwrap();

        assert_eq!(
            graph.set(LOCAL_ADDRESS_SET_V6).unwrap().elements,
            vec![net("2001:db8::/64")]
        );
        assert_eq!(
            graph.set(ROUTE_EXCLUDE_ADDRESS_SET_V4).unwrap().elements,
            vec![net("192.168.0.0/16")]
        );
    }

    #[test]
    fn test_mark_mode_output_never_redirects() {
        let policy = RedirectPolicy {
            mark_mode: true,
            ..Default::default()
        };
        let graph = build(&policy);

        for name in [CHAIN_OUTPUT, CHAIN_OUTPUT_UDP] {
            let chain = graph.chain(name).unwrap();
            assert!(!chain.rules.iter().any(Rule::is_redirect), "{}", name);
            assert_eq!(chain.rules[0].kind, RuleKind::MarkExclude);
            assert!(chain.rules[0].exprs.contains(&Expr::Mark(policy.output_mark)));
        }
        // Pre-routing still redirects TCP
        assert!(graph
            .chain(CHAIN_PREROUTING)
            .unwrap()
            .rules
            .iter()
            .any(Rule::is_redirect));
    }

    #[test]
    fn test_output_skipped_when_tun_excluded() {
        let policy = RedirectPolicy {
            exclude_interface: vec!["tun0".to_string()],
            ..Default::default()
        };
        let graph = build(&policy);
        assert!(graph.chain(CHAIN_OUTPUT).is_none());
        assert!(graph.chain(CHAIN_PREROUTING).is_some());

        let policy = RedirectPolicy {
            include_interface: vec!["eth0".to_string()],
            mark_mode: true,
            ..Default::default()
        };
        let graph = build(&policy);
        assert!(graph.chain(CHAIN_OUTPUT).is_none());
        assert!(graph.chain(CHAIN_OUTPUT_UDP).is_none());
    }

    #[test]
    fn test_include_interface_negated() {
        let policy = RedirectPolicy {
            include_interface: vec!["tun0".to_string(), "eth0".to_string()],
            ..Default::default()
        };
        let graph = build(&policy);
        let output = graph.chain(CHAIN_OUTPUT).unwrap();
        assert_eq!(
            output.rules[0].exprs[0],
            Expr::Oifname {
                names: vec!["tun0".to_string(), "eth0".to_string()],
                negate: true,
            }
        );
    }

    #[test]
    fn test_route_sets() {
        let policy = RedirectPolicy {
            route_address: vec![net("198.18.0.0/15")],
            route_exclude_address: vec![net("192.168.0.0/16"), net("fd00::/8")],
            ..Default::default()
        };
        let graph = build(&policy);

        assert!(graph.set(ROUTE_ADDRESS_SET_V4).is_some());
        assert!(graph.set(ROUTE_ADDRESS_SET_V6).is_none());
        assert_eq!(
            graph.set(ROUTE_EXCLUDE_ADDRESS_SET_V6).unwrap().elements,
            vec![net("fd00::/8")]
        );

        let prerouting = graph.chain(CHAIN_PREROUTING).unwrap();
        let include = prerouting
            .rules
            .iter()
            .find(|rule| {
                rule.exprs.iter().any(|it| {
                    matches!(it, Expr::DaddrInSet { set, negate: true, .. } if set == ROUTE_ADDRESS_SET_V4)
                })
            })
            .unwrap();
        assert_eq!(include.kind, RuleKind::AddressExclude);
    }

    #[test]
    fn test_strict_route_single_family() {
        let policy = RedirectPolicy {
            strict_route: true,
            ..ipv4_policy()
        };
        let graph = build(&policy);
        for chain in &graph.chains {
            let unreachable = chain
                .rules
                .iter()
                .find(|it| it.kind == RuleKind::Unreachable)
                .unwrap();
            assert_eq!(unreachable.exprs, vec![Expr::NfProto(Family::Ipv6), Expr::Reject]);
            assert!(chain.is_ordered());
        }

        // Both families enabled: nothing to reject
        let policy = RedirectPolicy {
            strict_route: true,
            ..Default::default()
        };
        let graph = build(&policy);
        assert!(graph
            .chains
            .iter()
            .flat_map(|it| &it.rules)
            .all(|it| it.kind != RuleKind::Unreachable));
    }

    #[test]
    fn test_ordering_across_policies() {
        for mark_mode in [false, true] {
            for strict_route in [false, true] {
                for enable_ipv6 in [false, true] {
                    let policy = RedirectPolicy {
                        mark_mode,
                        strict_route,
                        enable_ipv6,
                        include_interface: vec!["tun0".to_string(), "br-lan".to_string()],
                        exclude_interface: vec!["wan".to_string()],
                        route_exclude_address: vec![net("192.168.0.0/16")],
                        ..Default::default()
                    };
                    let graph = build(&policy);
                    for chain in &graph.chains {
                        assert!(chain.is_ordered(), "{:?} {}", policy, chain.name);
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let policy = RedirectPolicy {
            enable_ipv4: false,
            enable_ipv6: false,
            ..Default::default()
        };
        let result = RuleGraph::build(&policy, &local(), &RouteAddresses::default());
        assert!(matches!(
            result,
            Err(RedirectError::Validation(ValidationError::NoFamilyEnabled))
        ));
    }
}
