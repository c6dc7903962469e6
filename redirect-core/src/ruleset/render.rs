//! Rendering of rule graph objects into `nftables` schema objects
//!
//! Objects render without their command wrapper; the transport wraps them
//! into `add`, `insert`, `flush` or `delete` commands of one batch.

use super::graph::{AddressSet, Chain, ChainType, Expr, Family, Hook, Rule};
use ipnet::IpNet;
use nftables::expr::{
    Expression, Meta, MetaKey, NamedExpression, Payload, PayloadField, Prefix, SetItem, CT,
};
use nftables::schema::{
    Chain as NfChain, Element, Rule as NfRule, Set, SetFlag, SetType, SetTypeValue, Table,
};
use nftables::stmt::{Counter, Mangle, Match, Operator, Reject, RejectType, Statement, NAT};
use nftables::types::{NfChainPolicy, NfChainType, NfFamily, NfHook, RejectCode};
use std::borrow::Cow;
use std::collections::HashSet;

pub const TABLE_FAMILY: NfFamily = NfFamily::INet;

fn owned(value: &str) -> Cow<'static, str> {
    Cow::Owned(value.to_string())
}

pub fn table(name: &str) -> Table<'static> {
    Table {
        family: TABLE_FAMILY,
        name: owned(name),
        handle: None,
    }
}

pub fn chain(table: &str, chain: &Chain) -> NfChain<'static> {
    NfChain {
        family: TABLE_FAMILY,
        table: owned(table),
        name: owned(&chain.name),
        newname: None,
        handle: None,
        _type: Some(match chain.chain_type {
            ChainType::Nat => NfChainType::NAT,
            ChainType::Route => NfChainType::Route,
            ChainType::Filter => NfChainType::Filter,
        }),
        hook: Some(match chain.hook {
            Hook::Output => NfHook::Output,
            Hook::Prerouting => NfHook::Prerouting,
        }),
        prio: Some(chain.priority),
        dev: None,
        policy: Some(NfChainPolicy::Accept),
    }
}

/// Interval set declaration; elements are added separately
pub fn set(table: &str, set: &AddressSet) -> Set<'static> {
    Set {
        flags: Some(HashSet::from([SetFlag::Interval])),
        ..set_ref(table, set.family, &set.name)
    }
}

/// Set reference for flush commands
pub fn set_ref(table: &str, family: Family, name: &str) -> Set<'static> {
    Set {
        family: TABLE_FAMILY,
        table: owned(table),
        name: owned(name),
        handle: None,
        set_type: SetTypeValue::Single(match family {
            Family::Ipv4 => SetType::Ipv4Addr,
            Family::Ipv6 => SetType::Ipv6Addr,
        }),
        policy: None,
        flags: None,
        elem: None,
        timeout: None,
        gc_interval: None,
        size: None,
        comment: None,
    }
}

/// Prefix elements, rendered by network address. Callers pass disjoint
/// networks (see [`Family::networks`]).
pub fn elements(table: &str, set: &str, networks: &[IpNet]) -> Element<'static> {
    Element {
        family: TABLE_FAMILY,
        table: owned(table),
        name: owned(set),
        elem: Cow::Owned(networks.iter().map(prefix).collect()),
    }
}

fn prefix(net: &IpNet) -> Expression<'static> {
    Expression::Named(NamedExpression::Prefix(Prefix {
        addr: Box::new(Expression::String(Cow::Owned(net.network().to_string()))),
        len: u32::from(net.prefix_len()),
    }))
}

pub fn rule(table: &str, chain: &str, rule: &Rule) -> NfRule<'static> {
    NfRule {
        family: TABLE_FAMILY,
        table: owned(table),
        chain: owned(chain),
        expr: Cow::Owned(rule.exprs.iter().map(statement).collect()),
        handle: None,
        index: None,
        comment: rule.comment.as_deref().map(owned),
    }
}

/// Rule reference by kernel handle, for deletion
pub fn rule_handle(table: &str, chain: &str, handle: u32) -> NfRule<'static> {
    NfRule {
        family: TABLE_FAMILY,
        table: owned(table),
        chain: owned(chain),
        expr: Cow::Owned(Vec::new()),
        handle: Some(handle),
        index: None,
        comment: None,
    }
}

fn matches(op: Operator, left: Expression<'static>, right: Expression<'static>) -> Statement<'static> {
    Statement::Match(Match { left, right, op })
}

fn equality(negate: bool) -> Operator {
    if negate {
        Operator::NEQ
    } else {
        Operator::EQ
    }
}

fn meta(key: MetaKey) -> Expression<'static> {
    Expression::Named(NamedExpression::Meta(Meta { key }))
}

fn ct_mark() -> Expression<'static> {
    Expression::Named(NamedExpression::CT(CT {
        key: Cow::Borrowed("mark"),
        family: None,
        dir: None,
    }))
}

fn string(value: &str) -> Expression<'static> {
    Expression::String(owned(value))
}

fn interfaces(key: MetaKey, names: &[String], negate: bool) -> Statement<'static> {
    let right = match names {
        [single] => string(single),
        _ => Expression::Named(NamedExpression::Set(
            names
                .iter()
                .map(|it| SetItem::Element(string(it)))
                .collect(),
        )),
    };
    matches(equality(negate), meta(key), right)
}

fn daddr(family: Family) -> Expression<'static> {
    Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
        protocol: Cow::Borrowed(family.payload_protocol()),
        field: Cow::Borrowed("daddr"),
    })))
}

pub fn statement(expr: &Expr) -> Statement<'static> {
    match expr {
        Expr::Iifname { names, negate } => interfaces(MetaKey::Iifname, names, *negate),
        Expr::Oifname { names, negate } => interfaces(MetaKey::Oifname, names, *negate),
        Expr::L4Proto(protocol) => matches(
            Operator::EQ,
            meta(MetaKey::L4proto),
            string(protocol.as_str()),
        ),
        Expr::NfProto(family) => {
            matches(Operator::EQ, meta(MetaKey::Nfproto), string(family.nfproto()))
        }
        Expr::DaddrInSet {
            family,
            set,
            negate,
        } => matches(
            equality(*negate),
            daddr(*family),
            Expression::String(Cow::Owned(format!("@{}", set))),
        ),
        Expr::Mark(mark) => matches(Operator::EQ, meta(MetaKey::Mark), Expression::Number(*mark)),
        Expr::CtMark(mark) => matches(Operator::EQ, ct_mark(), Expression::Number(*mark)),
        Expr::Counter => Statement::Counter(Counter::Anonymous(None)),
        Expr::SetMark(mark) => Statement::Mangle(Mangle {
            key: meta(MetaKey::Mark),
            value: Expression::Number(*mark),
        }),
        Expr::CtMarkFromMark => Statement::Mangle(Mangle {
            key: ct_mark(),
            value: meta(MetaKey::Mark),
        }),
        Expr::MarkFromCtMark => Statement::Mangle(Mangle {
            key: meta(MetaKey::Mark),
            value: ct_mark(),
        }),
        Expr::Redirect { port } => Statement::Redirect(Some(NAT {
            addr: None,
            family: None,
            port: Some(Expression::Number(u32::from(*port))),
            flags: None,
        })),
        Expr::Reject => Statement::Reject(Some(Reject {
            _type: Some(RejectType::ICMPX),
            expr: Some(RejectCode::AdminProhibited),
        })),
        Expr::Return => Statement::Return(None),
        Expr::Accept => Statement::Accept(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::graph::{Protocol, RuleKind, PRIORITY_MANGLE};
    use serde_json::{json, Value};

    fn to_json<T: serde::Serialize>(value: &T) -> Value {
        serde_json::to_value(value).unwrap()
    }

    #[test]
    fn test_chain() {
        let chain = Chain::new("prerouting_udp", Hook::Prerouting, PRIORITY_MANGLE + 1, ChainType::Filter);
        let value = to_json(&super::chain("auto_redirect", &chain));

        assert_eq!(value["family"], "inet");
        assert_eq!(value["table"], "auto_redirect");
        assert_eq!(value["name"], "prerouting_udp");
        assert_eq!(value["type"], "filter");
        assert_eq!(value["hook"], "prerouting");
        assert_eq!(value["prio"], -149);
        assert_eq!(value["policy"], "accept");
    }

    #[test]
    fn test_redirect_rule() {
        let redirect = Rule::new(
            RuleKind::Redirect,
            vec![
                Expr::Oifname {
                    names: vec!["tun0".to_string()],
                    negate: false,
                },
                Expr::L4Proto(Protocol::Tcp),
                Expr::Redirect { port: 7892 },
            ],
        );
        let value = to_json(&rule("auto_redirect", "output", &redirect));
        let exprs = value["expr"].as_array().unwrap();

        assert_eq!(exprs[0]["match"]["left"]["meta"]["key"], "oifname");
        assert_eq!(exprs[0]["match"]["op"], "==");
        assert_eq!(exprs[0]["match"]["right"], "tun0");
        assert_eq!(exprs[1]["match"]["right"], "tcp");
        assert_eq!(exprs[2]["redirect"]["port"], 7892);
        assert!(value.get("comment").map_or(true, Value::is_null));
    }

    #[test]
    fn test_negated_interface_set() {
        let value = to_json(&statement(&Expr::Iifname {
            names: vec!["br-lan".to_string(), "tun0".to_string()],
            negate: true,
        }));
        assert_eq!(value["match"]["op"], "!=");
        assert_eq!(value["match"]["right"], json!({ "set": ["br-lan", "tun0"] }));
    }

    #[test]
    fn test_daddr_set_match() {
        let value = to_json(&statement(&Expr::DaddrInSet {
            family: Family::Ipv6,
            set: "inet6_local_address_set".to_string(),
            negate: false,
        }));
        assert_eq!(value["match"]["left"]["payload"]["protocol"], "ip6");
        assert_eq!(value["match"]["left"]["payload"]["field"], "daddr");
        assert_eq!(value["match"]["right"], "@inet6_local_address_set");
    }

    #[test]
    fn test_interval_set() {
        let declared = AddressSet {
            name: "inet4_local_address_set".to_string(),
            family: Family::Ipv4,
            elements: Vec::new(),
        };
        let value = to_json(&set("auto_redirect", &declared));
        assert_eq!(value["type"], "ipv4_addr");
        assert_eq!(value["flags"], json!(["interval"]));

        let flushed = to_json(&set_ref("auto_redirect", Family::Ipv6, "inet6_route_exclude_address_set"));
        assert_eq!(flushed["type"], "ipv6_addr");
        assert!(flushed.get("flags").map_or(true, Value::is_null));
    }

    #[test]
    fn test_elements_by_network() {
        let networks: Vec<IpNet> = vec!["10.0.0.5/24".parse().unwrap(), "2001:db8::/64".parse().unwrap()];
        let value = to_json(&elements("auto_redirect", "s", &networks));
        assert_eq!(
            value["elem"],
            json!([
                { "prefix": { "addr": "10.0.0.0", "len": 24 } },
                { "prefix": { "addr": "2001:db8::", "len": 64 } },
            ])
        );
    }

    #[test]
    fn test_mark_mangles() {
        let value = to_json(&statement(&Expr::SetMark(0x2024)));
        assert_eq!(value["mangle"]["key"], json!({ "meta": { "key": "mark" } }));
        assert_eq!(value["mangle"]["value"], 0x2024);

        let value = to_json(&statement(&Expr::MarkFromCtMark));
        assert_eq!(value["mangle"]["key"]["meta"]["key"], "mark");
        assert_eq!(value["mangle"]["value"]["ct"]["key"], "mark");
    }

    #[test]
    fn test_rule_handle() {
        let value = to_json(&rule_handle("fw4", "input", 42));
        assert_eq!(value["handle"], 42);
        assert_eq!(value["chain"], "input");
    }
}
