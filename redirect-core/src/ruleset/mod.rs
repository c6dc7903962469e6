//! nftables rule graph: model, construction and JSON rendering

pub mod builder;
pub mod graph;
pub mod render;

pub use graph::{
    AddressSet, Chain, ChainType, Expr, Family, Hook, Protocol, Rule, RuleGraph, RuleKind,
    CHAIN_OUTPUT, CHAIN_OUTPUT_UDP, CHAIN_PREROUTING, CHAIN_PREROUTING_UDP, PRIORITY_MANGLE,
};
