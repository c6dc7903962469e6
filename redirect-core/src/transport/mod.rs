//! Packet filter transport
//!
//! A session batches mutating operations and applies them atomically on
//! [`NftSession::commit`]. Dropping a session without committing discards
//! the batch, which is how failed installs roll back. Queries run against
//! committed kernel state immediately.

pub mod cli;
pub mod memory;

pub use cli::NftCli;
pub use memory::{FaultPoint, MemoryBackend};

use crate::error::TransportError;
use crate::ruleset::{render, AddressSet, Chain, Family, Rule};
use ipnet::IpNet;
use nftables::batch::Batch;
use nftables::schema::{FlushObject, NfCmd, NfListObject, Nftables};

pub type Result<T> = std::result::Result<T, TransportError>;

/// A rule as listed from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    pub handle: u32,
    pub comment: Option<String>,
}

/// One mutating operation of a batch. All operations target the inet family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTable {
        table: String,
    },
    DeleteTable {
        table: String,
    },
    /// Base chain definition; rules are added separately
    AddChain {
        table: String,
        chain: Chain,
    },
    AddRule {
        table: String,
        chain: String,
        rule: Rule,
    },
    /// Prepend a rule to an existing chain
    InsertRule {
        table: String,
        chain: String,
        rule: Rule,
    },
    DeleteRule {
        table: String,
        chain: String,
        handle: u32,
    },
    AddSet {
        table: String,
        set: AddressSet,
    },
    FlushSet {
        table: String,
        family: Family,
        set: String,
    },
    AddElements {
        table: String,
        set: String,
        elements: Vec<IpNet>,
    },
    DeleteElements {
        table: String,
        set: String,
        elements: Vec<IpNet>,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::AddTable { .. } => "add table",
            Op::DeleteTable { .. } => "delete table",
            Op::AddChain { .. } => "add chain",
            Op::AddRule { .. } => "add rule",
            Op::InsertRule { .. } => "insert rule",
            Op::DeleteRule { .. } => "delete rule",
            Op::AddSet { .. } => "add set",
            Op::FlushSet { .. } => "flush set",
            Op::AddElements { .. } => "add element",
            Op::DeleteElements { .. } => "delete element",
        }
    }

    /// The nftables command for this operation
    pub fn to_command(&self) -> NfCmd<'static> {
        match self {
            Op::AddTable { table } => NfCmd::Add(NfListObject::Table(render::table(table))),
            Op::DeleteTable { table } => NfCmd::Delete(NfListObject::Table(render::table(table))),
            Op::AddChain { table, chain } => {
                NfCmd::Add(NfListObject::Chain(render::chain(table, chain)))
            }
            Op::AddRule { table, chain, rule } => {
                NfCmd::Add(NfListObject::Rule(render::rule(table, chain, rule)))
            }
            Op::InsertRule { table, chain, rule } => {
                NfCmd::Insert(NfListObject::Rule(render::rule(table, chain, rule)))
            }
            Op::DeleteRule {
                table,
                chain,
                handle,
            } => NfCmd::Delete(NfListObject::Rule(render::rule_handle(table, chain, *handle))),
            Op::AddSet { table, set } => {
                NfCmd::Add(NfListObject::Set(Box::new(render::set(table, set))))
            }
            Op::FlushSet { table, family, set } => {
                NfCmd::Flush(FlushObject::Set(Box::new(render::set_ref(table, *family, set))))
            }
            Op::AddElements {
                table,
                set,
                elements,
            } => NfCmd::Add(NfListObject::Element(render::elements(table, set, elements))),
            Op::DeleteElements {
                table,
                set,
                elements,
            } => NfCmd::Delete(NfListObject::Element(render::elements(table, set, elements))),
        }
    }
}

/// A batch against the kernel packet filter
pub trait NftSession: Send {
    /// Whether the inet table exists in committed state
    fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Rules of a chain in committed state, in evaluation order
    fn list_rules(&mut self, table: &str, chain: &str) -> Result<Vec<RuleInfo>>;

    /// Append an operation to the pending batch
    fn queue(&mut self, op: Op) -> Result<()>;

    /// Apply the pending batch atomically. An empty batch is a no-op.
    fn commit(&mut self) -> Result<()>;

    fn add_table(&mut self, table: &str) -> Result<()> {
        self.queue(Op::AddTable {
            table: table.to_string(),
        })
    }

    fn delete_table(&mut self, table: &str) -> Result<()> {
        self.queue(Op::DeleteTable {
            table: table.to_string(),
        })
    }

    fn add_chain(&mut self, table: &str, chain: &Chain) -> Result<()> {
        let mut chain = chain.clone();
        chain.rules.clear();
        self.queue(Op::AddChain {
            table: table.to_string(),
            chain,
        })
    }

    fn add_rule(&mut self, table: &str, chain: &str, rule: &Rule) -> Result<()> {
        self.queue(Op::AddRule {
            table: table.to_string(),
            chain: chain.to_string(),
            rule: rule.clone(),
        })
    }

    fn insert_rule(&mut self, table: &str, chain: &str, rule: &Rule) -> Result<()> {
        self.queue(Op::InsertRule {
            table: table.to_string(),
            chain: chain.to_string(),
            rule: rule.clone(),
        })
    }

    fn delete_rule(&mut self, table: &str, chain: &str, handle: u32) -> Result<()> {
        self.queue(Op::DeleteRule {
            table: table.to_string(),
            chain: chain.to_string(),
            handle,
        })
    }

    /// Declare a set; elements are added separately
    fn add_set(&mut self, table: &str, set: &AddressSet) -> Result<()> {
        self.queue(Op::AddSet {
            table: table.to_string(),
            set: AddressSet {
                elements: Vec::new(),
                ..set.clone()
            },
        })
    }

    fn flush_set(&mut self, table: &str, family: Family, set: &str) -> Result<()> {
        self.queue(Op::FlushSet {
            table: table.to_string(),
            family,
            set: set.to_string(),
        })
    }

    fn add_set_elements(&mut self, table: &str, set: &str, elements: &[IpNet]) -> Result<()> {
        self.queue(Op::AddElements {
            table: table.to_string(),
            set: set.to_string(),
            elements: elements.to_vec(),
        })
    }

    fn delete_set_elements(&mut self, table: &str, set: &str, elements: &[IpNet]) -> Result<()> {
        self.queue(Op::DeleteElements {
            table: table.to_string(),
            set: set.to_string(),
            elements: elements.to_vec(),
        })
    }
}

/// Opens sessions against one packet filter
pub trait NftBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn NftSession>>;
}

/// Render a batch into one nftables document
pub fn batch_document(ops: &[Op]) -> Nftables<'static> {
    let mut batch = Batch::new();
    for op in ops {
        batch.add_cmd(op.to_command());
    }
    batch.to_nftables()
}
