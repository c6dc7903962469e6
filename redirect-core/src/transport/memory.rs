//! In-memory packet filter
//!
//! Models committed kernel state for the inet family closely enough to catch
//! ordering mistakes: operations on missing objects are rejected, interval
//! sets refuse overlapping elements, and a rejected batch leaves state
//! untouched. Used for tests and dry runs.

use super::{batch_document, NftBackend, NftSession, Op, Result, RuleInfo};
use crate::error::TransportError;
use crate::ruleset::Rule;
use indexmap::{IndexMap, IndexSet};
use ipnet::IpNet;
use nftables::schema::Nftables;
use std::sync::{Arc, Mutex, MutexGuard};

/// Step at which an armed fault fires once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Open,
    Query,
    AddChain,
    AddRule,
    AddElements,
    DeleteElements,
    Commit,
}

impl FaultPoint {
    fn of(op: &Op) -> Option<Self> {
        match op {
            Op::AddChain { .. } => Some(FaultPoint::AddChain),
            Op::AddRule { .. } | Op::InsertRule { .. } => Some(FaultPoint::AddRule),
            Op::AddElements { .. } => Some(FaultPoint::AddElements),
            Op::DeleteElements { .. } => Some(FaultPoint::DeleteElements),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TableState {
    chains: IndexMap<String, Vec<(u32, Rule)>>,
    sets: IndexMap<String, IndexSet<IpNet>>,
}

#[derive(Debug, Default)]
struct Kernel {
    tables: IndexMap<String, TableState>,
    next_handle: u32,
    commits: Vec<Vec<Op>>,
    faults: Vec<FaultPoint>,
    sessions: usize,
}

impl Kernel {
    fn take_fault(&mut self, point: FaultPoint) -> Result<()> {
        if let Some(pos) = self.faults.iter().position(|it| *it == point) {
            self.faults.remove(pos);
            return Err(TransportError::Failed(format!("injected fault at {:?}", point)));
        }
        Ok(())
    }

    /// Apply a batch to a copy of the state and swap it in only on success
    fn apply(&mut self, ops: &[Op]) -> Result<()> {
        let mut tables = self.tables.clone();
        let mut next_handle = self.next_handle;

        for op in ops {
            apply_op(&mut tables, &mut next_handle, op)?;
        }

        self.tables = tables;
        self.next_handle = next_handle;
        Ok(())
    }
}

fn missing(what: &str) -> TransportError {
    TransportError::Rejected {
        stderr: format!("Error: Could not process rule: No such file or directory ({})", what),
    }
}

fn conflict(network: &IpNet, existing: &IpNet, set: &str) -> TransportError {
    TransportError::Rejected {
        stderr: format!(
            "Error: Could not process rule: File exists ({} overlaps {} in {}: conflicting intervals specified)",
            network, existing, set
        ),
    }
}

/// Insert into an interval set. Re-adding a stored network is a no-op; any
/// other overlap is refused, as nft does for sets without auto-merge.
fn insert_interval(current: &mut IndexSet<IpNet>, network: IpNet, set: &str) -> Result<()> {
    if current.contains(&network) {
        return Ok(());
    }
    if let Some(existing) = current
        .iter()
        .find(|it| it.contains(&network) || network.contains(*it))
    {
        return Err(conflict(&network, existing, set));
    }
    current.insert(network);
    Ok(())
}

fn table_mut<'a>(
    tables: &'a mut IndexMap<String, TableState>,
    name: &str,
) -> Result<&'a mut TableState> {
    tables
        .get_mut(name)
        .ok_or_else(|| missing(&format!("table {}", name)))
}

fn apply_op(
    tables: &mut IndexMap<String, TableState>,
    next_handle: &mut u32,
    op: &Op,
) -> Result<()> {
    match op {
        Op::AddTable { table } => {
            tables.entry(table.clone()).or_default();
        }
        Op::DeleteTable { table } => {
            tables
                .shift_remove(table)
                .ok_or_else(|| missing(&format!("table {}", table)))?;
        }
        Op::AddChain { table, chain } => {
            table_mut(tables, table)?
                .chains
                .entry(chain.name.clone())
                .or_default();
        }
        Op::AddRule { table, chain, rule } | Op::InsertRule { table, chain, rule } => {
            let rules = table_mut(tables, table)?
                .chains
                .get_mut(chain)
                .ok_or_else(|| missing(&format!("chain {}", chain)))?;
            *next_handle += 1;
            let entry = (*next_handle, rule.clone());
            if matches!(op, Op::InsertRule { .. }) {
                rules.insert(0, entry);
            } else {
                rules.push(entry);
            }
        }
        Op::DeleteRule {
            table,
            chain,
            handle,
        } => {
            let rules = table_mut(tables, table)?
                .chains
                .get_mut(chain)
                .ok_or_else(|| missing(&format!("chain {}", chain)))?;
            let pos = rules
                .iter()
                .position(|(it, _)| it == handle)
                .ok_or_else(|| missing(&format!("rule handle {}", handle)))?;
            rules.remove(pos);
        }
        Op::AddSet { table, set } => {
            table_mut(tables, table)?
                .sets
                .entry(set.name.clone())
                .or_default();
        }
        Op::FlushSet { table, set, .. } => {
            table_mut(tables, table)?
                .sets
                .get_mut(set)
                .ok_or_else(|| missing(&format!("set {}", set)))?
                .clear();
        }
        Op::AddElements {
            table,
            set,
            elements,
        } => {
            let current = table_mut(tables, table)?
                .sets
                .get_mut(set)
                .ok_or_else(|| missing(&format!("set {}", set)))?;
            for network in elements.iter().map(IpNet::trunc) {
                insert_interval(current, network, set)?;
            }
        }
        Op::DeleteElements {
            table,
            set,
            elements,
        } => {
            let current = table_mut(tables, table)?
                .sets
                .get_mut(set)
                .ok_or_else(|| missing(&format!("set {}", set)))?;
            let networks: IndexSet<IpNet> = elements.iter().map(IpNet::trunc).collect();
            for network in networks {
                if !current.shift_remove(&network) {
                    return Err(missing(&format!("element {} in {}", network, set)));
                }
            }
        }
    }
    Ok(())
}

/// Shared in-memory kernel; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    kernel: Arc<Mutex<Kernel>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Kernel>> {
        self.kernel
            .lock()
            .map_err(|_| TransportError::Failed("memory kernel lock poisoned".to_string()))
    }

    fn read<T: Default>(&self, f: impl FnOnce(&Kernel) -> T) -> T {
        self.kernel.lock().map(|it| f(&it)).unwrap_or_default()
    }

    /// Arm a one-shot fault
    pub fn fail_on(&self, point: FaultPoint) {
        if let Ok(mut kernel) = self.kernel.lock() {
            kernel.faults.push(point);
        }
    }

    /// Create a table with empty chains outside of any batch
    pub fn seed_table(&self, table: &str, chains: &[&str]) {
        if let Ok(mut kernel) = self.kernel.lock() {
            let state = kernel.tables.entry(table.to_string()).or_default();
            for chain in chains {
                state.chains.entry(chain.to_string()).or_default();
            }
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.read(|k| k.tables.contains_key(table))
    }

    pub fn chain_names(&self, table: &str) -> Vec<String> {
        self.read(|k| {
            k.tables
                .get(table)
                .map(|t| t.chains.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<Rule> {
        self.read(|k| {
            k.tables
                .get(table)
                .and_then(|t| t.chains.get(chain))
                .map(|rules| rules.iter().map(|(_, rule)| rule.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Elements of a set as stored by the kernel: truncated networks
    pub fn set_elements(&self, table: &str, set: &str) -> Option<Vec<IpNet>> {
        self.read(|k| {
            k.tables
                .get(table)
                .and_then(|t| t.sets.get(set))
                .map(|elements| elements.iter().copied().collect())
        })
    }

    /// Every committed batch, oldest first
    pub fn commits(&self) -> Vec<Vec<Op>> {
        self.read(|k| k.commits.clone())
    }

    /// Committed batches as nftables documents
    pub fn committed_documents(&self) -> Vec<Nftables<'static>> {
        self.commits().iter().map(|ops| batch_document(ops)).collect()
    }

    /// Number of sessions opened so far
    pub fn sessions_opened(&self) -> usize {
        self.read(|k| k.sessions)
    }
}

impl NftBackend for MemoryBackend {
    fn open(&self) -> Result<Box<dyn NftSession>> {
        let mut kernel = self.lock()?;
        kernel.take_fault(FaultPoint::Open)?;
        kernel.sessions += 1;
        Ok(Box::new(MemorySession {
            backend: self.clone(),
            pending: Vec::new(),
        }))
    }
}

struct MemorySession {
    backend: MemoryBackend,
    pending: Vec<Op>,
}

impl NftSession for MemorySession {
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let mut kernel = self.backend.lock()?;
        kernel.take_fault(FaultPoint::Query)?;
        Ok(kernel.tables.contains_key(table))
    }

    fn list_rules(&mut self, table: &str, chain: &str) -> Result<Vec<RuleInfo>> {
        let mut kernel = self.backend.lock()?;
        kernel.take_fault(FaultPoint::Query)?;
        let rules = kernel
            .tables
            .get(table)
            .and_then(|t| t.chains.get(chain))
            .ok_or_else(|| missing(&format!("chain {}", chain)))?;
        Ok(rules
            .iter()
            .map(|(handle, rule)| RuleInfo {
                handle: *handle,
                comment: rule.comment.clone(),
            })
            .collect())
    }

    fn queue(&mut self, op: Op) -> Result<()> {
        if let Some(point) = FaultPoint::of(&op) {
            self.backend.lock()?.take_fault(point)?;
        }
        self.pending.push(op);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        let mut kernel = self.backend.lock()?;
        kernel.take_fault(FaultPoint::Commit)?;
        kernel.apply(&ops)?;
        kernel.commits.push(ops);
        Ok(())
    }
}
