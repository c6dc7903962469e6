//! Transport that drives the `nft` command line tool through the `nftables`
//! helpers

use super::{batch_document, NftBackend, NftSession, Op, Result, RuleInfo};
use crate::error::TransportError;
use crate::ruleset::render::TABLE_FAMILY;
use nftables::helper::{apply_ruleset_with_args, get_current_ruleset_with_args};
use nftables::schema::{NfListObject, NfObject, Nftables};
use std::path::PathBuf;
use tracing::{debug, trace};

const DEFAULT_PROGRAM: &str = "nft";
const LIST_RULESET: [&str; 2] = ["list", "ruleset"];
const NO_ARGS: [&str; 0] = [];

/// Backend spawning `nft`; each batch is applied with one `nft -j -f -`
/// call, which commits it as one kernel transaction
#[derive(Debug, Clone)]
pub struct NftCli {
    program: PathBuf,
}

impl Default for NftCli {
    fn default() -> Self {
        Self::new()
    }
}

impl NftCli {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn ruleset(&self) -> Result<Nftables<'static>> {
        trace!("Listing ruleset with {}", self.program.display());
        Ok(get_current_ruleset_with_args(
            Some(self.program.as_path()),
            LIST_RULESET,
        )?)
    }

    fn apply(&self, document: &Nftables<'_>) -> Result<()> {
        apply_ruleset_with_args(document, Some(self.program.as_path()), NO_ARGS)?;
        Ok(())
    }
}

impl NftBackend for NftCli {
    fn open(&self) -> Result<Box<dyn NftSession>> {
        Ok(Box::new(CliSession {
            cli: self.clone(),
            pending: Vec::new(),
        }))
    }
}

struct CliSession {
    cli: NftCli,
    pending: Vec<Op>,
}

impl NftSession for CliSession {
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(has_table(&self.cli.ruleset()?, table))
    }

    fn list_rules(&mut self, table: &str, chain: &str) -> Result<Vec<RuleInfo>> {
        chain_rules(&self.cli.ruleset()?, table, chain)
    }

    fn queue(&mut self, op: Op) -> Result<()> {
        trace!("Queued {}", op.name());
        self.pending.push(op);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        debug!("Committing {} nft operations", ops.len());
        self.cli.apply(&batch_document(&ops))
    }
}

fn has_table(ruleset: &Nftables<'_>, table: &str) -> bool {
    ruleset.objects.iter().any(|it| {
        matches!(
            it,
            NfObject::ListObject(NfListObject::Table(t)) if t.family == TABLE_FAMILY && t.name == table
        )
    })
}

/// Rule handles and comments of one chain, in listing order
fn chain_rules(ruleset: &Nftables<'_>, table: &str, chain: &str) -> Result<Vec<RuleInfo>> {
    let mut rules = Vec::new();
    for object in ruleset.objects.iter() {
        let NfObject::ListObject(NfListObject::Rule(rule)) = object else {
            continue;
        };
        if rule.family != TABLE_FAMILY || rule.table != table || rule.chain != chain {
            continue;
        }
        let handle = rule
            .handle
            .ok_or_else(|| TransportError::Malformed("rule without handle".to_string()))?;
        rules.push(RuleInfo {
            handle,
            comment: rule.comment.as_deref().map(str::to_string),
        });
    }
    Ok(rules)
}
