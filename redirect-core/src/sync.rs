//! Applies rule graphs and element patches to the packet filter
//!
//! Every mutating operation runs in one session and commits once, so the
//! kernel sees either the whole change or none of it.

use crate::address::LocalAddressSet;
use crate::companion::CompanionFirewall;
use crate::config::{RedirectPolicy, RouteAddresses};
use crate::error::{CompanionError, RedirectError, Result, ValidationError};
use crate::ruleset::{Family, RuleGraph};
use crate::transport::{NftBackend, NftSession};
use ipnet::IpNet;
use tracing::{debug, info, warn};

pub struct Synchronizer<'a> {
    backend: &'a dyn NftBackend,
    table: &'a str,
    families: Vec<Family>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(backend: &'a dyn NftBackend, policy: &'a RedirectPolicy) -> Self {
        let mut families = Vec::with_capacity(2);
        if policy.enable_ipv4 {
            families.push(Family::Ipv4);
        }
        if policy.enable_ipv6 {
            families.push(Family::Ipv6);
        }
        Self {
            backend,
            table: &policy.table_name,
            families,
        }
    }

    /// Replace the table with `graph` and configure the companion, in one
    /// batch. On any failure nothing is committed.
    pub fn install(&self, graph: &RuleGraph, companion: &dyn CompanionFirewall) -> Result<()> {
        let mut session = self.backend.open()?;
        let table = graph.table.as_str();

        if session.table_exists(table)? {
            debug!("Replacing stale table {}", table);
            session.delete_table(table)?;
        }
        session.add_table(table)?;

        for set in &graph.sets {
            session.add_set(table, set)?;
            if !set.elements.is_empty() {
                session.add_set_elements(table, &set.name, &set.elements)?;
            }
        }

        for chain in &graph.chains {
            session.add_chain(table, chain)?;
            for rule in &chain.rules {
                session.add_rule(table, &chain.name, rule)?;
            }
        }

        companion.configure(session.as_mut(), false)?;
        session.commit()?;

        info!("Installed {}", graph);
        Ok(())
    }

    /// Patch the local address sets from `old` to `new`. Sets whose merged
    /// networks are equal return without touching the kernel.
    pub fn update_local_addresses(
        &self,
        old: &LocalAddressSet,
        new: &LocalAddressSet,
    ) -> Result<()> {
        if LocalAddressSet::diff(old, new).is_empty() {
            debug!("Local addresses unchanged");
            return Ok(());
        }

        // The kernel holds the merged networks of `old`. Removals go first in
        // the batch so a network can be replaced by an overlapping one.
        let patches: Vec<SetPatch> = self
            .families
            .iter()
            .map(|&family| SetPatch::between(family, old, new))
            .filter(|it| !it.is_empty())
            .collect();
        if patches.is_empty() {
            debug!("Local networks unchanged");
            return Ok(());
        }

        let mut session = self.open_installed()?;
        for patch in &patches {
            let set = patch.family.local_address_set();
            if !patch.removed.is_empty() {
                session.delete_set_elements(self.table, set, &patch.removed)?;
            }
            if !patch.added.is_empty() {
                session.add_set_elements(self.table, set, &patch.added)?;
            }
        }
        session.commit()?;

        for patch in &patches {
            debug!(
                "Updated {}: +{} -{}",
                patch.family.local_address_set(),
                patch.added.len(),
                patch.removed.len()
            );
        }
        Ok(())
    }

    /// Refill the route address sets. The include set is only present when
    /// installed non-empty, so toggling it needs a reinstall.
    pub fn update_route_addresses(&self, old: &RouteAddresses, new: &RouteAddresses) -> Result<()> {
        if old == new {
            debug!("Route addresses unchanged");
            return Ok(());
        }

        for &family in &self.families {
            if has_family(&old.route_address, family) != has_family(&new.route_address, family) {
                return Err(ValidationError::RouteShapeChanged {
                    set: family.route_address_set().to_string(),
                }
                .into());
            }
        }

        let mut session = self.open_installed()?;

        for &family in &self.families {
            if has_family(&new.route_address, family) {
                let set = family.route_address_set();
                session.flush_set(self.table, family, set)?;
                session.add_set_elements(self.table, set, &family.networks(&new.route_address))?;
            }

            let set = family.route_exclude_address_set();
            session.flush_set(self.table, family, set)?;
            let elements = family.networks(&new.route_exclude_address);
            if !elements.is_empty() {
                session.add_set_elements(self.table, set, &elements)?;
            }
        }

        session.commit()?;
        info!("Updated route address sets");
        Ok(())
    }

    /// Delete the table and revert the companion. Every step is attempted;
    /// packet filter failures are logged, a companion failure is returned.
    pub fn teardown(&self, companion: &dyn CompanionFirewall) -> Result<()> {
        let mut session = match self.backend.open() {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot open packet filter session for teardown: {}", e);
                return Ok(());
            }
        };

        match session.table_exists(self.table) {
            Ok(true) => {
                let deleted = session
                    .delete_table(self.table)
                    .and_then(|_| session.commit());
                match deleted {
                    Ok(()) => info!("Removed table {}", self.table),
                    Err(e) => warn!("Failed to remove table {}: {}", self.table, e),
                }
            }
            Ok(false) => debug!("Table {} not installed", self.table),
            Err(e) => warn!("Failed to look up table {}: {}", self.table, e),
        }

        companion.configure(session.as_mut(), true)?;
        session.commit().map_err(CompanionError::Commit)?;
        Ok(())
    }

    fn open_installed(&self) -> Result<Box<dyn NftSession>> {
        let mut session = self.backend.open()?;
        if !session.table_exists(self.table)? {
            return Err(RedirectError::NotInitialized {
                table: self.table.to_string(),
            });
        }
        Ok(session)
    }
}

/// Element changes of one family's local address set
struct SetPatch {
    family: Family,
    added: Vec<IpNet>,
    removed: Vec<IpNet>,
}

impl SetPatch {
    fn between(family: Family, old: &LocalAddressSet, new: &LocalAddressSet) -> Self {
        let before = family.networks(old.iter());
        let after = family.networks(new.iter());
        Self {
            family,
            added: after.iter().filter(|it| !before.contains(it)).copied().collect(),
            removed: before.iter().filter(|it| !after.contains(it)).copied().collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn has_family(prefixes: &[IpNet], family: Family) -> bool {
    prefixes.iter().any(|it| Family::of(it) == family)
}
