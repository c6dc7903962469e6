//! Platform firewall managers that need their own accept rules for the tun

use crate::error::CompanionError;
use crate::ruleset::{Expr, Rule, RuleKind};
use crate::transport::NftSession;
use tracing::{debug, info};

/// Adjusts a host firewall manager alongside install and teardown. Operations
/// are queued into the caller's session and commit with its batch.
pub trait CompanionFirewall: Send + Sync {
    fn configure(&self, session: &mut dyn NftSession, revert: bool) -> Result<(), CompanionError>;
}

/// No platform firewall manager
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompanion;

impl CompanionFirewall for NoCompanion {
    fn configure(&self, _session: &mut dyn NftSession, _revert: bool) -> Result<(), CompanionError> {
        Ok(())
    }
}

const FW4_TABLE: &str = "fw4";
const FW4_INPUT: &str = "input";
const FW4_FORWARD: &str = "forward";

/// OpenWrt firewall4: its `input` and `forward` chains drop tun traffic
/// unless explicitly accepted
#[derive(Debug, Clone)]
pub struct Firewall4 {
    tun_name: String,
}

impl Firewall4 {
    pub fn new(tun_name: impl Into<String>) -> Self {
        Self {
            tun_name: tun_name.into(),
        }
    }

    /// Comment tagging the rules this companion owns
    pub fn comment(&self) -> String {
        format!("auto-redirect {}", self.tun_name)
    }

    fn accept(&self, expr: Expr) -> Rule {
        Rule::new(RuleKind::Passthrough, vec![expr, Expr::Counter, Expr::Accept])
            .with_comment(self.comment())
    }

    fn install(&self, session: &mut dyn NftSession) -> Result<(), CompanionError> {
        let names = vec![self.tun_name.clone()];
        let from_tun = self.accept(Expr::Iifname {
            names: names.clone(),
            negate: false,
        });
        let to_tun = self.accept(Expr::Oifname {
            names,
            negate: false,
        });

        let fail = |source| CompanionError::Firewall4 {
            action: "insert",
            source,
        };
        session
            .insert_rule(FW4_TABLE, FW4_INPUT, &from_tun)
            .map_err(fail)?;
        session
            .insert_rule(FW4_TABLE, FW4_FORWARD, &to_tun)
            .map_err(fail)?;
        session
            .insert_rule(FW4_TABLE, FW4_FORWARD, &from_tun)
            .map_err(fail)?;

        info!("Accepting {} traffic in firewall4", self.tun_name);
        Ok(())
    }

    fn revert(&self, session: &mut dyn NftSession) -> Result<(), CompanionError> {
        let comment = self.comment();
        let fail = |source| CompanionError::Firewall4 {
            action: "remove",
            source,
        };

        let mut removed = 0;
        for chain in [FW4_INPUT, FW4_FORWARD] {
            for rule in session.list_rules(FW4_TABLE, chain).map_err(fail)? {
                if rule.comment.as_deref() == Some(comment.as_str()) {
                    session
                        .delete_rule(FW4_TABLE, chain, rule.handle)
                        .map_err(fail)?;
                    removed += 1;
                }
            }
        }

        debug!("Removing {} firewall4 rules for {}", removed, self.tun_name);
        Ok(())
    }
}

impl CompanionFirewall for Firewall4 {
    fn configure(&self, session: &mut dyn NftSession, revert: bool) -> Result<(), CompanionError> {
        let present = session
            .table_exists(FW4_TABLE)
            .map_err(|source| CompanionError::Firewall4 {
                action: "detect",
                source,
            })?;
        if !present {
            debug!("No firewall4 table, skipping");
            return Ok(());
        }

        if revert {
            self.revert(session)
        } else {
            self.install(session)
        }
    }
}
