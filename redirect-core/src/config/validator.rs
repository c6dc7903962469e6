//! Policy validation, run before any packet filter call

use super::schema::{RedirectPolicy, RouteAddresses};
use crate::error::{Result, ValidationError};
use ipnet::IpNet;

/// Linux IFNAMSIZ including the trailing NUL
const IFNAMSIZ: usize = 16;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate an entire redirect policy
    pub fn validate(policy: &RedirectPolicy) -> Result<()> {
        Self::validate_families(policy)?;
        Self::validate_names(policy)?;
        Self::validate_marks(policy)?;
        Self::validate_routes(policy, &policy.route_addresses())?;
        Ok(())
    }

    fn validate_families(policy: &RedirectPolicy) -> Result<()> {
        if !policy.enable_ipv4 && !policy.enable_ipv6 {
            return Err(ValidationError::NoFamilyEnabled.into());
        }
        Ok(())
    }

    fn validate_names(policy: &RedirectPolicy) -> Result<()> {
        Self::validate_interface(&policy.tun_name)?;

        for name in policy.include_interface.iter().chain(&policy.exclude_interface) {
            Self::validate_interface(name)?;
        }

        for name in &policy.include_interface {
            if policy.exclude_interface.contains(name) {
                return Err(ValidationError::ConflictingInterface { name: name.clone() }.into());
            }
        }

        let table = &policy.table_name;
        let valid_table = !table.is_empty()
            && table.len() < 256
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_table {
            return Err(ValidationError::InvalidTableName {
                name: table.clone(),
            }
            .into());
        }

        if policy.redirect_port == 0 {
            return Err(ValidationError::InvalidPort.into());
        }

        Ok(())
    }

    fn validate_interface(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() < IFNAMSIZ
            && !name.contains(|c: char| c == '/' || c == '\0' || c.is_whitespace());
        if !valid {
            return Err(ValidationError::InvalidInterface {
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn validate_marks(policy: &RedirectPolicy) -> Result<()> {
        if !policy.mark_mode {
            return Ok(());
        }

        if policy.input_mark == 0 || policy.output_mark == 0 {
            return Err(ValidationError::InvalidMark {
                reason: "marks must be non-zero in mark mode".to_string(),
            }
            .into());
        }

        if policy.input_mark == policy.output_mark {
            return Err(ValidationError::InvalidMark {
                reason: format!("input and output mark are both {:#x}", policy.input_mark),
            }
            .into());
        }

        Ok(())
    }

    /// Check that every route prefix belongs to an enabled family
    pub fn validate_routes(policy: &RedirectPolicy, routes: &RouteAddresses) -> Result<()> {
        for prefix in routes
            .route_address
            .iter()
            .chain(&routes.route_exclude_address)
        {
            let enabled = match prefix {
                IpNet::V4(_) => policy.enable_ipv4,
                IpNet::V6(_) => policy.enable_ipv6,
            };
            if !enabled {
                return Err(ValidationError::RouteFamilyDisabled {
                    prefix: prefix.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}
