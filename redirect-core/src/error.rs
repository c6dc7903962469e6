//! Error types for redirect operations

use nftables::helper::NftablesError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RedirectError>;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("Invalid redirect policy: {0}")]
    Validation(#[from] ValidationError),

    #[error("Packet filter transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Table {table} is not installed")]
    NotInitialized { table: String },

    #[error("Companion firewall error: {0}")]
    Companion(#[from] CompanionError),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a failure, used to pick a remediation hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The policy itself is wrong; fix the configuration
    Policy,
    /// The packet filter subsystem could not be reached or refused the batch
    Transport,
    /// An update was attempted before install
    NotInitialized,
    /// The platform firewall manager may be in an inconsistent state
    Companion,
    /// The configuration file could not be read or parsed
    Config,
}

impl RedirectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedirectError::Validation(_) => ErrorKind::Policy,
            RedirectError::Transport(_) => ErrorKind::Transport,
            RedirectError::NotInitialized { .. } => ErrorKind::NotInitialized,
            RedirectError::Companion(_) => ErrorKind::Companion,
            RedirectError::ConfigLoad { .. } | RedirectError::ConfigParse(_) => ErrorKind::Config,
            RedirectError::Io(_) => ErrorKind::Transport,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("At least one of IPv4 or IPv6 must be enabled")]
    NoFamilyEnabled,

    #[error("Invalid interface name: {name}")]
    InvalidInterface { name: String },

    #[error("Interface {name} is both included and excluded")]
    ConflictingInterface { name: String },

    #[error("Invalid table name: {name}")]
    InvalidTableName { name: String },

    #[error("Redirect port must be non-zero")]
    InvalidPort,

    #[error("Invalid mark configuration: {reason}")]
    InvalidMark { reason: String },

    #[error("Route address {prefix} does not match an enabled address family")]
    RouteFamilyDisabled { prefix: String },

    #[error("Route address set shape changed ({set}); reinstall required")]
    RouteShapeChanged { set: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("nft failed: {0}")]
    Nft(#[from] NftablesError),

    #[error("nft rejected the request: {stderr}")]
    Rejected { stderr: String },

    #[error("Malformed nft output: {0}")]
    Malformed(String),

    #[error("Transport failure: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("Failed to {action} firewall4 rules: {source}")]
    Firewall4 {
        action: &'static str,
        source: TransportError,
    },

    #[error("Failed to commit firewall changes: {0}")]
    Commit(TransportError),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Unknown subscription {0}")]
    UnknownSubscription(u64),
}
