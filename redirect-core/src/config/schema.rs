//! Configuration schema types

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Complete auto-redirect configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub redirect: RedirectPolicy,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Redirection policy, fixed for the lifetime of one install cycle
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RedirectPolicy {
    /// Name of the TUN interface traffic is redirected into
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    /// Name of the inet table owning every chain and set
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Local port the proxy accepts redirected TCP connections on
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    /// Only intercept traffic on these interfaces (empty means all)
    #[serde(default)]
    pub include_interface: Vec<String>,
    /// Never intercept traffic on these interfaces
    #[serde(default)]
    pub exclude_interface: Vec<String>,
    /// Split TCP/UDP handling using packet marks
    #[serde(default)]
    pub mark_mode: bool,
    /// Conntrack mark identifying return UDP traffic
    #[serde(default = "default_input_mark")]
    pub input_mark: u32,
    /// Mark set on traffic routed through the tunnel
    #[serde(default = "default_output_mark")]
    pub output_mark: u32,
    #[serde(default = "default_true")]
    pub enable_ipv4: bool,
    #[serde(default = "default_true")]
    pub enable_ipv6: bool,
    /// Reject traffic of a disabled address family instead of letting it leak
    #[serde(default)]
    pub strict_route: bool,
    /// Only redirect traffic to these destinations (empty means all)
    #[serde(default)]
    pub route_address: Vec<IpNet>,
    /// Never redirect traffic to these destinations
    #[serde(default)]
    pub route_exclude_address: Vec<IpNet>,
}

fn default_tun_name() -> String {
    "tun0".to_string()
}

fn default_table_name() -> String {
    "auto_redirect".to_string()
}

fn default_redirect_port() -> u16 {
    7892
}

fn default_input_mark() -> u32 {
    0x2023
}

fn default_output_mark() -> u32 {
    0x2024
}

fn default_true() -> bool {
    true
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            tun_name: default_tun_name(),
            table_name: default_table_name(),
            redirect_port: default_redirect_port(),
            include_interface: Vec::new(),
            exclude_interface: Vec::new(),
            mark_mode: false,
            input_mark: default_input_mark(),
            output_mark: default_output_mark(),
            enable_ipv4: true,
            enable_ipv6: true,
            strict_route: false,
            route_address: Vec::new(),
            route_exclude_address: Vec::new(),
        }
    }
}

/// Ruleset construction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// Redirect everything to the proxy port
    Simple,
    /// Mark traffic and let policy routing split TCP and UDP
    MarkSplit,
}

impl RedirectPolicy {
    pub fn mode(&self) -> RedirectMode {
        if self.mark_mode {
            RedirectMode::MarkSplit
        } else {
            RedirectMode::Simple
        }
    }

    /// Whether traffic on `name` is in interception scope
    pub fn intercepts(&self, name: &str) -> bool {
        if self.exclude_interface.iter().any(|it| it == name) {
            return false;
        }
        self.include_interface.is_empty() || self.include_interface.iter().any(|it| it == name)
    }

    /// Destination sets as configured at setup
    pub fn route_addresses(&self) -> RouteAddresses {
        RouteAddresses {
            route_address: self.route_address.clone(),
            route_exclude_address: self.route_exclude_address.clone(),
        }
    }
}

/// Destination prefixes that scope redirection independently of local addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteAddresses {
    pub route_address: Vec<IpNet>,
    pub route_exclude_address: Vec<IpNet>,
}

/// Settings for the embedding process rather than the ruleset
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Seconds between interface polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Platform firewall manager to keep consistent
    #[serde(default)]
    pub companion: CompanionKind,
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            companion: CompanionKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompanionKind {
    #[default]
    None,
    Firewall4,
}
