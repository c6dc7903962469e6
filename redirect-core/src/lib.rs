//! Transparent redirection of host traffic into a local proxy with nftables

pub mod address;
pub mod companion;
pub mod config;
pub mod error;
pub mod monitor;
pub mod redirect;
pub mod ruleset;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use address::{InterfaceFinder, LocalAddressSet, NetworkInterface, StaticInterfaces, SystemInterfaces};
pub use companion::{CompanionFirewall, Firewall4, NoCompanion};
pub use config::{CompanionKind, Config, ConfigLoader, ConfigValidator, RedirectMode, RedirectPolicy, RouteAddresses};
pub use error::{ErrorKind, RedirectError, Result, TransportError, ValidationError};
pub use monitor::{spawn_poller, CallbackRegistry, NetworkMonitor, SubscriptionToken};
pub use redirect::{AutoRedirect, AutoRedirectBuilder};
pub use ruleset::RuleGraph;
pub use sync::Synchronizer;
pub use transport::{MemoryBackend, NftBackend, NftCli, NftSession};
