//! Configuration management for auto-redirect

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{CompanionKind, Config, RedirectMode, RedirectPolicy, RouteAddresses, RuntimeConfig};
pub use validator::ConfigValidator;
