//! smoltcp device over a TUN file descriptor
//!
//! The descriptor is borrowed: whoever opened the TUN device keeps it open for
//! as long as the endpoint lives and closes it afterwards.

pub mod endpoint;
pub mod error;

pub use endpoint::{FdEndpoint, FdRxToken, FdTxToken, MAX_MTU, MIN_MTU};
pub use error::{BridgeError, Result};
