//! Error types for the TUN bridge

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid MTU {mtu}: must be between {min} and {max}")]
    InvalidMtu { mtu: usize, min: usize, max: usize },

    #[error("Invalid file descriptor: {0}")]
    InvalidDescriptor(Errno),
}
