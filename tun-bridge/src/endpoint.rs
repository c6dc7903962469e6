//! Packet endpoint reading and writing whole IP packets on a descriptor

use crate::error::{BridgeError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd};
use tracing::{debug, trace};

/// Smallest MTU every IPv4 host must accept
pub const MIN_MTU: usize = 68;
pub const MAX_MTU: usize = 65535;

/// smoltcp [`Device`] on a packet-oriented descriptor such as a TUN device in
/// IP mode. Each read yields one packet of at most `mtu` bytes.
///
/// Set the descriptor non-blocking: `receive` returns `None` when no packet is
/// pending instead of waiting.
pub struct FdEndpoint<'fd> {
    fd: BorrowedFd<'fd>,
    mtu: usize,
    /// Read buffer reused across polls; only received packets are copied out
    buffer: Vec<u8>,
}

impl fmt::Debug for FdEndpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdEndpoint")
            .field("fd", &self.fd)
            .field("mtu", &self.mtu)
            .finish()
    }
}

impl<'fd> FdEndpoint<'fd> {
    pub fn new(fd: BorrowedFd<'fd>, mtu: usize) -> Result<Self> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(BridgeError::InvalidMtu {
                mtu,
                min: MIN_MTU,
                max: MAX_MTU,
            });
        }

        fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(BridgeError::InvalidDescriptor)?;

        debug!("TUN endpoint on fd {} with MTU {}", fd.as_raw_fd(), mtu);
        Ok(Self {
            fd,
            mtu,
            buffer: vec![0u8; mtu],
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

impl<'fd> Device for FdEndpoint<'fd> {
    type RxToken<'a> = FdRxToken where Self: 'a;
    type TxToken<'a> = FdTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        match nix::unistd::read(self.fd.as_raw_fd(), &mut self.buffer) {
            Ok(0) => None,
            Ok(len) => {
                trace!("TUN read {} bytes", len);
                let packet = self.buffer[..len].to_vec();
                Some((FdRxToken { packet }, FdTxToken { fd: self.fd }))
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => None,
            Err(e) => {
                debug!("TUN read failed: {}", e);
                None
            }
        }
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(FdTxToken { fd: self.fd })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

/// One packet read from the descriptor
pub struct FdRxToken {
    packet: Vec<u8>,
}

impl RxToken for FdRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet)
    }
}

/// Writes one packet to the descriptor when consumed
pub struct FdTxToken<'a> {
    fd: BorrowedFd<'a>,
}

impl<'a> TxToken for FdTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);
        match nix::unistd::write(self.fd, &packet) {
            Ok(written) if written == len => trace!("TUN wrote {} bytes", len),
            Ok(written) => debug!("TUN short write: {} of {} bytes", written, len),
            // Dropped packets are recovered by the transport protocols
            Err(e) => debug!("TUN write failed: {}", e),
        }
        result
    }
}
