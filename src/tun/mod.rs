//! TUN device handling: creation, packet I/O, and platform network
//! configuration.

pub mod device;
pub mod packet;
pub mod routing;

pub use device::TunDevice;

use async_trait::async_trait;

use crate::error::Result;

/// Packet-level I/O on a virtual interface.
///
/// The pumps and the server router speak to this trait rather than to the
/// device directly, so tests can substitute an in-process mock.
#[async_trait]
pub trait PacketIo: Send + Sync {
    /// Read one IP packet. The buffer should be at least MTU bytes.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one IP packet. TUN writes of MTU-sized packets are
    /// all-or-nothing on both target OSes.
    async fn send(&self, packet: &[u8]) -> Result<usize>;
}

/// Check whether the process can create TUN devices.
pub fn check_privileges() -> bool {
    // Both Linux and macOS require root (or CAP_NET_ADMIN) for this.
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
