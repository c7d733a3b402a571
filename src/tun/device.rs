//! Cross-platform TUN device creation and I/O.
//!
//! Linux opens `/dev/net/tun` and binds a name via `TUNSETIFF`; macOS
//! connects a `utun` control socket (the kernel assigns the unit). Both
//! file descriptors are switched to non-blocking and driven through
//! tokio's `AsyncFd`.

use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};

use async_trait::async_trait;
#[cfg(unix)]
use tokio::io::unix::AsyncFd;

use super::PacketIo;
use crate::error::{Error, Result};

/// Handle to a created TUN device.
///
/// # Privileges
///
/// Creation requires elevated privileges (root or `CAP_NET_ADMIN`); no
/// further privileged operations happen during steady state.
pub struct TunDevice {
    name: String,
    mtu: usize,
    #[cfg(unix)]
    io: AsyncFd<OwnedFd>,
}

impl TunDevice {
    /// Create a TUN device. Must be called from within a tokio runtime.
    ///
    /// `name` is a hint; the actual name (returned by [`Self::name`]) may
    /// differ, notably on macOS where the kernel picks the utun unit.
    pub fn create(name: &str, mtu: usize) -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Self::create_linux(name, mtu)
        }

        #[cfg(target_os = "macos")]
        {
            let _ = name;
            Self::create_macos(mtu)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = (name, mtu);
            Err(Error::Config(
                "TUN devices are not supported on this platform".into(),
            ))
        }
    }

    /// The actual device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    #[cfg(target_os = "linux")]
    fn create_linux(name: &str, mtu: usize) -> Result<Self> {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let tun_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(Error::Io)?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };

        // Interface names are capped at 15 chars plus the terminator.
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(15);
        unsafe {
            std::ptr::copy_nonoverlapping(
                name_bytes.as_ptr(),
                ifr.ifr_name.as_mut_ptr().cast::<u8>(),
                name_len,
            );
        }

        // IFF_TUN: raw IP packets; IFF_NO_PI: no packet-info header.
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as i16;

        const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
        let ret = unsafe { libc::ioctl(tun_file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let actual_name = unsafe {
            std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        tracing::info!(requested = %name, actual = %actual_name, mtu, "created TUN device");

        let io = AsyncFd::new(OwnedFd::from(tun_file)).map_err(Error::Io)?;

        Ok(Self {
            name: actual_name,
            mtu,
            io,
        })
    }

    #[cfg(target_os = "macos")]
    fn create_macos(mtu: usize) -> Result<Self> {
        use std::os::fd::FromRawFd;

        // PF_SYSTEM datagram socket speaking SYSPROTO_CONTROL.
        let fd = unsafe { libc::socket(32, libc::SOCK_DGRAM, 2) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        #[repr(C)]
        struct CtlInfo {
            ctl_id: u32,
            ctl_name: [u8; 96],
        }

        let mut info: CtlInfo = unsafe { std::mem::zeroed() };
        let utun_control = b"com.apple.net.utun_control\0";
        info.ctl_name[..utun_control.len()].copy_from_slice(utun_control);

        const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;
        if unsafe { libc::ioctl(fd, CTLIOCGINFO, &mut info) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        #[repr(C)]
        struct SockaddrCtl {
            sc_len: u8,
            sc_family: u8,
            ss_sysaddr: u16,
            sc_id: u32,
            sc_unit: u32,
            sc_reserved: [u32; 5],
        }

        let mut addr: SockaddrCtl = unsafe { std::mem::zeroed() };
        addr.sc_len = std::mem::size_of::<SockaddrCtl>() as u8;
        addr.sc_family = 32; // AF_SYSTEM
        addr.ss_sysaddr = 2; // AF_SYS_CONTROL
        addr.sc_id = info.ctl_id;
        addr.sc_unit = 0; // kernel assigns the next free utun unit

        let ret = unsafe {
            libc::connect(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<SockaddrCtl>() as u32,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // UTUN_OPT_IFNAME via SYSPROTO_CONTROL.
        let mut name_buf = [0u8; 64];
        let mut name_len: libc::socklen_t = name_buf.len() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                2,
                2,
                name_buf.as_mut_ptr().cast(),
                &mut name_len,
            )
        };

        let actual_name = if ret >= 0 && name_len > 1 {
            String::from_utf8_lossy(&name_buf[..name_len as usize - 1]).into_owned()
        } else {
            return Err(Error::Config("failed to query utun interface name".into()));
        };

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        tracing::info!(actual = %actual_name, mtu, "created TUN device");

        let io = AsyncFd::new(owned).map_err(Error::Io)?;

        Ok(Self {
            name: actual_name,
            mtu,
            io,
        })
    }

    #[cfg(unix)]
    async fn read_fd(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.io.readable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }

    #[cfg(unix)]
    async fn write_fd(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self.io.writable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let ret = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        buf.as_ptr().cast(),
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl PacketIo for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_fd(buf).await
    }

    async fn send(&self, packet: &[u8]) -> Result<usize> {
        self.write_fd(packet).await
    }
}

// macOS utun frames every packet with a 4-byte address-family header,
// which is stripped on read and prepended on write.
#[cfg(target_os = "macos")]
#[async_trait]
impl PacketIo for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut framed = vec![0u8; buf.len() + 4];
        let n = self.read_fd(&mut framed).await?;
        if n <= 4 {
            return Ok(0);
        }
        let data_len = n - 4;
        buf[..data_len].copy_from_slice(&framed[4..n]);
        Ok(data_len)
    }

    async fn send(&self, packet: &[u8]) -> Result<usize> {
        let af: u32 = match super::packet::ip_version(packet) {
            Some(6) => 30, // AF_INET6
            _ => 2,        // AF_INET
        };

        let mut framed = Vec::with_capacity(packet.len() + 4);
        framed.extend_from_slice(&af.to_be_bytes());
        framed.extend_from_slice(packet);

        let n = self.write_fd(&framed).await?;
        Ok(n.saturating_sub(4))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[async_trait]
impl PacketIo for TunDevice {
    async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Config("TUN not supported on this platform".into()))
    }

    async fn send(&self, _packet: &[u8]) -> Result<usize> {
        Err(Error::Config("TUN not supported on this platform".into()))
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        // The kernel removes the interface when the fd closes.
        tracing::debug!(name = %self.name, "closing TUN device");
    }
}
