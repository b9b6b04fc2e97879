//! UDP socket abstraction for the batch writers.
//!
//! The transmission core never owns the event loop; it only needs a way to
//! hand coalesced datagrams to a socket. [`QuicUdpSocket`] is that seam.
//! [`StdUdpSocket`] adapts `std::net::UdpSocket`, using `sendmsg` with
//! `UDP_SEGMENT` and `sendmmsg` on Linux and falling back to per-datagram
//! sends elsewhere.

#![allow(unsafe_code)]

use std::io;
use std::net::{SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket as Socket2, Type};

/// Write-side socket interface consumed by the batch writers.
pub trait QuicUdpSocket {
    /// Sends one datagram.
    fn write(&self, addr: SocketAddr, buf: &[u8]) -> io::Result<usize>;

    /// Sends a run of equal-sized segments (the last may be shorter) as one
    /// kernel call when GSO is available.
    fn write_gso(&self, addr: SocketAddr, segments: &[Bytes], segment_size: usize)
        -> io::Result<usize>;

    /// Sends independent datagrams, batched into one kernel call when
    /// sendmmsg is available. Returns the number of datagrams sent.
    fn writem(&self, addr: SocketAddr, bufs: &[Bytes]) -> io::Result<usize>;

    /// Sends several GSO runs. `segment_sizes[i]` is the segment size of
    /// `chains[i]`; zero means the chain is a single plain datagram.
    fn writem_gso(
        &self,
        addr: SocketAddr,
        chains: &[Vec<Bytes>],
        segment_sizes: &[usize],
    ) -> io::Result<usize>;

    /// Whether the kernel accepts `UDP_SEGMENT` on this socket.
    fn supports_gso(&self) -> bool {
        false
    }
}

/// Creates and configures a UDP socket for the transport: SO_REUSEADDR and
/// generously sized kernel buffers.
pub fn create_udp_socket(bind_addr: SocketAddr) -> Result<UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket =
        Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    socket
        .set_send_buffer_size(1 << 20)
        .context("setting SO_SNDBUF")?;
    socket
        .set_recv_buffer_size(1 << 20)
        .context("setting SO_RCVBUF")?;
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {bind_addr}"))?;
    Ok(socket.into())
}

/// `std::net::UdpSocket` adapter.
pub struct StdUdpSocket {
    socket: UdpSocket,
    gso_supported: bool,
}

impl StdUdpSocket {
    pub fn new(socket: UdpSocket) -> Self {
        let gso_supported = probe_gso(&socket);
        Self {
            socket,
            gso_supported,
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl QuicUdpSocket for StdUdpSocket {
    fn write(&self, addr: SocketAddr, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    #[cfg(target_os = "linux")]
    fn write_gso(
        &self,
        addr: SocketAddr,
        segments: &[Bytes],
        segment_size: usize,
    ) -> io::Result<usize> {
        linux::send_gso(&self.socket, addr, segments, segment_size)
    }

    #[cfg(not(target_os = "linux"))]
    fn write_gso(
        &self,
        addr: SocketAddr,
        segments: &[Bytes],
        _segment_size: usize,
    ) -> io::Result<usize> {
        let mut sent = 0;
        for segment in segments {
            sent += self.socket.send_to(segment, addr)?;
        }
        Ok(sent)
    }

    #[cfg(target_os = "linux")]
    fn writem(&self, addr: SocketAddr, bufs: &[Bytes]) -> io::Result<usize> {
        linux::send_mmsg(&self.socket, addr, bufs)
    }

    #[cfg(not(target_os = "linux"))]
    fn writem(&self, addr: SocketAddr, bufs: &[Bytes]) -> io::Result<usize> {
        let mut sent = 0;
        for buf in bufs {
            self.socket.send_to(buf, addr)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn writem_gso(
        &self,
        addr: SocketAddr,
        chains: &[Vec<Bytes>],
        segment_sizes: &[usize],
    ) -> io::Result<usize> {
        debug_assert_eq!(chains.len(), segment_sizes.len());
        let mut sent = 0;
        for (chain, segment_size) in chains.iter().zip(segment_sizes) {
            if *segment_size == 0 {
                debug_assert_eq!(chain.len(), 1);
                self.write(addr, &chain[0])?;
            } else {
                self.write_gso(addr, chain, *segment_size)?;
            }
            sent += 1;
        }
        Ok(sent)
    }

    fn supports_gso(&self) -> bool {
        self.gso_supported
    }
}

/// Checks whether the kernel accepts `UDP_SEGMENT` on this socket.
#[cfg(target_os = "linux")]
fn probe_gso(socket: &UdpSocket) -> bool {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = 0;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_UDP,
            libc::UDP_SEGMENT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret == -1 {
        tracing::warn!("UDP_SEGMENT not supported on this kernel");
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn probe_gso(_socket: &UdpSocket) -> bool {
    tracing::warn!("UDP GSO not available on this platform");
    false
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::fd::AsRawFd;

    fn sockaddr_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &sin as *const _ as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        std::mem::size_of::<libc::sockaddr_in>(),
                    );
                }
                std::mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        &sin6 as *const _ as *const u8,
                        &mut storage as *mut _ as *mut u8,
                        std::mem::size_of::<libc::sockaddr_in6>(),
                    );
                }
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// One `sendmsg` carrying all segments plus a `UDP_SEGMENT` cmsg; the
    /// kernel splits the payload into `segment_size`d datagrams.
    pub fn send_gso(
        socket: &UdpSocket,
        addr: SocketAddr,
        segments: &[Bytes],
        segment_size: usize,
    ) -> io::Result<usize> {
        let (mut storage, addr_len) = sockaddr_storage(addr);
        let mut iovecs: Vec<libc::iovec> = segments
            .iter()
            .map(|segment| libc::iovec {
                iov_base: segment.as_ptr() as *mut libc::c_void,
                iov_len: segment.len(),
            })
            .collect();

        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = addr_len;
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = iovecs.len();
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<u16>() as u32) } as usize;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_UDP;
            (*cmsg).cmsg_type = libc::UDP_SEGMENT;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<u16>() as u32) as usize;
            std::ptr::copy_nonoverlapping(
                &(segment_size as u16) as *const u16 as *const u8,
                libc::CMSG_DATA(cmsg),
                std::mem::size_of::<u16>(),
            );
        }

        let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// One `sendmmsg` carrying each buffer as its own message. Returns the
    /// number of messages sent.
    pub fn send_mmsg(socket: &UdpSocket, addr: SocketAddr, bufs: &[Bytes]) -> io::Result<usize> {
        let (mut storage, addr_len) = sockaddr_storage(addr);
        let mut iovecs: Vec<libc::iovec> = bufs
            .iter()
            .map(|buf| libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            })
            .collect();
        let mut msgs: Vec<libc::mmsghdr> = iovecs
            .iter_mut()
            .map(|iov| {
                let mut msg: libc::mmsghdr = unsafe { std::mem::zeroed() };
                msg.msg_hdr.msg_name = &mut storage as *mut _ as *mut libc::c_void;
                msg.msg_hdr.msg_namelen = addr_len;
                msg.msg_hdr.msg_iov = iov;
                msg.msg_hdr.msg_iovlen = 1;
                msg
            })
            .collect();

        let ret = unsafe {
            libc::sendmmsg(
                socket.as_raw_fd(),
                msgs.as_mut_ptr(),
                msgs.len() as libc::c_uint,
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}
