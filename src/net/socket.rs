//! UDP socket wrapper for mio-based feed reception.
//!
//! Provides a thin wrapper around [`mio::net::UdpSocket`] plus the
//! socket-option plumbing a feed receive socket needs: SO_REUSEADDR, a
//! large SO_RCVBUF, bind to the wildcard address, and an optional
//! IP_ADD_MEMBERSHIP multicast join. Feed producers burst; an
//! under-sized receive buffer is a silent-loss risk, not a crash risk,
//! so the buffer is sized generously by default.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};
use rustix::net::{AddressFamily, SocketFlags, SocketType, ipproto};

use super::Endpoint;
use crate::ring::ByteSource;

/// Receive buffer size applied to feed sockets, per the exchange's
/// connectivity recommendation.
pub const RECV_BUFFER_BYTES: usize = 128 * 1024 * 1024;

/// A non-blocking UDP receive socket.
///
/// Use with mio's [`Poll`] for readiness notification.
///
/// [`Poll`]: mio::Poll
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Opens a receive socket for one feed endpoint.
    ///
    /// The socket is created non-blocking, has SO_REUSEADDR set and its
    /// receive buffer sized to `recv_buffer`, is bound to
    /// `0.0.0.0:port`, and joins `group` on the default interface when a
    /// group is given. `group: None` yields a plain bound socket (used
    /// by tests and unicast feeds).
    ///
    /// # Errors
    ///
    /// Returns an error if any step of socket creation, option setup,
    /// bind, or group join fails.
    pub fn bind_feed(
        group: Option<Ipv4Addr>,
        port: u16,
        recv_buffer: usize,
    ) -> io::Result<Self> {
        let fd = rustix::net::socket_with(
            AddressFamily::INET,
            SocketType::DGRAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            Some(ipproto::UDP),
        )?;

        // Options must be set before bind to take effect for rebinding.
        rustix::net::sockopt::set_socket_reuseaddr(&fd, true)?;
        rustix::net::sockopt::set_socket_recv_buffer_size(&fd, recv_buffer)?;

        rustix::net::bind(&fd, &SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;

        if let Some(group) = group {
            rustix::net::sockopt::set_ip_add_membership(&fd, &group, &Ipv4Addr::UNSPECIFIED)?;
        }

        let inner = MioUdpSocket::from_std(std::net::UdpSocket::from(fd));
        Ok(Self { inner })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Receives a datagram from the socket.
    ///
    /// Returns the number of bytes received and the source endpoint,
    /// or `WouldBlock` if no data is available.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// Useful in polling loops where `WouldBlock` is expected.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, ep)) => Ok(Some((n, ep))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        let fd = self.inner.as_fd();
        Ok(rustix::net::sockopt::socket_recv_buffer_size(fd)?)
    }
}

impl ByteSource for UdpSocket {
    /// Pulls at most one pending datagram into `buf`.
    ///
    /// Returns 0 when the socket is dry (`WouldBlock`), matching the
    /// ring's "source exhausted" convention.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.try_recv_from(buf)? {
            Some((n, _from)) => Ok(n),
            None => Ok(0),
        }
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
