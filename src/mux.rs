//! Socket multiplexer: the write side of the pipeline.
//!
//! Owns one non-blocking receive socket per primary and secondary
//! endpoint (two per channel), waits on readiness for all of them, and
//! pushes every ready datagram into the byte ring tagged only by
//! arrival order — the frames carry their own channel ids, so the
//! consumer never needs to know which socket produced them.
//!
//! A ready datagram must never be skipped: a partially-delivered
//! datagram cannot be reconstructed from a later receive. When the ring
//! has no room the push is spin-retried until it succeeds, which means
//! a slow consumer throttles socket draining and the kernel receive
//! buffers (not the ring) become the loss point under sustained
//! overload. That is the accepted tradeoff.

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;

use crate::channel::{ChannelTable, StreamId};
use crate::net::UdpSocket;
use crate::net::socket::RECV_BUFFER_BYTES;
use crate::ring::{MAX_PUSH_BYTES, RingProducer};
use crate::trace::{debug, info, warn};

/// Token reserved for the shutdown waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Event buffer size for one readiness wait.
const EVENT_CAPACITY: usize = 1024;

/// Which copy of the feed a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRole {
    Primary,
    Secondary,
}

impl std::fmt::Display for FeedRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// Supplies bound, group-joined, non-blocking receive sockets.
///
/// The provider owns all OS-level socket option plumbing; `group` may
/// be `None` for a plain bound socket.
pub trait SocketProvider {
    /// Opens one receive socket.
    ///
    /// # Errors
    ///
    /// Propagates socket creation/bind/join failures.
    fn open(&mut self, group: Option<Ipv4Addr>, port: u16) -> std::io::Result<UdpSocket>;
}

/// Default provider: multicast receive sockets with a large buffer.
#[derive(Debug, Clone)]
pub struct MulticastSocketProvider {
    /// Receive buffer size requested per socket.
    pub recv_buffer_bytes: usize,
}

impl Default for MulticastSocketProvider {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: RECV_BUFFER_BYTES,
        }
    }
}

impl SocketProvider for MulticastSocketProvider {
    fn open(&mut self, group: Option<Ipv4Addr>, port: u16) -> std::io::Result<UdpSocket> {
        UdpSocket::bind_feed(group, port, self.recv_buffer_bytes)
    }
}

/// Errors opening or running the multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Readiness-notification setup failed.
    #[error("poll setup failed")]
    Poll(#[source] std::io::Error),
    /// One feed socket could not be opened or registered.
    #[error("failed to open {role} socket for stream {stream}")]
    Socket {
        stream: StreamId,
        role: FeedRole,
        #[source]
        source: std::io::Error,
    },
    /// The readiness wait itself failed.
    #[error("readiness wait failed")]
    Wait(#[source] std::io::Error),
}

struct MuxSlot {
    socket: UdpSocket,
    stream: StreamId,
    role: FeedRole,
}

/// The socket set plus its readiness-notification handle.
///
/// Channel membership is fixed at construction; there is no per-channel
/// unsubscribe. All sockets and the poll handle close on drop.
pub struct SocketMux {
    poll: Poll,
    events: Events,
    slots: Vec<MuxSlot>,
    waker: Arc<Waker>,
}

impl SocketMux {
    /// Opens two sockets per channel (primary then secondary, table
    /// order) and registers them all for readiness.
    ///
    /// # Errors
    ///
    /// Fails fast on the first socket that cannot be opened; no
    /// partially initialized multiplexer is returned.
    pub fn open<P: SocketProvider>(
        table: &ChannelTable,
        provider: &mut P,
    ) -> Result<Self, MuxError> {
        let poll = Poll::new().map_err(MuxError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(MuxError::Poll)?;

        let mut slots = Vec::with_capacity(table.len() * 2);
        for config in table.iter() {
            let endpoints = [
                (FeedRole::Primary, config.primary),
                (FeedRole::Secondary, config.secondary),
            ];
            for (role, endpoint) in endpoints {
                let socket_err = |source| MuxError::Socket {
                    stream: config.stream_id,
                    role,
                    source,
                };
                let mut socket = provider
                    .open(endpoint.group, endpoint.port)
                    .map_err(socket_err)?;
                poll.registry()
                    .register(&mut socket, Token(slots.len()), Interest::READABLE)
                    .map_err(socket_err)?;
                debug!(
                    stream = %config.stream_id,
                    %role,
                    endpoint = %endpoint,
                    "feed socket registered"
                );
                slots.push(MuxSlot {
                    socket,
                    stream: config.stream_id,
                    role,
                });
            }
        }

        info!(sockets = slots.len(), "multiplexer open");
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            slots,
            waker: Arc::new(waker),
        })
    }

    /// Handle that interrupts the readiness wait (for shutdown).
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Number of open feed sockets.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.slots.len()
    }

    /// Identities of the open sockets, in registration order.
    pub fn sockets(&self) -> impl Iterator<Item = (StreamId, FeedRole)> + '_ {
        self.slots.iter().map(|slot| (slot.stream, slot.role))
    }

    /// Runs the producer loop until `shutdown` is observed.
    ///
    /// Waits indefinitely for readiness (a channel that never sends is
    /// not an error), then drains every ready socket into the ring,
    /// spin-retrying full-ring pushes. The shutdown flag is checked
    /// between readiness waits; use the [waker](Self::waker) to force a
    /// wakeup after setting it.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Wait`] if the readiness wait fails.
    /// Per-socket receive errors are logged and the datagram dropped;
    /// they do not stop the loop.
    pub fn run(&mut self, ring: &mut RingProducer, shutdown: &AtomicBool) -> Result<(), MuxError> {
        info!("producer loop started");
        while !shutdown.load(Ordering::Acquire) {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(MuxError::Wait(e)),
            }

            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue; // shutdown flag is re-checked at loop top
                }

                let slot = &mut self.slots[token.0];
                // Drain the socket: readiness is edge-triggered, and
                // each push pulls at most one datagram.
                loop {
                    match ring.push(&mut slot.socket, MAX_PUSH_BYTES) {
                        // Ring full: retry, never skip a ready datagram.
                        Ok(None) => std::hint::spin_loop(),
                        // Socket dry.
                        Ok(Some(0)) => break,
                        Ok(Some(_)) => {}
                        Err(e) => {
                            warn!(
                                stream = %slot.stream,
                                role = %slot.role,
                                error = %e,
                                "receive failed, dropping datagram"
                            );
                            break;
                        }
                    }
                }
            }
        }
        info!("producer loop stopped");
        Ok(())
    }
}
