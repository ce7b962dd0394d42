//! Request and event taxonomy of the network gateway.

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;

use crate::bus::Bus;

/// Identifies one socket owned by a [`NetworkGateway`].
///
/// Ids increase monotonically and are never reused within a gateway's
/// lifetime.
///
/// [`NetworkGateway`]: super::NetworkGateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct SocketId(pub(super) u64);

/// Requests accepted on the network gateway's bus.
#[derive(derive_more::Debug)]
pub enum NetworkRequest {
    /// Open a non-blocking UDP socket bound to `source_addr` on an OS-chosen
    /// port.
    ///
    /// Answered with [`NetworkEvent::UdpCreated`] or [`NetworkEvent::Error`].
    CreateUdp {
        /// Local address to bind.
        source_addr: IpAddr,
        /// Where replies and notifications for this socket are posted.
        #[debug("_")]
        response_bus: Bus<NetworkEvent>,
    },
    /// Open a non-blocking TCP socket bound to `source_addr` and start
    /// connecting to `to`.
    ///
    /// Answered with [`NetworkEvent::TcpCreated`] right away (or
    /// [`NetworkEvent::Error`] if the socket could not be set up), followed by
    /// exactly one of [`NetworkEvent::TcpConnected`] or
    /// [`NetworkEvent::SocketError`].
    CreateTcp {
        /// Local address to bind.
        source_addr: IpAddr,
        /// Remote endpoint to connect to.
        to: SocketAddr,
        /// Where replies and notifications for this socket are posted.
        #[debug("_")]
        response_bus: Bus<NetworkEvent>,
    },
    /// Append bytes to a TCP socket's outgoing stream.
    ///
    /// Empty writes are dropped silently, TCP has no message framing to
    /// preserve. Each buffer is reported with [`NetworkEvent::TcpWritten`]
    /// once fully on the wire.
    WriteTcp {
        /// Socket to write to.
        id: SocketId,
        /// Stream bytes.
        data: Bytes,
    },
    /// Enqueue one datagram to `to`.
    WriteUdp {
        /// Socket to write from.
        id: SocketId,
        /// Destination of the datagram.
        to: SocketAddr,
        /// Datagram payload.
        data: Bytes,
    },
    /// Close the socket and release its id.
    ///
    /// Answered with [`NetworkEvent::Closed`] on the socket's response bus.
    /// Closing an id that is already gone is a no-op.
    Close {
        /// Socket to close.
        id: SocketId,
    },
    /// Enumerate every non-loopback address bound to a local interface.
    LocalAddresses {
        /// Where the address set is posted.
        #[debug("_")]
        response_bus: Bus<NetworkEvent>,
    },
    /// Stop the gateway.
    ///
    /// Every remaining socket is closed and reported with
    /// [`NetworkEvent::SocketError`].
    Kill,
}

/// Replies and notifications posted on a caller's response bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A UDP socket was created.
    UdpCreated {
        /// Id of the new socket.
        id: SocketId,
    },
    /// A TCP socket was created and its connect is in flight.
    TcpCreated {
        /// Id of the new socket.
        id: SocketId,
    },
    /// The three-way handshake completed. Sent exactly once per successful
    /// connect.
    TcpConnected {
        /// Id of the connected socket.
        id: SocketId,
    },
    /// At least one byte was read from a TCP stream.
    TcpRead {
        /// Id of the socket that was read.
        id: SocketId,
        /// Bytes read, in network order.
        data: Bytes,
    },
    /// One datagram was received.
    UdpRead {
        /// Id of the socket that was read.
        id: SocketId,
        /// Local address of the socket.
        local: SocketAddr,
        /// Sender of the datagram.
        from: SocketAddr,
        /// Datagram payload.
        data: Bytes,
    },
    /// One outgoing buffer was fully written; `n` is its length.
    ///
    /// Buffers complete in the order the writes were submitted.
    TcpWritten {
        /// Id of the socket that was written.
        id: SocketId,
        /// Bytes of the completed buffer.
        n: usize,
    },
    /// One datagram was sent; `n` is the byte count the OS accepted.
    UdpWritten {
        /// Id of the socket that was written.
        id: SocketId,
        /// Bytes sent.
        n: usize,
    },
    /// The outgoing stream queue just drained.
    ///
    /// Emitted once per drain cycle. A freshly connected socket reports its
    /// (empty) queue once, which doubles as the first write-readiness signal.
    TcpWriteQueueEmpty {
        /// Id of the drained socket.
        id: SocketId,
    },
    /// The outgoing datagram queue just drained. Same cadence as
    /// [`NetworkEvent::TcpWriteQueueEmpty`].
    UdpWriteQueueEmpty {
        /// Id of the drained socket.
        id: SocketId,
    },
    /// The socket was closed on request and its id released.
    Closed {
        /// Id of the closed socket.
        id: SocketId,
    },
    /// Answer to [`NetworkRequest::LocalAddresses`].
    LocalAddressesFound(HashSet<IpAddr>),
    /// The request could not start; no id was allocated.
    Error,
    /// The socket failed or was torn down; the id is no longer valid.
    SocketError {
        /// Id of the dead socket.
        id: SocketId,
    },
}
