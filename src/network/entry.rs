//! Per-socket state records owned by the network service loop.

use std::{collections::VecDeque, net::SocketAddr};

use bytes::Bytes;
use futures::future::AbortHandle;
use tokio::{
    io::Interest,
    net::{TcpStream, UdpSocket},
};

use super::messages::{NetworkEvent, SocketId};
use crate::bus::Bus;

/// One buffer in a TCP outgoing queue, with a cursor for partial writes.
#[derive(Debug)]
pub(super) struct StreamBuf {
    pub(super) data: Bytes,
    written: usize,
}

impl StreamBuf {
    pub(super) fn new(data: Bytes) -> Self {
        StreamBuf { data, written: 0 }
    }

    pub(super) fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    pub(super) fn advance(&mut self, n: usize) {
        self.written += n;
    }

    pub(super) fn is_drained(&self) -> bool {
        self.written == self.data.len()
    }
}

/// The socket owned by an entry, together with its outgoing queue.
#[derive(Debug)]
pub(super) enum Socket {
    Udp {
        socket: UdpSocket,
        outgoing: VecDeque<(Bytes, SocketAddr)>,
    },
    Tcp {
        /// `None` while the connect is still in flight.
        stream: Option<TcpStream>,
        connecting: bool,
        /// Cancels the in-flight connect, which owns the socket until it
        /// resolves. Cleared once the stream is installed.
        connect_abort: Option<AbortHandle>,
        outgoing: VecDeque<StreamBuf>,
    },
}

/// Per-socket record. Only ever touched by the service loop.
#[derive(Debug)]
pub(super) struct NetworkEntry {
    pub(super) id: SocketId,
    pub(super) response_bus: Bus<NetworkEvent>,
    pub(super) socket: Socket,
    /// Readiness the loop currently waits for.
    pub(super) interest: Interest,
    /// Whether the current drained state of the outgoing queue has been
    /// reported. Keeps an always-writable idle socket from waking the loop
    /// on every iteration.
    pub(super) notified_of_writable: bool,
}

impl NetworkEntry {
    pub(super) fn new_udp(id: SocketId, socket: UdpSocket, response_bus: Bus<NetworkEvent>) -> Self {
        let mut entry = NetworkEntry {
            id,
            response_bus,
            socket: Socket::Udp {
                socket,
                outgoing: VecDeque::new(),
            },
            interest: Interest::READABLE,
            notified_of_writable: false,
        };
        entry.update_interest();
        entry
    }

    pub(super) fn new_tcp(
        id: SocketId,
        response_bus: Bus<NetworkEvent>,
        connect_abort: AbortHandle,
    ) -> Self {
        let mut entry = NetworkEntry {
            id,
            response_bus,
            socket: Socket::Tcp {
                stream: None,
                connecting: true,
                connect_abort: Some(connect_abort),
                outgoing: VecDeque::new(),
            },
            interest: Interest::READABLE,
            notified_of_writable: false,
        };
        entry.update_interest();
        entry
    }

    /// Cancels a connect that is still in flight, releasing its socket.
    /// A no-op once the connect has resolved.
    pub(super) fn abort_pending_connect(&mut self) {
        if let Socket::Tcp { connect_abort, .. } = &mut self.socket {
            if let Some(abort) = connect_abort.take() {
                abort.abort();
            }
        }
    }

    fn outgoing_is_empty(&self) -> bool {
        match &self.socket {
            Socket::Udp { outgoing, .. } => outgoing.is_empty(),
            Socket::Tcp { outgoing, .. } => outgoing.is_empty(),
        }
    }

    /// Recomputes the readiness interest after any mutation of the entry.
    ///
    /// Readable always. Writable while the outgoing queue has content, or
    /// while a drained queue has not been reported yet; enqueueing new
    /// content re-arms the drain notification.
    pub(super) fn update_interest(&mut self) {
        if !self.outgoing_is_empty() {
            self.notified_of_writable = false;
        }
        self.interest = if !self.outgoing_is_empty() || !self.notified_of_writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
    }
}
